use async_trait::async_trait;
use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::{debug, info};

use crate::error::AppResult;
use crate::services::schedule::{EventExt, Schedule};
use crate::services::zenduty::{ScheduleRef, Team};

/// Product name stamped on combined calendars.
pub const COMBINED_PRODUCT: &str = "zenduty-oncall";

/// Where teams, schedules and their feeds come from.
#[async_trait]
pub trait ScheduleSource: Send + Sync {
    async fn list_teams(&self) -> AppResult<Vec<Team>>;

    async fn list_schedules(&self, team_id: &str) -> AppResult<Vec<ScheduleRef>>;

    async fn get_schedule(
        &self,
        team_id: &str,
        schedule_id: &str,
        months: u32,
    ) -> AppResult<Schedule>;
}

#[derive(Debug, Clone)]
pub struct AggregationOptions {
    /// Window passed to the remote service for expanding recurring shifts.
    pub months: u32,
    /// Upper bound on upstream requests in flight.
    pub concurrency: usize,
}

impl Default for AggregationOptions {
    fn default() -> Self {
        Self {
            months: 12,
            concurrency: 4,
        }
    }
}

/// Teams whose member list contains `email` (exact, case-sensitive).
pub fn teams_for_user(teams: Vec<Team>, email: &str) -> Vec<Team> {
    teams
        .into_iter()
        .filter(|team| team.contains_user(email))
        .collect()
}

/// Build the combined on-call calendar of every team `email` belongs to.
///
/// Events keep the order (team, schedule, event-in-feed) as returned by the
/// remote service. Their summary and description are replaced by the team
/// and schedule names. The first failing fetch aborts the whole build and
/// cancels any fetches still in flight.
pub async fn combined_schedule<S>(
    source: &S,
    email: &str,
    options: &AggregationOptions,
) -> AppResult<Schedule>
where
    S: ScheduleSource + ?Sized,
{
    let concurrency = options.concurrency.max(1);

    let teams = teams_for_user(source.list_teams().await?, email);
    info!("Building combined schedule for {} from {} team(s)", email, teams.len());

    // Streams own their ids so the resulting future stays Send for any caller.
    let team_ids: Vec<String> = teams.iter().map(|team| team.id.clone()).collect();
    let schedule_lists: Vec<Vec<ScheduleRef>> = stream::iter(team_ids)
        .map(|team_id| async move { source.list_schedules(&team_id).await })
        .buffered(concurrency)
        .try_collect()
        .await?;

    let pairs: Vec<(&Team, ScheduleRef)> = teams
        .iter()
        .zip(schedule_lists)
        .flat_map(|(team, schedules)| schedules.into_iter().map(move |s| (team, s)))
        .collect();

    let months = options.months;
    let feed_ids: Vec<(String, String)> = pairs
        .iter()
        .map(|(team, schedule)| (team.id.clone(), schedule.id.clone()))
        .collect();
    let feeds: Vec<Schedule> = stream::iter(feed_ids)
        .map(|(team_id, schedule_id)| async move {
            source.get_schedule(&team_id, &schedule_id, months).await
        })
        .buffered(concurrency)
        .try_collect()
        .await?;

    let mut combined = Schedule::new_for(COMBINED_PRODUCT);
    for ((team, schedule), feed) in pairs.iter().zip(feeds) {
        let summary = format!("on call for team {}", team.name);
        let description = format!("{} (schedule: {})", summary, schedule.name);

        let (events, timezones) = feed.into_parts();
        debug!(
            "Merging {} event(s) of schedule {} ({})",
            events.len(),
            schedule.name,
            schedule.id
        );
        combined.merge_timezones(timezones);

        for mut event in events {
            debug!(
                "Shift {} from {:?} to {:?}",
                event.id().unwrap_or("<no uid>"),
                event.start(),
                event.end()
            );
            event.set_summary(&summary);
            event.set_description(&description);
            combined.add_event(event);
        }
    }

    info!("Combined schedule for {} has {} event(s)", email, combined.len());
    Ok(combined)
}
