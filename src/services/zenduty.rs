use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::config::ZendutyConfig;
use crate::error::{AppError, AppResult};
use crate::services::aggregator::ScheduleSource;
use crate::services::schedule::Schedule;
use crate::services::session::{CredentialResolver, Session};

// ============================================================================
// Team Types
// ============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Team {
    #[serde(rename = "unique_id")]
    pub id: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub name: String,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub members: Vec<TeamMember>,
}

impl Team {
    /// Exact, case-sensitive comparison against the email Zenduty reports.
    pub fn contains_user(&self, email: &str) -> bool {
        self.members.iter().any(|member| member.user.email == email)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TeamMember {
    #[serde(rename = "unique_id")]
    pub id: String,
    pub user: RemoteUser,
    #[serde(default)]
    pub joining_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteUser {
    #[serde(rename = "username")]
    pub id: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub first_name: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub last_name: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub email: String,
}

// ============================================================================
// Schedule Types
// ============================================================================

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ScheduleRef {
    #[serde(rename = "unique_id")]
    pub id: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub name: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub summary: String,
    #[serde(default, deserialize_with = "nullable_string")]
    pub description: String,
}

/// Short-lived signed URL of a schedule's iCalendar feed.
#[derive(Debug, Clone, Deserialize)]
pub struct CalendarFeedRef {
    pub url: String,
}

fn nullable_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

// ============================================================================
// Client
// ============================================================================

/// Read-only client for the session-authenticated Zenduty web API.
#[derive(Debug)]
pub struct ZendutyClient {
    session: Session,
}

impl ZendutyClient {
    pub fn new(config: &ZendutyConfig, credentials: Arc<dyn CredentialResolver>) -> AppResult<Self> {
        let session = Session::new(
            &config.base_url,
            Duration::from_secs(config.request_timeout_seconds),
            credentials,
        )?;
        Ok(Self { session })
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub async fn login(&self) -> AppResult<()> {
        self.session.login().await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> AppResult<T> {
        self.session.ensure_session().await?;

        let response = self
            .session
            .authenticated(Method::GET, &self.session.endpoint(path))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::RemoteStatus {
                status,
                endpoint: path.to_string(),
            });
        }

        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    // Two legs: the API hands out a signed URL, the URL serves the feed.
    async fn fetch_schedule(&self, path: &str) -> AppResult<Schedule> {
        let feed: CalendarFeedRef = self.get_json(path).await?;
        self.fetch_feed(&feed).await
    }

    async fn fetch_feed(&self, feed: &CalendarFeedRef) -> AppResult<Schedule> {
        // The signed URL carries its own authorization.
        let response = self.session.http().get(&feed.url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::RemoteStatus {
                status,
                endpoint: "schedule feed".to_string(),
            });
        }

        let body = response.bytes().await?;
        tracing::debug!("Downloaded schedule feed ({} bytes)", body.len());
        Schedule::parse(&body)
    }
}

#[async_trait]
impl ScheduleSource for ZendutyClient {
    async fn list_teams(&self) -> AppResult<Vec<Team>> {
        self.get_json("/api/account/teams").await.map_err(|e| {
            tracing::warn!("Can't list teams: {}", e);
            e
        })
    }

    async fn list_schedules(&self, team_id: &str) -> AppResult<Vec<ScheduleRef>> {
        let path = format!(
            "/api/account/teams/{}/schedules",
            urlencoding::encode(team_id)
        );
        self.get_json(&path).await.map_err(|e| {
            tracing::warn!("Error listing schedules of team {}: {}", team_id, e);
            e
        })
    }

    async fn get_schedule(
        &self,
        team_id: &str,
        schedule_id: &str,
        months: u32,
    ) -> AppResult<Schedule> {
        let path = format!(
            "/api/account/teams/{}/schedules/{}/get_schedule_ics/?months={}&is_team_or_user=1",
            urlencoding::encode(team_id),
            urlencoding::encode(schedule_id),
            months
        );

        self.fetch_schedule(&path).await.map_err(|e| {
            tracing::warn!(
                "Error requesting schedule {} of team {}: {}",
                schedule_id,
                team_id,
                e
            );
            e
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::services::schedule::tests::feed;
    use crate::services::session::StaticCredentials;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    pub(crate) async fn mount_login(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/login/"))
            .respond_with(
                ResponseTemplate::new(200).append_header("set-cookie", "csrftoken=tok1; Path=/"),
            )
            .mount(server)
            .await;

        Mock::given(method("POST"))
            .and(path("/api/account/loginAjax/"))
            .respond_with(
                ResponseTemplate::new(200)
                    .append_header("set-cookie", "sessionid=abc; Path=/")
                    .set_body_json(json!({ "success": true })),
            )
            .expect(1)
            .mount(server)
            .await;
    }

    pub(crate) fn client_for(server: &MockServer) -> ZendutyClient {
        let config = ZendutyConfig {
            base_url: server.uri(),
            ..crate::config::Config::default().zenduty
        };
        ZendutyClient::new(
            &config,
            Arc::new(StaticCredentials::new("oncall@example.com", "secret")),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn list_teams_decodes_members() {
        let server = MockServer::start().await;
        mount_login(&server).await;

        Mock::given(method("GET"))
            .and(path("/api/account/teams"))
            .and(header("X-CSRFToken", "tok1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {
                    "unique_id": "team-1",
                    "name": "Platform",
                    "account": "acc-1",
                    "members": [{
                        "unique_id": "m-1",
                        "joining_date": "2023-04-01T10:00:00Z",
                        "user": {
                            "username": "u-1",
                            "first_name": "Ada",
                            "last_name": null,
                            "email": "ada@example.com"
                        }
                    }]
                }
            ])))
            .expect(2)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let teams = client.list_teams().await.unwrap();
        assert_eq!(teams.len(), 1);
        assert_eq!(teams[0].name, "Platform");
        assert_eq!(teams[0].members[0].user.last_name, "");
        assert!(teams[0].contains_user("ada@example.com"));
        assert!(!teams[0].contains_user("Ada@example.com"));

        // Session is reused for the second call.
        client.list_teams().await.unwrap();
    }

    #[tokio::test]
    async fn non_success_status_carries_code() {
        let server = MockServer::start().await;
        mount_login(&server).await;

        Mock::given(method("GET"))
            .and(path("/api/account/teams/team-1/schedules"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let client = client_for(&server);
        match client.list_schedules("team-1").await {
            Err(AppError::RemoteStatus { status, .. }) => assert_eq!(status.as_u16(), 404),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn malformed_json_is_a_decode_error() {
        let server = MockServer::start().await;
        mount_login(&server).await;

        Mock::given(method("GET"))
            .and(path("/api/account/teams"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"unique_id\":"))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert!(matches!(
            client.list_teams().await,
            Err(AppError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn get_schedule_follows_signed_url() {
        let server = MockServer::start().await;
        mount_login(&server).await;

        Mock::given(method("GET"))
            .and(path(
                "/api/account/teams/team-1/schedules/sched-1/get_schedule_ics/",
            ))
            .and(query_param("months", "12"))
            .and(query_param("is_team_or_user", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "url": format!("{}/signed/feed.ics", server.uri())
            })))
            .expect(1)
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/signed/feed.ics"))
            .respond_with(ResponseTemplate::new(200).set_body_string(feed(&[
                ("one", vec!["ada@example.com"]),
                ("two", vec!["bob@example.com"]),
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let schedule = client.get_schedule("team-1", "sched-1", 12).await.unwrap();
        assert_eq!(schedule.len(), 2);
        assert!(schedule.contains_event_id("one"));
    }

    #[tokio::test]
    async fn feed_failure_is_reported() {
        let server = MockServer::start().await;
        mount_login(&server).await;

        Mock::given(method("GET"))
            .and(path(
                "/api/account/teams/team-1/schedules/sched-1/get_schedule_ics/",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "url": format!("{}/signed/expired.ics", server.uri())
            })))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/signed/expired.ics"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;

        let client = client_for(&server);
        assert!(matches!(
            client.get_schedule("team-1", "sched-1", 12).await,
            Err(AppError::RemoteStatus { .. })
        ));
    }
}
