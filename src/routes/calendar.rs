use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};

use crate::error::AppResult;
use crate::services::aggregator::{combined_schedule, AggregationOptions, ScheduleSource};
use crate::services::schedule::Schedule;
use crate::AppState;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        // Single schedule of one team, narrowed to one attendee
        .route("/calendar/:team/:schedule/:member", get(by_attendee))
        // Combined schedule of the configured user
        .route("/myschedule", get(my_schedule))
        // Combined schedule of any member (email address)
        .route("/myschedule/:member", get(member_schedule))
}

async fn by_attendee(
    State(state): State<Arc<AppState>>,
    Path((team, schedule, member)): Path<(String, String, String)>,
) -> AppResult<Response> {
    let schedule = state
        .zenduty
        .get_schedule(&team, &schedule, state.config.zenduty.schedule_months)
        .await?;

    Ok(calendar_response(
        &state,
        &schedule.only_attendees(&[member]),
    ))
}

async fn my_schedule(State(state): State<Arc<AppState>>) -> AppResult<Response> {
    let email = state.config.zenduty.username.clone();
    combined_for(&state, email).await
}

async fn member_schedule(
    State(state): State<Arc<AppState>>,
    Path(member): Path<String>,
) -> AppResult<Response> {
    combined_for(&state, member).await
}

async fn combined_for(state: &AppState, email: String) -> AppResult<Response> {
    let options = AggregationOptions {
        months: state.config.zenduty.schedule_months,
        concurrency: state.config.zenduty.fetch_concurrency,
    };
    let combined = combined_schedule(&state.zenduty, &email, &options).await?;

    Ok(calendar_response(state, &combined.only_attendees(&[email])))
}

fn calendar_response(state: &AppState, schedule: &Schedule) -> Response {
    (
        [
            (
                header::CONTENT_TYPE,
                "text/calendar; charset=utf-8".to_string(),
            ),
            (
                header::CACHE_CONTROL,
                format!("max-age={}, public", state.config.server.cache_max_age_seconds),
            ),
        ],
        schedule.serialize(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::services::schedule::tests::feed;
    use crate::services::zenduty::tests::{client_for, mount_login};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::json;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn app(server: &MockServer) -> Router {
        let mut config = Config::default();
        config.zenduty.base_url = server.uri();
        config.zenduty.username = "me@example.com".to_string();

        let state = Arc::new(AppState {
            config,
            zenduty: client_for(server),
        });
        router().with_state(state)
    }

    async fn mount_schedule(server: &MockServer, team: &str, schedule: &str, ics: String) {
        let feed_path = format!("/signed/{}/{}.ics", team, schedule);
        Mock::given(method("GET"))
            .and(path(format!(
                "/api/account/teams/{}/schedules/{}/get_schedule_ics/",
                team, schedule
            )))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "url": format!("{}{}", server.uri(), feed_path)
            })))
            .mount(server)
            .await;

        Mock::given(method("GET"))
            .and(path(feed_path))
            .respond_with(ResponseTemplate::new(200).set_body_string(ics))
            .mount(server)
            .await;
    }

    async fn get(app: Router, uri: &str) -> (StatusCode, http::HeaderMap, String) {
        let res = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = res.status();
        let headers = res.headers().clone();
        let body = res.into_body().collect().await.unwrap().to_bytes();
        (status, headers, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn single_schedule_is_filtered_by_member() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        mount_schedule(
            &server,
            "t1",
            "s1",
            feed(&[
                ("one", vec!["me@example.com"]),
                ("two", vec!["other@example.com"]),
            ]),
        )
        .await;

        let (status, headers, body) =
            get(app(&server), "/calendar/t1/s1/me@example.com").await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            headers[header::CONTENT_TYPE],
            "text/calendar; charset=utf-8"
        );
        assert_eq!(headers[header::CACHE_CONTROL], "max-age=300, public");
        assert!(body.contains("UID:one"));
        assert!(!body.contains("UID:two"));
    }

    #[tokio::test]
    async fn my_schedule_uses_configured_user() {
        let server = MockServer::start().await;
        mount_login(&server).await;

        Mock::given(method("GET"))
            .and(path("/api/account/teams"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                {
                    "unique_id": "t1",
                    "name": "Ops",
                    "account": "a1",
                    "members": [{
                        "unique_id": "m1",
                        "user": { "username": "u1", "first_name": "Me", "last_name": "", "email": "me@example.com" }
                    }]
                },
                {
                    "unique_id": "t2",
                    "name": "Billing",
                    "account": "a1",
                    "members": []
                }
            ])))
            .mount(&server)
            .await;

        Mock::given(method("GET"))
            .and(path("/api/account/teams/t1/schedules"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([
                { "unique_id": "s1", "name": "Primary", "summary": null, "description": "" }
            ])))
            .mount(&server)
            .await;

        mount_schedule(
            &server,
            "t1",
            "s1",
            feed(&[
                ("mine", vec!["me@example.com"]),
                ("theirs", vec!["other@example.com"]),
            ]),
        )
        .await;

        let (status, _, body) = get(app(&server), "/myschedule").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("UID:mine"));
        assert!(!body.contains("UID:theirs"));
        assert!(body.contains("SUMMARY:on call for team Ops"));
    }

    #[tokio::test]
    async fn member_without_teams_gets_empty_calendar() {
        let server = MockServer::start().await;
        mount_login(&server).await;

        Mock::given(method("GET"))
            .and(path("/api/account/teams"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
            .mount(&server)
            .await;

        let (status, _, body) = get(app(&server), "/myschedule/nobody@example.com").await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.contains("BEGIN:VCALENDAR"));
        assert!(!body.contains("BEGIN:VEVENT"));
    }

    #[tokio::test]
    async fn upstream_failure_is_a_500_without_details() {
        let server = MockServer::start().await;
        mount_login(&server).await;

        Mock::given(method("GET"))
            .and(path("/api/account/teams"))
            .respond_with(ResponseTemplate::new(502).set_body_string("internal stack trace"))
            .mount(&server)
            .await;

        let (status, _, body) = get(app(&server), "/myschedule").await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body.contains("stack trace"));
        assert!(!body.is_empty());
    }
}
