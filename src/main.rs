use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use axum::{routing::get, Router};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
mod middleware;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use axum::body::Body;
use http::StatusCode;
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::key_extractor::SmartIpKeyExtractor;
use tower_governor::{GovernorError, GovernorLayer};

mod config;
mod error;
mod routes;
mod services;

use config::Config;
use services::session::StaticCredentials;
use services::zenduty::ZendutyClient;

pub struct AppState {
    pub config: Config,
    pub zenduty: ZendutyClient,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "zenduty_calendar=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration (.env first, real environment wins)
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting Zenduty Calendar Service");

    let credentials = Arc::new(StaticCredentials::new(
        config.zenduty.username.clone(),
        config.zenduty.password.clone(),
    ));
    let zenduty = ZendutyClient::new(&config.zenduty, credentials)?;

    if config.zenduty.login_on_startup {
        zenduty.login().await?;
    }

    let app_state = Arc::new(AppState {
        config: config.clone(),
        zenduty,
    });

    let thread_shutdown = Arc::new(AtomicBool::new(false));

    // Every calendar request fans out into many upstream calls, so limit them per client IP.
    let mut calendar_builder = GovernorConfigBuilder::default();
    calendar_builder.per_second(config.rate_limit.calendar_per_second.into());
    calendar_builder.burst_size(config.rate_limit.calendar_burst);
    let mut calendar_builder = calendar_builder.key_extractor(SmartIpKeyExtractor);
    calendar_builder.error_handler(rate_limit_response);

    let calendar_gov_conf = Arc::new(
        calendar_builder
            .finish()
            .ok_or_else(|| anyhow::anyhow!("Failed to build calendar governor config"))?,
    );

    // Background cleanup for calendar limiter storage
    let calendar_cleaner = {
        let limiter = calendar_gov_conf.limiter().clone();
        let interval = Duration::from_secs(60);
        let flag = thread_shutdown.clone();
        std::thread::spawn(move || {
            // Use smaller sleep granularity to allow quick shutdown.
            let tick = Duration::from_secs(1);
            loop {
                for _ in 0..interval.as_secs() {
                    if flag.load(Ordering::SeqCst) {
                        tracing::info!("Calendar rate limiter cleanup thread exiting");
                        return;
                    }
                    std::thread::sleep(tick);
                }
                tracing::debug!("calendar rate limiter size: {}", limiter.len());
                limiter.retain_recent();
            }
        })
    };

    let calendar_rate_layer = GovernorLayer {
        config: calendar_gov_conf.clone(),
    };

    // Build router
    let app = Router::new()
        // Static landing page
        .route("/", get(routes::index::index))
        // Health check
        .route("/health", get(routes::health::health_check))
        // Calendar feeds (rate limited)
        .merge(routes::calendar::router().layer(calendar_rate_layer))
        .with_state(app_state.clone())
        .layer(
            ServiceBuilder::new()
                // Access log
                .layer(TraceLayer::new_for_http())
                // CSP middleware: set Content-Security-Policy headers
                .layer(axum::middleware::from_fn(middleware::csp::csp_middleware)),
        );

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Server listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());

    if let Err(e) = server.await {
        tracing::error!("Server error: {}", e);
    }

    // Join the cleanup thread; it checks `thread_shutdown` and should exit quickly.
    thread_shutdown.store(true, Ordering::SeqCst);
    if let Err(e) = calendar_cleaner.join() {
        tracing::warn!("Calendar cleanup thread join failed: {:?}", e);
    }

    tracing::info!("Shutdown complete");

    Ok(())
}

// Calendar clients poll; tell them when to come back.
fn rate_limit_response(error: GovernorError) -> http::Response<Body> {
    let (status, body, retry_after) = match error {
        GovernorError::TooManyRequests { wait_time, .. } => (
            StatusCode::TOO_MANY_REQUESTS,
            "Rate limit exceeded",
            Some(wait_time),
        ),
        _ => (
            StatusCode::BAD_REQUEST,
            "Unable to determine client IP for rate limiting",
            None,
        ),
    };

    let mut resp = http::Response::new(Body::from(body));
    *resp.status_mut() = status;
    if let Some(seconds) = retry_after {
        resp.headers_mut()
            .insert(http::header::RETRY_AFTER, http::HeaderValue::from(seconds));
    }
    resp
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(e) => {
                tracing::warn!("Failed to bind SIGTERM: {}", e);
                let _ = ctrl_c.await;
                return;
            }
        };
        tokio::select! {
            _ = ctrl_c => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }

    tracing::info!("Shutdown signal received, draining connections");
}
