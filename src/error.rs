use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Session init error: {0}")]
    SessionInit(String),

    #[error("Login failed: {0}")]
    Login(String),

    #[error("Request error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Received error code {status} from server ({endpoint})")]
    RemoteStatus {
        status: reqwest::StatusCode,
        endpoint: String,
    },

    #[error("Decode error: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Calendar parse error: {0}")]
    Parse(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl AppError {
    /// Short message that is safe to hand to HTTP clients.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::SessionInit(_) => "Could not initialise the upstream session",
            Self::Login(_) => "Could not log in to the scheduling service",
            Self::Transport(_) => "Failed to communicate with the scheduling service",
            Self::RemoteStatus { .. } => "The scheduling service returned an error",
            Self::Decode(_) => "The scheduling service returned an unexpected response",
            Self::Parse(_) => "The schedule feed could not be read",
            Self::Config(_) => "Server configuration error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::Login(msg) => tracing::warn!("Login error: {}", msg),
            AppError::Transport(e) => tracing::error!("HTTP request error: {:?}", e),
            AppError::RemoteStatus { status, endpoint } => {
                tracing::error!("Zenduty API error ({}) from {}", status, endpoint)
            }
            other => tracing::error!("{}", other),
        }

        (
            StatusCode::INTERNAL_SERVER_ERROR,
            [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
            self.user_message(),
        )
            .into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
