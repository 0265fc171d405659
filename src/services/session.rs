use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::cookie::{CookieStore, Jar};
use reqwest::{header, Client, Method, RequestBuilder};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use url::Url;

use crate::error::{AppError, AppResult};

pub const SESSION_COOKIE: &str = "sessionid";
pub const CSRF_COOKIE: &str = "csrftoken";
pub const CSRF_HEADER: &str = "X-CSRFToken";

const LOGIN_PAGE_PATH: &str = "/login/";
const LOGIN_PATH: &str = "/api/account/loginAjax/";

// ============================================================================
// Credentials
// ============================================================================

#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Supplies login credentials on demand, so the session never stores or
/// looks up secrets itself.
#[async_trait]
pub trait CredentialResolver: Send + Sync + 'static {
    async fn resolve(&self) -> AppResult<Credentials>;
}

/// Fixed username/password pair, usually taken from the process configuration.
#[derive(Debug, Clone)]
pub struct StaticCredentials(Credentials);

impl StaticCredentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self(Credentials {
            email: email.into(),
            password: password.into(),
        })
    }
}

#[async_trait]
impl CredentialResolver for StaticCredentials {
    async fn resolve(&self) -> AppResult<Credentials> {
        Ok(self.0.clone())
    }
}

// ============================================================================
// Login Types
// ============================================================================

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    success: bool,
}

// ============================================================================
// Session
// ============================================================================

/// Cookie-backed session against the Zenduty web application.
///
/// Authentication lives entirely in the cookie jar: the `sessionid` cookie
/// marks a logged-in session and the `csrftoken` cookie is echoed back in the
/// `X-CSRFToken` header. Expired cookies are dropped by the jar, so a present
/// `sessionid` is a valid one.
pub struct Session {
    http: Client,
    jar: Arc<Jar>,
    base_url: Url,
    credentials: Arc<dyn CredentialResolver>,
    login_lock: Mutex<()>,
}

impl Session {
    pub fn new(
        base_url: &str,
        timeout: Duration,
        credentials: Arc<dyn CredentialResolver>,
    ) -> AppResult<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| AppError::Config(format!("invalid base URL '{}': {}", base_url, e)))?;

        let jar = Arc::new(Jar::default());
        let http = Client::builder()
            .timeout(timeout)
            .cookie_provider(jar.clone())
            .build()
            .map_err(|e| AppError::SessionInit(e.to_string()))?;

        Ok(Self {
            http,
            jar,
            base_url,
            credentials,
            login_lock: Mutex::new(()),
        })
    }

    /// The underlying HTTP client (shares the session's cookie jar).
    pub fn http(&self) -> &Client {
        &self.http
    }

    /// Absolute URL for a path on the remote service.
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url.as_str().trim_end_matches('/'), path)
    }

    pub fn is_logged_in(&self) -> bool {
        self.cookie_value(SESSION_COOKIE).is_some()
    }

    /// Current CSRF token, read fresh from the jar since the server may rotate it.
    pub fn csrf_token(&self) -> Option<String> {
        self.cookie_value(CSRF_COOKIE)
    }

    /// Build a request that carries the current CSRF token.
    pub fn authenticated(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self
            .http
            .request(method, url)
            .header(header::CONTENT_TYPE, "application/json");

        match self.csrf_token() {
            Some(token) => builder.header(CSRF_HEADER, token),
            None => builder,
        }
    }

    /// Log in unless a session cookie is already present.
    ///
    /// Concurrent callers that find no session queue on the login lock; the
    /// first one logs in and the rest see the fresh cookie on the re-check.
    pub async fn ensure_session(&self) -> AppResult<()> {
        if self.is_logged_in() {
            return Ok(());
        }

        let _guard = self.login_lock.lock().await;
        if self.is_logged_in() {
            tracing::debug!("Session established by a concurrent caller");
            return Ok(());
        }

        self.login_locked().await
    }

    /// Unconditionally perform a fresh login.
    pub async fn login(&self) -> AppResult<()> {
        let _guard = self.login_lock.lock().await;
        self.login_locked().await
    }

    async fn login_locked(&self) -> AppResult<()> {
        tracing::info!("Logging in to {}", self.base_url);

        // The login page seeds the csrftoken cookie.
        let page = self
            .http
            .get(self.endpoint(LOGIN_PAGE_PATH))
            .send()
            .await
            .map_err(|e| AppError::Login(format!("error getting login page: {}", e)))?;
        if !page.status().is_success() {
            return Err(AppError::Login(format!(
                "error getting login page: status {}",
                page.status()
            )));
        }

        let credentials = self.credentials.resolve().await?;

        let response = self
            .authenticated(Method::POST, &self.endpoint(LOGIN_PATH))
            .json(&LoginRequest {
                email: &credentials.email,
                password: &credentials.password,
            })
            .send()
            .await
            .map_err(|e| AppError::Login(format!("error logging in: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            self.invalidate();
            return Err(AppError::Login(format!(
                "received error code {} from server",
                status
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| AppError::Login(format!("error reading login response: {}", e)))?;
        let login: LoginResponse = match serde_json::from_slice(&body) {
            Ok(login) => login,
            Err(e) => {
                self.invalidate();
                return Err(AppError::Login(format!("malformed login response: {}", e)));
            }
        };

        if !login.success {
            self.invalidate();
            return Err(AppError::Login(format!(
                "credentials for {} were rejected",
                credentials.email
            )));
        }

        if self.is_logged_in() {
            tracing::info!("Logged in to {} as {}", self.base_url, credentials.email);
        } else {
            tracing::warn!(
                "Login for {} succeeded but no {} cookie was issued",
                credentials.email,
                SESSION_COOKIE
            );
        }

        Ok(())
    }

    // Expire any session cookie so a failed login never leaves a session behind.
    fn invalidate(&self) {
        let expired = format!(
            "{}=; Max-Age=0; Expires=Thu, 01 Jan 1970 00:00:00 GMT; Path=/",
            SESSION_COOKIE
        );
        self.jar.add_cookie_str(&expired, &self.base_url);
    }

    fn cookie_value(&self, name: &str) -> Option<String> {
        let header = self.jar.cookies(&self.base_url)?;
        let header = header.to_str().ok()?;

        header.split(';').map(str::trim).find_map(|pair| {
            let (key, value) = pair.split_once('=')?;
            (key == name).then(|| value.to_string())
        })
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("base_url", &self.base_url.as_str())
            .field("logged_in", &self.is_logged_in())
            .finish()
    }
}
