//! Record fetcher - HTTP lookups of projects and users.
//!
//! Builders that need current project state call through the
//! [`RecordFetcher`] trait. [`HttpRecordFetcher`] is the production
//! implementation backed by a shared `reqwest` client.
//!
//! # Example
//!
//! ```rust,ignore
//! use herald::fetcher::HttpRecordFetcher;
//! use std::time::Duration;
//!
//! let fetcher = HttpRecordFetcher::new(
//!     "https://api.example.com/v5/projects",
//!     "https://api.example.com/v5/users",
//! )
//! .with_timeout(Duration::from_secs(5))
//! .with_retries(2);
//! ```

use crate::config::ApiConfig;
use crate::event::{Project, User};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Default timeout for record lookups
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default number of retries on 5xx and transport errors
const DEFAULT_RETRIES: u32 = 1;

/// Errors that can occur while fetching a record.
#[derive(Error, Debug)]
pub enum FetchError {
    /// Transport failure, including timeouts
    #[error("request to {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    /// The API answered with a non-success status
    #[error("{url} returned status {status}")]
    Status { url: String, status: StatusCode },

    /// The body did not decode into the expected record
    #[error("malformed body from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Looks up project and user records by id.
#[async_trait]
pub trait RecordFetcher: Send + Sync {
    async fn fetch_project(&self, id: i64) -> Result<Project, FetchError>;

    async fn fetch_user(&self, id: i64) -> Result<User, FetchError>;
}

/// Fetches records from the projects and users REST APIs.
#[derive(Debug, Clone)]
pub struct HttpRecordFetcher {
    projects_url: String,
    users_url: String,

    /// HTTP client (reused for connection pooling)
    client: Client,

    token: Option<String>,
    timeout: Duration,
    retries: u32,
}

impl HttpRecordFetcher {
    pub fn new(projects_url: impl Into<String>, users_url: impl Into<String>) -> Self {
        Self {
            projects_url: projects_url.into(),
            users_url: users_url.into(),
            client: Client::new(),
            token: None,
            timeout: DEFAULT_TIMEOUT,
            retries: DEFAULT_RETRIES,
        }
    }

    pub fn from_config(config: &ApiConfig) -> Self {
        let fetcher = Self::new(&config.projects_url, &config.users_url)
            .with_timeout(Duration::from_millis(config.timeout_ms))
            .with_retries(config.retries);

        match &config.token {
            Some(token) => fetcher.with_token(token),
            None => fetcher,
        }
    }

    /// Set custom timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set number of retries on 5xx and transport errors
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    /// Send a bearer token with every request
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn record_url(base: &str, id: i64) -> String {
        format!("{}/{}", base.trim_end_matches('/'), id)
    }

    /// GET a record with retries on server and transport errors.
    async fn get_json<T: DeserializeOwned>(&self, url: String) -> Result<T, FetchError> {
        let mut attempts = 0;

        loop {
            if attempts > 0 {
                debug!(url = %url, attempt = attempts, "Retrying record fetch");
            }

            let mut request = self.client.get(&url).timeout(self.timeout);
            if let Some(token) = &self.token {
                request = request.bearer_auth(token);
            }

            let error = match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response
                            .json::<T>()
                            .await
                            .map_err(|source| FetchError::Decode { url, source });
                    }

                    warn!(status = %status, url = %url, attempt = attempts, "Record API returned error status");

                    // Client errors are not retried
                    if !status.is_server_error() {
                        return Err(FetchError::Status { url, status });
                    }

                    FetchError::Status {
                        url: url.clone(),
                        status,
                    }
                }
                Err(source) => {
                    warn!(error = %source, url = %url, attempt = attempts, "Record fetch failed");
                    FetchError::Http {
                        url: url.clone(),
                        source,
                    }
                }
            };

            attempts += 1;
            if attempts > self.retries {
                return Err(error);
            }
        }
    }
}

#[async_trait]
impl RecordFetcher for HttpRecordFetcher {
    async fn fetch_project(&self, id: i64) -> Result<Project, FetchError> {
        debug!(project_id = id, "Fetching project");
        self.get_json(Self::record_url(&self.projects_url, id)).await
    }

    async fn fetch_user(&self, id: i64) -> Result<User, FetchError> {
        debug!(user_id = id, "Fetching user");
        self.get_json(Self::record_url(&self.users_url, id)).await
    }
}
