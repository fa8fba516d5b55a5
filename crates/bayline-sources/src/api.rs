//! Shared HTTP JSON client for vendor APIs.
//!
//! Bearer-token requests with uniform failure classification. A 401 marks
//! the platform for a Session Manager heal on next use and surfaces as
//! `AUTH_FAILED` here.

use std::sync::Arc;

use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use bayline_core::auth::SessionManager;
use bayline_types::SourceError;

use crate::ports::SourceContext;

#[derive(Clone)]
pub struct JsonApiClient {
    http: Client,
    platform: &'static str,
    base_url: String,
    token: Arc<RwLock<Option<String>>>,
    sessions: Option<Arc<SessionManager>>,
}

impl JsonApiClient {
    pub fn new(platform: &'static str, base_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            platform,
            base_url: base_url.into(),
            token: Arc::new(RwLock::new(None)),
            sessions: None,
        }
    }

    pub fn with_sessions(mut self, sessions: Arc<SessionManager>) -> Self {
        self.sessions = Some(sessions);
        self
    }

    pub fn with_token(self, token: impl Into<String>) -> Self {
        {
            let slot = self.token.clone();
            let token = token.into();
            // Constructor-time set; no contention yet.
            if let Ok(mut guard) = slot.try_write() {
                *guard = Some(token);
            };
        }
        self
    }

    pub async fn set_token(&self, token: impl Into<String>) {
        *self.token.write().await = Some(token.into());
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn get_json<T: DeserializeOwned>(
        &self,
        ctx: &SourceContext,
        path: &str,
    ) -> Result<T, SourceError> {
        self.request(ctx, reqwest::Method::GET, path, None).await
    }

    pub async fn post_json<T: DeserializeOwned>(
        &self,
        ctx: &SourceContext,
        path: &str,
        body: Value,
    ) -> Result<T, SourceError> {
        self.request(ctx, reqwest::Method::POST, path, Some(body))
            .await
    }

    async fn request<T: DeserializeOwned>(
        &self,
        ctx: &SourceContext,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> Result<T, SourceError> {
        let url = format!("{}{}", self.base_url, path);
        let platform = self.platform;

        let mut builder = self.http.request(method, &url);
        if let Some(token) = self.token.read().await.clone() {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = body {
            builder = builder.json(&body);
        }

        let fut = async {
            let response = builder.send().await.map_err(|e| classify_reqwest(platform, e))?;
            let status = response.status();
            if status == StatusCode::UNAUTHORIZED {
                debug!(target: "bayline.api", platform, "401 — scheduling session heal");
                if let Some(sessions) = &self.sessions {
                    // Degrade the cached state so the next stage heals first.
                    let _ = sessions.check(platform).await;
                }
                return Err(SourceError::auth_failed(platform));
            }
            if status.is_server_error() {
                return Err(SourceError::Transient5xx {
                    status: status.as_u16(),
                });
            }
            if status == StatusCode::NOT_FOUND {
                return Err(SourceError::NotFound);
            }
            if !status.is_success() {
                return Err(SourceError::platform_down(platform));
            }
            response
                .json::<T>()
                .await
                .map_err(|e| SourceError::parse(e.to_string()))
        };

        ctx.deadline.run(fut).await
    }
}

pub fn classify_reqwest(platform: &str, err: reqwest::Error) -> SourceError {
    if err.is_timeout() {
        SourceError::Timeout
    } else if err.is_connect() {
        SourceError::platform_down(platform)
    } else if err.is_decode() {
        SourceError::parse(err.to_string())
    } else {
        SourceError::network(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_carries_base_url() {
        let client = JsonApiClient::new("partstech", "https://api.example.test/v1");
        assert_eq!(client.base_url(), "https://api.example.test/v1");
    }
}
