//! Driver for the shared remote-controlled browser.
//!
//! The browser is pre-started and reached through its local debugging
//! endpoint; we never spawn it. One logical page per platform: the tab lease
//! is acquired before the page opens and released on every exit path by the
//! guard. Commands go over the page's WebSocket; replies are matched by id.

use std::path::PathBuf;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, warn};

use bayline_core::artifacts::ArtifactStore;
use bayline_core::tabs::{acquire_tab, TabGuard, TabRegistry};
use bayline_types::SourceError;

use crate::ports::SourceContext;

#[derive(Clone)]
pub struct BrowserDriver {
    http: reqwest::Client,
    cdp_url: String,
    tabs: Arc<TabRegistry>,
    artifacts: ArtifactStore,
}

impl BrowserDriver {
    pub fn new(cdp_url: impl Into<String>, tabs: Arc<TabRegistry>, artifacts: ArtifactStore) -> Self {
        Self {
            http: reqwest::Client::new(),
            cdp_url: cdp_url.into(),
            tabs,
            artifacts,
        }
    }

    /// True when the debugging endpoint answers `/json/version`.
    pub async fn reachable(&self) -> bool {
        self.http
            .get(format!("{}/json/version", self.cdp_url))
            .timeout(std::time::Duration::from_secs(2))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    /// Opens a page for `platform`, holding its tab lease for the session's
    /// lifetime. Waits for a contended lease up to the context deadline.
    pub async fn open(
        &self,
        ctx: &SourceContext,
        platform: &str,
        url: &str,
    ) -> Result<BrowserSession, SourceError> {
        let guard = acquire_tab(&self.tabs, platform, &ctx.run_id, &ctx.deadline).await?;

        let target: Value = ctx
            .deadline
            .run(async {
                let response = self
                    .http
                    .put(format!("{}/json/new?{}", self.cdp_url, url))
                    .send()
                    .await
                    .map_err(|e| crate::api::classify_reqwest("browser", e))?;
                if !response.status().is_success() {
                    return Err(SourceError::platform_down("browser"));
                }
                response
                    .json()
                    .await
                    .map_err(|e| SourceError::parse(e.to_string()))
            })
            .await?;

        let target_id = target["id"]
            .as_str()
            .ok_or_else(|| SourceError::parse("target id missing"))?
            .to_string();
        let ws_url = target["webSocketDebuggerUrl"]
            .as_str()
            .ok_or_else(|| SourceError::parse("webSocketDebuggerUrl missing"))?
            .to_string();

        let (ws, _) = ctx
            .deadline
            .run(async {
                connect_async(&ws_url)
                    .await
                    .map_err(|e| SourceError::network(e.to_string()))
            })
            .await?;

        debug!(target: "bayline.browser", platform, target_id = %target_id, "page opened");
        Ok(BrowserSession {
            driver: self.clone(),
            ws,
            guard,
            target_id,
            next_id: 0,
        })
    }
}

pub struct BrowserSession {
    driver: BrowserDriver,
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    guard: TabGuard,
    target_id: String,
    next_id: u64,
}

impl BrowserSession {
    pub fn platform(&self) -> &str {
        self.guard.platform()
    }

    /// Sends one protocol command and waits for its reply. Every command
    /// refreshes the tab lease so an active session is never reaped as
    /// stale.
    pub async fn command(
        &mut self,
        ctx: &SourceContext,
        method: &str,
        params: Value,
    ) -> Result<Value, SourceError> {
        if ctx.is_cancelled() {
            return Err(SourceError::DeadlineExceeded);
        }
        self.next_id += 1;
        let id = self.next_id;
        self.guard.touch();

        let frame = json!({ "id": id, "method": method, "params": params });
        self.ws
            .send(Message::Text(frame.to_string()))
            .await
            .map_err(|_| SourceError::StaleTab)?;

        loop {
            let message = ctx
                .deadline
                .run(async {
                    self.ws
                        .next()
                        .await
                        .ok_or(SourceError::StaleTab)?
                        .map_err(|_| SourceError::StaleTab)
                })
                .await?;

            let Message::Text(text) = message else {
                continue;
            };
            let Ok(value) = serde_json::from_str::<Value>(&text) else {
                continue;
            };
            if value["id"].as_u64() != Some(id) {
                // Unsolicited event; protocol events are not consumed here.
                continue;
            }
            if let Some(error) = value.get("error") {
                return Err(SourceError::parse(
                    error["message"].as_str().unwrap_or("protocol error").to_string(),
                ));
            }
            return Ok(value["result"].clone());
        }
    }

    pub async fn navigate(&mut self, ctx: &SourceContext, url: &str) -> Result<(), SourceError> {
        self.command(ctx, "Page.navigate", json!({ "url": url }))
            .await?;
        // Poll readiness instead of subscribing to load events; simpler and
        // bounded by the context deadline either way.
        loop {
            let state = self
                .evaluate(ctx, "document.readyState")
                .await
                .unwrap_or(Value::Null);
            if state.as_str() == Some("complete") {
                return Ok(());
            }
            if ctx.is_cancelled() {
                return Err(SourceError::DeadlineExceeded);
            }
            tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        }
    }

    /// Evaluates a JS expression in the page, returning its JSON value.
    pub async fn evaluate(&mut self, ctx: &SourceContext, expr: &str) -> Result<Value, SourceError> {
        let result = self
            .command(
                ctx,
                "Runtime.evaluate",
                json!({ "expression": expr, "returnByValue": true, "awaitPromise": true }),
            )
            .await?;
        if result["exceptionDetails"].is_object() {
            return Err(SourceError::parse("page script threw"));
        }
        Ok(result["result"]["value"].clone())
    }

    /// Captures a screenshot into the artifact store; returns its path.
    pub async fn screenshot(
        &mut self,
        ctx: &SourceContext,
        label: &str,
    ) -> Result<PathBuf, SourceError> {
        let result = self
            .command(ctx, "Page.captureScreenshot", json!({ "format": "png" }))
            .await?;
        let data = result["data"]
            .as_str()
            .ok_or_else(|| SourceError::parse("screenshot data missing"))?;
        let bytes = BASE64
            .decode(data)
            .map_err(|_| SourceError::parse("screenshot not base64"))?;
        let path = self.driver.artifacts.screenshot_path(&ctx.run_id, label);
        if let Some(parent) = path.parent() {
            let _ = tokio::fs::create_dir_all(parent).await;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|e| SourceError::network(e.to_string()))?;
        Ok(path)
    }

    /// Closes the page and releases the lease. Dropping without closing
    /// still releases the lease; the page itself is then reaped by the
    /// stale-tab sweep on the browser side.
    pub async fn close(self) {
        let url = format!("{}/json/close/{}", self.driver.cdp_url, self.target_id);
        if let Err(err) = self.driver.http.get(url).send().await {
            warn!(target: "bayline.browser", error = %err, "page close failed");
        }
        // guard drops here, releasing the lease
    }
}

// ---------------------------------------------------------------------------
// Login healing
// ---------------------------------------------------------------------------

/// Restores a vendor session by re-running the login form on the shared
/// browser. Form fields are found generically (username/email + password
/// inputs); vendor-specific page structure stays out of this layer.
pub struct BrowserLoginHealer {
    driver: Arc<BrowserDriver>,
    login_urls: Vec<(String, String)>,
}

impl BrowserLoginHealer {
    pub fn new(driver: Arc<BrowserDriver>, login_urls: Vec<(String, String)>) -> Self {
        Self { driver, login_urls }
    }
}

#[async_trait::async_trait]
impl bayline_core::auth::AuthHealer for BrowserLoginHealer {
    async fn heal(
        &self,
        creds: &bayline_core::auth::PlatformCredentials,
    ) -> Result<bayline_core::auth::CachedToken, SourceError> {
        let (Some(username), Some(password)) = (&creds.username, &creds.password) else {
            return Err(SourceError::auth_failed(&creds.platform));
        };
        let Some((_, login_url)) = self
            .login_urls
            .iter()
            .find(|(platform, _)| *platform == creds.platform)
        else {
            return Err(SourceError::auth_failed(&creds.platform));
        };

        let ctx = SourceContext::new(
            format!("auth-{}", creds.platform),
            bayline_core::deadline::RunDeadline::new(std::time::Duration::from_secs(60)),
            bayline_observability::RunLogger::new("auth", format!("auth-{}", creds.platform)),
        );

        let mut session = self.driver.open(&ctx, &creds.platform, login_url).await?;
        let outcome = async {
            session.navigate(&ctx, login_url).await?;

            let user_json = serde_json::to_string(username)
                .map_err(|e| SourceError::parse(e.to_string()))?;
            let pass_json = serde_json::to_string(password)
                .map_err(|e| SourceError::parse(e.to_string()))?;
            let fill = format!(
                "(() => {{\
                   const user = document.querySelector('input[type=email],input[name*=user i],input[name*=login i]');\
                   const pass = document.querySelector('input[type=password]');\
                   if (!user || !pass) return 'missing-form';\
                   user.value = {user_json}; pass.value = {pass_json};\
                   user.dispatchEvent(new Event('input', {{bubbles: true}}));\
                   pass.dispatchEvent(new Event('input', {{bubbles: true}}));\
                   const form = pass.closest('form');\
                   if (form) form.requestSubmit(); else pass.dispatchEvent(\
                     new KeyboardEvent('keydown', {{key: 'Enter', bubbles: true}}));\
                   return 'submitted';\
                 }})()"
            );
            let submitted = session.evaluate(&ctx, &fill).await?;
            if submitted.as_str() != Some("submitted") {
                return Err(SourceError::auth_failed(&creds.platform));
            }

            // Login pages redirect away when the session is established.
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(500)).await;
                if ctx.is_cancelled() {
                    return Err(SourceError::auth_failed(&creds.platform));
                }
                let on_login = session
                    .evaluate(&ctx, "location.href.toLowerCase().includes('login')")
                    .await?;
                if on_login.as_bool() == Some(false) {
                    break;
                }
            }

            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            Ok(bayline_core::auth::CachedToken {
                token: format!("browser-session:{}", uuid::Uuid::new_v4()),
                expires_at_monotonic_seconds: now + 30 * 60,
            })
        }
        .await;
        session.close().await;
        outcome
    }
}
