//! Vendor session management.
//!
//! One `AuthState` per integrated platform, mutated only here. `check` is
//! cheap (token cache where the platform has one, `NEEDS_BROWSER_CHECK`
//! otherwise); `heal` attempts a re-login through the registered healer;
//! `preflight` runs check→heal for every enabled platform in parallel.
//!
//! Per-platform state machine:
//! `UNKNOWN → CHECKING → {AUTHENTICATED, DEGRADED, DISABLED} → HEALING →
//! AUTHENTICATED | DEGRADED`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use bayline_types::SourceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthPhase {
    Unknown,
    Checking,
    Authenticated,
    Degraded,
    Disabled,
    Healing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthReason {
    Ok,
    NeedsBrowserCheck,
    PlatformDisabled,
    TokenExpired,
    LoginFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenSource {
    Cache,
    BrowserLogin,
    None,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthState {
    pub authenticated: bool,
    pub reason_code: AuthReason,
    pub token_source: TokenSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<u64>,
}

impl AuthState {
    fn disabled() -> Self {
        Self {
            authenticated: false,
            reason_code: AuthReason::PlatformDisabled,
            token_source: TokenSource::None,
            expires_at: None,
        }
    }
}

/// Stored credentials for one platform; absence of both secrets disables it.
#[derive(Debug, Clone, Default)]
pub struct PlatformCredentials {
    pub platform: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub api_key: Option<String>,
    /// Platforms with an API key authenticate without the browser.
    pub token_cached: bool,
}

impl PlatformCredentials {
    pub fn is_configured(&self) -> bool {
        self.api_key.is_some() || (self.username.is_some() && self.password.is_some())
    }
}

/// Re-login hook, implemented by the browser driver layer.
#[async_trait]
pub trait AuthHealer: Send + Sync {
    async fn heal(&self, creds: &PlatformCredentials) -> Result<CachedToken, SourceError>;
}

// ---------------------------------------------------------------------------
// Token cache files
// ---------------------------------------------------------------------------

/// Self-describing per-platform token record, persisted in the OS temp dir.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CachedToken {
    pub token: String,
    pub expires_at_monotonic_seconds: u64,
}

impl CachedToken {
    pub fn is_expired(&self) -> bool {
        self.expires_at_monotonic_seconds <= unix_seconds()
    }
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn cache_path(dir: &Path, platform: &str) -> PathBuf {
    dir.join(format!("{platform}.token.json"))
}

/// Loads the cached token; expired or unparseable files read as absent.
pub async fn load_cached_token(dir: &Path, platform: &str) -> Option<CachedToken> {
    let bytes = tokio::fs::read(cache_path(dir, platform)).await.ok()?;
    let token: CachedToken = serde_json::from_slice(&bytes).ok()?;
    if token.is_expired() {
        return None;
    }
    Some(token)
}

/// Persists the token crash-safely: write to a sibling temp file, then rename.
pub async fn store_cached_token(
    dir: &Path,
    platform: &str,
    token: &CachedToken,
) -> anyhow::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let path = cache_path(dir, platform);
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(token)?).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Session manager
// ---------------------------------------------------------------------------

struct PlatformSession {
    creds: PlatformCredentials,
    phase: AuthPhase,
    state: AuthState,
}

pub struct SessionManager {
    cache_dir: PathBuf,
    sessions: RwLock<HashMap<String, PlatformSession>>,
    healer: Option<Arc<dyn AuthHealer>>,
}

impl SessionManager {
    pub fn new(
        cache_dir: PathBuf,
        platforms: Vec<PlatformCredentials>,
        healer: Option<Arc<dyn AuthHealer>>,
    ) -> Self {
        let sessions = platforms
            .into_iter()
            .map(|creds| {
                let initial = if creds.is_configured() {
                    AuthState {
                        authenticated: false,
                        reason_code: AuthReason::NeedsBrowserCheck,
                        token_source: TokenSource::None,
                        expires_at: None,
                    }
                } else {
                    AuthState::disabled()
                };
                let phase = if creds.is_configured() {
                    AuthPhase::Unknown
                } else {
                    AuthPhase::Disabled
                };
                (
                    creds.platform.clone(),
                    PlatformSession {
                        creds,
                        phase,
                        state: initial,
                    },
                )
            })
            .collect();
        Self {
            cache_dir,
            sessions: RwLock::new(sessions),
            healer,
        }
    }

    pub async fn enabled_platforms(&self) -> Vec<String> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.creds.is_configured())
            .map(|s| s.creds.platform.clone())
            .collect()
    }

    pub async fn phase(&self, platform: &str) -> AuthPhase {
        self.sessions
            .read()
            .await
            .get(platform)
            .map(|s| s.phase)
            .unwrap_or(AuthPhase::Disabled)
    }

    /// Current auth state. Consults the token cache for platforms that keep
    /// one; otherwise reports `NEEDS_BROWSER_CHECK` without touching the
    /// browser.
    pub async fn check(&self, platform: &str) -> AuthState {
        let creds = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(platform) else {
                return AuthState::disabled();
            };
            if !session.creds.is_configured() {
                session.phase = AuthPhase::Disabled;
                return AuthState::disabled();
            }
            session.phase = AuthPhase::Checking;
            session.creds.clone()
        };

        let state = if creds.token_cached {
            match load_cached_token(&self.cache_dir, platform).await {
                Some(token) => AuthState {
                    authenticated: true,
                    reason_code: AuthReason::Ok,
                    token_source: TokenSource::Cache,
                    expires_at: Some(token.expires_at_monotonic_seconds),
                },
                None => AuthState {
                    authenticated: false,
                    reason_code: AuthReason::TokenExpired,
                    token_source: TokenSource::None,
                    expires_at: None,
                },
            }
        } else {
            AuthState {
                authenticated: false,
                reason_code: AuthReason::NeedsBrowserCheck,
                token_source: TokenSource::None,
                expires_at: None,
            }
        };

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(platform) {
            session.phase = if state.authenticated {
                AuthPhase::Authenticated
            } else {
                AuthPhase::Degraded
            };
            session.state = state.clone();
        }
        state
    }

    /// Attempts to restore authentication through the registered healer.
    pub async fn heal(&self, platform: &str) -> AuthState {
        let creds = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get_mut(platform) else {
                return AuthState::disabled();
            };
            if !session.creds.is_configured() {
                return AuthState::disabled();
            }
            session.phase = AuthPhase::Healing;
            session.creds.clone()
        };

        let healed = match &self.healer {
            Some(healer) => healer.heal(&creds).await,
            None => Err(SourceError::auth_failed(platform)),
        };

        let state = match healed {
            Ok(token) => {
                if let Err(err) = store_cached_token(&self.cache_dir, platform, &token).await {
                    warn!(target: "bayline.auth", platform, error = %err, "token cache write failed");
                }
                info!(target: "bayline.auth", platform, "session healed");
                AuthState {
                    authenticated: true,
                    reason_code: AuthReason::Ok,
                    token_source: TokenSource::BrowserLogin,
                    expires_at: Some(token.expires_at_monotonic_seconds),
                }
            }
            Err(err) => {
                debug!(target: "bayline.auth", platform, code = err.code(), "heal failed");
                AuthState {
                    authenticated: false,
                    reason_code: AuthReason::LoginFailed,
                    token_source: TokenSource::None,
                    expires_at: None,
                }
            }
        };

        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(platform) {
            session.phase = if state.authenticated {
                AuthPhase::Authenticated
            } else {
                AuthPhase::Degraded
            };
            session.state = state.clone();
        }
        state
    }

    /// check→heal for every enabled platform, in parallel. Disabled
    /// platforms are reported as such and skipped by later stages.
    pub async fn preflight(&self) -> HashMap<String, AuthState> {
        let platforms: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        let futures = platforms.into_iter().map(|platform| async move {
            let checked = self.check(&platform).await;
            let state = if checked.authenticated
                || checked.reason_code == AuthReason::PlatformDisabled
            {
                checked
            } else {
                self.heal(&platform).await
            };
            (platform, state)
        });
        futures::future::join_all(futures).await.into_iter().collect()
    }

    /// True when the platform may be used by a stage right now.
    pub async fn usable(&self, platform: &str) -> bool {
        matches!(
            self.phase(platform).await,
            AuthPhase::Authenticated | AuthPhase::Unknown | AuthPhase::Checking
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn creds(platform: &str, api_key: Option<&str>) -> PlatformCredentials {
        PlatformCredentials {
            platform: platform.to_string(),
            username: None,
            password: None,
            api_key: api_key.map(str::to_string),
            token_cached: api_key.is_some(),
        }
    }

    struct FixedHealer;

    #[async_trait]
    impl AuthHealer for FixedHealer {
        async fn heal(&self, _creds: &PlatformCredentials) -> Result<CachedToken, SourceError> {
            Ok(CachedToken {
                token: "tok".to_string(),
                expires_at_monotonic_seconds: unix_seconds() + 3600,
            })
        }
    }

    #[tokio::test]
    async fn unconfigured_platform_is_disabled() {
        let dir = tempfile::tempdir().unwrap();
        let mgr = SessionManager::new(
            dir.path().to_path_buf(),
            vec![creds("prodemand", None)],
            None,
        );
        let state = mgr.check("prodemand").await;
        assert_eq!(state.reason_code, AuthReason::PlatformDisabled);
        assert_eq!(mgr.phase("prodemand").await, AuthPhase::Disabled);
    }

    #[tokio::test]
    async fn cached_token_authenticates_without_browser() {
        let dir = tempfile::tempdir().unwrap();
        store_cached_token(
            dir.path(),
            "partstech",
            &CachedToken {
                token: "abc".to_string(),
                expires_at_monotonic_seconds: unix_seconds() + 600,
            },
        )
        .await
        .unwrap();

        let mgr = SessionManager::new(
            dir.path().to_path_buf(),
            vec![creds("partstech", Some("key"))],
            None,
        );
        let state = mgr.check("partstech").await;
        assert!(state.authenticated);
        assert_eq!(state.token_source, TokenSource::Cache);
        assert_eq!(mgr.phase("partstech").await, AuthPhase::Authenticated);
    }

    #[tokio::test]
    async fn expired_token_reads_as_absent() {
        let dir = tempfile::tempdir().unwrap();
        store_cached_token(
            dir.path(),
            "partstech",
            &CachedToken {
                token: "old".to_string(),
                expires_at_monotonic_seconds: 1,
            },
        )
        .await
        .unwrap();
        assert!(load_cached_token(dir.path(), "partstech").await.is_none());
    }

    #[tokio::test]
    async fn heal_transitions_degraded_to_authenticated() {
        let dir = tempfile::tempdir().unwrap();
        let mut c = creds("prodemand", None);
        c.username = Some("user".to_string());
        c.password = Some("pass".to_string());
        let mgr = SessionManager::new(
            dir.path().to_path_buf(),
            vec![c],
            Some(Arc::new(FixedHealer)),
        );

        let checked = mgr.check("prodemand").await;
        assert_eq!(checked.reason_code, AuthReason::NeedsBrowserCheck);
        assert_eq!(mgr.phase("prodemand").await, AuthPhase::Degraded);

        let healed = mgr.heal("prodemand").await;
        assert!(healed.authenticated);
        assert_eq!(healed.token_source, TokenSource::BrowserLogin);
        assert_eq!(mgr.phase("prodemand").await, AuthPhase::Authenticated);
    }

    #[tokio::test]
    async fn preflight_reports_every_platform() {
        let dir = tempfile::tempdir().unwrap();
        let mut browser = creds("prodemand", None);
        browser.username = Some("u".to_string());
        browser.password = Some("p".to_string());
        let mgr = SessionManager::new(
            dir.path().to_path_buf(),
            vec![browser, creds("nexpart", None)],
            Some(Arc::new(FixedHealer)),
        );
        let report = mgr.preflight().await;
        assert_eq!(report.len(), 2);
        assert!(report["prodemand"].authenticated);
        assert_eq!(report["nexpart"].reason_code, AuthReason::PlatformDisabled);
    }
}
