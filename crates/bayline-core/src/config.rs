//! Engine configuration.
//!
//! Everything is environment-driven (§ external interfaces): vendor
//! credential pairs enable their adapters, absence disables them. The
//! startup validator reports what is configured and what is missing without
//! failing startup — a shop can run with any subset of platforms.

use std::time::Duration;

use serde::Serialize;
use tracing::{info, warn};

use crate::auth::PlatformCredentials;

pub const DEFAULT_CDP_URL: &str = "http://127.0.0.1:18800";

/// Research platforms driven through the shared browser.
pub const BROWSER_PLATFORMS: &[&str] = &["prodemand", "alldata", "identifix"];
/// Platforms reached over plain HTTP APIs.
pub const API_PLATFORMS: &[&str] = &["partstech", "nexpart", "motor", "autoleap"];

#[derive(Debug, Clone, Copy)]
pub struct StageTimeouts {
    pub vin_decode: Duration,
    pub api_research: Duration,
    pub browser_research: Duration,
    pub research_fanout: Duration,
    pub parts_pricing: Duration,
    pub estimate_create: Duration,
    pub pdf: Duration,
    pub root: Duration,
    /// Bound on cancellation cleanup for in-flight adapter calls.
    pub cleanup: Duration,
}

impl Default for StageTimeouts {
    fn default() -> Self {
        Self {
            vin_decode: Duration::from_secs(10),
            api_research: Duration::from_secs(25),
            browser_research: Duration::from_secs(75),
            research_fanout: Duration::from_secs(90),
            parts_pricing: Duration::from_secs(60),
            estimate_create: Duration::from_secs(45),
            pdf: Duration::from_secs(20),
            root: Duration::from_secs(180),
            cleanup: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AdvisorConfig {
    pub shop_id: Option<String>,
    pub platforms: Vec<PlatformCredentials>,
    pub llm_key: Option<String>,
    pub knowledge_base_url: Option<String>,
    pub telegram_bot_token: Option<String>,
    pub cdp_url: String,
    pub timeouts: StageTimeouts,
    /// Shop markup percent for matrix-fallback retail pricing.
    pub matrix_markup_percent: f64,
    pub shop_supplies_percent: f64,
    pub tax_percent: f64,
    /// Knowledge-base confidence at or above which the KB answer stands alone.
    pub kb_confidence_threshold: f64,
    pub max_parallel_api: usize,
    pub tab_stale_after: Duration,
    pub screenshot_cap: usize,
    pub labor_rate_per_hour: f64,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self {
            shop_id: None,
            platforms: Vec::new(),
            llm_key: None,
            knowledge_base_url: None,
            telegram_bot_token: None,
            cdp_url: DEFAULT_CDP_URL.to_string(),
            timeouts: StageTimeouts::default(),
            matrix_markup_percent: 40.0,
            shop_supplies_percent: 6.0,
            tax_percent: 8.25,
            kb_confidence_threshold: 0.7,
            max_parallel_api: 8,
            tab_stale_after: Duration::from_secs(60),
            screenshot_cap: 40,
            labor_rate_per_hour: 145.0,
        }
    }
}

impl AdvisorConfig {
    pub fn from_env() -> Self {
        let mut config = Self {
            shop_id: non_empty_env("SHOP_ID"),
            llm_key: non_empty_env("ANTHROPIC_API_KEY"),
            knowledge_base_url: non_empty_env("KNOWLEDGE_BASE_URL"),
            telegram_bot_token: non_empty_env("TELEGRAM_BOT_TOKEN"),
            cdp_url: non_empty_env("BROWSER_CDP_URL").unwrap_or_else(|| DEFAULT_CDP_URL.to_string()),
            ..Self::default()
        };

        for platform in BROWSER_PLATFORMS.iter().chain(API_PLATFORMS) {
            config.platforms.push(platform_creds_from_env(platform));
        }

        if let Some(pct) = parse_env_f64("MATRIX_MARKUP_PERCENT") {
            config.matrix_markup_percent = pct;
        }
        if let Some(pct) = parse_env_f64("SHOP_SUPPLIES_PERCENT") {
            config.shop_supplies_percent = pct;
        }
        if let Some(pct) = parse_env_f64("TAX_PERCENT") {
            config.tax_percent = pct;
        }
        if let Some(rate) = parse_env_f64("LABOR_RATE_PER_HOUR") {
            config.labor_rate_per_hour = rate;
        }
        if let Some(n) = parse_env_usize("MAX_PARALLEL_API") {
            config.max_parallel_api = n.clamp(1, 64);
        }
        if let Some(secs) = parse_env_u64("TAB_STALE_SECONDS") {
            config.tab_stale_after = Duration::from_secs(secs.max(5));
        }
        if let Some(n) = parse_env_usize("SCREENSHOT_CAP") {
            config.screenshot_cap = n;
        }
        if let Some(secs) = parse_env_u64("PIPELINE_TIMEOUT_SECONDS") {
            config.timeouts.root = Duration::from_secs(secs);
        }

        config
    }

    pub fn credentials_for(&self, platform: &str) -> Option<&PlatformCredentials> {
        self.platforms.iter().find(|p| p.platform == platform)
    }

    pub fn platform_enabled(&self, platform: &str) -> bool {
        self.credentials_for(platform)
            .map(PlatformCredentials::is_configured)
            .unwrap_or(false)
    }

    /// What the startup validator reports.
    pub fn env_report(&self) -> EnvReport {
        let mut report = EnvReport::default();
        for creds in &self.platforms {
            if creds.is_configured() {
                report.enabled_platforms.push(creds.platform.clone());
            } else {
                report.disabled_platforms.push(creds.platform.clone());
                let upper = creds.platform.to_uppercase();
                report
                    .missing
                    .push(format!("{upper}_API_KEY or {upper}_USERNAME/{upper}_PASSWORD"));
            }
        }
        if self.shop_id.is_none() {
            report.missing.push("SHOP_ID".to_string());
        }
        if self.llm_key.is_none() {
            report.missing.push("ANTHROPIC_API_KEY".to_string());
        }
        if self.knowledge_base_url.is_none() {
            report.missing.push("KNOWLEDGE_BASE_URL".to_string());
        }
        if self.telegram_bot_token.is_none() {
            report.missing.push("TELEGRAM_BOT_TOKEN".to_string());
        }
        report
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EnvReport {
    pub enabled_platforms: Vec<String>,
    pub disabled_platforms: Vec<String>,
    pub missing: Vec<String>,
}

impl EnvReport {
    pub fn log(&self) {
        info!(
            target: "bayline.config",
            enabled = %self.enabled_platforms.join(","),
            "configured platforms"
        );
        if !self.disabled_platforms.is_empty() {
            warn!(
                target: "bayline.config",
                disabled = %self.disabled_platforms.join(","),
                "platforms disabled (credentials not set)"
            );
        }
        for var in &self.missing {
            warn!(target: "bayline.config", missing = %var, "environment variable not set");
        }
    }
}

fn platform_creds_from_env(platform: &str) -> PlatformCredentials {
    let upper = platform.to_uppercase();
    let api_key = non_empty_env(&format!("{upper}_API_KEY"));
    PlatformCredentials {
        platform: platform.to_string(),
        username: non_empty_env(&format!("{upper}_USERNAME")),
        password: non_empty_env(&format!("{upper}_PASSWORD")),
        token_cached: api_key.is_some(),
        api_key,
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn parse_env_f64(key: &str) -> Option<f64> {
    non_empty_env(key)?.parse().ok()
}

fn parse_env_u64(key: &str) -> Option<u64> {
    non_empty_env(key)?.parse().ok()
}

fn parse_env_usize(key: &str) -> Option<usize> {
    non_empty_env(key)?.parse().ok()
}
