use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::info;

use bayline_channels::{Dispatcher, NullOutbound};
use bayline_core::{
    AdvisorConfig, ArtifactStore, BreakerConfig, CircuitBreakers, SessionManager, SessionStore,
    TabRegistry,
};
use bayline_observability::{init_logging, LogBackend};
use bayline_pipeline::{Adapters, Orchestrator};
use bayline_sources::{
    AlldataResearch, AutoleapSink, BrowserDriver, BrowserLoginHealer, CachingLabor, ClaudeReasoner,
    HttpKnowledge, HttpRepairHistory, IdentifixResearch, JsonApiClient, MotorLabor, NexpartPricing,
    PartstechPricing, ProdemandResearch, VpicDecoder,
};

mod http;

const PRODEMAND_URL: &str = "https://www.prodemand.com";
const ALLDATA_URL: &str = "https://my.alldata.com";
const IDENTIFIX_URL: &str = "https://api.identifix.com";
const PARTSTECH_URL: &str = "https://api.partstech.com";
const NEXPART_URL: &str = "https://api.nexpart.com";
const MOTOR_URL: &str = "https://api.motor.com";
const AUTOLEAP_URL: &str = "https://api.autoleap.com";

#[derive(Parser, Debug)]
#[command(name = "bayline-engine")]
#[command(about = "Headless Bayline service-advisor backend")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve the tool-call and health endpoints for the chat gateway.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 18810)]
        port: u16,
        /// Structured JSONL log files in addition to the console.
        #[arg(long, default_value_t = false)]
        jsonl: bool,
        #[arg(long)]
        logs_dir: Option<String>,
    },
    /// Validate the environment and report configured platforms.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve {
            hostname,
            port,
            jsonl,
            logs_dir,
        } => {
            let backend = if jsonl { LogBackend::Jsonl } else { LogBackend::Pretty };
            let logs_dir = logs_dir
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("bayline-logs"));
            let (_guard, log_info) = init_logging(backend, &logs_dir, 14)?;
            info!(backend = %log_info.backend, "logging initialized");

            let addr: SocketAddr = format!("{hostname}:{port}")
                .parse()
                .context("invalid hostname or port")?;
            let state = build_state().await?;
            info!("starting bayline-engine on http://{addr}");
            http::serve(addr, state).await?;
        }
        Command::Check => {
            let (_guard, _) =
                init_logging(LogBackend::Pretty, &std::env::temp_dir().join("bayline-logs"), 14)?;
            let config = AdvisorConfig::from_env();
            let report = config.env_report();
            report.log();
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}

async fn build_state() -> anyhow::Result<http::AppState> {
    let config = AdvisorConfig::from_env();
    config.env_report().log();

    let breakers = Arc::new(CircuitBreakers::new(BreakerConfig::default()));
    let tabs = Arc::new(TabRegistry::new(config.tab_stale_after));
    let store = Arc::new(SessionStore::new());
    let artifacts = ArtifactStore::in_temp_dir(config.screenshot_cap);
    artifacts.ensure_dirs().await?;

    let driver = Arc::new(BrowserDriver::new(
        config.cdp_url.clone(),
        tabs.clone(),
        artifacts.clone(),
    ));

    let healer = Arc::new(BrowserLoginHealer::new(driver.clone(), platform_login_urls()));
    let sessions = Arc::new(SessionManager::new(
        std::env::temp_dir().join("bayline-tokens"),
        config.platforms.clone(),
        Some(healer),
    ));

    let adapters = build_adapters(&config, &sessions, &driver);
    let orchestrator = Arc::new(Orchestrator::new(
        config.clone(),
        adapters,
        breakers,
        tabs.clone(),
        sessions,
        store,
    )?);

    let dispatcher = Arc::new(Dispatcher::new(
        orchestrator,
        Arc::new(NullOutbound),
        config.shop_id.clone(),
    ));

    // Housekeeping: stale-tab reaping and the artifact sweep.
    let sweep_tabs = tabs.clone();
    let sweep_artifacts = artifacts.clone();
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(std::time::Duration::from_secs(30));
        let mut hourly = 0u32;
        loop {
            tick.tick().await;
            sweep_tabs.cleanup_stale();
            hourly += 1;
            if hourly >= 120 {
                hourly = 0;
                if let Err(err) = sweep_artifacts.sweep().await {
                    tracing::warn!(error = %err, "artifact sweep failed");
                }
            }
        }
    });

    Ok(http::AppState::new(dispatcher, driver, artifacts))
}

fn platform_login_urls() -> Vec<(String, String)> {
    vec![
        ("prodemand".to_string(), format!("{PRODEMAND_URL}/login")),
        ("alldata".to_string(), format!("{ALLDATA_URL}/login")),
    ]
}

fn build_adapters(
    config: &AdvisorConfig,
    sessions: &Arc<SessionManager>,
    driver: &Arc<BrowserDriver>,
) -> Adapters {
    let mut adapters = Adapters {
        vin: Some(Arc::new(VpicDecoder::new())),
        ..Default::default()
    };

    if let Some(kb_url) = &config.knowledge_base_url {
        adapters.knowledge = Some(Arc::new(HttpKnowledge::new(JsonApiClient::new(
            "knowledge", kb_url,
        ))));
        adapters.history = Some(Arc::new(HttpRepairHistory::new(JsonApiClient::new(
            "knowledge", kb_url,
        ))));
    }
    if let Some(llm_key) = &config.llm_key {
        adapters.reasoner = Some(Arc::new(ClaudeReasoner::new(llm_key.clone())));
    }

    if config.platform_enabled("prodemand") {
        adapters
            .research
            .push(Arc::new(ProdemandResearch::new(driver.clone(), PRODEMAND_URL)));
    }
    if config.platform_enabled("alldata") {
        adapters
            .research
            .push(Arc::new(AlldataResearch::new(driver.clone(), ALLDATA_URL)));
    }
    if config.platform_enabled("identifix") {
        let client = api_client(config, sessions, "identifix", IDENTIFIX_URL);
        adapters.research.push(Arc::new(IdentifixResearch::new(client)));
    }

    if config.platform_enabled("partstech") {
        let client = api_client(config, sessions, "partstech", PARTSTECH_URL);
        adapters.pricing_primary = Some(Arc::new(PartstechPricing::new(client)));
    }
    if config.platform_enabled("nexpart") {
        let client = api_client(config, sessions, "nexpart", NEXPART_URL);
        adapters.pricing_fallback = Some(Arc::new(NexpartPricing::new(client)));
    }

    if config.platform_enabled("motor") {
        let client = api_client(config, sessions, "motor", MOTOR_URL);
        adapters
            .labor
            .push(Arc::new(CachingLabor::new(Arc::new(MotorLabor::new(client)))));
    }

    if config.platform_enabled("autoleap") {
        let client = api_client(config, sessions, "autoleap", AUTOLEAP_URL);
        adapters.estimate_sink = Some(Arc::new(AutoleapSink::new(client)));
    }

    adapters
}

fn api_client(
    config: &AdvisorConfig,
    sessions: &Arc<SessionManager>,
    platform: &'static str,
    base_url: &str,
) -> JsonApiClient {
    let mut client = JsonApiClient::new(platform, base_url).with_sessions(sessions.clone());
    if let Some(key) = config
        .credentials_for(platform)
        .and_then(|c| c.api_key.clone())
    {
        client = client.with_token(key);
    }
    client
}
