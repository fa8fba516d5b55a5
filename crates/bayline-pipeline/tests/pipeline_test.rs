//! End-to-end pipeline scenarios over mock adapters.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use bayline_core::{
    AdvisorConfig, BreakerConfig, CircuitBreakers, SessionManager, SessionStore, TabRegistry,
};
use bayline_pipeline::{Adapters, Orchestrator};
use bayline_sources::{
    EstimateDraft, EstimateReceipt, EstimateSink, KbAnswer, Knowledge, LaborLookup, PartsPrice,
    Research, SourceContext,
};
use bayline_types::{
    CustomerHints, Diagnosis, Dtc, GateVerdict, LaborResult, LaborSource, PartQuote, PartRequest,
    PartSelection, PartsBundle, PricingSource, Request, ResearchFragment, RunOutcome, SourceError,
    Vehicle, VehicleHints,
};

// ---------------------------------------------------------------------------
// Mock adapters
// ---------------------------------------------------------------------------

struct MockKb {
    answer: KbAnswer,
}

#[async_trait]
impl Knowledge for MockKb {
    async fn lookup(
        &self,
        _ctx: &SourceContext,
        _vehicle: &Vehicle,
        _query: &str,
        _dtcs: &[Dtc],
    ) -> Result<KbAnswer, SourceError> {
        Ok(self.answer.clone())
    }
}

struct MockPricing {
    platform: &'static str,
    outcome: Result<Vec<(String, f64)>, SourceError>,
    calls: AtomicU32,
    orders: AtomicU32,
}

impl MockPricing {
    fn quoting(platform: &'static str, quotes: &[(&str, f64)]) -> Self {
        Self {
            platform,
            outcome: Ok(quotes
                .iter()
                .map(|(brand, price)| (brand.to_string(), *price))
                .collect()),
            calls: AtomicU32::new(0),
            orders: AtomicU32::new(0),
        }
    }

    fn failing(platform: &'static str, err: SourceError) -> Self {
        Self {
            platform,
            outcome: Err(err),
            calls: AtomicU32::new(0),
            orders: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl PartsPrice for MockPricing {
    fn platform(&self) -> &'static str {
        self.platform
    }

    async fn price(
        &self,
        _ctx: &SourceContext,
        _vehicle: &Vehicle,
        parts: &[PartRequest],
    ) -> Result<PartsBundle, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let quotes = self.outcome.clone()?;
        let mut bundle = PartsBundle {
            all_in_stock: true,
            ..Default::default()
        };
        for (index, request) in parts.iter().enumerate() {
            let (brand, price) = quotes
                .get(index.min(quotes.len().saturating_sub(1)))
                .cloned()
                .unwrap_or(("Generic".to_string(), 10.0));
            bundle.parts_cost += price * f64::from(request.qty.max(1));
            bundle.selections.push(PartSelection {
                request: request.clone(),
                quote: Some(PartQuote {
                    brand,
                    part_number: Some("PN".to_string()),
                    supplier: "X".to_string(),
                    unit_price: Some(price),
                    availability: "In Stock".to_string(),
                    in_stock: true,
                    source: self.platform.to_string(),
                }),
                miss: None,
            });
        }
        bundle.suppliers = vec!["X".to_string()];
        Ok(bundle)
    }

    async fn order(
        &self,
        _ctx: &SourceContext,
        _run_id: &str,
        parts: &[PartSelection],
    ) -> Result<Vec<String>, SourceError> {
        self.orders.fetch_add(1, Ordering::SeqCst);
        Ok(parts.iter().map(|s| s.request.name.clone()).collect())
    }
}

struct MockLabor {
    source: LaborSource,
    hours: f64,
}

#[async_trait]
impl LaborLookup for MockLabor {
    fn source(&self) -> LaborSource {
        self.source
    }

    async fn hours(
        &self,
        _ctx: &SourceContext,
        _vehicle: &Vehicle,
        procedure: &str,
    ) -> Result<LaborResult, SourceError> {
        Ok(LaborResult {
            hours: self.hours,
            source: self.source,
            operation: procedure.to_string(),
            confidence: 0.9,
            reason_code: None,
        })
    }
}

struct MockResearch {
    platform: &'static str,
    browser: bool,
    delay: Duration,
    fragment: Result<ResearchFragment, SourceError>,
    calls: AtomicU32,
}

impl MockResearch {
    fn ok(platform: &'static str, browser: bool, delay: Duration, fragment: ResearchFragment) -> Self {
        Self {
            platform,
            browser,
            delay,
            fragment: Ok(fragment),
            calls: AtomicU32::new(0),
        }
    }

    fn failing(platform: &'static str, err: SourceError) -> Self {
        Self {
            platform,
            browser: false,
            delay: Duration::from_millis(0),
            fragment: Err(err),
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl Research for MockResearch {
    fn platform(&self) -> &'static str {
        self.platform
    }

    fn requires_browser(&self) -> bool {
        self.browser
    }

    async fn search(
        &self,
        _ctx: &SourceContext,
        _vehicle: &Vehicle,
        _query: &str,
        _dtcs: &[Dtc],
    ) -> Result<ResearchFragment, SourceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.fragment.clone()
    }
}

struct MockSink {
    vendor_creates: AtomicU32,
    created: std::sync::Mutex<std::collections::HashMap<(String, String), EstimateReceipt>>,
}

impl MockSink {
    fn new() -> Self {
        Self {
            vendor_creates: AtomicU32::new(0),
            created: std::sync::Mutex::new(std::collections::HashMap::new()),
        }
    }
}

#[async_trait]
impl EstimateSink for MockSink {
    fn platform(&self) -> &'static str {
        "autoleap"
    }

    async fn create(
        &self,
        _ctx: &SourceContext,
        draft: &EstimateDraft,
    ) -> Result<EstimateReceipt, SourceError> {
        let key = (draft.chat_id.clone(), draft.run_id.clone());
        if let Some(receipt) = self.created.lock().unwrap().get(&key).cloned() {
            return Ok(receipt);
        }
        self.vendor_creates.fetch_add(1, Ordering::SeqCst);
        let receipt = EstimateReceipt {
            estimate_id: format!("est-{}", draft.run_id),
            estimate_code: "E-1001".to_string(),
            total: 100.0,
            source_tag: "autoleap".to_string(),
            parts_retail_total: None,
        };
        self.created.lock().unwrap().insert(key, receipt.clone());
        Ok(receipt)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct Harness {
    orchestrator: Orchestrator,
    tabs: Arc<TabRegistry>,
    store: Arc<SessionStore>,
    breakers: Arc<CircuitBreakers>,
}

fn harness(adapters: Adapters) -> Harness {
    let config = AdvisorConfig::default();
    let breakers = Arc::new(CircuitBreakers::new(BreakerConfig::default()));
    let tabs = Arc::new(TabRegistry::new(Duration::from_secs(60)));
    let store = Arc::new(SessionStore::new());
    let sessions = Arc::new(SessionManager::new(
        std::env::temp_dir().join("bayline-test-tokens"),
        Vec::new(),
        None,
    ));
    let orchestrator = Orchestrator::new(
        config,
        adapters,
        breakers.clone(),
        tabs.clone(),
        sessions,
        store.clone(),
    )
    .unwrap();
    Harness {
        orchestrator,
        tabs,
        store,
        breakers,
    }
}

fn kb_o2_sensor() -> Arc<MockKb> {
    let mut top = Diagnosis::new("downstream O2 sensor", 0.78);
    top.from_knowledge_base = true;
    top.parts.push("oxygen sensor (downstream)".to_string());
    Arc::new(MockKb {
        answer: KbAnswer {
            diagnoses: vec![top],
            parts: vec![PartRequest::new("oxygen sensor (downstream)")],
            confidence: 0.78,
        },
    })
}

fn civic_request(query: &str) -> Request {
    Request::new("chat-1", query).with_hints(VehicleHints {
        year: Some(2019),
        make: Some("Honda".to_string()),
        model: Some("Civic".to_string()),
        engine: Some("2.0L".to_string()),
        ..Default::default()
    })
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

/// S1: diagnostic happy path without a customer — matrix-fallback pricing.
#[tokio::test]
async fn s1_diagnostic_estimate_with_matrix_pricing() {
    let pricing = Arc::new(MockPricing::quoting("partstech", &[("Denso", 64.50)]));
    let adapters = Adapters {
        knowledge: Some(kb_o2_sensor()),
        pricing_primary: Some(pricing.clone()),
        labor: vec![Arc::new(MockLabor {
            source: LaborSource::Prodemand,
            hours: 1.2,
        })],
        ..Default::default()
    };
    let h = harness(adapters);

    let result = h.orchestrator.run_estimate(civic_request("P0420")).await;

    assert_eq!(result.outcome, RunOutcome::Completed);
    assert!(result.customer_ready);
    assert_eq!(result.pricing_gate, GateVerdict::Pass);
    assert_eq!(result.pricing_source, PricingSource::MatrixFallback);
    // 64.50 wholesale × 1.40 markup
    assert!((result.totals.parts_retail_total - 90.30).abs() < 1e-9);
    assert_eq!(result.labor.as_ref().unwrap().hours, 1.2);
    assert_eq!(result.labor.as_ref().unwrap().source, LaborSource::Prodemand);
    assert!(result.artifacts.pdf.is_none());

    // Deposited in the session store under the chat id.
    let stored = h.store.last_result("chat-1").await.unwrap();
    assert_eq!(stored.run_id, result.run_id);
}

/// S2: both pricing adapters down — the gate blocks and totals vanish.
#[tokio::test(start_paused = true)]
async fn s2_pricing_outage_blocks_the_gate() {
    let adapters = Adapters {
        knowledge: Some(kb_o2_sensor()),
        pricing_primary: Some(Arc::new(MockPricing::failing(
            "partstech",
            SourceError::platform_down("partstech"),
        ))),
        pricing_fallback: Some(Arc::new(MockPricing::failing(
            "nexpart",
            SourceError::platform_down("nexpart"),
        ))),
        ..Default::default()
    };
    let h = harness(adapters);

    let result = h.orchestrator.run_estimate(civic_request("P0420")).await;

    assert_eq!(result.pricing_gate, GateVerdict::Blocked);
    assert!(!result.customer_ready);
    assert_eq!(result.pricing_source, PricingSource::Failed);
    assert!(result.has_warning("PRICING_GATE_BLOCKED"));
    assert!(result.artifacts.customer_facing_empty());
    assert_eq!(result.totals.grand_total, 0.0);
}

/// S3: maintenance request with a customer; estimate creation is idempotent
/// on the run id.
#[tokio::test]
async fn s3_maintenance_estimate_is_idempotent_on_replay() {
    let sink = Arc::new(MockSink::new());
    let pricing = Arc::new(MockPricing::quoting(
        "partstech",
        &[("Fram", 8.99), ("Dorman", 2.49)],
    ));
    let adapters = Adapters {
        pricing_primary: Some(pricing),
        estimate_sink: Some(sink.clone()),
        ..Default::default()
    };
    let h = harness(adapters);

    let mut request = Request::new("chat-1", "oil change 45000 miles").with_customer(CustomerHints {
        name: Some("Jane Doe".to_string()),
        phone: None,
    });
    request.vehicle_hints.vin = Some("1HGBH41JXMN109186".to_string());

    let first = h.orchestrator.run_estimate(request.clone()).await;
    assert_eq!(first.outcome, RunOutcome::Completed);
    assert!(first.customer_ready);
    assert_eq!(first.labor.as_ref().unwrap().hours, 0.6);
    assert_eq!(first.labor.as_ref().unwrap().source, LaborSource::ShopDefault);
    let names: Vec<&str> = first
        .parts
        .as_ref()
        .unwrap()
        .selections
        .iter()
        .map(|s| s.request.name.as_str())
        .collect();
    assert_eq!(names, vec!["oil filter", "drain plug gasket"]);
    let estimate_id = first.estimate_id.clone().unwrap();

    // Replaying the same run id must not create a second estimate.
    let second = h.orchestrator.run_estimate(request).await;
    assert_eq!(second.estimate_id.as_deref(), Some(estimate_id.as_str()));
    assert_eq!(sink.vendor_creates.load(Ordering::SeqCst), 1);
}

/// S4: API and browser research sources run in the same fan-out; the merge
/// is independent of completion order.
#[tokio::test]
async fn s4_research_merge_is_completion_order_independent() {
    let mut api_fragment = ResearchFragment::for_source("identifix");
    let mut fix = Diagnosis::new("replace downstream O2 sensor", 0.7);
    fix.success_rate = Some(0.72);
    api_fragment.fixes.push(fix);

    let mut browser_fragment = ResearchFragment::for_source("prodemand");
    browser_fragment
        .torque_specs
        .insert("O2 sensor".to_string(), "30 ft-lb".to_string());

    let run = |api_delay: u64, browser_delay: u64| {
        let api_fragment = api_fragment.clone();
        let browser_fragment = browser_fragment.clone();
        async move {
            let adapters = Adapters {
                knowledge: Some(kb_o2_sensor()),
                research: vec![
                    Arc::new(MockResearch::ok(
                        "identifix",
                        false,
                        Duration::from_millis(api_delay),
                        api_fragment,
                    )),
                    Arc::new(MockResearch::ok(
                        "prodemand",
                        true,
                        Duration::from_millis(browser_delay),
                        browser_fragment,
                    )),
                ],
                ..Default::default()
            };
            harness(adapters)
                .orchestrator
                .run_estimate(civic_request("P0420"))
                .await
        }
    };

    let fast_api = run(5, 60).await;
    let fast_browser = run(60, 5).await;

    // Same merged plan either way.
    assert_eq!(fast_api.plan.torque_specs, fast_browser.plan.torque_specs);
    assert_eq!(fast_api.plan.diagnoses.len(), fast_browser.plan.diagnoses.len());
    assert!(fast_api.plan.diagnoses[0].identifix_corroborated);
    assert_eq!(
        fast_api.plan.torque_specs["O2 sensor"].value,
        "30 ft-lb"
    );
}

/// S6: an open breaker short-circuits the optional stage with a warning;
/// the pipeline proceeds.
#[tokio::test]
async fn s6_open_breaker_skips_optional_research() {
    let research = Arc::new(MockResearch::failing(
        "identifix",
        SourceError::platform_down("identifix"),
    ));
    let adapters = Adapters {
        knowledge: Some(kb_o2_sensor()),
        research: vec![research.clone()],
        ..Default::default()
    };
    let h = harness(adapters);

    // Trip the breaker before the request arrives.
    for _ in 0..3 {
        h.breakers.record_failure("identifix");
    }

    let result = h.orchestrator.run_estimate(civic_request("P0420")).await;
    assert_eq!(result.outcome, RunOutcome::Completed);
    assert!(result.warnings.iter().any(|w| w.code == "CIRCUIT_OPEN"));
    // The adapter itself was never invoked.
    assert_eq!(research.calls.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

/// §8.5: no tab lease with the run's id survives finalize.
#[tokio::test]
async fn finalize_releases_every_lease_for_the_run() {
    let adapters = Adapters {
        knowledge: Some(kb_o2_sensor()),
        ..Default::default()
    };
    let h = harness(adapters);

    let request = civic_request("P0420");
    h.tabs.register("tab:prodemand:test", "prodemand", &request.run_id);

    let result = h.orchestrator.run_estimate(request).await;
    assert!(h.tabs.leases_for_run(&result.run_id).is_empty());
}

/// §8.6: a terminal failure invokes the adapter exactly once; retryable
/// failures at most 1 + max_retries times.
#[tokio::test(start_paused = true)]
async fn retry_counts_respect_failure_classification() {
    let terminal = Arc::new(MockResearch::failing(
        "identifix",
        SourceError::platform_down("identifix"),
    ));
    let adapters = Adapters {
        knowledge: Some(kb_o2_sensor()),
        research: vec![terminal.clone()],
        ..Default::default()
    };
    let result = harness(adapters)
        .orchestrator
        .run_estimate(civic_request("P0420"))
        .await;
    assert_eq!(result.outcome, RunOutcome::Completed);
    assert_eq!(terminal.calls.load(Ordering::SeqCst), 1);

    let retryable = Arc::new(MockResearch::failing("alldata", SourceError::Timeout));
    let adapters = Adapters {
        knowledge: Some(kb_o2_sensor()),
        research: vec![retryable.clone()],
        ..Default::default()
    };
    let _ = harness(adapters)
        .orchestrator
        .run_estimate(civic_request("P0420"))
        .await;
    // Default policy: 1 initial + 2 retries.
    assert_eq!(retryable.calls.load(Ordering::SeqCst), 3);
}

/// A required-stage terminal failure aborts with the classified reason.
#[tokio::test]
async fn unresolvable_vehicle_fails_the_pipeline() {
    let h = harness(Adapters::default());
    let result = h
        .orchestrator
        .run_estimate(Request::new("chat-1", "P0420"))
        .await;
    assert_eq!(
        result.outcome,
        RunOutcome::Failed {
            code: "VEHICLE_UNRESOLVED".to_string()
        }
    );
    assert!(!result.customer_ready);
    assert_eq!(result.pricing_gate, GateVerdict::Blocked);
}

// ---------------------------------------------------------------------------
// Follow-ups
// ---------------------------------------------------------------------------

#[tokio::test]
async fn follow_ups_gate_on_customer_ready() {
    let pricing = Arc::new(MockPricing::quoting("partstech", &[("Denso", 64.50)]));
    let adapters = Adapters {
        knowledge: Some(kb_o2_sensor()),
        pricing_primary: Some(pricing.clone()),
        ..Default::default()
    };
    let h = harness(adapters);

    // No estimate yet.
    let outcome = h.orchestrator.order_parts("chat-1", false).await;
    assert!(!outcome.accepted);

    let result = h.orchestrator.run_estimate(civic_request("P0420")).await;
    assert!(result.customer_ready);

    let outcome = h.orchestrator.order_parts("chat-1", false).await;
    assert!(outcome.accepted);
    assert_eq!(outcome.ordered_parts, vec!["oxygen sensor (downstream)"]);
    assert_eq!(pricing.orders.load(Ordering::SeqCst), 1);

    let approved = h.orchestrator.customer_approved("chat-1", false).await;
    assert!(approved.accepted);
}

#[tokio::test]
async fn blocked_estimate_requires_shop_override_for_follow_ups() {
    let adapters = Adapters {
        knowledge: Some(kb_o2_sensor()),
        pricing_primary: Some(Arc::new(MockPricing::failing(
            "partstech",
            SourceError::platform_down("partstech"),
        ))),
        ..Default::default()
    };
    let h = harness(adapters);

    let result = h.orchestrator.run_estimate(civic_request("P0420")).await;
    assert!(!result.customer_ready);

    let denied = h.orchestrator.order_parts("chat-1", false).await;
    assert!(!denied.accepted);
    assert!(denied.message.contains("override"));
}
