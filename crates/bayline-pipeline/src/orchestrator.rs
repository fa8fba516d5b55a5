//! The estimate pipeline.
//!
//! One `run_estimate` call drives the thirteen stages in order, delegating
//! fan-out to the scheduler and all vendor I/O to the adapter ports. The
//! orchestrator owns the `Request` and the evolving result exclusively;
//! adapters only ever see immutable views and return fragments.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use bayline_core::auth::SessionManager;
use bayline_core::breaker::CircuitBreakers;
use bayline_core::config::AdvisorConfig;
use bayline_core::deadline::RunDeadline;
use bayline_core::retry::{with_retry, RetryPolicy};
use bayline_core::session_store::SessionStore;
use bayline_core::tabs::TabRegistry;
use bayline_observability::{RunLogger, StepOutcome};
use bayline_sources::{
    EstimateDraft, EstimateReceipt, EstimateSink, Knowledge, LaborLookup, PartsPrice, PdfRenderer,
    Reasoner, RepairHistory, Research, SourceContext, VinDecode,
};
use bayline_types::{
    warn_codes, ArtifactPaths, DiagnosticPath, Dtc, EstimateResult, EstimateTotals,
    GateVerdict, LaborResult, LaborSource, LaborSpec, PartsBundle, Phase, PricingSource,
    ProgressEvent, RepairPlan, Request, ResearchFragment, RunOutcome, SourceError, StageOutcome,
    StageStatus, Vehicle, Warning,
};

use crate::classify::{classify, RequestKind};
use crate::gate::{apply_gate, GateInput};
use crate::merge::{apply_history, merge_all, merge_fragment};
use crate::parts::{canned_job, extract_parts};
use crate::reference::build_reference;
use crate::schedule::{
    validate_stages, FanTask, StagePolicy, StageScheduler, StageSpec, SHARED_BROWSER,
};

/// Adapter wiring. Everything is optional except that a pipeline without a
/// diagnosis source can only serve maintenance requests.
#[derive(Default, Clone)]
pub struct Adapters {
    pub vin: Option<Arc<dyn VinDecode>>,
    pub knowledge: Option<Arc<dyn Knowledge>>,
    pub reasoner: Option<Arc<dyn Reasoner>>,
    pub history: Option<Arc<dyn RepairHistory>>,
    pub research: Vec<Arc<dyn Research>>,
    pub pricing_primary: Option<Arc<dyn PartsPrice>>,
    pub pricing_fallback: Option<Arc<dyn PartsPrice>>,
    pub labor: Vec<Arc<dyn LaborLookup>>,
    pub estimate_sink: Option<Arc<dyn EstimateSink>>,
    pub pdf: Option<Arc<dyn PdfRenderer>>,
}

/// The thirteen pipeline stages and their happens-before edges.
pub fn pipeline_stages(config: &AdvisorConfig) -> Vec<StageSpec> {
    let t = &config.timeouts;
    vec![
        StageSpec {
            name: "identify_vehicle",
            needs: &[],
            may_suspend: true,
            timeout: t.vin_decode,
            policy: StagePolicy::Required,
            resource: None,
        },
        StageSpec {
            name: "classify_request",
            needs: &["identify_vehicle"],
            may_suspend: false,
            timeout: Duration::from_secs(1),
            policy: StagePolicy::Required,
            resource: None,
        },
        StageSpec {
            name: "seed_diagnosis",
            needs: &["classify_request"],
            may_suspend: true,
            timeout: t.api_research,
            policy: StagePolicy::Required,
            resource: None,
        },
        StageSpec {
            name: "history_check",
            needs: &["seed_diagnosis"],
            may_suspend: true,
            timeout: t.api_research,
            policy: StagePolicy::Optional,
            resource: None,
        },
        StageSpec {
            name: "research_fanout",
            needs: &["seed_diagnosis"],
            may_suspend: true,
            timeout: t.research_fanout,
            policy: StagePolicy::Optional,
            resource: Some(SHARED_BROWSER),
        },
        StageSpec {
            name: "mechanic_reference",
            needs: &["research_fanout"],
            may_suspend: false,
            timeout: Duration::from_secs(1),
            policy: StagePolicy::Required,
            resource: None,
        },
        StageSpec {
            name: "extract_parts",
            needs: &["research_fanout"],
            may_suspend: false,
            timeout: Duration::from_secs(1),
            policy: StagePolicy::Required,
            resource: None,
        },
        StageSpec {
            name: "price_parts",
            needs: &["extract_parts"],
            may_suspend: true,
            timeout: t.parts_pricing,
            policy: StagePolicy::Optional,
            resource: None,
        },
        StageSpec {
            name: "stage_cart",
            needs: &["price_parts"],
            may_suspend: true,
            timeout: t.parts_pricing,
            policy: StagePolicy::Optional,
            resource: None,
        },
        StageSpec {
            name: "create_estimate",
            needs: &["price_parts"],
            may_suspend: true,
            timeout: t.estimate_create,
            policy: StagePolicy::Optional,
            resource: None,
        },
        StageSpec {
            name: "pricing_gate",
            needs: &["price_parts", "create_estimate"],
            may_suspend: false,
            timeout: Duration::from_secs(1),
            policy: StagePolicy::Required,
            resource: None,
        },
        StageSpec {
            name: "emit_pdf",
            needs: &["pricing_gate"],
            may_suspend: true,
            timeout: t.pdf,
            policy: StagePolicy::Optional,
            resource: None,
        },
        StageSpec {
            name: "finalize",
            needs: &["pricing_gate"],
            may_suspend: false,
            timeout: Duration::from_secs(2),
            policy: StagePolicy::Required,
            resource: None,
        },
    ]
}

pub struct Orchestrator {
    config: AdvisorConfig,
    adapters: Adapters,
    breakers: Arc<CircuitBreakers>,
    tabs: Arc<TabRegistry>,
    sessions: Arc<SessionManager>,
    store: Arc<SessionStore>,
    scheduler: StageScheduler,
}

impl Orchestrator {
    pub fn new(
        config: AdvisorConfig,
        adapters: Adapters,
        breakers: Arc<CircuitBreakers>,
        tabs: Arc<TabRegistry>,
        sessions: Arc<SessionManager>,
        store: Arc<SessionStore>,
    ) -> anyhow::Result<Self> {
        let order = validate_stages(&pipeline_stages(&config))?;
        tracing::debug!(target: "bayline.pipeline", ?order, "stage graph validated");
        let scheduler = StageScheduler::new(config.max_parallel_api);
        Ok(Self {
            config,
            adapters,
            breakers,
            tabs,
            sessions,
            store,
            scheduler,
        })
    }

    pub fn store(&self) -> Arc<SessionStore> {
        self.store.clone()
    }

    // -----------------------------------------------------------------------
    // run_estimate
    // -----------------------------------------------------------------------

    pub async fn run_estimate(&self, request: Request) -> EstimateResult {
        let started = Instant::now();
        let logger = RunLogger::new("estimate", request.run_id.clone());
        let root = RunDeadline::new(self.config.timeouts.root);
        let ctx = SourceContext::new(request.run_id.clone(), root.clone(), logger.clone());
        logger.info(&format!("estimate run started: {}", request.query));

        let mut run = RunState::new(&request);

        // 1. Identify Vehicle — REQUIRED
        let step = logger.step("identify_vehicle");
        match self.identify_vehicle(&ctx, &request).await {
            Ok(vehicle) => {
                run.push_stage("identify_vehicle", StageOutcome::Ok, None, step.end(StepOutcome::Ok));
                run.vehicle = vehicle;
            }
            Err(err) => {
                run.push_stage(
                    "identify_vehicle",
                    StageOutcome::Failed,
                    Some(err.clone()),
                    step.end(StepOutcome::Failed),
                );
                return self
                    .fail(&request, run, SourceError::VehicleUnresolved, started)
                    .await;
            }
        }

        // 2. Classify Request — REQUIRED (pure, cannot fail)
        let classification = classify(&request.query, &request.dtc_codes);
        run.dtcs = classification.dtcs.clone();
        run.push_stage("classify_request", StageOutcome::Ok, None, 0);

        // 3. Seed Diagnosis — REQUIRED on the diagnostic path
        if classification.kind == RequestKind::Maintenance {
            run.plan = self.seed_maintenance(&request.query);
            run.push_stage("seed_diagnosis", StageOutcome::Skipped, None, 0);
        } else {
            let step = logger.step("seed_diagnosis");
            match self.seed_diagnosis(&ctx, &run.vehicle, &request.query, &run.dtcs).await {
                Ok(plan) => {
                    run.plan = plan;
                    run.push_stage("seed_diagnosis", StageOutcome::Ok, None, step.end(StepOutcome::Ok));
                }
                Err(err) => {
                    run.push_stage(
                        "seed_diagnosis",
                        StageOutcome::Failed,
                        Some(err.clone()),
                        step.end(StepOutcome::Failed),
                    );
                    return self.fail(&request, run, err, started).await;
                }
            }
        }

        // 4. History Check — OPTIONAL
        self.history_check(&ctx, &mut run).await;

        // 5. Research Fan-out — OPTIONAL per source
        self.emit(&request, Phase::LoggingIn);
        self.research_fanout(&ctx, &root, &mut run).await;

        // 6. Mechanic Reference — REQUIRED (pure)
        run.reference = build_reference(&run.vehicle, &run.plan, &run.dtcs);
        run.push_stage("mechanic_reference", StageOutcome::Ok, None, 0);

        // 7. Extract Parts Needed — REQUIRED
        run.plan.parts = extract_parts(&run.plan, &request.query);
        run.push_stage("extract_parts", StageOutcome::Ok, None, 0);

        // Labor resolution rides between extraction and pricing.
        self.emit(&request, Phase::AddingLabor);
        self.resolve_labor(&ctx, &mut run).await;

        // 8. Price Parts — OPTIONAL, with fallback
        self.emit(&request, Phase::AddingParts);
        self.price_parts(&ctx, &root, &mut run).await;

        // 9. Pre-stage Cart — OPTIONAL
        self.emit(&request, Phase::LinkingParts);
        self.stage_cart(&ctx, &mut run).await;

        // 10. Create Estimate — OPTIONAL, customer required
        if request.customer.is_some() {
            self.emit(&request, Phase::CreatingCustomer);
        }
        self.create_estimate(&ctx, &request, &mut run).await;

        // Totals precede the gate so it judges the final numbers.
        let totals = self.compute_totals(&mut run);

        // 11. Apply Pricing Gate — REQUIRED
        let decision = apply_gate(GateInput {
            parts_empty: run.plan.parts.is_empty(),
            parts_retail_total: totals.parts_retail_total,
            pricing_source: run.pricing_source,
        });
        run.push_stage("pricing_gate", StageOutcome::Ok, None, 0);
        if let Some(warning) = decision.warning.clone() {
            run.warnings.push(warning);
        }

        // 12. Emit PDF — OPTIONAL, skipped when the gate blocks
        let mut artifacts = ArtifactPaths {
            pdf: None,
            wiring_diagrams: Vec::new(),
            screenshots: run.screenshots.clone(),
        };
        if decision.customer_ready && request.pdf_requested {
            self.emit(&request, Phase::GeneratingPdf);
            artifacts.pdf = self.emit_pdf(&ctx, &run, totals.grand_total).await;
            let outcome = if artifacts.pdf.is_some() {
                StageOutcome::Ok
            } else {
                StageOutcome::Skipped
            };
            run.push_stage("emit_pdf", outcome, None, 0);
        } else {
            run.push_stage("emit_pdf", StageOutcome::Skipped, None, 0);
        }

        // 13. Finalize — REQUIRED
        let totals = if decision.customer_ready {
            totals
        } else {
            // Blocked estimates carry no customer-facing money.
            EstimateTotals::default()
        };
        let result = EstimateResult {
            run_id: request.run_id.clone(),
            chat_id: request.chat_id.clone(),
            vehicle: run.vehicle.clone(),
            plan: run.plan.clone(),
            parts: run.bundle.clone(),
            labor: run.labor.clone(),
            reference: run.reference.clone(),
            totals,
            pricing_source: decision.pricing_source,
            pricing_gate: decision.verdict,
            customer_ready: decision.customer_ready,
            warnings: run.warnings.clone(),
            artifacts,
            stages: run.stages.clone(),
            estimate_id: run.receipt.as_ref().map(|r| r.estimate_id.clone()),
            outcome: RunOutcome::Completed,
            completed_at: Utc::now(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        self.finalize(&request, result).await
    }

    // -----------------------------------------------------------------------
    // Stages
    // -----------------------------------------------------------------------

    async fn identify_vehicle(
        &self,
        ctx: &SourceContext,
        request: &Request,
    ) -> Result<Vehicle, SourceError> {
        let hints = &request.vehicle_hints;
        if let (Some(vin), Some(decoder)) = (hints.vin.as_deref(), self.adapters.vin.clone()) {
            if bayline_types::is_valid_vin(vin) {
                let child = ctx.deadline.with_deadline(self.config.timeouts.vin_decode);
                let child_ctx = SourceContext::new(ctx.run_id.clone(), child, ctx.logger.clone());
                let vin = vin.to_string();
                let decoded = with_retry("vin_decode", RetryPolicy::default(), |_| {
                    let decoder = decoder.clone();
                    let ctx = child_ctx.clone();
                    let vin = vin.clone();
                    async move { decoder.decode(&ctx, &vin).await }
                })
                .await;
                match decoded {
                    Ok(mut vehicle) => {
                        vehicle.mileage = hints.mileage;
                        return Ok(vehicle);
                    }
                    Err(err) => {
                        ctx.logger.warn(&format!("vin decode failed: {err}"));
                    }
                }
            }
        }

        let vehicle = Vehicle {
            vin: hints.vin.clone().filter(|v| bayline_types::is_valid_vin(v)),
            year: hints.year,
            make: hints.make.clone(),
            model: hints.model.clone(),
            trim: None,
            engine: hints.engine.clone(),
            mileage: hints.mileage,
        };
        if vehicle.is_resolved() {
            Ok(vehicle)
        } else {
            Err(SourceError::VehicleUnresolved)
        }
    }

    fn seed_maintenance(&self, query: &str) -> RepairPlan {
        match canned_job(query) {
            Some(job) => {
                let mut plan = RepairPlan::new(job.name, 0.95, DiagnosticPath::KbDirect);
                plan.parts = job.parts;
                plan.labor = Some(LaborSpec {
                    hours: job.hours,
                    source: job.labor_source,
                    category: Some("maintenance".to_string()),
                    lift_required: false,
                    notes: None,
                });
                plan
            }
            None => RepairPlan::new(query, 0.6, DiagnosticPath::KbDirect),
        }
    }

    async fn seed_diagnosis(
        &self,
        ctx: &SourceContext,
        vehicle: &Vehicle,
        query: &str,
        dtcs: &[Dtc],
    ) -> Result<RepairPlan, SourceError> {
        let threshold = self.config.kb_confidence_threshold;

        let mut kb_error = None;
        let kb_answer = match &self.adapters.knowledge {
            Some(kb) => {
                let kb = kb.clone();
                match self
                    .breakers
                    .call("knowledge", || async {
                        kb.lookup(ctx, vehicle, query, dtcs).await
                    })
                    .await
                {
                    Ok(answer) => Some(answer),
                    Err(err) => {
                        kb_error = Some(err);
                        None
                    }
                }
            }
            None => None,
        };

        let mut plan: Option<RepairPlan> = None;
        if let Some(answer) = &kb_answer {
            if let Some(top) = answer.diagnoses.first() {
                let mut seeded = RepairPlan::new(
                    top.cause.clone(),
                    top.confidence,
                    if answer.confidence >= threshold {
                        DiagnosticPath::KbDirect
                    } else {
                        DiagnosticPath::KbWithClaude
                    },
                );
                seeded.diagnoses = answer.diagnoses.clone();
                seeded.diagnoses[0].primary = true;
                seeded.parts = answer.parts.clone();
                plan = Some(seeded);
            }
        }

        let need_llm = plan
            .as_ref()
            .map(|p| p.confidence < threshold)
            .unwrap_or(true);
        if need_llm {
            if let Some(reasoner) = &self.adapters.reasoner {
                let llm = reasoner.diagnose(ctx, vehicle, query, dtcs).await;
                match llm {
                    Ok(diagnoses) if !diagnoses.is_empty() => {
                        plan = Some(match plan {
                            Some(existing) => {
                                let mut fragment = ResearchFragment::for_source("claude");
                                fragment.fixes = diagnoses;
                                merge_fragment(&existing, &fragment)
                            }
                            None => {
                                let top = diagnoses[0].clone();
                                let mut seeded = RepairPlan::new(
                                    top.cause.clone(),
                                    top.confidence,
                                    DiagnosticPath::ClaudeOnly,
                                );
                                seeded.diagnoses = diagnoses;
                                seeded.diagnoses[0].primary = true;
                                seeded
                            }
                        });
                    }
                    Ok(_) => {}
                    Err(err) => ctx.logger.warn(&format!("llm diagnosis failed: {err}")),
                }
            }
        }

        // With neither source contributing, the stage fails with the most
        // specific reason we saw.
        let mut plan = plan.ok_or(kb_error.unwrap_or(SourceError::NotFound))?;
        if plan.confidence < 0.5 {
            plan.low_confidence_warning = true;
        }
        Ok(plan)
    }

    async fn history_check(&self, ctx: &SourceContext, run: &mut RunState) {
        let Some(history) = self.adapters.history.clone() else {
            run.push_stage("history_check", StageOutcome::Skipped, None, 0);
            return;
        };
        let step = ctx.logger.step("history_check");
        let shop_id = self.config.shop_id.clone();
        let outcome = history
            .prior_repairs(ctx, &run.vehicle, shop_id.as_deref())
            .await;
        match outcome {
            Ok(signal) => {
                run.plan = apply_history(&run.plan, &signal);
                run.push_stage("history_check", StageOutcome::Ok, None, step.end(StepOutcome::Ok));
            }
            Err(err) => {
                run.optional_failure("history_check", err, step.end(StepOutcome::Failed));
            }
        }
    }

    async fn research_fanout(&self, ctx: &SourceContext, root: &RunDeadline, run: &mut RunState) {
        if self.adapters.research.is_empty() {
            run.push_stage("research_fanout", StageOutcome::Skipped, None, 0);
            return;
        }

        let preflight = self.sessions.preflight().await;
        let step = ctx.logger.step("research_fanout");
        let scope = root.with_deadline(self.config.timeouts.research_fanout);

        let mut tasks: Vec<FanTask<ResearchFragment>> = Vec::new();
        for adapter in &self.adapters.research {
            let platform = adapter.platform();
            let usable = preflight
                .get(platform)
                .map(|state| state.authenticated)
                .unwrap_or(true);
            if !usable {
                run.warnings.push(Warning::new(
                    warn_codes::STAGE_SKIPPED,
                    format!("research source {platform} unavailable (not authenticated)"),
                ));
                run.push_stage(&format!("research:{platform}"), StageOutcome::Skipped, None, 0);
                continue;
            }

            let timeout = if adapter.requires_browser() {
                self.config.timeouts.browser_research
            } else {
                self.config.timeouts.api_research
            };
            let resource = adapter.requires_browser().then_some(SHARED_BROWSER);

            let adapter = adapter.clone();
            let breakers = self.breakers.clone();
            let logger = ctx.logger.clone();
            let run_id = ctx.run_id.clone();
            let vehicle = run.vehicle.clone();
            let query = run.query.clone();
            let dtcs = run.dtcs.clone();
            tasks.push(FanTask::new(
                format!("research:{platform}"),
                resource,
                timeout,
                move |deadline| {
                    Box::pin(async move {
                        let ctx = SourceContext::new(run_id, deadline, logger);
                        breakers
                            .call(platform, || async {
                                with_retry(platform, RetryPolicy::default(), |_| {
                                    let adapter = adapter.clone();
                                    let ctx = ctx.clone();
                                    let vehicle = vehicle.clone();
                                    let query = query.clone();
                                    let dtcs = dtcs.clone();
                                    async move { adapter.search(&ctx, &vehicle, &query, &dtcs).await }
                                })
                                .await
                            })
                            .await
                    })
                },
            ));
        }

        let results = self.scheduler.fan_out(&scope, tasks).await;
        let mut fragments = Vec::new();
        for (name, outcome) in results {
            match outcome {
                Ok(fragment) => {
                    run.screenshots
                        .extend(fragment.screenshots.iter().cloned());
                    run.push_stage(&name, StageOutcome::Ok, None, 0);
                    fragments.push(fragment);
                }
                Err(err) => {
                    run.optional_failure(&name, err, 0);
                }
            }
        }
        run.plan = merge_all(&run.plan, &fragments);
        run.push_stage(
            "research_fanout",
            StageOutcome::Ok,
            None,
            step.end(StepOutcome::Ok),
        );
    }

    async fn resolve_labor(&self, ctx: &SourceContext, run: &mut RunState) {
        let procedure = run
            .plan
            .procedures
            .first()
            .cloned()
            .unwrap_or_else(|| run.plan.primary_cause.clone());

        for adapter in &self.adapters.labor {
            let source = adapter.source();
            let outcome = self
                .breakers
                .call(source.as_str(), || async {
                    adapter.hours(ctx, &run.vehicle, &procedure).await
                })
                .await;
            match outcome {
                Ok(result) if result.hours > 0.0 => {
                    let mut fragment = ResearchFragment::for_source(source.as_str());
                    fragment.labor = Some(LaborSpec {
                        hours: result.hours,
                        source: result.source,
                        category: None,
                        lift_required: false,
                        notes: None,
                    });
                    run.plan = merge_fragment(&run.plan, &fragment);
                    run.labor = Some(result);
                    run.push_stage("labor_lookup", StageOutcome::Ok, None, 0);
                    return;
                }
                Ok(result) => {
                    run.warnings.push(Warning::new(
                        warn_codes::INVALID_LABOR,
                        format!("{} returned {} hours", source.as_str(), result.hours),
                    ));
                }
                Err(SourceError::NotFound) => {}
                Err(err) => {
                    ctx.logger
                        .warn(&format!("labor lookup via {} failed: {err}", source.as_str()));
                }
            }
        }

        // No lookup source answered; fall back to whatever research or the
        // canned job already put on the plan, else default hours.
        match &run.plan.labor {
            Some(spec) => {
                run.labor = Some(LaborResult {
                    hours: spec.hours,
                    source: spec.source,
                    operation: procedure,
                    confidence: 0.6,
                    reason_code: None,
                });
                run.push_stage("labor_lookup", StageOutcome::Ok, None, 0);
            }
            None => {
                run.labor = Some(LaborResult {
                    hours: 1.0,
                    source: LaborSource::Default,
                    operation: procedure,
                    confidence: 0.3,
                    reason_code: Some("DEFAULT_HOURS".to_string()),
                });
                run.plan.labor = Some(LaborSpec {
                    hours: 1.0,
                    source: LaborSource::Default,
                    category: None,
                    lift_required: false,
                    notes: None,
                });
                run.push_stage("labor_lookup", StageOutcome::Skipped, None, 0);
            }
        }
    }

    async fn price_parts(&self, ctx: &SourceContext, root: &RunDeadline, run: &mut RunState) {
        if run.plan.parts.is_empty() {
            run.push_stage("price_parts", StageOutcome::Skipped, None, 0);
            return;
        }
        let step = ctx.logger.step("price_parts");
        let scope = root.with_deadline(self.config.timeouts.parts_pricing);
        let scoped_ctx = SourceContext::new(ctx.run_id.clone(), scope, ctx.logger.clone());

        let adapters = [
            self.adapters.pricing_primary.clone(),
            self.adapters.pricing_fallback.clone(),
        ];
        for adapter in adapters.into_iter().flatten() {
            let platform = adapter.platform();
            let outcome = self
                .breakers
                .call(platform, || async {
                    with_retry(platform, RetryPolicy::default(), |_| {
                        let adapter = adapter.clone();
                        let ctx = scoped_ctx.clone();
                        let vehicle = run.vehicle.clone();
                        let parts = run.plan.parts.clone();
                        async move { adapter.price(&ctx, &vehicle, &parts).await }
                    })
                    .await
                })
                .await;
            match outcome {
                Ok(bundle) => {
                    run.pricing_platform = Some(platform);
                    run.bundle = Some(bundle);
                    run.push_stage("price_parts", StageOutcome::Ok, None, step.end(StepOutcome::Ok));
                    return;
                }
                Err(err) => {
                    run.warnings.push(Warning::new(
                        err.code(),
                        format!("pricing via {platform} failed: {err}"),
                    ));
                }
            }
        }
        run.push_stage(
            "price_parts",
            StageOutcome::Failed,
            Some(SourceError::platform_down("parts-pricing")),
            step.end(StepOutcome::Failed),
        );
    }

    async fn stage_cart(&self, ctx: &SourceContext, run: &mut RunState) {
        let (Some(bundle), Some(adapter)) = (&run.bundle, &self.adapters.pricing_primary) else {
            run.push_stage("stage_cart", StageOutcome::Skipped, None, 0);
            return;
        };
        if run.pricing_platform != Some(adapter.platform()) {
            // Fallback-priced bundles have nothing staged at the primary.
            run.push_stage("stage_cart", StageOutcome::Skipped, None, 0);
            return;
        }
        match adapter.stage_cart(ctx, &ctx.run_id, &bundle.selections).await {
            Ok(()) => run.push_stage("stage_cart", StageOutcome::Ok, None, 0),
            Err(err) => run.optional_failure("stage_cart", err, 0),
        }
    }

    async fn create_estimate(&self, ctx: &SourceContext, request: &Request, run: &mut RunState) {
        let (Some(customer), Some(sink)) = (&request.customer, &self.adapters.estimate_sink)
        else {
            run.push_stage("create_estimate", StageOutcome::Skipped, None, 0);
            return;
        };
        let step = ctx.logger.step("create_estimate");

        let draft = EstimateDraft {
            chat_id: request.chat_id.clone(),
            run_id: request.run_id.clone(),
            customer: customer.clone(),
            vehicle: run.vehicle.clone(),
            parts: run.bundle.clone().unwrap_or_default(),
            labor: run.labor.clone(),
            diagnosis: run.plan.primary_cause.clone(),
            labor_total: self.labor_total(run),
        };

        let sink = sink.clone();
        let outcome = self
            .breakers
            .call(sink.platform(), || async {
                with_retry("create_estimate", RetryPolicy::default(), |_| {
                    let sink = sink.clone();
                    let ctx = ctx.clone();
                    let draft = draft.clone();
                    async move { sink.create(&ctx, &draft).await }
                })
                .await
            })
            .await;

        match outcome {
            Ok(receipt) => {
                run.receipt = Some(receipt);
                run.push_stage("create_estimate", StageOutcome::Ok, None, step.end(StepOutcome::Ok));
            }
            Err(err) => {
                run.optional_failure("create_estimate", err, step.end(StepOutcome::Failed));
            }
        }
    }

    async fn emit_pdf(
        &self,
        ctx: &SourceContext,
        run: &RunState,
        grand_total: f64,
    ) -> Option<std::path::PathBuf> {
        let renderer = self.adapters.pdf.as_ref()?;
        match renderer
            .render(ctx, &run.plan, &run.vehicle, grand_total)
            .await
        {
            Ok(path) => Some(path),
            Err(err) => {
                warn!(target: "bayline.pipeline", code = err.code(), "pdf render failed");
                None
            }
        }
    }

    fn labor_total(&self, run: &RunState) -> f64 {
        let hours = run.labor.as_ref().map(|l| l.hours).unwrap_or(0.0);
        bayline_sources::round_cents(hours * self.config.labor_rate_per_hour)
    }

    fn compute_totals(&self, run: &mut RunState) -> EstimateTotals {
        use bayline_sources::{apply_markup, round_cents};

        let labor_total = self.labor_total(run);

        // Pricing source: the sink's native retail beats the markup matrix.
        let native_retail = run
            .receipt
            .as_ref()
            .and_then(|r| r.parts_retail_total)
            .filter(|total| *total > 0.0);
        let wholesale = run.bundle.as_ref().map(|b| b.parts_cost).unwrap_or(0.0);

        let parts_retail_total = if let Some(native) = native_retail {
            run.pricing_source = PricingSource::AutoleapNative;
            native
        } else if wholesale > 0.0 {
            run.pricing_source = PricingSource::MatrixFallback;
            apply_markup(wholesale, self.config.matrix_markup_percent)
        } else if run.plan.parts.is_empty() {
            run.pricing_source = PricingSource::MatrixFallback;
            0.0
        } else {
            run.pricing_source = PricingSource::Failed;
            0.0
        };

        let supplies = round_cents(labor_total * self.config.shop_supplies_percent / 100.0);
        let taxable = labor_total + parts_retail_total + supplies;
        let tax = round_cents(taxable * self.config.tax_percent / 100.0);
        EstimateTotals {
            labor_total,
            parts_retail_total,
            supplies,
            tax,
            grand_total: round_cents(taxable + tax),
        }
    }

    async fn fail(
        &self,
        request: &Request,
        mut run: RunState,
        err: SourceError,
        started: Instant,
    ) -> EstimateResult {
        run.warnings.push(Warning::new(
            err.code(),
            format!("pipeline failed: {err}"),
        ));
        let result = EstimateResult {
            run_id: request.run_id.clone(),
            chat_id: request.chat_id.clone(),
            vehicle: run.vehicle.clone(),
            plan: run.plan.clone(),
            parts: None,
            labor: None,
            reference: run.reference.clone(),
            totals: EstimateTotals::default(),
            pricing_source: PricingSource::Failed,
            pricing_gate: GateVerdict::Blocked,
            customer_ready: false,
            warnings: run.warnings.clone(),
            artifacts: ArtifactPaths::default(),
            stages: run.stages.clone(),
            estimate_id: None,
            outcome: RunOutcome::Failed {
                code: err.code().to_string(),
            },
            completed_at: Utc::now(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        self.finalize(request, result).await
    }

    async fn finalize(&self, request: &Request, mut result: EstimateResult) -> EstimateResult {
        let released = self.tabs.release_run(&request.run_id);
        if released > 0 {
            info!(
                target: "bayline.pipeline",
                run_id = %request.run_id,
                released,
                "released tab leases at finalize"
            );
        }
        result.stages.push(StageStatus {
            name: "finalize".to_string(),
            outcome: StageOutcome::Ok,
            error: None,
            elapsed_ms: 0,
        });
        self.store.put(result.clone()).await;
        self.emit(request, Phase::Done);
        info!(
            target: "bayline.pipeline",
            run_id = %request.run_id,
            elapsed_ms = result.elapsed_ms,
            customer_ready = result.customer_ready,
            "estimate run finished"
        );
        result
    }

    fn emit(&self, request: &Request, phase: Phase) {
        if let Some(sink) = &request.progress {
            let _ = sink.try_send(ProgressEvent::now(request.run_id.clone(), phase));
        }
    }

    // -----------------------------------------------------------------------
    // Follow-up actions
    // -----------------------------------------------------------------------

    /// Orders the selected parts from the last estimate for this chat.
    /// Accepted only when the estimate was customer-ready, unless the shop
    /// explicitly overrides.
    pub async fn order_parts(&self, chat_id: &str, shop_override: bool) -> OrderOutcome {
        self.follow_up(chat_id, shop_override, FollowUpKind::OrderParts)
            .await
    }

    /// Marks the customer's approval and releases the parts order.
    pub async fn customer_approved(&self, chat_id: &str, shop_override: bool) -> OrderOutcome {
        self.follow_up(chat_id, shop_override, FollowUpKind::CustomerApproved)
            .await
    }

    async fn follow_up(
        &self,
        chat_id: &str,
        shop_override: bool,
        kind: FollowUpKind,
    ) -> OrderOutcome {
        let Some(last) = self.store.last_result(chat_id).await else {
            return rejected_outcome("", "no estimate on file for this chat");
        };
        if !last.customer_ready && !shop_override {
            return rejected_outcome(
                &last.run_id,
                "estimate is not customer-ready; shop override required",
            );
        }
        let Some(bundle) = &last.parts else {
            return OrderOutcome {
                run_id: last.run_id.clone(),
                accepted: matches!(kind, FollowUpKind::CustomerApproved),
                message: match kind {
                    FollowUpKind::OrderParts => "estimate has no parts to order".to_string(),
                    FollowUpKind::CustomerApproved => {
                        "approval recorded; no parts to order".to_string()
                    }
                },
                ordered_parts: Vec::new(),
            };
        };

        let Some(adapter) = &self.adapters.pricing_primary else {
            return rejected_outcome(&last.run_id, "no parts vendor configured");
        };

        let deadline = RunDeadline::new(self.config.timeouts.parts_pricing);
        let logger = RunLogger::new("follow_up", last.run_id.clone());
        let ctx = SourceContext::new(last.run_id.clone(), deadline, logger);

        match adapter.order(&ctx, &last.run_id, &bundle.selections).await {
            Ok(names) => OrderOutcome {
                run_id: last.run_id.clone(),
                accepted: true,
                message: match kind {
                    FollowUpKind::OrderParts => format!("ordered {} part(s)", names.len()),
                    FollowUpKind::CustomerApproved => {
                        format!("approval recorded; ordered {} part(s)", names.len())
                    }
                },
                ordered_parts: names,
            },
            Err(err) => OrderOutcome {
                run_id: last.run_id.clone(),
                accepted: false,
                message: format!("parts order failed: {err}"),
                ordered_parts: Vec::new(),
            },
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum FollowUpKind {
    OrderParts,
    CustomerApproved,
}

pub type OrderOutcome = bayline_types::OrderResult;

fn rejected_outcome(run_id: &str, message: &str) -> OrderOutcome {
    OrderOutcome {
        run_id: run_id.to_string(),
        accepted: false,
        message: message.to_string(),
        ordered_parts: Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Per-run accumulator
// ---------------------------------------------------------------------------

struct RunState {
    query: String,
    vehicle: Vehicle,
    dtcs: Vec<Dtc>,
    plan: RepairPlan,
    bundle: Option<PartsBundle>,
    labor: Option<LaborResult>,
    reference: bayline_types::MechanicReference,
    receipt: Option<EstimateReceipt>,
    pricing_source: PricingSource,
    pricing_platform: Option<&'static str>,
    warnings: Vec<Warning>,
    stages: Vec<StageStatus>,
    screenshots: Vec<std::path::PathBuf>,
}

impl RunState {
    fn new(request: &Request) -> Self {
        Self {
            query: request.query.clone(),
            vehicle: Vehicle::default(),
            dtcs: Vec::new(),
            plan: RepairPlan::new("unclassified", 0.0, DiagnosticPath::ClaudeOnly),
            bundle: None,
            labor: None,
            reference: bayline_types::MechanicReference::default(),
            receipt: None,
            pricing_source: PricingSource::Failed,
            pricing_platform: None,
            warnings: Vec::new(),
            stages: Vec::new(),
            screenshots: Vec::new(),
        }
    }

    fn push_stage(
        &mut self,
        name: &str,
        outcome: StageOutcome,
        error: Option<SourceError>,
        elapsed_ms: u64,
    ) {
        self.stages.push(StageStatus {
            name: name.to_string(),
            outcome,
            error,
            elapsed_ms,
        });
    }

    /// Optional-stage failure: a warning plus a failed status, never an
    /// abort.
    fn optional_failure(&mut self, name: &str, err: SourceError, elapsed_ms: u64) {
        self.warnings.push(Warning::new(
            err.code(),
            format!("{name}: {err}"),
        ));
        self.push_stage(name, StageOutcome::Failed, Some(err), elapsed_ms);
    }
}
