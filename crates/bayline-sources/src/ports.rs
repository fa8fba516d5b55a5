//! The four adapter ports.
//!
//! Every source — HTTP JSON or browser-driven — implements exactly one of
//! these. The orchestrator only ever sees the port. Operations take a
//! `SourceContext` (run id + deadline + cancellation) and return normalized
//! values; raw vendor strings never cross a port boundary.

use async_trait::async_trait;

use bayline_core::deadline::RunDeadline;
use bayline_observability::RunLogger;
use bayline_types::{
    CustomerHints, Diagnosis, Dtc, LaborResult, LaborSource, PartRequest, PartSelection,
    PartsBundle, RepairPlan, ResearchFragment, SourceError, Vehicle,
};

/// Per-call context threaded through every adapter operation.
#[derive(Clone)]
pub struct SourceContext {
    pub run_id: String,
    pub deadline: RunDeadline,
    pub logger: RunLogger,
}

impl SourceContext {
    pub fn new(run_id: impl Into<String>, deadline: RunDeadline, logger: RunLogger) -> Self {
        Self {
            run_id: run_id.into(),
            deadline,
            logger,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.deadline.is_cancelled() || self.deadline.deadline_elapsed()
    }
}

/// A research source: returns whatever subset of the repair picture it has.
/// Partial results are normal; empty fields are not errors.
#[async_trait]
pub trait Research: Send + Sync {
    fn platform(&self) -> &'static str;

    /// Browser-driven sources contend for the shared browser tab and are
    /// serialized by the scheduler.
    fn requires_browser(&self) -> bool;

    async fn search(
        &self,
        ctx: &SourceContext,
        vehicle: &Vehicle,
        query: &str,
        dtcs: &[Dtc],
    ) -> Result<ResearchFragment, SourceError>;
}

/// Prices a parts list. Each `PartRequest` yields a quote or a reasoned
/// miss; the bundle's selections are the per-part results.
#[async_trait]
pub trait PartsPrice: Send + Sync {
    fn platform(&self) -> &'static str;

    async fn price(
        &self,
        ctx: &SourceContext,
        vehicle: &Vehicle,
        parts: &[PartRequest],
    ) -> Result<PartsBundle, SourceError>;

    /// Holds non-conditional selections in the vendor cart ahead of
    /// approval. Idempotent on `run_id`. Vendors without a cart report
    /// `NOT_FOUND`, which optional stages downgrade to a warning.
    async fn stage_cart(
        &self,
        _ctx: &SourceContext,
        _run_id: &str,
        _parts: &[PartSelection],
    ) -> Result<(), SourceError> {
        Err(SourceError::NotFound)
    }

    /// Places the order for previously selected parts. Returns the ordered
    /// part names. Idempotent on `run_id`.
    async fn order(
        &self,
        _ctx: &SourceContext,
        _run_id: &str,
        _parts: &[PartSelection],
    ) -> Result<Vec<String>, SourceError> {
        Err(SourceError::NotFound)
    }
}

/// Book-hours lookup for one named procedure.
#[async_trait]
pub trait LaborLookup: Send + Sync {
    fn source(&self) -> LaborSource;

    async fn hours(
        &self,
        ctx: &SourceContext,
        vehicle: &Vehicle,
        procedure: &str,
    ) -> Result<LaborResult, SourceError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct EstimateDraft {
    pub chat_id: String,
    pub run_id: String,
    pub customer: CustomerHints,
    pub vehicle: Vehicle,
    pub parts: PartsBundle,
    pub labor: Option<LaborResult>,
    pub diagnosis: String,
    pub labor_total: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EstimateReceipt {
    pub estimate_id: String,
    pub estimate_code: String,
    pub total: f64,
    pub source_tag: String,
    /// Set when the platform computed its own retail parts total.
    pub parts_retail_total: Option<f64>,
}

/// Writes the estimate into the shop-management platform. `create` is
/// idempotent on `(chat_id, run_id)`: a retry must not create a second
/// estimate.
#[async_trait]
pub trait EstimateSink: Send + Sync {
    fn platform(&self) -> &'static str;

    async fn create(
        &self,
        ctx: &SourceContext,
        draft: &EstimateDraft,
    ) -> Result<EstimateReceipt, SourceError>;
}

// ---------------------------------------------------------------------------
// Supporting ports consumed by individual stages
// ---------------------------------------------------------------------------

/// Knowledge-base answer used to seed the diagnosis.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KbAnswer {
    pub diagnoses: Vec<Diagnosis>,
    pub parts: Vec<PartRequest>,
    pub confidence: f64,
}

#[async_trait]
pub trait Knowledge: Send + Sync {
    async fn lookup(
        &self,
        ctx: &SourceContext,
        vehicle: &Vehicle,
        query: &str,
        dtcs: &[Dtc],
    ) -> Result<KbAnswer, SourceError>;
}

/// LLM supplement for low-confidence or KB-miss diagnoses.
#[async_trait]
pub trait Reasoner: Send + Sync {
    async fn diagnose(
        &self,
        ctx: &SourceContext,
        vehicle: &Vehicle,
        query: &str,
        dtcs: &[Dtc],
    ) -> Result<Vec<Diagnosis>, SourceError>;
}

/// Prior-repair signal for this vehicle and shop: a signed confidence delta
/// in [-0.2, +0.2].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistorySignal {
    pub delta: f64,
    pub note: Option<String>,
}

#[async_trait]
pub trait RepairHistory: Send + Sync {
    async fn prior_repairs(
        &self,
        ctx: &SourceContext,
        vehicle: &Vehicle,
        shop_id: Option<&str>,
    ) -> Result<HistorySignal, SourceError>;
}

/// VIN decoding against the public decoder service.
#[async_trait]
pub trait VinDecode: Send + Sync {
    async fn decode(&self, ctx: &SourceContext, vin: &str) -> Result<Vehicle, SourceError>;
}

/// Renders the customer PDF. Out-of-scope renderers plug in here; the
/// pipeline skips the stage when none is configured or the gate blocked.
#[async_trait]
pub trait PdfRenderer: Send + Sync {
    async fn render(
        &self,
        ctx: &SourceContext,
        plan: &RepairPlan,
        vehicle: &Vehicle,
        grand_total: f64,
    ) -> Result<std::path::PathBuf, SourceError>;
}
