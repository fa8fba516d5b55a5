use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SourceError, Warning};
use crate::parts::{LaborResult, PartsBundle};
use crate::plan::RepairPlan;
use crate::vehicle::Vehicle;

/// Where the customer-facing parts pricing came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PricingSource {
    /// Retail prices written by the estimate platform itself.
    #[serde(rename = "autoleap-native")]
    AutoleapNative,
    /// Shop markup applied to wholesale cost.
    #[serde(rename = "matrix-fallback")]
    MatrixFallback,
    /// No trustworthy source; totals must stay internal.
    #[serde(rename = "FAILED_PRICING_SOURCE")]
    Failed,
}

impl PricingSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AutoleapNative => "autoleap-native",
            Self::MatrixFallback => "matrix-fallback",
            Self::Failed => "FAILED_PRICING_SOURCE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GateVerdict {
    #[serde(rename = "PASS")]
    Pass,
    #[serde(rename = "BLOCKED")]
    Blocked,
}

/// Quick-reference sheet for the mechanic working the job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MechanicReference {
    #[serde(default)]
    pub sensor_locations: Vec<String>,
    #[serde(default)]
    pub fluids: BTreeMap<String, String>,
    #[serde(default)]
    pub torque: BTreeMap<String, String>,
    #[serde(default)]
    pub tools: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EstimateTotals {
    pub labor_total: f64,
    pub parts_retail_total: f64,
    pub supplies: f64,
    pub tax: f64,
    pub grand_total: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactPaths {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf: Option<PathBuf>,
    #[serde(default)]
    pub wiring_diagrams: Vec<PathBuf>,
    #[serde(default)]
    pub screenshots: Vec<PathBuf>,
}

impl ArtifactPaths {
    /// True when nothing customer-facing has been written.
    pub fn customer_facing_empty(&self) -> bool {
        self.pdf.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Ok,
    Skipped,
    Failed,
}

/// Per-stage completion record kept on the result for observability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageStatus {
    pub name: String,
    pub outcome: StageOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SourceError>,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    /// A REQUIRED stage failed terminally; `code` is the classified reason.
    Failed { code: String },
}

/// Everything the pipeline produced for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EstimateResult {
    pub run_id: String,
    pub chat_id: String,
    pub vehicle: Vehicle,
    pub plan: RepairPlan,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<PartsBundle>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labor: Option<LaborResult>,
    pub reference: MechanicReference,
    pub totals: EstimateTotals,
    pub pricing_source: PricingSource,
    pub pricing_gate: GateVerdict,
    pub customer_ready: bool,
    #[serde(default)]
    pub warnings: Vec<Warning>,
    #[serde(default)]
    pub artifacts: ArtifactPaths,
    #[serde(default)]
    pub stages: Vec<StageStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimate_id: Option<String>,
    pub outcome: RunOutcome,
    pub completed_at: DateTime<Utc>,
    pub elapsed_ms: u64,
}

impl EstimateResult {
    pub fn warning(&mut self, code: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(Warning::new(code, message));
    }

    pub fn has_warning(&self, code: &str) -> bool {
        self.warnings.iter().any(|w| w.code == code)
    }
}

/// Result of a follow-up action (`order_parts` / `customer_approved`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResult {
    pub run_id: String,
    pub accepted: bool,
    pub message: String,
    #[serde(default)]
    pub ordered_parts: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pricing_source_tags_are_stable() {
        assert_eq!(
            serde_json::to_value(PricingSource::AutoleapNative).unwrap(),
            serde_json::json!("autoleap-native")
        );
        assert_eq!(
            serde_json::to_value(PricingSource::Failed).unwrap(),
            serde_json::json!("FAILED_PRICING_SOURCE")
        );
        assert_eq!(
            serde_json::to_value(GateVerdict::Blocked).unwrap(),
            serde_json::json!("BLOCKED")
        );
    }
}
