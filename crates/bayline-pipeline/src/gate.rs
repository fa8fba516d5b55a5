//! The pricing gate.
//!
//! Applied exactly once, immediately before the result is produced. The
//! gate decides whether the estimate may be shown to an external customer;
//! it never lets wholesale cost masquerade as retail.

use bayline_types::{warn_codes, GateVerdict, PricingSource, Warning};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GateInput {
    pub parts_empty: bool,
    pub parts_retail_total: f64,
    pub pricing_source: PricingSource,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GateDecision {
    pub verdict: GateVerdict,
    pub customer_ready: bool,
    pub pricing_source: PricingSource,
    pub warning: Option<Warning>,
}

pub fn apply_gate(input: GateInput) -> GateDecision {
    // No parts: labor-only work is always presentable.
    if input.parts_empty {
        return GateDecision {
            verdict: GateVerdict::Pass,
            customer_ready: true,
            pricing_source: input.pricing_source,
            warning: None,
        };
    }

    let trusted = matches!(
        input.pricing_source,
        PricingSource::AutoleapNative | PricingSource::MatrixFallback
    );
    if trusted && input.parts_retail_total > 0.0 {
        return GateDecision {
            verdict: GateVerdict::Pass,
            customer_ready: true,
            pricing_source: input.pricing_source,
            warning: None,
        };
    }

    GateDecision {
        verdict: GateVerdict::Blocked,
        customer_ready: false,
        pricing_source: PricingSource::Failed,
        warning: Some(Warning::new(
            warn_codes::PRICING_GATE_BLOCKED,
            "Parts pricing couldn't be resolved — review before sending",
        )),
    }
}
