//! Chat-facing estimate rendering.
//!
//! Formatters switch on the pricing-gate verdict, never on strings. A
//! blocked estimate shows the internal review message and no dollar totals.

use bayline_types::{EstimateResult, GateVerdict, Phase, RunOutcome};

pub const BLOCKED_NOTICE: &str =
    "Parts pricing couldn't be resolved — review before sending";

pub fn format_estimate(result: &EstimateResult) -> String {
    let mut out = String::new();
    out.push_str(&format!("🔧 {}\n", result.vehicle.description()));

    if let RunOutcome::Failed { code } = &result.outcome {
        out.push_str(&format!("Estimate failed: {code}\n"));
        return out;
    }

    out.push_str(&format!(
        "Diagnosis: {} ({:.0}% confidence)\n",
        result.plan.primary_cause,
        result.plan.confidence * 100.0
    ));
    if result.plan.low_confidence_warning {
        out.push_str("⚠ Low confidence — verify before quoting the customer\n");
    }

    if let Some(bundle) = &result.parts {
        out.push_str(&format!("Parts: {} selected", bundle.quoted_count()));
        if !bundle.all_in_stock {
            out.push_str(" (some not in stock)");
        }
        out.push('\n');
    }
    if let Some(labor) = &result.labor {
        out.push_str(&format!(
            "Labor: {:.1} h ({})\n",
            labor.hours,
            labor.source.as_str()
        ));
    }

    match result.pricing_gate {
        GateVerdict::Pass => {
            out.push_str(&format!(
                "Parts: ${:.2} · Labor: ${:.2} · Supplies: ${:.2} · Tax: ${:.2}\n",
                result.totals.parts_retail_total,
                result.totals.labor_total,
                result.totals.supplies,
                result.totals.tax,
            ));
            out.push_str(&format!("Total: ${:.2}\n", result.totals.grand_total));
        }
        GateVerdict::Blocked => {
            out.push_str(BLOCKED_NOTICE);
            out.push('\n');
        }
    }

    for warning in &result.warnings {
        out.push_str(&format!("⚠ {}\n", warning.message));
    }
    out
}

pub fn format_phase(phase: Phase) -> &'static str {
    match phase {
        Phase::LoggingIn => "Signing in to vendor platforms…",
        Phase::CreatingCustomer => "Creating the customer record…",
        Phase::AddingParts => "Pricing parts…",
        Phase::AddingLabor => "Looking up labor times…",
        Phase::LinkingParts => "Staging parts in the cart…",
        Phase::GeneratingPdf => "Generating the PDF…",
        Phase::Done => "Done.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bayline_types::{
        warn_codes, ArtifactPaths, DiagnosticPath, EstimateTotals, MechanicReference,
        PricingSource, RepairPlan, Vehicle, Warning,
    };
    use chrono::Utc;

    fn base(gate: GateVerdict, ready: bool) -> EstimateResult {
        EstimateResult {
            run_id: "run-1".to_string(),
            chat_id: "chat-1".to_string(),
            vehicle: Vehicle {
                year: Some(2019),
                make: Some("Honda".to_string()),
                model: Some("Civic".to_string()),
                ..Default::default()
            },
            plan: RepairPlan::new("downstream O2 sensor", 0.78, DiagnosticPath::KbDirect),
            parts: None,
            labor: None,
            reference: MechanicReference::default(),
            totals: EstimateTotals {
                labor_total: 174.0,
                parts_retail_total: 90.30,
                supplies: 10.44,
                tax: 22.67,
                grand_total: 297.41,
            },
            pricing_source: PricingSource::MatrixFallback,
            pricing_gate: gate,
            customer_ready: ready,
            warnings: Vec::new(),
            artifacts: ArtifactPaths::default(),
            stages: Vec::new(),
            estimate_id: None,
            outcome: RunOutcome::Completed,
            completed_at: Utc::now(),
            elapsed_ms: 1000,
        }
    }

    #[test]
    fn passing_estimate_shows_totals() {
        let text = format_estimate(&base(GateVerdict::Pass, true));
        assert!(text.contains("Total: $297.41"));
        assert!(!text.contains(BLOCKED_NOTICE));
    }

    #[test]
    fn blocked_estimate_suppresses_every_dollar_figure() {
        let mut result = base(GateVerdict::Blocked, false);
        result.totals = EstimateTotals::default();
        result
            .warnings
            .push(Warning::new(warn_codes::PRICING_GATE_BLOCKED, BLOCKED_NOTICE));
        let text = format_estimate(&result);
        assert!(text.contains(BLOCKED_NOTICE));
        assert!(!text.contains('$'));
    }
}
