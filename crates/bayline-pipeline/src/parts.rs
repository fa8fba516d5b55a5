//! Parts extraction.
//!
//! Resolution order: the plan's own parts list, then parts attached to the
//! top-ranked diagnoses, then query-keyword fallback patterns. Maintenance
//! requests draw from the canned-jobs table instead.

use std::sync::OnceLock;

use regex::RegexSet;

use bayline_types::{LaborSource, PartRequest, RepairPlan};

/// A shop-standard maintenance job with known parts and hours.
#[derive(Debug, Clone, PartialEq)]
pub struct CannedJob {
    pub name: &'static str,
    pub parts: Vec<PartRequest>,
    pub hours: f64,
    pub labor_source: LaborSource,
}

/// Patterns and builders share an index; the first matching pattern wins,
/// so the more specific cabin-filter entry sits above the engine one.
const CANNED_PATTERNS: &[&str] = &[
    r"oil (change|service)",
    r"brake (pad|job)",
    r"coolant flush",
    r"cabin (air )?filter",
    r"air filter",
    r"spark plug",
];

fn canned_set() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new(CANNED_PATTERNS.iter().map(|p| format!("(?i){p}")))
            .expect("valid canned job patterns")
    })
}

pub fn canned_job(query: &str) -> Option<CannedJob> {
    let index = canned_set().matches(query).into_iter().next()?;
    let job = match index {
        0 => CannedJob {
            name: "oil change",
            parts: vec![
                PartRequest::new("oil filter"),
                PartRequest::new("drain plug gasket"),
            ],
            hours: 0.6,
            labor_source: LaborSource::ShopDefault,
        },
        1 => CannedJob {
            name: "front brake pads and rotors",
            parts: vec![
                PartRequest::new("front brake pads"),
                PartRequest::new("front brake rotors").with_qty(2),
            ],
            hours: 1.8,
            labor_source: LaborSource::ShopDefault,
        },
        2 => CannedJob {
            name: "coolant flush",
            parts: vec![PartRequest::new("coolant")],
            hours: 1.0,
            labor_source: LaborSource::ShopDefault,
        },
        3 => CannedJob {
            name: "cabin air filter",
            parts: vec![PartRequest::new("cabin air filter")],
            hours: 0.3,
            labor_source: LaborSource::ShopDefault,
        },
        4 => CannedJob {
            name: "engine air filter",
            parts: vec![PartRequest::new("engine air filter")],
            hours: 0.3,
            labor_source: LaborSource::ShopDefault,
        },
        _ => CannedJob {
            name: "spark plug replacement",
            parts: vec![PartRequest::new("spark plugs").with_qty(4)],
            hours: 1.2,
            labor_source: LaborSource::ShopDefault,
        },
    };
    Some(job)
}

/// Query keywords that imply parts when neither the plan nor the diagnoses
/// name any. Indexed in lockstep with `fallback_set()`.
const FALLBACK_PATTERNS: &[(&str, &[&str])] = &[
    (r"\bbattery\b", &["battery"]),
    (r"\balternator\b", &["alternator"]),
    (r"\bstarter\b", &["starter motor"]),
    (r"\bradiator\b", &["radiator"]),
    (r"\bthermostat\b", &["thermostat"]),
    (r"\bwater pump\b", &["water pump"]),
    (r"\bserpentine\b", &["serpentine belt"]),
    (r"\bwipers?\b", &["wiper blades"]),
    (r"\b(o2|oxygen) sensor\b", &["oxygen sensor"]),
    (r"\bcatalytic\b", &["catalytic converter"]),
    (r"\bignition coil\b", &["ignition coil"]),
    (r"\bfuel pump\b", &["fuel pump"]),
];

fn fallback_set() -> &'static RegexSet {
    static SET: OnceLock<RegexSet> = OnceLock::new();
    SET.get_or_init(|| {
        RegexSet::new(FALLBACK_PATTERNS.iter().map(|(p, _)| format!("(?i){p}")))
            .expect("valid part fallback patterns")
    })
}

/// Derives what to price. Diagnosis-attached parts keep the order of the
/// diagnoses they came from; only the top three causes contribute.
pub fn extract_parts(plan: &RepairPlan, query: &str) -> Vec<PartRequest> {
    if !plan.parts.is_empty() {
        return plan.parts.clone();
    }

    let mut requests: Vec<PartRequest> = Vec::new();
    for diagnosis in plan.diagnoses.iter().take(3) {
        for name in &diagnosis.parts {
            if !requests.iter().any(|r| r.name.eq_ignore_ascii_case(name)) {
                requests.push(PartRequest::new(name.clone()));
            }
        }
    }
    if !requests.is_empty() {
        return requests;
    }

    for index in fallback_set().matches(query) {
        for name in FALLBACK_PATTERNS[index].1 {
            if !requests.iter().any(|r| r.name == *name) {
                requests.push(PartRequest::new(*name));
            }
        }
    }
    requests
}
