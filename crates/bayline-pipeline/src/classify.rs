//! Request classification.
//!
//! Partitions the free-form query into diagnostic / maintenance / general
//! and pulls every trouble code out of the text.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use bayline_types::Dtc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Diagnostic,
    Maintenance,
    General,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub kind: RequestKind,
    pub dtcs: Vec<Dtc>,
}

fn dtc_scan_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[PBCUpbcu][0-9]{4}\b").expect("valid DTC scan regex"))
}

fn diagnostic_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            r"(?i)rough idle|misfire|stall|check engine|won'?t start|no start",
            r"|overheat|hesitat|vibrat|noise|grinding|squeal|leak|smoke|dies",
        ))
        .expect("valid diagnostic keyword regex")
    })
}

fn maintenance_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(concat!(
            r"(?i)oil change|oil service|tire rotation|rotate|brake pad|brake job",
            r"|coolant flush|transmission fluid|trans fluid|cabin filter|air filter",
            r"|tune[- ]?up|alignment|inspection|mile service|maintenance|wiper",
            r"|spark plug replacement",
        ))
        .expect("valid maintenance keyword regex")
    })
}

/// Extracts DTCs from the query text, merging with any the request already
/// carried. Order: explicit codes first, then first appearance in text.
pub fn extract_dtcs(query: &str, explicit: &[Dtc]) -> Vec<Dtc> {
    let mut codes: Vec<Dtc> = explicit.to_vec();
    for found in dtc_scan_re().find_iter(query) {
        if let Some(code) = Dtc::parse(found.as_str()) {
            if !codes.contains(&code) {
                codes.push(code);
            }
        }
    }
    codes
}

pub fn classify(query: &str, explicit: &[Dtc]) -> Classification {
    let dtcs = extract_dtcs(query, explicit);

    let kind = if !dtcs.is_empty() {
        RequestKind::Diagnostic
    } else if maintenance_re().is_match(query) {
        RequestKind::Maintenance
    } else if diagnostic_re().is_match(query) {
        RequestKind::Diagnostic
    } else {
        RequestKind::General
    };

    Classification { kind, dtcs }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trouble_codes_force_diagnostic() {
        let c = classify("car threw p0420 and P0171 on the highway", &[]);
        assert_eq!(c.kind, RequestKind::Diagnostic);
        assert_eq!(
            c.dtcs,
            vec![Dtc::parse("P0420").unwrap(), Dtc::parse("P0171").unwrap()]
        );
    }

    #[test]
    fn maintenance_wins_over_general() {
        let c = classify("oil change 45000 miles", &[]);
        assert_eq!(c.kind, RequestKind::Maintenance);
        assert!(c.dtcs.is_empty());
    }

    #[test]
    fn symptom_keywords_classify_diagnostic() {
        assert_eq!(classify("rough idle on cold start", &[]).kind, RequestKind::Diagnostic);
        assert_eq!(classify("grinding noise when braking", &[]).kind, RequestKind::Diagnostic);
        assert_eq!(classify("it won't start this morning", &[]).kind, RequestKind::Diagnostic);
    }

    #[test]
    fn everything_else_is_general() {
        assert_eq!(classify("what octane should I use", &[]).kind, RequestKind::General);
    }

    #[test]
    fn code_like_noise_inside_words_is_ignored() {
        // `AP0420X` is not a standalone code.
        let c = classify("part number AP0420X", &[]);
        assert!(c.dtcs.is_empty());
    }

    #[test]
    fn explicit_codes_come_first_and_dedupe() {
        let explicit = vec![Dtc::parse("P0300").unwrap()];
        let codes = extract_dtcs("saw P0300 and C1234", &explicit);
        assert_eq!(
            codes,
            vec![Dtc::parse("P0300").unwrap(), Dtc::parse("C1234").unwrap()]
        );
    }
}
