use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

fn dtc_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[PBCU][0-9]{4}$").expect("valid DTC regex"))
}

fn vin_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-HJ-NPR-Z0-9]{17}$").expect("valid VIN regex"))
}

/// A diagnostic trouble code: one of `P`/`B`/`C`/`U` followed by four digits.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Dtc(String);

impl Dtc {
    pub fn parse(raw: &str) -> Option<Self> {
        let code = raw.trim().to_ascii_uppercase();
        dtc_re().is_match(&code).then_some(Self(code))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `P`, `B`, `C` or `U`.
    pub fn system(&self) -> char {
        self.0.chars().next().unwrap_or('P')
    }
}

impl std::fmt::Display for Dtc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returns true for a well-formed 17-character VIN (I/O/Q excluded).
pub fn is_valid_vin(vin: &str) -> bool {
    vin_re().is_match(&vin.trim().to_ascii_uppercase())
}

/// Resolved vehicle identity. Produced by the identify stage; later stages
/// treat it as read-only.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Vehicle {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub make: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trim: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mileage: Option<u32>,
}

impl Vehicle {
    /// A vehicle is resolved when it carries a valid VIN or the full
    /// year/make/model tuple.
    pub fn is_resolved(&self) -> bool {
        if self.vin.as_deref().map(is_valid_vin).unwrap_or(false) {
            return true;
        }
        self.year.is_some() && self.make.is_some() && self.model.is_some()
    }

    pub fn description(&self) -> String {
        let mut out = String::new();
        if let Some(year) = self.year {
            out.push_str(&year.to_string());
        }
        for part in [&self.make, &self.model, &self.trim, &self.engine] {
            if let Some(part) = part {
                if !out.is_empty() {
                    out.push(' ');
                }
                out.push_str(part);
            }
        }
        if out.is_empty() {
            if let Some(vin) = &self.vin {
                out = format!("VIN {vin}");
            } else {
                out = "unknown vehicle".to_string();
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dtc_accepts_standard_codes() {
        for raw in ["P0420", "p0300", " C1234 ", "U0100", "B1342"] {
            assert!(Dtc::parse(raw).is_some(), "{raw} should parse");
        }
        assert_eq!(Dtc::parse("p0300").unwrap().as_str(), "P0300");
    }

    #[test]
    fn dtc_rejects_malformed_codes() {
        for raw in ["X0420", "P042", "P04201", "P04A0", "", "0420"] {
            assert!(Dtc::parse(raw).is_none(), "{raw} should not parse");
        }
    }

    #[test]
    fn vin_validation_excludes_ioq() {
        assert!(is_valid_vin("1HGBH41JXMN109186"));
        assert!(!is_valid_vin("1HGBH41JXMN10918"));
        assert!(!is_valid_vin("1HGBH41JXMN10918O"));
    }

    #[test]
    fn vehicle_resolution_needs_vin_or_tuple() {
        let by_vin = Vehicle {
            vin: Some("1HGBH41JXMN109186".to_string()),
            ..Default::default()
        };
        assert!(by_vin.is_resolved());

        let by_tuple = Vehicle {
            year: Some(2019),
            make: Some("Honda".to_string()),
            model: Some("Civic".to_string()),
            ..Default::default()
        };
        assert!(by_tuple.is_resolved());

        let partial = Vehicle {
            make: Some("Honda".to_string()),
            ..Default::default()
        };
        assert!(!partial.is_resolved());
    }
}
