use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::parts::PartRequest;

/// Provenance ranking for labor hours. Merges only ever move labor toward a
/// higher-ranked source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LaborSource {
    #[serde(rename = "MOTOR")]
    Motor,
    #[serde(rename = "shop_default")]
    ShopDefault,
    #[serde(rename = "ari")]
    Ari,
    #[serde(rename = "labor_cache")]
    LaborCache,
    #[serde(rename = "prodemand")]
    Prodemand,
    #[serde(rename = "alldata")]
    Alldata,
    #[serde(rename = "AI_fallback")]
    AiFallback,
    #[serde(rename = "default")]
    Default,
}

impl LaborSource {
    /// Precedence rank, 0 = highest.
    pub fn rank(self) -> u8 {
        match self {
            Self::Motor => 0,
            Self::ShopDefault => 1,
            Self::Ari => 2,
            Self::LaborCache => 3,
            Self::Prodemand => 4,
            Self::Alldata => 5,
            Self::AiFallback => 6,
            Self::Default => 7,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Motor => "MOTOR",
            Self::ShopDefault => "shop_default",
            Self::Ari => "ari",
            Self::LaborCache => "labor_cache",
            Self::Prodemand => "prodemand",
            Self::Alldata => "alldata",
            Self::AiFallback => "AI_fallback",
            Self::Default => "default",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaborSpec {
    pub hours: f64,
    pub source: LaborSource,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(default)]
    pub lift_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// One candidate cause, ordered by rank inside `RepairPlan::diagnoses`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnosis {
    pub cause: String,
    pub confidence: f64,
    #[serde(default)]
    pub primary: bool,
    #[serde(default)]
    pub from_knowledge_base: bool,
    #[serde(default)]
    pub identifix_corroborated: bool,
    #[serde(default)]
    pub history_adjusted: bool,
    /// Community success rate in [0,1], when the source reports one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub success_rate: Option<f64>,
    /// Part names commonly replaced for this cause; feeds parts extraction.
    #[serde(default)]
    pub parts: Vec<String>,
}

impl Diagnosis {
    pub fn new(cause: impl Into<String>, confidence: f64) -> Self {
        Self {
            cause: cause.into(),
            confidence: confidence.clamp(0.0, 1.0),
            primary: false,
            from_knowledge_base: false,
            identifix_corroborated: false,
            history_adjusted: false,
            success_rate: None,
            parts: Vec::new(),
        }
    }
}

/// A torque or tool entry with the platform that contributed it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tagged {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

impl Tagged {
    pub fn new(value: impl Into<String>, platform: Option<&str>) -> Self {
        Self {
            value: value.into(),
            platform: platform.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Verification {
    #[serde(default)]
    pub before_repair: Vec<String>,
    #[serde(default)]
    pub after_repair: Vec<String>,
}

/// TSB or recall reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRef {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticPath {
    KbDirect,
    KbWithClaude,
    ClaudeOnly,
}

/// The canonical repair plan, seeded by the diagnosis stage and refined by
/// every research fragment that merges into it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepairPlan {
    pub primary_cause: String,
    pub confidence: f64,
    #[serde(default)]
    pub diagnoses: Vec<Diagnosis>,
    #[serde(default)]
    pub parts: Vec<PartRequest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labor: Option<LaborSpec>,
    #[serde(default)]
    pub procedures: Vec<String>,
    #[serde(default)]
    pub tools: BTreeMap<String, Tagged>,
    #[serde(default)]
    pub torque_specs: BTreeMap<String, Tagged>,
    #[serde(default)]
    pub verification: Verification,
    #[serde(default)]
    pub diagrams_needed: Vec<String>,
    #[serde(default)]
    pub tsbs: Vec<ExternalRef>,
    #[serde(default)]
    pub recalls: Vec<ExternalRef>,
    #[serde(default)]
    pub low_confidence_warning: bool,
    pub diagnostic_path: DiagnosticPath,
}

impl RepairPlan {
    pub fn new(primary_cause: impl Into<String>, confidence: f64, path: DiagnosticPath) -> Self {
        Self {
            primary_cause: primary_cause.into(),
            confidence: confidence.clamp(0.0, 1.0),
            diagnoses: Vec::new(),
            parts: Vec::new(),
            labor: None,
            procedures: Vec::new(),
            tools: BTreeMap::new(),
            torque_specs: BTreeMap::new(),
            verification: Verification::default(),
            diagrams_needed: Vec::new(),
            tsbs: Vec::new(),
            recalls: Vec::new(),
            low_confidence_warning: false,
            diagnostic_path: path,
        }
    }

    pub fn top_diagnosis(&self) -> Option<&Diagnosis> {
        self.diagnoses.iter().find(|d| d.primary).or_else(|| self.diagnoses.first())
    }
}

/// Partial result returned by one research source. Missing fields are empty,
/// not errors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResearchFragment {
    /// Source tag, e.g. `prodemand`; used by merge precedence.
    pub source: String,
    #[serde(default)]
    pub fixes: Vec<Diagnosis>,
    #[serde(default)]
    pub procedures: Vec<String>,
    #[serde(default)]
    pub torque_specs: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labor: Option<LaborSpec>,
    #[serde(default)]
    pub tools: Vec<String>,
    #[serde(default)]
    pub tsbs: Vec<ExternalRef>,
    #[serde(default)]
    pub screenshots: Vec<PathBuf>,
    /// Honored only while seeding; afterwards fragments may annotate parts
    /// but never replace the list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parts: Option<Vec<PartRequest>>,
    #[serde(default)]
    pub part_hints: Vec<PartHint>,
}

impl ResearchFragment {
    pub fn for_source(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            ..Default::default()
        }
    }
}

/// Annotation a later fragment may add to an already-seeded part.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartHint {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oem_alternative: Option<String>,
}
