use serde::{Deserialize, Serialize};

/// One part the repair needs, before pricing. `search_terms` is never empty;
/// the first entry is the canonical vendor search string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartRequest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<String>,
    pub qty: u32,
    #[serde(default)]
    pub oem_preferred: bool,
    pub search_terms: Vec<String>,
    #[serde(default)]
    pub conditional: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

impl PartRequest {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            search_terms: vec![name.clone()],
            name,
            position: None,
            qty: 1,
            oem_preferred: false,
            conditional: false,
            condition: None,
        }
    }

    pub fn with_qty(mut self, qty: u32) -> Self {
        self.qty = qty.max(1);
        self
    }

    pub fn with_position(mut self, position: impl Into<String>) -> Self {
        self.position = Some(position.into());
        self
    }

    pub fn canonical_term(&self) -> &str {
        self.search_terms.first().map(String::as_str).unwrap_or(&self.name)
    }
}

/// A priced quote for one `PartRequest`. `unit_price` is `None` when the
/// vendor reported "N/A"/"Call"/zero; it is never zero or negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartQuote {
    pub brand: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub part_number: Option<String>,
    pub supplier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_price: Option<f64>,
    #[serde(default)]
    pub availability: String,
    #[serde(default)]
    pub in_stock: bool,
    /// Source tag of the pricing adapter that produced the quote.
    pub source: String,
}

/// Why a part came back without a usable quote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuoteMiss {
    NoPrice,
    NotFound,
    SourceFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartSelection {
    pub request: PartRequest,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quote: Option<PartQuote>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub miss: Option<QuoteMiss>,
}

/// Best-value selection across every quoted part.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartsBundle {
    pub selections: Vec<PartSelection>,
    /// Wholesale cost of the selected quotes.
    pub parts_cost: f64,
    pub suppliers: Vec<String>,
    pub all_in_stock: bool,
    #[serde(default)]
    pub oem_alternatives: Vec<PartQuote>,
}

impl PartsBundle {
    pub fn is_empty(&self) -> bool {
        self.selections.is_empty()
    }

    pub fn quoted_count(&self) -> usize {
        self.selections.iter().filter(|s| s.quote.is_some()).count()
    }
}

/// Labor hours with provenance, as returned by a `LaborLookup` adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaborResult {
    pub hours: f64,
    pub source: crate::plan::LaborSource,
    pub operation: String,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_code: Option<String>,
}
