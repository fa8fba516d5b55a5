use serde::{Deserialize, Serialize};

use crate::progress::ProgressSink;
use crate::vehicle::Dtc;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct VehicleHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vin: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub make: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mileage: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CustomerHints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

impl CustomerHints {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.phone.is_none()
    }
}

/// One identified unit of pipeline work. Immutable after creation; the
/// orchestrator owns it exclusively.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub run_id: String,
    pub chat_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shop_id: Option<String>,
    #[serde(default)]
    pub vehicle_hints: VehicleHints,
    pub query: String,
    #[serde(default)]
    pub dtc_codes: Vec<Dtc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer: Option<CustomerHints>,
    /// Render the customer PDF when the run passes the pricing gate.
    #[serde(default)]
    pub pdf_requested: bool,
    #[serde(skip)]
    pub progress: Option<ProgressSink>,
}

impl Request {
    pub fn new(chat_id: impl Into<String>, query: impl Into<String>) -> Self {
        Self {
            run_id: uuid::Uuid::new_v4().to_string(),
            chat_id: chat_id.into(),
            shop_id: None,
            vehicle_hints: VehicleHints::default(),
            query: query.into(),
            dtc_codes: Vec::new(),
            customer: None,
            pdf_requested: false,
            progress: None,
        }
    }

    pub fn with_hints(mut self, hints: VehicleHints) -> Self {
        self.vehicle_hints = hints;
        self
    }

    pub fn with_customer(mut self, customer: CustomerHints) -> Self {
        if !customer.is_empty() {
            self.customer = Some(customer);
        }
        self
    }

    pub fn with_progress(mut self, sink: ProgressSink) -> Self {
        self.progress = Some(sink);
        self
    }
}
