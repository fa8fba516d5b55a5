use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Closed set of user-visible pipeline phases, relayed to the chat channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    LoggingIn,
    CreatingCustomer,
    AddingParts,
    AddingLabor,
    LinkingParts,
    GeneratingPdf,
    Done,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::LoggingIn => "logging_in",
            Phase::CreatingCustomer => "creating_customer",
            Phase::AddingParts => "adding_parts",
            Phase::AddingLabor => "adding_labor",
            Phase::LinkingParts => "linking_parts",
            Phase::GeneratingPdf => "generating_pdf",
            Phase::Done => "done",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub run_id: String,
    pub phase: Phase,
    pub at: DateTime<Utc>,
}

impl ProgressEvent {
    pub fn now(run_id: impl Into<String>, phase: Phase) -> Self {
        Self {
            run_id: run_id.into(),
            phase,
            at: Utc::now(),
        }
    }
}

/// Fire-and-forget sink for progress events. Senders never block the
/// pipeline; a full channel drops the event.
pub type ProgressSink = tokio::sync::mpsc::Sender<ProgressEvent>;
