//! Knowledge-base and repair-history adapters.
//!
//! The vector store itself lives behind an HTTP service; we only speak its
//! lookup interface.

use async_trait::async_trait;
use serde_json::{json, Value};

use bayline_types::{Diagnosis, Dtc, PartRequest, SourceError, Vehicle};

use crate::api::JsonApiClient;
use crate::ports::{HistorySignal, KbAnswer, Knowledge, RepairHistory, SourceContext};

pub struct HttpKnowledge {
    client: JsonApiClient,
}

impl HttpKnowledge {
    pub fn new(client: JsonApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Knowledge for HttpKnowledge {
    async fn lookup(
        &self,
        ctx: &SourceContext,
        vehicle: &Vehicle,
        query: &str,
        dtcs: &[Dtc],
    ) -> Result<KbAnswer, SourceError> {
        let body = json!({
            "vehicle": {
                "year": vehicle.year,
                "make": vehicle.make,
                "model": vehicle.model,
                "engine": vehicle.engine,
            },
            "query": query,
            "codes": dtcs.iter().map(Dtc::as_str).collect::<Vec<_>>(),
        });
        let response: Value = self.client.post_json(ctx, "/v1/lookup", body).await?;
        parse_kb_answer(&response)
    }
}

pub fn parse_kb_answer(response: &Value) -> Result<KbAnswer, SourceError> {
    let matches = response
        .get("matches")
        .and_then(Value::as_array)
        .ok_or_else(|| SourceError::parse("kb response missing matches"))?;

    let mut answer = KbAnswer::default();
    for entry in matches {
        let Some(cause) = entry["cause"].as_str() else {
            continue;
        };
        let confidence = entry["confidence"].as_f64().unwrap_or(0.0).clamp(0.0, 1.0);
        let mut diagnosis = Diagnosis::new(cause, confidence);
        diagnosis.from_knowledge_base = true;
        if let Some(parts) = entry["parts"].as_array() {
            diagnosis.parts = parts
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }
        answer.diagnoses.push(diagnosis);
    }
    answer.confidence = answer
        .diagnoses
        .first()
        .map(|d| d.confidence)
        .unwrap_or(0.0);
    if let Some(parts) = response["parts"].as_array() {
        for part in parts {
            if let Some(name) = part["name"].as_str() {
                let mut request = PartRequest::new(name);
                if let Some(position) = part["position"].as_str() {
                    request = request.with_position(position);
                }
                if let Some(qty) = part["qty"].as_u64() {
                    request = request.with_qty(qty as u32);
                }
                answer.parts.push(request);
            }
        }
    }
    Ok(answer)
}

/// Prior-repair lookup against the same service. The signal is a signed
/// confidence delta, clamped server-side and again here.
pub struct HttpRepairHistory {
    client: JsonApiClient,
}

impl HttpRepairHistory {
    pub fn new(client: JsonApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl RepairHistory for HttpRepairHistory {
    async fn prior_repairs(
        &self,
        ctx: &SourceContext,
        vehicle: &Vehicle,
        shop_id: Option<&str>,
    ) -> Result<HistorySignal, SourceError> {
        let body = json!({
            "vin": vehicle.vin,
            "year": vehicle.year,
            "make": vehicle.make,
            "model": vehicle.model,
            "shopId": shop_id,
        });
        let response: Value = self.client.post_json(ctx, "/v1/history", body).await?;
        let delta = response["confidenceDelta"]
            .as_f64()
            .unwrap_or(0.0)
            .clamp(-0.2, 0.2);
        Ok(HistorySignal {
            delta,
            note: response["note"].as_str().map(str::to_string),
        })
    }
}
