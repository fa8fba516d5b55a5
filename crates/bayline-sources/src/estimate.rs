//! AutoLeap estimate sink.
//!
//! Creating an estimate is the one write with durable side effects in the
//! pipeline, so `create` is idempotent on `(chat_id, run_id)`: replays
//! return the recorded receipt without a second vendor call.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::info;

use bayline_types::SourceError;

use crate::api::JsonApiClient;
use crate::ports::{EstimateDraft, EstimateReceipt, EstimateSink, SourceContext};
use crate::price::normalize_price_value;

pub struct AutoleapSink {
    client: JsonApiClient,
    created: Mutex<HashMap<(String, String), EstimateReceipt>>,
}

impl AutoleapSink {
    pub fn new(client: JsonApiClient) -> Self {
        Self {
            client,
            created: Mutex::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl EstimateSink for AutoleapSink {
    fn platform(&self) -> &'static str {
        "autoleap"
    }

    async fn create(
        &self,
        ctx: &SourceContext,
        draft: &EstimateDraft,
    ) -> Result<EstimateReceipt, SourceError> {
        let key = (draft.chat_id.clone(), draft.run_id.clone());
        if let Some(receipt) = self.created.lock().get(&key).cloned() {
            return Ok(receipt);
        }

        let parts: Vec<Value> = draft
            .parts
            .selections
            .iter()
            .filter_map(|s| s.quote.as_ref().map(|q| (s, q)))
            .map(|(s, q)| {
                json!({
                    "name": s.request.name,
                    "qty": s.request.qty,
                    "brand": q.brand,
                    "partNumber": q.part_number,
                    "unitCost": q.unit_price,
                })
            })
            .collect();

        let body = json!({
            "externalReference": draft.run_id,
            "customer": { "name": draft.customer.name, "phone": draft.customer.phone },
            "vehicle": {
                "vin": draft.vehicle.vin,
                "year": draft.vehicle.year,
                "make": draft.vehicle.make,
                "model": draft.vehicle.model,
            },
            "diagnosis": draft.diagnosis,
            "laborHours": draft.labor.as_ref().map(|l| l.hours),
            "laborTotal": draft.labor_total,
            "parts": parts,
        });

        let response: Value = self.client.post_json(ctx, "/v1/estimates", body).await?;
        let estimate_id = response["id"]
            .as_str()
            .ok_or_else(|| SourceError::parse("estimate id missing"))?
            .to_string();

        let receipt = EstimateReceipt {
            estimate_id: estimate_id.clone(),
            estimate_code: response["code"].as_str().unwrap_or(&estimate_id).to_string(),
            total: response["total"].as_f64().unwrap_or(0.0),
            source_tag: "autoleap".to_string(),
            parts_retail_total: normalize_price_value(response["partsRetailTotal"].as_f64()),
        };
        info!(
            target: "bayline.estimate",
            estimate_id = %receipt.estimate_id,
            total = receipt.total,
            "estimate created"
        );
        self.created.lock().insert(key, receipt.clone());
        Ok(receipt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bayline_types::{CustomerHints, PartsBundle, Vehicle};

    #[tokio::test]
    async fn replay_key_is_chat_and_run_scoped() {
        let sink = AutoleapSink::new(JsonApiClient::new("autoleap", "http://127.0.0.1:1"));
        let receipt = EstimateReceipt {
            estimate_id: "est-1".to_string(),
            estimate_code: "E-1001".to_string(),
            total: 250.0,
            source_tag: "autoleap".to_string(),
            parts_retail_total: Some(90.30),
        };
        sink.created
            .lock()
            .insert(("chat-1".to_string(), "run-1".to_string()), receipt.clone());

        let draft = EstimateDraft {
            chat_id: "chat-1".to_string(),
            run_id: "run-1".to_string(),
            customer: CustomerHints::default(),
            vehicle: Vehicle::default(),
            parts: PartsBundle::default(),
            labor: None,
            diagnosis: "test".to_string(),
            labor_total: 0.0,
        };

        // The cached receipt short-circuits before any network use.
        let ctx = crate::ports::SourceContext::new(
            "run-1",
            bayline_core::deadline::RunDeadline::new(std::time::Duration::from_secs(1)),
            bayline_observability::RunLogger::new("test", "run-1"),
        );
        let out = sink.create(&ctx, &draft).await;
        assert_eq!(out.unwrap(), receipt);
    }
}
