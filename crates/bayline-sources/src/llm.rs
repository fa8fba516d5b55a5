//! LLM diagnosis supplement.
//!
//! One-shot structured call used when the knowledge base misses or comes
//! back under the confidence threshold. The conversational tool-calling
//! loop lives in the chat gateway, not here.

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use bayline_types::{Diagnosis, Dtc, SourceError, Vehicle};

use crate::api::classify_reqwest;
use crate::ports::{Reasoner, SourceContext};

pub const DEFAULT_ANTHROPIC_URL: &str = "https://api.anthropic.com";
const MODEL: &str = "claude-sonnet-4-20250514";

pub struct ClaudeReasoner {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl ClaudeReasoner {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, DEFAULT_ANTHROPIC_URL)
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl Reasoner for ClaudeReasoner {
    async fn diagnose(
        &self,
        ctx: &SourceContext,
        vehicle: &Vehicle,
        query: &str,
        dtcs: &[Dtc],
    ) -> Result<Vec<Diagnosis>, SourceError> {
        let codes: Vec<&str> = dtcs.iter().map(Dtc::as_str).collect();
        let prompt = format!(
            "Vehicle: {}. Complaint: {}. Trouble codes: {}.\n\
             List the most likely causes as JSON: \
             [{{\"cause\": str, \"confidence\": 0..1, \"parts\": [str]}}] — JSON only.",
            vehicle.description(),
            query,
            if codes.is_empty() {
                "none".to_string()
            } else {
                codes.join(", ")
            }
        );

        let body = json!({
            "model": MODEL,
            "max_tokens": 1024,
            "messages": [{ "role": "user", "content": prompt }],
        });

        let response: Value = ctx
            .deadline
            .run(async {
                let response = self
                    .http
                    .post(format!("{}/v1/messages", self.base_url))
                    .header("x-api-key", &self.api_key)
                    .header("anthropic-version", "2023-06-01")
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| classify_reqwest("llm", e))?;
                let status = response.status();
                if status.as_u16() == 401 {
                    return Err(SourceError::auth_failed("llm"));
                }
                if status.is_server_error() || status.as_u16() == 429 {
                    return Err(SourceError::Transient5xx {
                        status: status.as_u16(),
                    });
                }
                if !status.is_success() {
                    return Err(SourceError::platform_down("llm"));
                }
                response
                    .json()
                    .await
                    .map_err(|e| SourceError::parse(e.to_string()))
            })
            .await?;

        let text = response["content"][0]["text"]
            .as_str()
            .ok_or_else(|| SourceError::parse("llm response missing text"))?;
        let diagnoses = parse_diagnosis_json(text)?;
        debug!(target: "bayline.llm", causes = diagnoses.len(), "llm diagnosis");
        Ok(diagnoses)
    }
}

/// Parses the model's JSON array, tolerating surrounding prose and fences.
pub fn parse_diagnosis_json(text: &str) -> Result<Vec<Diagnosis>, SourceError> {
    let start = text.find('[').ok_or_else(|| SourceError::parse("no JSON array in reply"))?;
    let end = text.rfind(']').ok_or_else(|| SourceError::parse("no JSON array in reply"))?;
    let parsed: Vec<Value> = serde_json::from_str(&text[start..=end])
        .map_err(|e| SourceError::parse(e.to_string()))?;

    let mut diagnoses = Vec::new();
    for entry in parsed {
        let Some(cause) = entry["cause"].as_str() else {
            continue;
        };
        let mut diagnosis =
            Diagnosis::new(cause, entry["confidence"].as_f64().unwrap_or(0.3).clamp(0.0, 1.0));
        if let Some(parts) = entry["parts"].as_array() {
            diagnosis.parts = parts
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
        }
        diagnoses.push(diagnosis);
    }
    if diagnoses.is_empty() {
        return Err(SourceError::parse("llm reply held no usable causes"));
    }
    Ok(diagnoses)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fenced_reply_parses() {
        let text = "Here you go:\n```json\n[{\"cause\": \"vacuum leak\", \"confidence\": 0.6, \
                    \"parts\": [\"intake gasket\"]}]\n```";
        let out = parse_diagnosis_json(text).unwrap();
        assert_eq!(out[0].cause, "vacuum leak");
        assert_eq!(out[0].parts, vec!["intake gasket"]);
    }

    #[test]
    fn prose_only_reply_is_a_parse_error() {
        assert!(parse_diagnosis_json("I think it's the coil.").is_err());
    }
}
