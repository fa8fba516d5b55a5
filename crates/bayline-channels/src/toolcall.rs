//! LLM tool-call translation.
//!
//! The gateway's model emits tool calls as JSON; this module maps them onto
//! orchestrator operations. Unknown tools and malformed arguments are
//! reported back as errors, never guessed at.

use serde::Deserialize;
use serde_json::Value;

use bayline_types::{CustomerHints, Dtc, Request, VehicleHints};

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct EstimateArgs {
    #[serde(default)]
    pub vin: Option<String>,
    #[serde(default)]
    pub year: Option<u16>,
    #[serde(default)]
    pub make: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub engine: Option<String>,
    #[serde(default)]
    pub mileage: Option<u32>,
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub dtc_codes: Vec<String>,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub customer_phone: Option<String>,
    #[serde(default)]
    pub pdf: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    RunEstimate(Box<EstimateArgs>),
    OrderParts { shop_override: bool },
    CustomerApproved { shop_override: bool },
    GetStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolCallError {
    UnknownTool(String),
    BadArguments(String),
}

impl std::fmt::Display for ToolCallError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownTool(name) => write!(f, "unknown tool `{name}`"),
            Self::BadArguments(detail) => write!(f, "bad tool arguments: {detail}"),
        }
    }
}

pub fn parse_tool_call(value: &Value) -> Result<ToolCall, ToolCallError> {
    let tool = value["tool"]
        .as_str()
        .ok_or_else(|| ToolCallError::BadArguments("missing `tool` field".to_string()))?;
    let args = value.get("args").cloned().unwrap_or(Value::Null);

    match tool {
        "run_estimate" => {
            let parsed: EstimateArgs = serde_json::from_value(args)
                .map_err(|e| ToolCallError::BadArguments(e.to_string()))?;
            if parsed.query.trim().is_empty() {
                return Err(ToolCallError::BadArguments("query must not be empty".to_string()));
            }
            Ok(ToolCall::RunEstimate(Box::new(parsed)))
        }
        "order_parts" => Ok(ToolCall::OrderParts {
            shop_override: args["shop_override"].as_bool().unwrap_or(false),
        }),
        "customer_approved" => Ok(ToolCall::CustomerApproved {
            shop_override: args["shop_override"].as_bool().unwrap_or(false),
        }),
        "get_status" => Ok(ToolCall::GetStatus),
        other => Err(ToolCallError::UnknownTool(other.to_string())),
    }
}

/// Builds the orchestrator request for one chat. DTC strings that don't
/// parse are dropped; the classifier re-scans the query text anyway.
pub fn build_request(chat_id: &str, shop_id: Option<&str>, args: &EstimateArgs) -> Request {
    let hints = VehicleHints {
        vin: args.vin.clone(),
        year: args.year,
        make: args.make.clone(),
        model: args.model.clone(),
        engine: args.engine.clone(),
        mileage: args.mileage,
    };
    let mut request = Request::new(chat_id, args.query.clone()).with_hints(hints);
    request.shop_id = shop_id.map(str::to_string);
    request.dtc_codes = args
        .dtc_codes
        .iter()
        .filter_map(|raw| Dtc::parse(raw))
        .collect();
    request.pdf_requested = args.pdf;
    request = request.with_customer(CustomerHints {
        name: args.customer_name.clone(),
        phone: args.customer_phone.clone(),
    });
    request
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn run_estimate_round_trips_vehicle_hints() {
        let call = parse_tool_call(&json!({
            "tool": "run_estimate",
            "args": {
                "year": 2019, "make": "Honda", "model": "Civic",
                "engine": "2.0L", "query": "P0420",
                "customer_name": "Jane Doe"
            }
        }))
        .unwrap();
        let ToolCall::RunEstimate(args) = call else {
            panic!("expected run_estimate");
        };
        let request = build_request("chat-1", Some("shop-9"), &args);
        assert_eq!(request.vehicle_hints.make.as_deref(), Some("Honda"));
        assert_eq!(request.shop_id.as_deref(), Some("shop-9"));
        assert_eq!(request.customer.as_ref().unwrap().name.as_deref(), Some("Jane Doe"));
    }

    #[test]
    fn empty_query_is_rejected() {
        let out = parse_tool_call(&json!({"tool": "run_estimate", "args": {"query": "  "}}));
        assert!(matches!(out, Err(ToolCallError::BadArguments(_))));
    }

    #[test]
    fn unknown_tool_is_reported() {
        let out = parse_tool_call(&json!({"tool": "reboot_shop"}));
        assert_eq!(out, Err(ToolCallError::UnknownTool("reboot_shop".to_string())));
    }

    #[test]
    fn malformed_dtcs_are_dropped() {
        let args = EstimateArgs {
            query: "misfire".to_string(),
            dtc_codes: vec!["P0300".to_string(), "garbage".to_string()],
            ..Default::default()
        };
        let request = build_request("chat-1", None, &args);
        assert_eq!(request.dtc_codes.len(), 1);
    }
}
