//! Research adapters.
//!
//! ProDemand and AllData ride the shared browser; Identifix Direct-Hit is a
//! plain JSON API. Each adapter normalizes whatever subset it gets into a
//! `ResearchFragment` and reports `PLATFORM_DOWN`/`PARSE_ERROR` rather than
//! guessing at a changed page: the pipeline degrades to "source
//! unavailable" and moves on.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::debug;

use bayline_types::{Diagnosis, Dtc, LaborSource, LaborSpec, ResearchFragment, Vehicle};
use bayline_types::{ExternalRef, SourceError};

use crate::api::JsonApiClient;
use crate::browser::BrowserDriver;
use crate::ports::{Research, SourceContext};

/// Expression each vendor page exposes its loaded repair data through. The
/// sites render from a client-side store; reading it wholesale keeps us
/// independent of their DOM.
const APP_STATE_EXPR: &str =
    "JSON.parse(JSON.stringify(window.__APP_STATE__ ?? window.__INITIAL_STATE__ ?? null))";

// ---------------------------------------------------------------------------
// ProDemand (browser)
// ---------------------------------------------------------------------------

pub struct ProdemandResearch {
    driver: Arc<BrowserDriver>,
    base_url: String,
}

impl ProdemandResearch {
    pub fn new(driver: Arc<BrowserDriver>, base_url: impl Into<String>) -> Self {
        Self {
            driver,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl Research for ProdemandResearch {
    fn platform(&self) -> &'static str {
        "prodemand"
    }

    fn requires_browser(&self) -> bool {
        true
    }

    async fn search(
        &self,
        ctx: &SourceContext,
        vehicle: &Vehicle,
        query: &str,
        dtcs: &[Dtc],
    ) -> Result<ResearchFragment, SourceError> {
        let term = search_term(query, dtcs);
        let url = format!(
            "{}/search?vehicle={}&q={}",
            self.base_url,
            urlencode(&vehicle.description()),
            urlencode(&term)
        );

        let mut session = self.driver.open(ctx, self.platform(), &url).await?;
        let out = async {
            session.navigate(ctx, &url).await?;
            let shot = session.screenshot(ctx, "prodemand").await.ok();
            let state = session.evaluate(ctx, APP_STATE_EXPR).await?;
            let mut fragment = parse_prodemand(&state)?;
            fragment.screenshots.extend(shot);
            Ok(fragment)
        }
        .await;
        session.close().await;
        out
    }
}

/// ProDemand's store keys repair content under `repairInfo`.
pub fn parse_prodemand(state: &Value) -> Result<ResearchFragment, SourceError> {
    let info = state
        .get("repairInfo")
        .ok_or_else(|| SourceError::parse("prodemand state missing repairInfo"))?;

    let mut fragment = ResearchFragment::for_source("prodemand");
    if let Some(fixes) = info["probableCauses"].as_array() {
        for fix in fixes {
            let Some(cause) = fix["description"].as_str() else {
                continue;
            };
            let mut diagnosis =
                Diagnosis::new(cause, fix["likelihood"].as_f64().unwrap_or(0.4).clamp(0.0, 1.0));
            diagnosis.parts = string_list(&fix["parts"]);
            fragment.fixes.push(diagnosis);
        }
    }
    fragment.procedures = string_list(&info["procedures"]);
    if let Some(specs) = info["torqueSpecs"].as_object() {
        fragment.torque_specs = specs
            .iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
            .collect::<BTreeMap<_, _>>();
    }
    if let Some(hours) = info["laborTimes"]["total"].as_f64() {
        if hours > 0.0 {
            fragment.labor = Some(LaborSpec {
                hours,
                source: LaborSource::Prodemand,
                category: info["laborTimes"]["category"].as_str().map(str::to_string),
                lift_required: info["laborTimes"]["lift"].as_bool().unwrap_or(false),
                notes: None,
            });
        }
    }
    fragment.tools = string_list(&info["tools"]);
    Ok(fragment)
}

// ---------------------------------------------------------------------------
// AllData (browser)
// ---------------------------------------------------------------------------

pub struct AlldataResearch {
    driver: Arc<BrowserDriver>,
    base_url: String,
}

impl AlldataResearch {
    pub fn new(driver: Arc<BrowserDriver>, base_url: impl Into<String>) -> Self {
        Self {
            driver,
            base_url: base_url.into(),
        }
    }
}

#[async_trait]
impl Research for AlldataResearch {
    fn platform(&self) -> &'static str {
        "alldata"
    }

    fn requires_browser(&self) -> bool {
        true
    }

    async fn search(
        &self,
        ctx: &SourceContext,
        vehicle: &Vehicle,
        query: &str,
        dtcs: &[Dtc],
    ) -> Result<ResearchFragment, SourceError> {
        let term = search_term(query, dtcs);
        let url = format!(
            "{}/repair?v={}&search={}",
            self.base_url,
            urlencode(&vehicle.description()),
            urlencode(&term)
        );

        let mut session = self.driver.open(ctx, self.platform(), &url).await?;
        let out = async {
            session.navigate(ctx, &url).await?;
            let state = session.evaluate(ctx, APP_STATE_EXPR).await?;
            parse_alldata(&state)
        }
        .await;
        session.close().await;
        out
    }
}

/// AllData nests articles under `articles`; TSBs ride along.
pub fn parse_alldata(state: &Value) -> Result<ResearchFragment, SourceError> {
    let articles = state
        .get("articles")
        .and_then(Value::as_array)
        .ok_or_else(|| SourceError::parse("alldata state missing articles"))?;

    let mut fragment = ResearchFragment::for_source("alldata");
    for article in articles {
        match article["kind"].as_str() {
            Some("procedure") => {
                if let Some(title) = article["title"].as_str() {
                    fragment.procedures.push(title.to_string());
                }
                if let Some(specs) = article["torque"].as_object() {
                    for (component, spec) in specs {
                        if let Some(spec) = spec.as_str() {
                            fragment
                                .torque_specs
                                .insert(component.clone(), spec.to_string());
                        }
                    }
                }
            }
            Some("tsb") => {
                if let (Some(id), Some(title)) =
                    (article["number"].as_str(), article["title"].as_str())
                {
                    fragment.tsbs.push(ExternalRef {
                        id: id.to_string(),
                        title: title.to_string(),
                        url: article["url"].as_str().map(str::to_string),
                    });
                }
            }
            _ => {}
        }
    }
    if let Some(hours) = state["laborHours"].as_f64() {
        if hours > 0.0 {
            fragment.labor = Some(LaborSpec {
                hours,
                source: LaborSource::Alldata,
                category: None,
                lift_required: false,
                notes: None,
            });
        }
    }
    Ok(fragment)
}

// ---------------------------------------------------------------------------
// Identifix Direct-Hit (API)
// ---------------------------------------------------------------------------

pub struct IdentifixResearch {
    client: JsonApiClient,
}

impl IdentifixResearch {
    pub fn new(client: JsonApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Research for IdentifixResearch {
    fn platform(&self) -> &'static str {
        "identifix"
    }

    fn requires_browser(&self) -> bool {
        false
    }

    async fn search(
        &self,
        ctx: &SourceContext,
        vehicle: &Vehicle,
        query: &str,
        dtcs: &[Dtc],
    ) -> Result<ResearchFragment, SourceError> {
        let body = json!({
            "vehicle": {
                "year": vehicle.year,
                "make": vehicle.make,
                "model": vehicle.model,
                "engine": vehicle.engine,
            },
            "query": search_term(query, dtcs),
            "codes": dtcs.iter().map(Dtc::as_str).collect::<Vec<_>>(),
        });
        let response: Value = self.client.post_json(ctx, "/v1/fixes/search", body).await?;
        let fragment = parse_identifix(&response)?;
        debug!(
            target: "bayline.research",
            platform = "identifix",
            fixes = fragment.fixes.len(),
            "direct-hit search complete"
        );
        Ok(fragment)
    }
}

/// Direct-Hit returns community-confirmed fixes with success percentages.
pub fn parse_identifix(response: &Value) -> Result<ResearchFragment, SourceError> {
    let fixes = response
        .get("fixes")
        .and_then(Value::as_array)
        .ok_or_else(|| SourceError::parse("identifix response missing fixes"))?;

    let mut fragment = ResearchFragment::for_source("identifix");
    for fix in fixes {
        let Some(cause) = fix["title"].as_str() else {
            continue;
        };
        let success_rate = fix["successPercent"]
            .as_f64()
            .map(|p| (p / 100.0).clamp(0.0, 1.0));
        let mut diagnosis = Diagnosis::new(cause, success_rate.unwrap_or(0.5));
        diagnosis.success_rate = success_rate;
        diagnosis.parts = string_list(&fix["parts"]);
        fragment.fixes.push(diagnosis);
    }
    Ok(fragment)
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn search_term(query: &str, dtcs: &[Dtc]) -> String {
    if let Some(code) = dtcs.first() {
        code.as_str().to_string()
    } else {
        query.to_string()
    }
}

fn string_list(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn urlencode(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b' ' => out.push('+'),
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}
