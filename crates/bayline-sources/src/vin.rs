//! VIN decoding against the public vPIC service.

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use bayline_types::{is_valid_vin, SourceError, Vehicle};

use crate::api::classify_reqwest;
use crate::ports::{SourceContext, VinDecode};

pub const DEFAULT_VPIC_URL: &str = "https://vpic.nhtsa.dot.gov/api/vehicles";

pub struct VpicDecoder {
    http: reqwest::Client,
    base_url: String,
}

impl VpicDecoder {
    pub fn new() -> Self {
        Self::with_base_url(DEFAULT_VPIC_URL)
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }
}

impl Default for VpicDecoder {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Deserialize)]
struct VpicResponse {
    #[serde(rename = "Results")]
    results: Vec<VpicRecord>,
}

#[derive(Debug, Default, Deserialize)]
struct VpicRecord {
    #[serde(rename = "ModelYear", default)]
    model_year: String,
    #[serde(rename = "Make", default)]
    make: String,
    #[serde(rename = "Model", default)]
    model: String,
    #[serde(rename = "Trim", default)]
    trim: String,
    #[serde(rename = "DisplacementL", default)]
    displacement_l: String,
    #[serde(rename = "EngineCylinders", default)]
    engine_cylinders: String,
}

#[async_trait]
impl VinDecode for VpicDecoder {
    async fn decode(&self, ctx: &SourceContext, vin: &str) -> Result<Vehicle, SourceError> {
        if !is_valid_vin(vin) {
            return Err(SourceError::VehicleUnresolved);
        }
        let url = format!("{}/DecodeVinValues/{}?format=json", self.base_url, vin.trim());

        let decoded: VpicResponse = ctx
            .deadline
            .run(async {
                let response = self
                    .http
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| classify_reqwest("vin-decode", e))?;
                let status = response.status();
                if status.is_server_error() {
                    return Err(SourceError::Transient5xx {
                        status: status.as_u16(),
                    });
                }
                if !status.is_success() {
                    return Err(SourceError::platform_down("vin-decode"));
                }
                response
                    .json()
                    .await
                    .map_err(|e| SourceError::parse(e.to_string()))
            })
            .await?;

        let record = decoded.results.into_iter().next().unwrap_or_default();
        if record.make.trim().is_empty() || record.model.trim().is_empty() {
            return Err(SourceError::NotFound);
        }

        let engine = match (
            record.displacement_l.trim(),
            record.engine_cylinders.trim(),
        ) {
            ("", "") => None,
            (disp, "") => Some(format!("{disp}L")),
            ("", cyl) => Some(format!("{cyl}-cyl")),
            (disp, cyl) => Some(format!("{disp}L {cyl}-cyl")),
        };

        let vehicle = Vehicle {
            vin: Some(vin.trim().to_ascii_uppercase()),
            year: record.model_year.trim().parse().ok(),
            make: non_empty(record.make),
            model: non_empty(record.model),
            trim: non_empty(record.trim),
            engine,
            mileage: None,
        };
        debug!(target: "bayline.vin", vehicle = %vehicle.description(), "vin decoded");
        Ok(vehicle)
    }
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
