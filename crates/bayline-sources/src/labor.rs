//! Labor-hours lookup.
//!
//! MOTOR is the book-time source of record. Successful lookups are cached
//! in-process; cache hits re-tag as `labor_cache` so merge precedence keeps
//! a fresh MOTOR answer ahead of a cached one.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::debug;

use bayline_types::{LaborResult, LaborSource, SourceError, Vehicle};

use crate::api::JsonApiClient;
use crate::ports::{LaborLookup, SourceContext};

pub struct MotorLabor {
    client: JsonApiClient,
}

impl MotorLabor {
    pub fn new(client: JsonApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LaborLookup for MotorLabor {
    fn source(&self) -> LaborSource {
        LaborSource::Motor
    }

    async fn hours(
        &self,
        ctx: &SourceContext,
        vehicle: &Vehicle,
        procedure: &str,
    ) -> Result<LaborResult, SourceError> {
        let path = format!(
            "/v1/labor?year={}&make={}&model={}&operation={}",
            vehicle.year.unwrap_or(0),
            vehicle.make.as_deref().unwrap_or(""),
            vehicle.model.as_deref().unwrap_or(""),
            procedure.replace(' ', "+"),
        );
        let response: Value = self.client.get_json(ctx, &path).await?;

        let hours = response["hours"].as_f64().unwrap_or(0.0);
        if hours <= 0.0 {
            return Err(SourceError::NotFound);
        }
        Ok(LaborResult {
            hours,
            source: LaborSource::Motor,
            operation: response["operation"]
                .as_str()
                .unwrap_or(procedure)
                .to_string(),
            confidence: response["confidence"].as_f64().unwrap_or(0.9),
            reason_code: None,
        })
    }
}

/// Decorator that remembers successful lookups per (vehicle, procedure).
/// Hits are re-tagged `labor_cache`.
pub struct CachingLabor<L> {
    inner: Arc<L>,
    cache: Mutex<HashMap<String, LaborResult>>,
}

impl<L: LaborLookup> CachingLabor<L> {
    pub fn new(inner: Arc<L>) -> Self {
        Self {
            inner,
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn key(vehicle: &Vehicle, procedure: &str) -> String {
        format!(
            "{}|{}|{}|{}",
            vehicle.year.unwrap_or(0),
            vehicle.make.as_deref().unwrap_or(""),
            vehicle.model.as_deref().unwrap_or(""),
            procedure.to_ascii_lowercase()
        )
    }
}

#[async_trait]
impl<L: LaborLookup> LaborLookup for CachingLabor<L> {
    fn source(&self) -> LaborSource {
        self.inner.source()
    }

    async fn hours(
        &self,
        ctx: &SourceContext,
        vehicle: &Vehicle,
        procedure: &str,
    ) -> Result<LaborResult, SourceError> {
        let key = Self::key(vehicle, procedure);
        if let Some(hit) = self.cache.lock().get(&key).cloned() {
            debug!(target: "bayline.labor", procedure, "labor cache hit");
            return Ok(LaborResult {
                source: LaborSource::LaborCache,
                ..hit
            });
        }
        let result = self.inner.hours(ctx, vehicle, procedure).await?;
        self.cache.lock().insert(key, result.clone());
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bayline_core::deadline::RunDeadline;
    use bayline_observability::RunLogger;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct FixedLabor {
        calls: AtomicU32,
    }

    #[async_trait]
    impl LaborLookup for FixedLabor {
        fn source(&self) -> LaborSource {
            LaborSource::Motor
        }

        async fn hours(
            &self,
            _ctx: &SourceContext,
            _vehicle: &Vehicle,
            procedure: &str,
        ) -> Result<LaborResult, SourceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(LaborResult {
                hours: 1.2,
                source: LaborSource::Motor,
                operation: procedure.to_string(),
                confidence: 0.9,
                reason_code: None,
            })
        }
    }

    fn ctx() -> SourceContext {
        SourceContext::new(
            "run-1",
            RunDeadline::new(Duration::from_secs(5)),
            RunLogger::new("test", "run-1"),
        )
    }

    #[tokio::test]
    async fn second_lookup_hits_cache_with_downgraded_tag() {
        let inner = Arc::new(FixedLabor {
            calls: AtomicU32::new(0),
        });
        let caching = CachingLabor::new(inner.clone());
        let vehicle = Vehicle {
            year: Some(2019),
            make: Some("Honda".to_string()),
            model: Some("Civic".to_string()),
            ..Default::default()
        };

        let first = caching
            .hours(&ctx(), &vehicle, "replace oxygen sensor")
            .await
            .unwrap();
        assert_eq!(first.source, LaborSource::Motor);

        let second = caching
            .hours(&ctx(), &vehicle, "Replace Oxygen Sensor")
            .await
            .unwrap();
        assert_eq!(second.source, LaborSource::LaborCache);
        assert_eq!(second.hours, 1.2);
        assert_eq!(inner.calls.load(Ordering::SeqCst), 1);
    }
}
