//! Parts pricing adapters.
//!
//! PartsTech is the primary vendor, Nexpart the fallback. Both return one
//! quote (or a reasoned miss) per requested part; the best-value selection
//! itself is a pure function shared between them.

use std::collections::HashSet;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::debug;

use bayline_types::{
    PartQuote, PartRequest, PartSelection, PartsBundle, QuoteMiss, SourceError, Vehicle,
};

use crate::api::JsonApiClient;
use crate::ports::{PartsPrice, SourceContext};
use crate::price::{normalize_price, normalize_price_value, round_cents};

/// Picks the best value quote per part and totals the bundle. In-stock
/// quotes beat out-of-stock at any price; ties break on lower unit price.
/// OEM-branded quotes that lost the selection are kept as alternatives.
pub fn select_bundle(requests: &[PartRequest], quotes: Vec<Vec<PartQuote>>) -> PartsBundle {
    let mut bundle = PartsBundle {
        all_in_stock: true,
        ..Default::default()
    };
    let mut suppliers: Vec<String> = Vec::new();

    for (request, mut candidates) in requests.iter().cloned().zip(quotes) {
        candidates.retain(|q| q.unit_price.is_some());
        candidates.sort_by(|a, b| {
            b.in_stock
                .cmp(&a.in_stock)
                .then(partial_price(a).total_cmp(&partial_price(b)))
        });

        if candidates.is_empty() {
            bundle.all_in_stock = false;
            bundle.selections.push(PartSelection {
                request,
                quote: None,
                miss: Some(QuoteMiss::NoPrice),
            });
            continue;
        }

        let quote = candidates.remove(0);
        if let Some(price) = quote.unit_price {
            bundle.parts_cost += price * f64::from(request.qty.max(1));
        }
        if !quote.in_stock {
            bundle.all_in_stock = false;
        }
        if !suppliers.contains(&quote.supplier) {
            suppliers.push(quote.supplier.clone());
        }
        // Losing OEM candidates stay visible for upsell.
        bundle
            .oem_alternatives
            .extend(candidates.into_iter().filter(|q| is_oem_brand(&q.brand)));
        bundle.selections.push(PartSelection {
            request,
            quote: Some(quote),
            miss: None,
        });
    }

    bundle.parts_cost = round_cents(bundle.parts_cost);
    bundle.suppliers = suppliers;
    bundle
}

fn partial_price(quote: &PartQuote) -> f64 {
    quote.unit_price.unwrap_or(f64::MAX)
}

fn is_oem_brand(brand: &str) -> bool {
    matches!(
        brand.to_ascii_lowercase().as_str(),
        "oem" | "genuine" | "motorcraft" | "mopar" | "acdelco"
    )
}

fn quote_from_value(source: &str, item: &Value) -> Option<PartQuote> {
    let unit_price = match &item["price"] {
        Value::String(raw) => normalize_price(raw),
        Value::Number(n) => normalize_price_value(n.as_f64()),
        _ => None,
    };
    Some(PartQuote {
        brand: item["brand"].as_str().unwrap_or("unknown").to_string(),
        part_number: item["partNumber"].as_str().map(str::to_string),
        supplier: item["supplier"].as_str().unwrap_or(source).to_string(),
        unit_price,
        availability: item["availability"].as_str().unwrap_or("").to_string(),
        in_stock: item["inStock"].as_bool().unwrap_or(false),
        source: source.to_string(),
    })
}

// ---------------------------------------------------------------------------
// PartsTech (primary)
// ---------------------------------------------------------------------------

pub struct PartstechPricing {
    client: JsonApiClient,
    staged_runs: Mutex<HashSet<String>>,
    ordered_runs: Mutex<HashSet<String>>,
}

impl PartstechPricing {
    pub fn new(client: JsonApiClient) -> Self {
        Self {
            client,
            staged_runs: Mutex::new(HashSet::new()),
            ordered_runs: Mutex::new(HashSet::new()),
        }
    }

    async fn search_part(
        &self,
        ctx: &SourceContext,
        vehicle: &Vehicle,
        request: &PartRequest,
    ) -> Result<Vec<PartQuote>, SourceError> {
        let body = json!({
            "vehicle": {
                "vin": vehicle.vin,
                "year": vehicle.year,
                "make": vehicle.make,
                "model": vehicle.model,
            },
            "keyword": request.canonical_term(),
            "oemOnly": request.oem_preferred,
        });
        let response: Value = self.client.post_json(ctx, "/catalog/search", body).await?;
        let items = response["results"].as_array().cloned().unwrap_or_default();
        Ok(items
            .iter()
            .filter_map(|item| quote_from_value("partstech", item))
            .collect())
    }
}

#[async_trait]
impl PartsPrice for PartstechPricing {
    fn platform(&self) -> &'static str {
        "partstech"
    }

    async fn price(
        &self,
        ctx: &SourceContext,
        vehicle: &Vehicle,
        parts: &[PartRequest],
    ) -> Result<PartsBundle, SourceError> {
        let mut quotes = Vec::with_capacity(parts.len());
        for request in parts {
            // Misses are per-part data, not adapter failures.
            let part_quotes = match self.search_part(ctx, vehicle, request).await {
                Ok(found) => found,
                Err(SourceError::NotFound) => Vec::new(),
                Err(err) => return Err(err),
            };
            quotes.push(part_quotes);
        }
        let bundle = select_bundle(parts, quotes);
        debug!(
            target: "bayline.pricing",
            platform = "partstech",
            quoted = bundle.quoted_count(),
            requested = parts.len(),
            "pricing complete"
        );
        Ok(bundle)
    }

    async fn stage_cart(
        &self,
        ctx: &SourceContext,
        run_id: &str,
        parts: &[PartSelection],
    ) -> Result<(), SourceError> {
        if self.staged_runs.lock().contains(run_id) {
            return Ok(());
        }
        let items: Vec<Value> = parts
            .iter()
            .filter(|s| !s.request.conditional)
            .filter_map(|s| s.quote.as_ref())
            .map(|q| json!({ "partNumber": q.part_number, "supplier": q.supplier }))
            .collect();
        if items.is_empty() {
            return Ok(());
        }
        let _: Value = self
            .client
            .post_json(ctx, "/cart/stage", json!({ "reference": run_id, "items": items }))
            .await?;
        self.staged_runs.lock().insert(run_id.to_string());
        Ok(())
    }

    async fn order(
        &self,
        ctx: &SourceContext,
        run_id: &str,
        parts: &[PartSelection],
    ) -> Result<Vec<String>, SourceError> {
        let names: Vec<String> = parts
            .iter()
            .filter(|s| s.quote.is_some())
            .map(|s| s.request.name.clone())
            .collect();
        if self.ordered_runs.lock().contains(run_id) {
            return Ok(names);
        }
        let _: Value = self
            .client
            .post_json(ctx, "/cart/submit", json!({ "reference": run_id }))
            .await?;
        self.ordered_runs.lock().insert(run_id.to_string());
        Ok(names)
    }
}

// ---------------------------------------------------------------------------
// Nexpart (fallback)
// ---------------------------------------------------------------------------

pub struct NexpartPricing {
    client: JsonApiClient,
}

impl NexpartPricing {
    pub fn new(client: JsonApiClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PartsPrice for NexpartPricing {
    fn platform(&self) -> &'static str {
        "nexpart"
    }

    async fn price(
        &self,
        ctx: &SourceContext,
        vehicle: &Vehicle,
        parts: &[PartRequest],
    ) -> Result<PartsBundle, SourceError> {
        let terms: Vec<&str> = parts.iter().map(PartRequest::canonical_term).collect();
        let body = json!({
            "year": vehicle.year,
            "make": vehicle.make,
            "model": vehicle.model,
            "terms": terms,
        });
        let response: Value = self.client.post_json(ctx, "/v2/quote", body).await?;
        let groups = response["quotes"].as_array().cloned().unwrap_or_default();

        let mut quotes = vec![Vec::new(); parts.len()];
        for (index, group) in groups.iter().enumerate().take(parts.len()) {
            quotes[index] = group
                .as_array()
                .map(|items| {
                    items
                        .iter()
                        .filter_map(|item| quote_from_value("nexpart", item))
                        .collect()
                })
                .unwrap_or_default();
        }
        Ok(select_bundle(parts, quotes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quote(brand: &str, price: Option<f64>, in_stock: bool) -> PartQuote {
        PartQuote {
            brand: brand.to_string(),
            part_number: Some("PN-1".to_string()),
            supplier: format!("{brand} supply"),
            unit_price: price,
            availability: if in_stock { "today" } else { "3 days" }.to_string(),
            in_stock,
            source: "partstech".to_string(),
        }
    }

    #[test]
    fn in_stock_beats_cheaper_backorder() {
        let requests = vec![PartRequest::new("oxygen sensor")];
        let bundle = select_bundle(
            &requests,
            vec![vec![
                quote("Denso", Some(64.50), true),
                quote("Bosch", Some(41.00), false),
            ]],
        );
        let selected = bundle.selections[0].quote.as_ref().unwrap();
        assert_eq!(selected.brand, "Denso");
        assert!(bundle.all_in_stock);
        assert_eq!(bundle.parts_cost, 64.50);
    }

    #[test]
    fn unpriced_quotes_are_never_selected() {
        let requests = vec![PartRequest::new("oil filter")];
        let bundle = select_bundle(&requests, vec![vec![quote("Fram", None, true)]]);
        assert!(bundle.selections[0].quote.is_none());
        assert_eq!(bundle.selections[0].miss, Some(QuoteMiss::NoPrice));
        assert!(!bundle.all_in_stock);
        assert_eq!(bundle.parts_cost, 0.0);
    }

    #[test]
    fn quantities_multiply_into_parts_cost() {
        let requests = vec![PartRequest::new("spark plug").with_qty(4)];
        let bundle = select_bundle(&requests, vec![vec![quote("NGK", Some(7.25), true)]]);
        assert_eq!(bundle.parts_cost, 29.0);
    }

    #[test]
    fn losing_oem_quotes_surface_as_alternatives() {
        let requests = vec![PartRequest::new("ignition coil")];
        let bundle = select_bundle(
            &requests,
            vec![vec![
                quote("Delphi", Some(38.00), true),
                quote("Motorcraft", Some(61.00), true),
            ]],
        );
        assert_eq!(bundle.selections[0].quote.as_ref().unwrap().brand, "Delphi");
        assert_eq!(bundle.oem_alternatives.len(), 1);
        assert_eq!(bundle.oem_alternatives[0].brand, "Motorcraft");
    }

    #[test]
    fn price_string_and_number_shapes_normalize() {
        let item = json!({
            "brand": "Denso", "partNumber": "234-4587", "supplier": "X",
            "price": "$64.50", "availability": "In Stock", "inStock": true
        });
        let q = quote_from_value("partstech", &item).unwrap();
        assert_eq!(q.unit_price, Some(64.50));

        let item = json!({ "brand": "Denso", "price": "N/A", "inStock": false });
        let q = quote_from_value("partstech", &item).unwrap();
        assert_eq!(q.unit_price, None);
    }
}
