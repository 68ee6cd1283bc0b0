use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;

pub use http::{HttpCatalog, HttpTransactions};

mod http;

/// One sellable variant of a product (e.g. a size or color).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductVariant {
    pub name: String,
    pub price: i64,
    pub stock: u32,
}

/// Catalog entity as served by the product service. Prices are integer
/// minor units. `price`/`stock` may be absent on the wire when the product
/// sells only through variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    #[serde(rename = "_id")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub price: i64,
    #[serde(default)]
    pub stock: u32,
    #[serde(default)]
    pub variants: Vec<ProductVariant>,
}

/// One page of a product listing.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProductPage {
    pub data: Vec<ProductRecord>,
    #[serde(default)]
    pub total: u64,
}

/// Query parameters for `ProductCatalog::products`.
#[derive(Debug, Clone)]
pub struct ProductQuery {
    pub page: u32,
    pub limit: u32,
    pub search: String,
    pub sort_by: Option<String>,
    pub only_available: bool,
}

impl Default for ProductQuery {
    fn default() -> Self {
        Self {
            page: 1,
            limit: 50,
            search: String::new(),
            sort_by: None,
            only_available: false,
        }
    }
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("product {0} not found")]
    NotFound(String),
    #[error("catalog request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("unexpected catalog response: {0}")]
    Envelope(String),
}

/// Read-side port of the product catalog service.
#[async_trait]
pub trait ProductCatalog: Send + Sync {
    async fn product_detail(&self, id: &str) -> Result<ProductRecord, CatalogError>;

    async fn products(&self, query: &ProductQuery) -> Result<ProductPage, CatalogError>;
}

/// One line of a transaction draft, keyed the way the transaction service
/// expects it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransactionItem {
    #[serde(rename = "productID")]
    pub product_id: String,
    pub quantity: u32,
    #[serde(rename = "variantName", skip_serializing_if = "Option::is_none")]
    pub variant_name: Option<String>,
}

/// Body of `POST /transaction`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TransactionDraft {
    pub data: Vec<TransactionItem>,
}

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("transaction draft is empty")]
    Empty,
    #[error("transaction request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("transaction rejected with status {0}")]
    Rejected(u16),
}

/// Write-side port of the transaction service.
#[async_trait]
pub trait TransactionGateway: Send + Sync {
    async fn create_transaction(&self, draft: &TransactionDraft) -> Result<(), TransactionError>;
}

/// Append-only product lookup cache, shared between overlapping batch
/// resolutions. Repeated detections of the same product within a session
/// group must not re-issue lookups, so entries live until the group is
/// explicitly reset.
#[derive(Debug, Clone, Default)]
pub struct CatalogCache {
    entries: Arc<RwLock<HashMap<String, ProductRecord>>>,
}

impl CatalogCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: &str) -> Option<ProductRecord> {
        self.entries.read().await.get(id).cloned()
    }

    pub async fn insert(&self, record: ProductRecord) {
        self.entries.write().await.insert(record.id.clone(), record);
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    /// Drops every entry. Only called when a session group ends (hard reset).
    pub async fn clear(&self) {
        self.entries.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> ProductRecord {
        ProductRecord {
            id: id.to_string(),
            name: format!("Product {id}"),
            price: 1000,
            stock: 5,
            variants: Vec::new(),
        }
    }

    #[tokio::test]
    async fn cache_round_trip() {
        let cache = CatalogCache::new();
        assert!(cache.get("p1").await.is_none());

        cache.insert(record("p1")).await;
        let hit = cache.get("p1").await.expect("cached record");
        assert_eq!(hit.name, "Product p1");
        assert_eq!(cache.len().await, 1);

        // Re-inserting the same id replaces rather than duplicating.
        cache.insert(record("p1")).await;
        assert_eq!(cache.len().await, 1);

        cache.clear().await;
        assert!(cache.is_empty().await);
    }

    #[test]
    fn product_record_parses_service_shape() {
        let raw = r#"{
            "_id": "665f1",
            "name": "Iced Tea",
            "price": 5000,
            "stock": 12,
            "variants": [
                { "name": "Large", "price": 7000, "stock": 4 }
            ]
        }"#;
        let record: ProductRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(record.id, "665f1");
        assert_eq!(record.variants[0].name, "Large");
        assert_eq!(record.variants[0].price, 7000);
    }

    #[test]
    fn product_record_defaults_missing_price_and_stock() {
        let raw = r#"{ "_id": "p2", "name": "Bundle" }"#;
        let record: ProductRecord = serde_json::from_str(raw).unwrap();
        assert_eq!(record.price, 0);
        assert_eq!(record.stock, 0);
        assert!(record.variants.is_empty());
    }

    #[test]
    fn transaction_draft_serializes_service_field_names() {
        let draft = TransactionDraft {
            data: vec![
                TransactionItem {
                    product_id: "p1".into(),
                    quantity: 2,
                    variant_name: None,
                },
                TransactionItem {
                    product_id: "p2".into(),
                    quantity: 1,
                    variant_name: Some("Red".into()),
                },
            ],
        };
        let value = serde_json::to_value(&draft).unwrap();
        assert_eq!(value["data"][0]["productID"], "p1");
        assert!(value["data"][0].get("variantName").is_none());
        assert_eq!(value["data"][1]["variantName"], "Red");
    }
}
