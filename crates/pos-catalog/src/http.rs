use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::debug;

use crate::{
    CatalogError, ProductCatalog, ProductPage, ProductQuery, ProductRecord, TransactionDraft,
    TransactionError, TransactionGateway,
};

/// Detail responses wrap the record in a `data` envelope.
#[derive(Deserialize)]
struct DetailEnvelope {
    data: ProductRecord,
}

/// HTTP client for the product catalog service.
#[derive(Debug, Clone)]
pub struct HttpCatalog {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpCatalog {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }
}

pub(crate) fn product_query_params(query: &ProductQuery) -> Vec<(String, String)> {
    let mut params = vec![
        ("page".to_string(), query.page.to_string()),
        ("limit".to_string(), query.limit.to_string()),
        ("search".to_string(), query.search.clone()),
    ];
    if let Some(sort_by) = &query.sort_by {
        params.push(("sortBy".to_string(), sort_by.clone()));
        params.push(("sortOrder".to_string(), "1".to_string()));
    }
    if query.only_available {
        params.push(("isAvailable".to_string(), "true".to_string()));
    }
    params
}

#[async_trait]
impl ProductCatalog for HttpCatalog {
    async fn product_detail(&self, id: &str) -> Result<ProductRecord, CatalogError> {
        let url = format!("{}/product/{}", self.base_url, id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.token)
            .send()
            .await?;

        if response.status() == StatusCode::NOT_FOUND {
            return Err(CatalogError::NotFound(id.to_string()));
        }
        let response = response.error_for_status()?;
        let envelope: DetailEnvelope = response.json().await?;
        debug!(product_id = %id, "fetched product detail");
        Ok(envelope.data)
    }

    async fn products(&self, query: &ProductQuery) -> Result<ProductPage, CatalogError> {
        let url = format!("{}/product", self.base_url);
        let response = self
            .client
            .get(&url)
            .query(&product_query_params(query))
            .bearer_auth(&self.token)
            .send()
            .await?
            .error_for_status()?;

        let page: ProductPage = response.json().await?;
        debug!(count = page.data.len(), "fetched product page");
        Ok(page)
    }
}

/// HTTP client for the transaction service.
#[derive(Debug, Clone)]
pub struct HttpTransactions {
    client: Client,
    base_url: String,
    token: String,
}

impl HttpTransactions {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }
}

#[async_trait]
impl TransactionGateway for HttpTransactions {
    async fn create_transaction(&self, draft: &TransactionDraft) -> Result<(), TransactionError> {
        if draft.data.is_empty() {
            return Err(TransactionError::Empty);
        }

        let url = format!("{}/transaction", self.base_url);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.token)
            .json(draft)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(TransactionError::Rejected(response.status().as_u16()));
        }
        debug!(items = draft.data.len(), "transaction created");
        Ok(())
    }
}
