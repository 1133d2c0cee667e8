//! Types and operations for the EUMETSAT Data Store API
mod provider;
pub mod catalog;

pub use provider::{Credentials, Endpoints, Provider};

use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use reqwest::Response;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

pub const DEFAULT_BASE_URL: &str = "https://api.eumetsat.int";
pub const DEFAULT_PRODUCT_ID: &str = "EO:EUM:DAT:MSG:MSG15-RSS";

/// Operations against the remote data store. `Provider` talks HTTP; tests substitute fakes.
pub trait DataStoreApi {
    async fn request_access_token(self: &Self) -> Result<AccessToken>;

    async fn query_products(self: &Self, query: &ProductQuery) -> Result<SearchPage>;

    /// Writes the dataset's zip archive to `output`, returning the number of bytes written.
    async fn download_product(
        self: &Self,
        id: &DatasetId,
        token: &AccessToken,
        output: &Path,
    ) -> Result<u64>;
}

#[derive(Clone, Debug)]
pub struct AccessToken {
    pub value: String,
    pub acquired: DateTime<Utc>,
}

impl AccessToken {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            acquired: Utc::now(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(transparent)]
pub struct ProductId(String);

impl ProductId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(self: &Self) -> &str {
        &self.0
    }
}

impl Default for ProductId {
    fn default() -> Self {
        Self::new(DEFAULT_PRODUCT_ID)
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(transparent)]
pub struct DatasetId(String);

impl DatasetId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(self: &Self) -> &str {
        &self.0
    }
}

impl fmt::Display for DatasetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DatasetId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// One page of the OpenSearch catalog query.
#[derive(Clone, Debug)]
pub struct ProductQuery {
    pub product_id: ProductId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub start_index: usize,
    pub page_size: usize,
}

#[derive(Deserialize, Debug)]
pub struct SearchPage {
    pub features: Vec<Feature>,
    pub properties: SearchProperties,
}

#[derive(Deserialize, Debug)]
pub struct Feature {
    pub id: DatasetId,
}

#[derive(Deserialize, Debug)]
pub struct SearchProperties {
    #[serde(rename = "totalResults")]
    pub total_results: usize,
}

#[derive(Deserialize)]
struct ErrorBody {
    error: Option<String>,
    error_description: Option<String>,
}

/// Builds the provider error code and a readable message from a failed response body.
fn describe_failure(status: u16, body: &str) -> (Option<String>, String) {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(ErrorBody {
            error: Some(error),
            error_description: Some(description),
        }) => {
            let message = format!("Error: {error}\nDescription: {description}");
            (Some(error), message)
        }
        Ok(ErrorBody { error, .. }) => (
            error,
            format!("Request was unsuccessful - Error code: {status}"),
        ),
        Err(_) => (None, format!("Request was unsuccessful - Error code: {status}")),
    }
}

/// Passes successful responses through and turns anything else into `Error::Api`.
pub(crate) async fn check_response(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    let (code, message) = describe_failure(status.as_u16(), &body);
    Err(Error::Api {
        status: status.as_u16(),
        code,
        message,
    })
}
