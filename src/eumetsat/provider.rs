use super::{check_response, AccessToken, DataStoreApi, DatasetId, ProductQuery, SearchPage};
use crate::datetime::format_query_datetime;
use crate::error::{Error, Result};
use futures_util::TryStreamExt;
use reqwest::Client;
use serde::Deserialize;
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use tracing::debug;
use url::Url;

pub const USER_KEY_VAR: &str = "EUMETSAT_USER_KEY";
pub const USER_SECRET_VAR: &str = "EUMETSAT_USER_SECRET";

#[derive(Clone)]
pub struct Credentials {
    pub key: String,
    pub secret: String,
}

impl Credentials {
    pub fn new(key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            secret: secret.into(),
        }
    }

    /// Reads the API key and secret from the environment, loading a `.env` file first if present.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();
        let read = |name: &str| {
            std::env::var(name).map_err(|_| Error::Config(format!("{name} is not set")))
        };
        Ok(Self::new(read(USER_KEY_VAR)?, read(USER_SECRET_VAR)?))
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("key", &self.key)
            .field("secret", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct Endpoints {
    pub token: Url,
    pub search: Url,
    pub download: Url,
}

impl Endpoints {
    pub fn from_base_url(base_url: &str) -> Result<Self> {
        let base = base_url.trim_end_matches('/');
        Ok(Self {
            token: Url::parse(&format!("{base}/token"))?,
            search: Url::parse(&format!("{base}/data/search-products/os"))?,
            download: Url::parse(&format!("{base}/data/download/products"))?,
        })
    }

    /// `.../download/products/{id}`, with the id percent-encoded as a single path segment.
    pub fn download_url(self: &Self, id: &DatasetId) -> Result<Url> {
        let mut url = self.download.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("Invalid download endpoint: {}", self.download)))?
            .push(id.as_str());
        Ok(url)
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

pub struct Provider {
    client: Client,
    credentials: Credentials,
    endpoints: Endpoints,
}

impl Provider {
    pub fn new(credentials: Credentials, endpoints: Endpoints) -> Self {
        Self {
            client: Client::new(),
            credentials,
            endpoints,
        }
    }

    pub fn from_base_url(credentials: Credentials, base_url: &str) -> Result<Self> {
        Ok(Self::new(credentials, Endpoints::from_base_url(base_url)?))
    }
}

impl DataStoreApi for Provider {
    async fn request_access_token(self: &Self) -> Result<AccessToken> {
        let response = self
            .client
            .post(self.endpoints.token.clone())
            .basic_auth(&self.credentials.key, Some(&self.credentials.secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        let response = check_response(response).await.map_err(|e| match e {
            Error::Api { message, .. } => Error::Auth(message),
            other => other,
        })?;

        let body: TokenResponse = response.json().await?;
        debug!("Access token acquired");
        Ok(AccessToken::new(body.access_token))
    }

    async fn query_products(self: &Self, query: &ProductQuery) -> Result<SearchPage> {
        let params = [
            ("format", "json".to_string()),
            ("pi", query.product_id.to_string()),
            ("si", query.start_index.to_string()),
            ("c", query.page_size.to_string()),
            ("sort", "start,time,0".to_string()),
            ("dtstart", format_query_datetime(&query.start)),
            ("dtend", format_query_datetime(&query.end)),
        ];

        let response = self
            .client
            .get(self.endpoints.search.clone())
            .query(&params)
            .send()
            .await?;

        let page = check_response(response).await?.json::<SearchPage>().await?;
        Ok(page)
    }

    async fn download_product(
        self: &Self,
        id: &DatasetId,
        token: &AccessToken,
        output: &Path,
    ) -> Result<u64> {
        let url = self.endpoints.download_url(id)?;
        let response = self
            .client
            .get(url)
            .query(&[("access_token", token.value.as_str())])
            .send()
            .await?;
        let response = check_response(response).await?;

        // Stream into a .partial file so an interrupted transfer never looks complete
        let partial = format!("{}.partial", output.display());
        let mut partial_file = File::create(&partial)?;
        let mut byte_count = 0_u64;

        let mut body = response.bytes_stream();
        while let Some(bytes) = body.try_next().await? {
            partial_file.write_all(&bytes)?;
            byte_count += bytes.len() as u64;
        }
        partial_file.flush()?;

        fs::rename(partial, output)?;
        debug!(dataset = %id, bytes = byte_count, "Archive downloaded");
        Ok(byte_count)
    }
}
