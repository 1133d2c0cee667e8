//! Catalog search: pages through the OpenSearch endpoint to enumerate every dataset in a window
use super::{DataStoreApi, DatasetId, ProductId, ProductQuery, SearchPage};
use crate::datetime::parse_datetime;
use crate::error::{Error, Result};
use chrono::{DateTime, Utc};
use tracing::debug;

/// The data store refuses to return more than this many features per request.
pub const MAX_PAGE_SIZE: usize = 10_000;

#[derive(Clone, Debug)]
pub struct DatasetSearch {
    pub product_id: ProductId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub page_size: usize,
}

impl DatasetSearch {
    /// Accepts dates in any of the forms understood by [`parse_datetime`].
    pub fn new(start: &str, end: &str, product_id: ProductId) -> Result<Self> {
        Ok(Self {
            product_id,
            start: parse_date_arg(start)?,
            end: parse_date_arg(end)?,
            page_size: MAX_PAGE_SIZE,
        })
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.clamp(1, MAX_PAGE_SIZE);
        self
    }

    fn page(self: &Self, start_index: usize) -> ProductQuery {
        ProductQuery {
            product_id: self.product_id.clone(),
            start: self.start,
            end: self.end,
            start_index,
            page_size: self.page_size,
        }
    }
}

fn parse_date_arg(value: &str) -> Result<DateTime<Utc>> {
    parse_datetime(value).ok_or_else(|| Error::Config(format!("Unrecognised date: '{value}'")))
}

/// A single catalog request.
pub async fn query_products(
    api: &impl DataStoreApi,
    start: &str,
    end: &str,
    start_index: usize,
    page_size: usize,
    product_id: &ProductId,
) -> Result<SearchPage> {
    let search = DatasetSearch::new(start, end, product_id.clone())?.with_page_size(page_size);
    api.query_products(&search.page(start_index)).await
}

/// Convenience wrapper over [`identify_datasets`] using the maximum page size.
pub async fn identify_available_datasets(
    api: &impl DataStoreApi,
    start: &str,
    end: &str,
    product_id: &ProductId,
) -> Result<Vec<DatasetId>> {
    let search = DatasetSearch::new(start, end, product_id.clone())?;
    identify_datasets(api, &search).await
}

/// Collects every dataset id matching `search`, one page at a time, in server order.
pub async fn identify_datasets(
    api: &impl DataStoreApi,
    search: &DatasetSearch,
) -> Result<Vec<DatasetId>> {
    let mut datasets: Vec<DatasetId> = vec![];
    let mut start_index = 0;

    loop {
        let page = api.query_products(&search.page(start_index)).await?;
        let page_len = page.features.len();
        let total_results = page.properties.total_results;

        datasets.extend(page.features.into_iter().map(|f| f.id));

        let returned_results = start_index + page_len;
        if returned_results != datasets.len() {
            return Err(Error::Consistency(format!(
                "expected {returned_results} accumulated results after the page at index {start_index}, \
                 holding {}",
                datasets.len()
            )));
        }

        debug!(
            start_index,
            page_len, total_results, "Retrieved catalog page"
        );

        if returned_results >= total_results {
            break;
        }
        if page_len == 0 {
            return Err(Error::Consistency(format!(
                "empty page at index {start_index} with {returned_results} of {total_results} results retrieved"
            )));
        }
        start_index += search.page_size;
    }

    Ok(datasets)
}
