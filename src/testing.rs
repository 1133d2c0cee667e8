//! In-memory stand-ins for the data store used by unit tests
use crate::error::{Error, Result};
use crate::eumetsat::{
    AccessToken, DataStoreApi, DatasetId, Feature, ProductQuery, SearchPage, SearchProperties,
};
use crate::metadata::tests::EOP_METADATA;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io::{Cursor, Write};
use std::path::Path;
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

pub(crate) fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
    for (name, content) in files {
        writer.start_file(*name, SimpleFileOptions::default()).unwrap();
        writer.write_all(content).unwrap();
    }
    writer.finish().unwrap().into_inner()
}

/// A data file, its EOP metadata and a manifest, as the data store packages them.
pub(crate) fn dataset_archive(id: &str) -> Vec<u8> {
    let data_file = format!("{id}.nat");
    zip_bytes(&[
        (data_file.as_str(), b"native SEVIRI level 1.5"),
        ("EOPMetadata.xml", EOP_METADATA.as_bytes()),
        ("manifest.xml", b"<manifest/>"),
    ])
}

pub(crate) fn unauthorized() -> Error {
    Error::Api {
        status: 401,
        code: Some("invalid_token".to_string()),
        message: "Error: invalid_token\nDescription: Access token expired".to_string(),
    }
}

pub(crate) struct FakeApi {
    ids: Vec<DatasetId>,
    archive_bytes: Option<Vec<u8>>,
    failures: RefCell<VecDeque<Error>>,
    token_requests: Cell<usize>,
    downloads: RefCell<Vec<DatasetId>>,
}

impl FakeApi {
    pub(crate) fn new(ids: &[&str]) -> Self {
        Self {
            ids: ids.iter().map(|id| DatasetId::new(*id)).collect(),
            archive_bytes: None,
            failures: RefCell::new(VecDeque::new()),
            token_requests: Cell::new(0),
            downloads: RefCell::new(vec![]),
        }
    }

    /// Download attempts fail with these errors, in order, before succeeding.
    pub(crate) fn fail_downloads(self, failures: Vec<Error>) -> Self {
        *self.failures.borrow_mut() = failures.into();
        self
    }

    pub(crate) fn with_archive_bytes(mut self, bytes: Vec<u8>) -> Self {
        self.archive_bytes = Some(bytes);
        self
    }

    pub(crate) fn token_requests(self: &Self) -> usize {
        self.token_requests.get()
    }

    pub(crate) fn download_attempts(self: &Self) -> usize {
        self.downloads.borrow().len()
    }

    pub(crate) fn downloaded(self: &Self) -> Vec<DatasetId> {
        self.downloads.borrow().clone()
    }
}

impl DataStoreApi for FakeApi {
    async fn request_access_token(self: &Self) -> Result<AccessToken> {
        let n = self.token_requests.get() + 1;
        self.token_requests.set(n);
        Ok(AccessToken::new(format!("token-{n}")))
    }

    async fn query_products(self: &Self, query: &ProductQuery) -> Result<SearchPage> {
        let features = self
            .ids
            .iter()
            .skip(query.start_index)
            .take(query.page_size)
            .map(|id| Feature { id: id.clone() })
            .collect();
        Ok(SearchPage {
            features,
            properties: SearchProperties {
                total_results: self.ids.len(),
            },
        })
    }

    async fn download_product(
        self: &Self,
        id: &DatasetId,
        _token: &AccessToken,
        output: &Path,
    ) -> Result<u64> {
        self.downloads.borrow_mut().push(id.clone());
        if let Some(e) = self.failures.borrow_mut().pop_front() {
            return Err(e);
        }
        let bytes = self
            .archive_bytes
            .clone()
            .unwrap_or_else(|| dataset_archive(id.as_str()));
        std::fs::write(output, &bytes)?;
        Ok(bytes.len() as u64)
    }
}
