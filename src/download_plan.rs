use crate::error::Result;
use crate::eumetsat::catalog::{identify_datasets, DatasetSearch};
use crate::eumetsat::{DataStoreApi, DatasetId, ProductId};
use crate::store::MetadataStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Where a dataset stands with respect to the data directory and the metadata store.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    /// Primary file on disk and row in the store.
    Complete,
    /// Primary file on disk, no row. Left behind by a run interrupted before the insert.
    MissingRecord,
    /// Row in the store, no primary file.
    MissingFile,
    Absent,
}

impl LedgerStatus {
    pub fn needs_download(self: Self) -> bool {
        self != Self::Complete
    }
}

/// The idempotency check: the data directory and the store must agree before a dataset is skipped.
pub struct Ledger<'a> {
    data_dir: &'a Path,
    store: &'a MetadataStore,
    primary_suffix: &'a str,
}

impl<'a> Ledger<'a> {
    pub fn new(data_dir: &'a Path, store: &'a MetadataStore, primary_suffix: &'a str) -> Self {
        Self {
            data_dir,
            store,
            primary_suffix,
        }
    }

    pub fn primary_file(self: &Self, id: &DatasetId) -> PathBuf {
        self.data_dir
            .join(format!("{}.{}", id.as_str(), self.primary_suffix))
    }

    pub fn status(self: &Self, id: &DatasetId) -> Result<LedgerStatus> {
        let on_disk = self.primary_file(id).is_file();
        let recorded = self.store.contains(id)?;
        Ok(match (on_disk, recorded) {
            (true, true) => LedgerStatus::Complete,
            (true, false) => LedgerStatus::MissingRecord,
            (false, true) => LedgerStatus::MissingFile,
            (false, false) => LedgerStatus::Absent,
        })
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct DownloadTask {
    pub dataset_id: DatasetId,
    pub status: LedgerStatus,
}

#[derive(Deserialize, Serialize, Debug)]
pub struct DownloadPlan {
    pub product_id: ProductId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    tasks: Vec<DownloadTask>,
}

impl DownloadPlan {
    /// Enumerates the catalog and classifies every dataset against the ledger.
    /// Tasks are sorted by id so runs are reproducible.
    pub async fn generate(
        api: &impl DataStoreApi,
        search: &DatasetSearch,
        ledger: &Ledger<'_>,
    ) -> Result<Self> {
        let mut ids = identify_datasets(api, search).await?;
        ids.sort();
        ids.dedup();

        let tasks = ids
            .into_iter()
            .map(|dataset_id| {
                let status = ledger.status(&dataset_id)?;
                Ok(DownloadTask { dataset_id, status })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            product_id: search.product_id.clone(),
            start: search.start,
            end: search.end,
            tasks,
        })
    }

    pub fn tasks(self: &Self) -> &[DownloadTask] {
        &self.tasks
    }

    pub fn pending(self: &Self) -> impl Iterator<Item = &DownloadTask> {
        self.tasks.iter().filter(|t| t.status.needs_download())
    }

    pub fn read<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let plan: Self = serde_json::from_str(&content)?;
        Ok(plan)
    }

    pub fn write<P: AsRef<Path>>(self: &Self, path: P) -> anyhow::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }
}
