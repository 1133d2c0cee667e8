use crate::config::Settings;
use crate::download_plan::{DownloadPlan, Ledger, LedgerStatus};
use crate::error::{Error, Result};
use crate::eumetsat::catalog::{DatasetSearch, MAX_PAGE_SIZE};
use crate::eumetsat::{Credentials, DataStoreApi, DatasetId, ProductId, Provider};
use crate::fetcher::ArchiveFetcher;
use crate::logging::Logger;
use crate::metadata::{extract_metadata_file, FieldMap, TRANSIENT_FILES};
use crate::store::{DatasetRecord, MetadataStore};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::instrument::WithSubscriber;
use tracing::{debug, error, info, warn};

const STAGING_DIR: &str = ".staging";

/// What a run does when a dataset cannot be processed.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// The first failure ends the run.
    #[default]
    Abort,
    /// Failures are logged and collected in the summary.
    Continue,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DatasetState {
    Discovered,
    Skipped,
    Downloading,
    Extracting,
    MetadataParsed,
    Recorded,
    FailedFatal,
}

#[derive(Clone, Debug)]
pub struct ProgressEvent {
    pub dataset_id: DatasetId,
    /// Position of the dataset in the sorted candidate list, from 1.
    pub position: usize,
    pub total: usize,
    pub state: DatasetState,
}

#[derive(Debug, Default)]
pub struct RunSummary {
    pub discovered: usize,
    pub skipped: Vec<DatasetId>,
    pub recorded: Vec<DatasetId>,
    /// Datasets whose row already existed and only needed their files restored.
    pub restored: Vec<DatasetId>,
    pub failed: Vec<(DatasetId, String)>,
}

impl RunSummary {
    pub fn is_complete(self: &Self) -> bool {
        self.failed.is_empty()
    }
}

/// Runs the acquisition pipeline for one product and time window at a time.
pub struct DownloadManager<A: DataStoreApi> {
    api: A,
    fetcher: ArchiveFetcher,
    store: MetadataStore,
    data_dir: PathBuf,
    field_maps: Vec<FieldMap>,
    on_failure: FailurePolicy,
    page_size: usize,
    logger: Logger,
    progress: Option<UnboundedSender<ProgressEvent>>,
}

impl<A: DataStoreApi> DownloadManager<A> {
    /// Requests the first access token, so bad credentials fail here rather than mid-run.
    pub async fn new(
        api: A,
        store: MetadataStore,
        data_dir: impl Into<PathBuf>,
        logger: Logger,
    ) -> Result<Self> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir)?;
        let fetcher = ArchiveFetcher::new(&api)
            .with_subscriber(logger.dispatch().clone())
            .await?;

        Ok(Self {
            api,
            fetcher,
            store,
            data_dir,
            field_maps: FieldMap::builtin()?,
            on_failure: FailurePolicy::default(),
            page_size: MAX_PAGE_SIZE,
            logger,
            progress: None,
        })
    }

    /// Adds field maps, replacing any built-in map for the same product.
    pub fn with_field_maps(mut self, maps: Vec<FieldMap>) -> Self {
        for map in maps {
            self.field_maps.retain(|m| m.product_id != map.product_id);
            self.field_maps.push(map);
        }
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.on_failure = policy;
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    /// Progress events for every state change of every dataset, from now on.
    pub fn subscribe(self: &mut Self) -> UnboundedReceiver<ProgressEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.progress = Some(tx);
        rx
    }

    pub fn api(self: &Self) -> &A {
        &self.api
    }

    pub fn store(self: &Self) -> &MetadataStore {
        &self.store
    }

    pub fn data_dir(self: &Self) -> &Path {
        &self.data_dir
    }

    pub fn fetcher(self: &Self) -> &ArchiveFetcher {
        &self.fetcher
    }

    pub fn field_map(self: &Self, product_id: &ProductId) -> Result<&FieldMap> {
        self.field_maps
            .iter()
            .find(|m| &m.product_id == product_id)
            .ok_or_else(|| Error::Config(format!("No field map for product {product_id}")))
    }

    /// Enumerates the window and classifies each dataset without downloading anything.
    pub async fn plan(
        self: &Self,
        start: &str,
        end: &str,
        product_id: &ProductId,
    ) -> Result<DownloadPlan> {
        let field_map = self.field_map(product_id)?;
        let search =
            DatasetSearch::new(start, end, product_id.clone())?.with_page_size(self.page_size);
        let ledger = Ledger::new(&self.data_dir, &self.store, &field_map.primary_suffix);
        DownloadPlan::generate(&self.api, &search, &ledger)
            .with_subscriber(self.logger.dispatch().clone())
            .await
    }

    /// Downloads and records every dataset of `product_id` in the window that is not
    /// already complete. Running it again over the same window is a no-op.
    pub async fn run(
        self: &mut Self,
        start: &str,
        end: &str,
        product_id: &ProductId,
    ) -> Result<RunSummary> {
        let dispatch = self.logger.dispatch().clone();
        self.run_plan(start, end, product_id)
            .with_subscriber(dispatch)
            .await
    }

    async fn run_plan(
        self: &mut Self,
        start: &str,
        end: &str,
        product_id: &ProductId,
    ) -> Result<RunSummary> {
        let field_map = self.field_map(product_id)?.clone();
        let search =
            DatasetSearch::new(start, end, product_id.clone())?.with_page_size(self.page_size);

        info!(
            product = %product_id,
            start = %search.start,
            end = %search.end,
            "Identifying available datasets"
        );
        let plan = {
            let ledger = Ledger::new(&self.data_dir, &self.store, &field_map.primary_suffix);
            DownloadPlan::generate(&self.api, &search, &ledger).await?
        };

        let total = plan.tasks().len();
        let pending = plan.pending().count();
        info!(found = total, to_download = pending, "Datasets identified");

        let mut summary = RunSummary {
            discovered: total,
            ..Default::default()
        };

        for (i, task) in plan.tasks().iter().enumerate() {
            let id = &task.dataset_id;
            let emit = |state| ProgressEvent {
                dataset_id: id.clone(),
                position: i + 1,
                total,
                state,
            };
            self.emit(emit(DatasetState::Discovered));

            if !task.status.needs_download() {
                debug!(dataset = %id, "Already downloaded and recorded, skipping");
                self.emit(emit(DatasetState::Skipped));
                summary.skipped.push(id.clone());
                continue;
            }

            if task.status == LedgerStatus::MissingRecord {
                warn!(dataset = %id, "Data file present without a record, downloading again");
            }

            match self.process_dataset(id, &field_map, &emit).await {
                Ok(true) => summary.recorded.push(id.clone()),
                Ok(false) => summary.restored.push(id.clone()),
                Err(e) => {
                    error!(dataset = %id, error = %e, "Unable to process dataset");
                    self.emit(emit(DatasetState::FailedFatal));
                    self.discard_staging(id);
                    match self.on_failure {
                        FailurePolicy::Abort => return Err(e),
                        FailurePolicy::Continue => {
                            summary.failed.push((id.clone(), e.to_string()))
                        }
                    }
                }
            }
        }

        info!(
            recorded = summary.recorded.len(),
            restored = summary.restored.len(),
            skipped = summary.skipped.len(),
            failed = summary.failed.len(),
            "Run finished"
        );
        Ok(summary)
    }

    /// Returns `false` when the store already held the record and only the files were restored.
    async fn process_dataset(
        self: &mut Self,
        id: &DatasetId,
        field_map: &FieldMap,
        emit: &impl Fn(DatasetState) -> ProgressEvent,
    ) -> Result<bool> {
        let staging = self.staging_dir(id);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }

        info!(dataset = %id, "Downloading");
        self.emit(emit(DatasetState::Downloading));
        self.fetcher.download_dataset(&self.api, id, &staging).await?;

        self.emit(emit(DatasetState::Extracting));
        let fields = extract_metadata_file(&staging, field_map)?;
        self.emit(emit(DatasetState::MetadataParsed));

        // Without its data file the dataset could never be complete, so nothing is recorded
        let primary = format!("{}.{}", id.as_str(), field_map.primary_suffix);
        if !staging.join(&primary).is_file() {
            return Err(Error::Archive(format!("Archive for {id} does not contain {primary}")));
        }

        let inserted = if self.store.contains(id)? {
            warn!(dataset = %id, "Record already stored, restoring data files only");
            false
        } else {
            self.store.insert(&DatasetRecord::new(id.clone(), fields))?;
            true
        };

        let moved = move_retained(&staging, &self.data_dir)?;
        fs::remove_dir_all(&staging)?;

        info!(dataset = %id, files = moved, "Recorded");
        self.emit(emit(DatasetState::Recorded));
        Ok(inserted)
    }

    fn staging_dir(self: &Self, id: &DatasetId) -> PathBuf {
        let name = id.as_str().replace(['/', '\\'], "_");
        self.data_dir.join(STAGING_DIR).join(name)
    }

    fn discard_staging(self: &Self, id: &DatasetId) {
        let staging = self.staging_dir(id);
        if staging.exists() {
            if let Err(e) = fs::remove_dir_all(&staging) {
                warn!(
                    path = %staging.display(),
                    error = %e,
                    "Unable to remove staging directory"
                );
            }
        }
    }

    fn emit(self: &Self, event: ProgressEvent) {
        if let Some(tx) = &self.progress {
            // A dropped receiver just means nobody is watching
            let _ = tx.send(event);
        }
    }
}

impl DownloadManager<Provider> {
    /// A manager talking to the real data store, configured from a settings file.
    pub async fn from_settings(
        settings: &Settings,
        credentials: Credentials,
        logger: Logger,
    ) -> anyhow::Result<Self> {
        let provider = Provider::from_base_url(credentials, &settings.api.base_url)?;
        let store = MetadataStore::open(&settings.metadata_db)?;
        let manager = Self::new(provider, store, &settings.data_dir, logger)
            .await?
            .with_field_maps(settings.load_field_maps()?)
            .with_failure_policy(settings.on_failure)
            .with_page_size(settings.api.page_size);
        Ok(manager)
    }
}

/// Moves everything except the transient metadata files from `staging` into `data_dir`.
fn move_retained(staging: &Path, data_dir: &Path) -> Result<usize> {
    let mut moved = 0;
    for entry in fs::read_dir(staging)? {
        let entry = entry?;
        let name = entry.file_name();
        if TRANSIENT_FILES.iter().any(|t| name == *t) {
            continue;
        }
        let target = data_dir.join(&name);
        if target.is_dir() {
            fs::remove_dir_all(&target)?;
        }
        fs::rename(entry.path(), target)?;
        moved += 1;
    }
    Ok(moved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::tests::EOP_METADATA;
    use crate::testing::{unauthorized, zip_bytes, FakeApi};
    use tempfile::TempDir;

    const P1: &str = "P1";
    const START: &str = "2020-01-01";
    const END: &str = "2020-01-02";

    fn p1_field_map() -> FieldMap {
        let mut map = FieldMap::builtin().unwrap().remove(0);
        map.product_id = ProductId::new(P1);
        map
    }

    async fn manager(api: FakeApi, dir: &TempDir) -> DownloadManager<FakeApi> {
        let store = MetadataStore::open(dir.path().join("metadata.db")).unwrap();
        DownloadManager::new(api, store, dir.path().join("data"), Logger::disabled())
            .await
            .unwrap()
            .with_field_maps(vec![p1_field_map()])
    }

    fn data_files(dir: &Path) -> Vec<String> {
        let mut names = fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|n| n != STAGING_DIR)
            .collect::<Vec<_>>();
        names.sort();
        names
    }

    #[tokio::test]
    async fn test_run_records_every_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(FakeApi::new(&["B", "A"]), &dir).await;

        let summary = manager.run(START, END, &ProductId::new(P1)).await.unwrap();

        assert_eq!(summary.discovered, 2);
        assert_eq!(summary.recorded, vec![DatasetId::new("A"), DatasetId::new("B")]);
        assert!(summary.is_complete());

        let ids: Vec<String> = manager
            .store()
            .all()
            .unwrap()
            .into_iter()
            .map(|r| r.id.to_string())
            .collect();
        assert_eq!(ids, vec!["A", "B"]);
        assert_eq!(data_files(manager.data_dir()), vec!["A.nat", "B.nat"]);
    }

    #[tokio::test]
    async fn test_second_run_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(FakeApi::new(&["A", "B"]), &dir).await;
        let product = ProductId::new(P1);

        manager.run(START, END, &product).await.unwrap();
        assert_eq!(manager.api().download_attempts(), 2);

        let summary = manager.run(START, END, &product).await.unwrap();
        assert_eq!(manager.api().download_attempts(), 2);
        assert_eq!(summary.skipped.len(), 2);
        assert!(summary.recorded.is_empty());
        assert_eq!(manager.store().len().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_auth_failure_is_retried_once() {
        let dir = tempfile::tempdir().unwrap();
        let api = FakeApi::new(&["A"]).fail_downloads(vec![unauthorized()]);
        let mut manager = manager(api, &dir).await;

        let summary = manager.run(START, END, &ProductId::new(P1)).await.unwrap();

        assert_eq!(summary.recorded.len(), 1);
        assert_eq!(manager.fetcher().token_refreshes(), 1);
        assert_eq!(manager.store().len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_repeated_failure_aborts_without_record() {
        let dir = tempfile::tempdir().unwrap();
        let api = FakeApi::new(&["A", "B"]).fail_downloads(vec![unauthorized(), unauthorized()]);
        let mut manager = manager(api, &dir).await;

        let result = manager.run(START, END, &ProductId::new(P1)).await;

        assert!(matches!(result, Err(Error::Api { status: 401, .. })));
        assert!(manager.store().is_empty().unwrap());
        assert_eq!(manager.api().downloaded(), vec![DatasetId::new("A"), DatasetId::new("A")]);
        assert!(!manager.staging_dir(&"A".into()).exists());
    }

    #[tokio::test]
    async fn test_continue_policy_collects_failures() {
        let dir = tempfile::tempdir().unwrap();
        let api = FakeApi::new(&["A", "B"]).fail_downloads(vec![unauthorized(), unauthorized()]);
        let mut manager = manager(api, &dir)
            .await
            .with_failure_policy(FailurePolicy::Continue);
        let product = ProductId::new(P1);

        let summary = manager.run(START, END, &product).await.unwrap();
        assert!(!summary.is_complete());
        assert_eq!(summary.failed[0].0, DatasetId::new("A"));
        assert_eq!(summary.recorded, vec![DatasetId::new("B")]);

        // The failed dataset is picked up by the next run
        let summary = manager.run(START, END, &product).await.unwrap();
        assert_eq!(summary.recorded, vec![DatasetId::new("A")]);
        assert_eq!(manager.store().len().unwrap(), 2);
    }

    #[tokio::test]
    async fn test_missing_file_is_restored_without_second_insert() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(FakeApi::new(&["A"]), &dir).await;
        let product = ProductId::new(P1);
        manager.run(START, END, &product).await.unwrap();

        fs::remove_file(manager.data_dir().join("A.nat")).unwrap();

        let summary = manager.run(START, END, &product).await.unwrap();
        assert_eq!(summary.restored, vec![DatasetId::new("A")]);
        assert!(manager.data_dir().join("A.nat").exists());
        assert_eq!(manager.store().len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_missing_record_is_downloaded_again() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(FakeApi::new(&["A"]), &dir).await;
        fs::write(manager.data_dir().join("A.nat"), b"left over").unwrap();

        let summary = manager.run(START, END, &ProductId::new(P1)).await.unwrap();

        assert_eq!(summary.recorded, vec![DatasetId::new("A")]);
        assert_eq!(manager.api().download_attempts(), 1);
        assert!(manager.store().contains(&"A".into()).unwrap());
    }

    #[tokio::test]
    async fn test_archive_without_data_file_is_not_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let archive = zip_bytes(&[
            ("EOPMetadata.xml", EOP_METADATA.as_bytes()),
            ("other.bin", b"not the data file"),
        ]);
        let api = FakeApi::new(&["A"]).with_archive_bytes(archive);
        let mut manager = manager(api, &dir)
            .await
            .with_failure_policy(FailurePolicy::Continue);
        let product = ProductId::new(P1);

        let summary = manager.run(START, END, &product).await.unwrap();
        assert!(summary.recorded.is_empty());
        assert_eq!(summary.failed[0].0, DatasetId::new("A"));
        assert!(summary.failed[0].1.contains("A.nat"));
        assert!(manager.store().is_empty().unwrap());
        assert!(!manager.data_dir().join("other.bin").exists());
        assert!(!manager.staging_dir(&"A".into()).exists());

        // Still absent from the ledger, so the next run tries again rather than restoring
        let summary = manager.run(START, END, &product).await.unwrap();
        assert!(summary.restored.is_empty());
        assert_eq!(summary.failed.len(), 1);
        assert_eq!(manager.api().download_attempts(), 2);
    }

    #[tokio::test]
    async fn test_archive_without_data_file_aborts() {
        let dir = tempfile::tempdir().unwrap();
        let archive = zip_bytes(&[("EOPMetadata.xml", EOP_METADATA.as_bytes())]);
        let api = FakeApi::new(&["A"]).with_archive_bytes(archive);
        let mut manager = manager(api, &dir).await;

        let result = manager.run(START, END, &ProductId::new(P1)).await;
        assert!(matches!(result, Err(Error::Archive(_))));
        assert!(manager.store().is_empty().unwrap());
    }

    #[tokio::test]
    async fn test_progress_events() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(FakeApi::new(&["A"]), &dir).await;
        let mut events = manager.subscribe();
        let product = ProductId::new(P1);

        manager.run(START, END, &product).await.unwrap();
        manager.run(START, END, &product).await.unwrap();

        let mut states = vec![];
        while let Ok(event) = events.try_recv() {
            assert_eq!(event.total, 1);
            states.push(event.state);
        }
        assert_eq!(
            states,
            vec![
                DatasetState::Discovered,
                DatasetState::Downloading,
                DatasetState::Extracting,
                DatasetState::MetadataParsed,
                DatasetState::Recorded,
                DatasetState::Discovered,
                DatasetState::Skipped,
            ]
        );
    }

    #[tokio::test]
    async fn test_unknown_product() {
        let dir = tempfile::tempdir().unwrap();
        let mut manager = manager(FakeApi::new(&["A"]), &dir).await;

        let result = manager.run(START, END, &ProductId::new("P2")).await;
        assert!(matches!(result, Err(Error::Config(_))));
        assert_eq!(manager.api().download_attempts(), 0);
    }

    #[tokio::test]
    async fn test_plan_does_not_download() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(FakeApi::new(&["A", "B"]), &dir).await;

        let plan = manager.plan(START, END, &ProductId::new(P1)).await.unwrap();
        assert_eq!(plan.pending().count(), 2);
        assert_eq!(manager.api().download_attempts(), 0);
    }
}
