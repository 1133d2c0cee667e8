#![allow(async_fn_in_trait)]
pub mod config;
pub mod datetime;
pub mod download_manager;
pub mod download_plan;
pub mod error;
pub mod eumetsat;
pub mod fetcher;
pub mod logging;
pub mod metadata;
pub mod store;
pub mod table;
#[cfg(test)]
mod testing;

pub use download_manager::{DownloadManager, FailurePolicy, ProgressEvent, RunSummary};
pub use error::{Error, Result};
