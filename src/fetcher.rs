use crate::error::Result;
use crate::eumetsat::{AccessToken, DataStoreApi, DatasetId};
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use zip::ZipArchive;

/// Downloads dataset archives, holding the most recent access token.
pub struct ArchiveFetcher {
    token: AccessToken,
    token_refreshes: usize,
}

impl ArchiveFetcher {
    /// Requests the initial access token.
    pub async fn new(api: &impl DataStoreApi) -> Result<Self> {
        let token = api.request_access_token().await?;
        Ok(Self {
            token,
            token_refreshes: 0,
        })
    }

    pub fn token(self: &Self) -> &AccessToken {
        &self.token
    }

    /// Number of times the token has been replaced since construction.
    pub fn token_refreshes(self: &Self) -> usize {
        self.token_refreshes
    }

    pub async fn refresh_token(self: &mut Self, api: &impl DataStoreApi) -> Result<()> {
        self.token = api.request_access_token().await?;
        self.token_refreshes += 1;
        info!("The EUMETSAT access token has been refreshed");
        Ok(())
    }

    /// Downloads `id` and extracts its archive into `dest`, returning the number of entries.
    ///
    /// An auth-class failure on the first attempt buys one token refresh and one retry.
    /// Anything else, or a second failure, is returned to the caller.
    pub async fn download_dataset(
        self: &mut Self,
        api: &impl DataStoreApi,
        id: &DatasetId,
        dest: &Path,
    ) -> Result<usize> {
        fs::create_dir_all(dest)?;
        let archive = archive_path(dest, id);

        match api.download_product(id, &self.token, &archive).await {
            Ok(_) => {}
            Err(e) if e.is_auth_failure() => {
                warn!(dataset = %id, error = %e, "Download rejected, retrying with a fresh token");
                self.refresh_token(api).await?;
                api.download_product(id, &self.token, &archive).await?;
            }
            Err(e) => return Err(e),
        }

        let entries = extract_archive(&archive, dest)?;
        fs::remove_file(&archive)?;
        debug!(dataset = %id, entries, "Archive extracted");
        Ok(entries)
    }
}

fn archive_path(dest: &Path, id: &DatasetId) -> PathBuf {
    let file_name = id.as_str().replace(['/', '\\'], "_");
    dest.join(format!("{file_name}.zip"))
}

/// Unpacks every entry of the zip at `archive` into `dest`. Entries escaping `dest` are rejected.
pub fn extract_archive(archive: &Path, dest: &Path) -> Result<usize> {
    let file = File::open(archive)?;
    let mut zip = ZipArchive::new(file)?;
    let entries = zip.len();
    zip.extract(dest)?;
    Ok(entries)
}
