use crate::download_manager::FailurePolicy;
use crate::error::{Error, Result};
use crate::eumetsat::catalog::MAX_PAGE_SIZE;
use crate::eumetsat::{ProductId, DEFAULT_BASE_URL};
use crate::logging::LogSettings;
use crate::metadata::FieldMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct ApiSettings {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_page_size() -> usize {
    MAX_PAGE_SIZE
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            page_size: default_page_size(),
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct Settings {
    pub data_dir: PathBuf,
    pub metadata_db: PathBuf,
    #[serde(default)]
    pub product_id: ProductId,
    #[serde(default)]
    pub on_failure: FailurePolicy,
    /// Field maps for products without a built-in one.
    #[serde(default)]
    pub field_maps: Vec<PathBuf>,
    #[serde(default)]
    pub api: ApiSettings,
    #[serde(default)]
    pub log: LogSettings,
}

impl Settings {
    pub fn read<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let settings: Self = toml::from_str(&content)?;
        Ok(settings)
    }

    pub fn write<P: AsRef<Path>>(self: &Self, path: P) -> anyhow::Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn from_template(table: &toml::Table) -> Result<Self> {
        toml::from_str(&table.to_string())
            .map_err(|e| Error::Config(format!("Invalid settings template: {e}")))
    }

    /// Settings for the MSG 15-minute rapid scan product.
    pub fn template() -> toml::Table {
        toml::toml! {
            data_dir = "./data"
            metadata_db = "./data/metadata.db"
            product_id = "EO:EUM:DAT:MSG:MSG15-RSS"
            on_failure = "abort"
            field_maps = []

            [api]
            base_url = "https://api.eumetsat.int"
            page_size = 10000

            [log]
            level = "info"
            file = "./logs/eumetsat.log"
            json = false
        }
    }

    /// The maps named in `field_maps`, in order.
    pub fn load_field_maps(self: &Self) -> anyhow::Result<Vec<FieldMap>> {
        self.field_maps
            .iter()
            .map(|path| {
                FieldMap::read(path).map_err(|e| {
                    anyhow::anyhow!("Unable to load field map {}: {e}", path.display())
                })
            })
            .collect()
    }
}
