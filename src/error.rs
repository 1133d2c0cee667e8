use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("API request failed ({status}): {message}")]
    Api {
        status: u16,
        code: Option<String>,
        message: String,
    },

    #[error("Unable to extract archive: {0}")]
    Archive(String),

    #[error("Unable to extract metadata field '{field}': {reason}")]
    MetadataParse { field: String, reason: String },

    #[error("Catalog pagination is inconsistent: {0}")]
    Consistency(String),

    #[error("Dataset '{0}' is already recorded in the metadata store")]
    DuplicateKey(String),

    #[error("Field '{field}' is stored as {stored} but the record holds {found}")]
    FieldType {
        field: String,
        stored: String,
        found: String,
    },

    #[error("Metadata store is corrupt: {0}")]
    CorruptStore(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Url(#[from] url::ParseError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] rusqlite::Error),
}

impl Error {
    /// Failures that a fresh access token can plausibly fix.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            Self::Auth(_) => true,
            Self::Api { status, code, .. } => {
                matches!(status, 401 | 403) || code.as_deref() == Some("invalid_token")
            }
            _ => false,
        }
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(e: zip::result::ZipError) -> Self {
        Self::Archive(e.to_string())
    }
}
