use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CoreError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Preferences I/O error at {}: {source}", path.display())]
    PreferencesIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Preferences file {} is not valid JSON: {source}", path.display())]
    PreferencesFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}
