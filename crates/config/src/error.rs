use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to read {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported config format: .{extension}")]
    UnsupportedFormat { extension: String },

    #[error("invalid TOML")]
    Toml(#[from] toml::de::Error),

    #[error("invalid YAML")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid JSON")]
    Json(#[from] serde_json::Error),

    #[error("invalid duration `{input}`: {reason}")]
    InvalidDuration { input: String, reason: String },
}

impl Error {
    #[must_use]
    pub fn invalid_duration(input: &str, reason: impl Into<String>) -> Self {
        Self::InvalidDuration {
            input: input.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
