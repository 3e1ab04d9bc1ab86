use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Message(String),

    #[error("message id must not be empty")]
    EmptyMessageId,

    #[error("an extension of type `{type_name}` is already set in this context")]
    ExtensionAlreadySet { type_name: &'static str },

    #[error("routing option `{option}` has already been set on these options")]
    OptionAlreadySet { option: &'static str },

    #[error("setting `{key}` not found")]
    SettingNotFound { key: String },

    #[error("setting `{key}` is not of type `{expected}`")]
    SettingTypeMismatch { key: String, expected: &'static str },

    #[error(
        "the settings have been locked for modifications, move any configuration code earlier in the endpoint setup"
    )]
    SettingsLocked,

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("internal error")]
    Other {
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl Error {
    #[must_use]
    pub fn message(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    #[must_use]
    pub fn other(source: impl std::error::Error + Send + Sync + 'static) -> Self {
        Self::Other {
            source: Box::new(source),
        }
    }
}

impl FromMessage for Error {
    fn from_message(message: String) -> Self {
        Self::Message(message)
    }
}

pub type ConveyorError = Error;
pub type Result<T> = std::result::Result<T, Error>;

// ── Unrecoverable marker ────────────────────────────────────────────────────

/// A processing failure that must never be retried.
///
/// Handlers and behaviors return this (usually through `anyhow`) when retrying
/// cannot change the outcome, e.g. a body that cannot be deserialized. The
/// default recoverability policy moves such messages straight to the error
/// queue.
#[derive(Error, Debug)]
#[error("{reason}")]
pub struct Unrecoverable {
    reason: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

impl Unrecoverable {
    #[must_use]
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            source: None,
        }
    }

    #[must_use]
    pub fn with_source(
        reason: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self {
            reason: reason.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

// ── Shared context trait ────────────────────────────────────────────────────

/// Trait for error types that can be constructed from a plain message string.
///
/// Implement this for your crate's error type, then invoke [`impl_context!`]
/// in your error module to get `.context()` and `.with_context()` on `Result`
/// and `Option`.
pub trait FromMessage: Sized {
    fn from_message(message: String) -> Self;
}

/// Generate a crate-local `Context` trait with `.context()` and `.with_context()`
/// methods on `Result` and `Option`.
///
/// Invoke inside a module that defines `Error: FromMessage` and
/// `type Result<T> = std::result::Result<T, Error>`.
///
/// ```ignore
/// // in crates/foo/src/error.rs
/// conveyor_common::impl_context!();
/// ```
#[macro_export]
macro_rules! impl_context {
    () => {
        pub trait Context<T> {
            fn context(self, context: impl Into<String>) -> Result<T>;
            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C;
        }

        impl<T, E: std::fmt::Display> Context<T> for std::result::Result<T, E> {
            fn context(self, context: impl Into<String>) -> Result<T> {
                let ctx = context.into();
                self.map_err(|source| {
                    <Error as $crate::FromMessage>::from_message(format!("{ctx}: {source}"))
                })
            }

            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C,
            {
                self.map_err(|source| {
                    let ctx = f().into();
                    <Error as $crate::FromMessage>::from_message(format!("{ctx}: {source}"))
                })
            }
        }

        impl<T> Context<T> for Option<T> {
            fn context(self, context: impl Into<String>) -> Result<T> {
                self.ok_or_else(|| <Error as $crate::FromMessage>::from_message(context.into()))
            }

            fn with_context<C, F>(self, f: F) -> Result<T>
            where
                C: Into<String>,
                F: FnOnce() -> C,
            {
                self.ok_or_else(|| <Error as $crate::FromMessage>::from_message(f().into()))
            }
        }
    };
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unrecoverable_exposes_source() {
        let io = std::io::Error::other("disk on fire");
        let err = Unrecoverable::with_source("cannot parse body", io);
        assert_eq!(err.to_string(), "cannot parse body");
        assert_eq!(
            std::error::Error::source(&err).unwrap().to_string(),
            "disk on fire"
        );
    }

    #[test]
    fn from_message_builds_message_variant() {
        let err = <Error as FromMessage>::from_message("boom".into());
        assert!(matches!(err, Error::Message(ref m) if m == "boom"));
    }
}
