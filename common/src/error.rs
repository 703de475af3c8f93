//! Error handling for the ferry-common crate.

use thiserror::Error;

/// Common error type shared by the object-store layer and the core crate.
///
/// Every variant carries a human readable message and, optionally, the
/// underlying failure as an `anyhow::Error` so the original cause stays
/// reachable through `std::error::Error::source`.
#[derive(Error, Debug)]
pub enum CommonError {
    #[error("Storage operation failed: {message}")]
    StorageError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Resource not found: {message}")]
    NotFoundError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Invalid configuration: {message}")]
    ConfigurationError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Invalid URI: {message}")]
    InvalidUriError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("IO operation failed: {message}")]
    IoError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Network operation failed: {message}")]
    NetworkError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Permission denied: {message}")]
    PermissionError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    #[error("Internal error: {message}")]
    InternalError {
        message: String,
        #[source]
        source: Option<anyhow::Error>,
    },
}

/// Result type alias for common operations.
pub type Result<T> = std::result::Result<T, CommonError>;

macro_rules! constructors {
    ($($variant:ident => $plain:ident, $with_source:ident;)*) => {
        impl CommonError {
            $(
                #[doc = concat!("Create a `", stringify!($variant), "` with a custom message.")]
                pub fn $plain<S: Into<String>>(message: S) -> Self {
                    Self::$variant {
                        message: message.into(),
                        source: None,
                    }
                }

                #[doc = concat!("Create a `", stringify!($variant), "` with a custom message and source error.")]
                pub fn $with_source<S: Into<String>, E: Into<anyhow::Error>>(
                    message: S,
                    source: E,
                ) -> Self {
                    Self::$variant {
                        message: message.into(),
                        source: Some(source.into()),
                    }
                }
            )*
        }
    };
}

constructors! {
    StorageError => storage_error, storage_error_with_source;
    NotFoundError => not_found_error, not_found_error_with_source;
    ConfigurationError => configuration_error, configuration_error_with_source;
    InvalidUriError => invalid_uri_error, invalid_uri_error_with_source;
    IoError => io_error, io_error_with_source;
    NetworkError => network_error, network_error_with_source;
    PermissionError => permission_error, permission_error_with_source;
    InternalError => internal_error, internal_error_with_source;
}

impl CommonError {
    /// Returns true for the not-found variant.
    pub fn is_not_found(&self) -> bool {
        matches!(self, CommonError::NotFoundError { .. })
    }
}

impl From<object_store::Error> for CommonError {
    fn from(error: object_store::Error) -> Self {
        match error {
            object_store::Error::NotFound { ref path, .. } => {
                let message = format!("object '{}' does not exist", path);
                CommonError::not_found_error_with_source(message, error)
            }
            object_store::Error::PermissionDenied { ref path, .. }
            | object_store::Error::Unauthenticated { ref path, .. } => {
                let message = format!("access to '{}' was refused", path);
                CommonError::permission_error_with_source(message, error)
            }
            other => CommonError::storage_error_with_source("Object store operation failed", other),
        }
    }
}

/// Context helpers for adding rich context to errors.
pub mod context {
    use super::*;

    /// Extension trait for adding context to Results.
    pub trait ErrorContext<T> {
        /// Wrap the error as a storage error.
        fn with_storage_context<F>(self, f: F) -> Result<T>
        where
            F: FnOnce() -> String;

        /// Wrap the error as an IO error.
        fn with_io_context<F>(self, f: F) -> Result<T>
        where
            F: FnOnce() -> String;
    }

    impl<T, E> ErrorContext<T> for std::result::Result<T, E>
    where
        E: Into<anyhow::Error>,
    {
        fn with_storage_context<F>(self, f: F) -> Result<T>
        where
            F: FnOnce() -> String,
        {
            self.map_err(|e| CommonError::storage_error_with_source(f(), e.into()))
        }

        fn with_io_context<F>(self, f: F) -> Result<T>
        where
            F: FnOnce() -> String,
        {
            self.map_err(|e| CommonError::io_error_with_source(f(), e.into()))
        }
    }
}

pub use context::ErrorContext;

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::error::Error;

    #[test]
    fn test_error_creation() {
        let storage_error = CommonError::storage_error("upload failed");
        assert!(matches!(storage_error, CommonError::StorageError { .. }));

        let not_found = CommonError::not_found_error_with_source(
            "bucket missing",
            anyhow!("404 from server"),
        );
        assert!(not_found.is_not_found());
        assert!(not_found.source().is_some());
    }

    #[test]
    fn test_object_store_not_found_maps_to_not_found() {
        let err = object_store::Error::NotFound {
            path: "work/staged.parquet".to_string(),
            source: anyhow!("no such key").into(),
        };
        let common: CommonError = err.into();
        assert!(common.is_not_found());
        assert!(common.to_string().contains("work/staged.parquet"));
    }

    #[test]
    fn test_error_context_extension() {
        let result: std::result::Result<(), std::io::Error> = Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "file not found",
        ));

        let common_result = result.with_io_context(|| "Failed to read staged file".to_string());
        assert!(matches!(
            common_result.unwrap_err(),
            CommonError::IoError { .. }
        ));
    }

    #[test]
    fn test_error_display_includes_message() {
        let err = CommonError::network_error("connection reset");
        assert_eq!(
            err.to_string(),
            "Network operation failed: connection reset"
        );
    }
}
