//! Error types for the vsync engine
//!
//! Errors carry the identities involved so a failed reconciliation can be
//! traced back to the virtual and host objects without extra log lookups.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for vsync operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// An unmanaged host object occupies the name a virtual object translates to
    #[error("conflict: cannot sync virtual object {virtual_key} as unmanaged physical object {host_key} exists with desired name")]
    Conflict {
        /// Identity of the virtual object being synced
        virtual_key: String,
        /// Identity of the unmanaged host object
        host_key: String,
    },

    /// Two virtual identities would resolve to one host identity (or vice versa)
    #[error("there is already another name mapping {existing} that conflicts with {requested}")]
    NameMappingConflict {
        /// The mapping already recorded, rendered as `from -> to`
        existing: String,
        /// The mapping that was rejected, rendered as `from -> to`
        requested: String,
    },

    /// A lifecycle hook aborted the reconciliation
    #[error("hook {hook} of syncer {syncer} failed: {message}")]
    Hook {
        /// Name of the synchronizer
        syncer: String,
        /// Hook that failed (start, initialize, up-sync, ...)
        hook: String,
        /// Description of what failed
        message: String,
    },

    /// Translation between virtual and host shape failed
    #[error("translation error for {kind}: {message}")]
    Translation {
        /// Kind being translated
        kind: String,
        /// Description of what failed
        message: String,
    },

    /// Name mapping backend error
    #[error("mapping backend error: {message}")]
    Backend {
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "dispatch", "store", "watcher")
        context: String,
    },
}

impl Error {
    /// Create an ownership conflict error naming both identities
    pub fn conflict(virtual_key: impl ToString, host_key: impl ToString) -> Self {
        Self::Conflict {
            virtual_key: virtual_key.to_string(),
            host_key: host_key.to_string(),
        }
    }

    /// Create a name mapping conflict error
    pub fn name_mapping_conflict(existing: impl Into<String>, requested: impl Into<String>) -> Self {
        Self::NameMappingConflict {
            existing: existing.into(),
            requested: requested.into(),
        }
    }

    /// Create a hook error
    pub fn hook(
        syncer: impl Into<String>,
        hook: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Hook {
            syncer: syncer.into(),
            hook: hook.into(),
            message: msg.into(),
        }
    }

    /// Create a translation error for a kind
    pub fn translation(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Translation {
            kind: kind.into(),
            message: msg.into(),
        }
    }

    /// Create a backend error
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// HTTP status code of the underlying API error, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Error::Kube {
                source: kube::Error::Api(ae),
            } => Some(ae.code),
            _ => None,
        }
    }

    /// True if the API reported that the object does not exist
    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(404)
    }

    /// True if a create failed because the object already exists
    pub fn is_already_exists(&self) -> bool {
        matches!(
            self,
            Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409 && ae.reason == "AlreadyExists"
        )
    }

    /// True if a write lost an optimistic-concurrency race
    pub fn is_write_conflict(&self) -> bool {
        matches!(
            self,
            Error::Kube { source: kube::Error::Api(ae) } if ae.code == 409 && ae.reason == "Conflict"
        )
    }

    /// Check if this error is retryable
    ///
    /// Ownership and mapping conflicts need operator intervention, serialization
    /// and translation errors need a code or config fix. Version conflicts on
    /// write and server-side failures are transient.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => ae.code == 409 || ae.code == 429 || ae.code >= 500,
                _ => true,
            },
            Error::Conflict { .. } => false,
            Error::NameMappingConflict { .. } => false,
            Error::Hook { .. } => true,
            Error::Translation { .. } => false,
            Error::Backend { .. } => true,
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Short label used for metrics (`transient` or `permanent`)
    pub fn error_type(&self) -> &'static str {
        if self.is_retryable() {
            "transient"
        } else {
            "permanent"
        }
    }
}
