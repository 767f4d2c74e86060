use std::fmt;

/// Opaque error produced by controller-author code.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizerAction {
    Add,
    Remove,
}

impl fmt::Display for FinalizerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FinalizerAction::Add => f.write_str("adding"),
            FinalizerAction::Remove => f.write_str("removing"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),
    /// Optimistic-concurrency failure; re-running the whole reconcile is safe.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("validation: {0}")]
    Validation(String),
    #[error("unable to identify resource mapping for {}", crate::gvk_key(.group, .version, .kind))]
    Mapping { group: String, version: String, kind: String },
    #[error("serialization: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("yaml: {0}")]
    Yaml(#[from] serde_yaml::Error),
    /// Returned verbatim from a delegate's reconcile or finalize.
    #[error("{0}")]
    Delegate(#[source] BoxError),
    #[error("failure {action} finalizer on {key}: {source}")]
    FinalizerUpdate { action: FinalizerAction, key: String, source: Box<Error> },
    #[error("operation cancelled")]
    Cancelled,
    #[error("kube: {0}")]
    Kube(#[source] kube::Error),
}

impl Error {
    /// Classify a kube client error: 404 and 409 become their own kinds.
    pub fn from_kube(err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ref resp) if resp.code == 404 => Error::NotFound(resp.message.clone()),
            kube::Error::Api(ref resp) if resp.code == 409 => Error::Conflict(resp.message.clone()),
            other => Error::Kube(other),
        }
    }

    pub fn delegate(err: impl Into<BoxError>) -> Self { Error::Delegate(err.into()) }

    pub fn is_not_found(&self) -> bool { matches!(self, Error::NotFound(_)) }

    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Conflict(_) => true,
            Error::FinalizerUpdate { source, .. } => source.is_conflict(),
            _ => false,
        }
    }

    /// Whether re-enqueueing the same request can succeed without anyone
    /// changing the object or the cluster schema first. Delegate errors are
    /// opaque, so they always count as retryable; a delegate that wants to
    /// stop should return `Ok` without a requeue.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Conflict(_) | Error::Cancelled | Error::Kube(_) | Error::Delegate(_) => true,
            Error::FinalizerUpdate { source, .. } => source.is_retryable(),
            Error::NotFound(_)
            | Error::Validation(_)
            | Error::Mapping { .. }
            | Error::Serialization(_)
            | Error::Yaml(_) => false,
        }
    }
}

impl From<kube::Error> for Error {
    fn from(err: kube::Error) -> Self { Error::from_kube(err) }
}
