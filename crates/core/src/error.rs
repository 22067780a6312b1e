/// Failures of a reconcile pass.
///
/// Dependency-not-ready is absent: it is an [`crate::Outcome`],
/// not an error. Invariant violations panic instead of surfacing here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{context}: {source}")]
    Kube {
        context: String,
        #[source]
        source: kube::Error,
    },
    #[error("remote {context}: {message}")]
    Remote { context: String, message: String },
    #[error("computing patch for {name}: {source}")]
    Diff {
        name: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("building {what}: {message}")]
    Build { what: String, message: String },
    #[error("status: {0}")]
    Status(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn kube(context: impl Into<String>, source: kube::Error) -> Self {
        Error::Kube { context: context.into(), source }
    }

    /// Wrap an opaque collaborator error, keeping its whole context chain in the message.
    pub fn remote(context: impl Into<String>, err: anyhow::Error) -> Self {
        Error::Remote { context: context.into(), message: format!("{err:#}") }
    }

    pub fn diff(name: impl Into<String>, source: serde_json::Error) -> Self {
        Error::Diff { name: name.into(), source }
    }

    pub fn build(what: impl Into<String>, err: anyhow::Error) -> Self {
        Error::Build { what: what.into(), message: format!("{err:#}") }
    }

    /// Network and API-server failures; everything else is a defect in the
    /// desired state or in a builder and will not heal by itself.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Kube { .. } | Error::Remote { .. })
    }
}
