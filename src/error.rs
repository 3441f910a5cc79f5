//! Error families for every stage of the push pipeline and its storage.

use thiserror::Error;

/// Failures surfaced by a [`crate::backend::Backend`].
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("no value found for key {0}")]
    NotFound(String),

    #[error("key must be non empty")]
    EmptyKey,

    #[error("backend configuration error: {0}")]
    Config(String),

    #[error("backend io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not (de)serialize record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("remote store error: {0}")]
    Remote(String),
}

impl BackendError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::NotFound(_))
    }
}

impl From<reqwest::Error> for BackendError {
    fn from(err: reqwest::Error) -> Self {
        BackendError::Remote(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error("could not read repository archive: {0}")]
    ReadFailure(#[source] std::io::Error),

    #[error("malformed repository archive: {0}")]
    MalformedArchive(#[source] std::io::Error),

    #[error("this project does not have a Dockerfile or a compose file")]
    NoBuildableProject,
}

/// Failures talking to the container daemon.
#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("container daemon unreachable: {0}")]
    Unreachable(String),

    #[error("image build failed:\n{log}")]
    BuildFailed { log: String },

    #[error("no image found for {0} after build")]
    NoImageFound(String),

    #[error("could not launch container: {0}")]
    LaunchFailed(String),

    #[error("docker compose failed: {0}")]
    Compose(String),

    #[error("could not take the deploy lock for {name}: {source}")]
    Lock {
        name: String,
        #[source]
        source: std::io::Error,
    },
}

impl From<bollard::errors::Error> for DaemonError {
    fn from(err: bollard::errors::Error) -> Self {
        DaemonError::Unreachable(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("could not write proxy configuration {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not enable proxy configuration {path}: {source}")]
    Symlink {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not remove proxy configuration {path}: {source}")]
    Remove {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("proxy reload failed: {0}")]
    Reload(String),
}

/// Failures preparing a bare repository for a push.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("repository name must end with \".git\" and cannot be empty: {0:?}")]
    InvalidName(String),

    #[error("unsupported command: {0:?}")]
    UnsupportedCommand(String),

    #[error("repository io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not create remote repository: {0}")]
    GitInit(String),
}

/// Any failure of the checkout → deploy → publish sequence.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Archive(#[from] CheckoutError),

    #[error(transparent)]
    Daemon(#[from] DaemonError),

    #[error(transparent)]
    Publish(#[from] PublishError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("pushes to branch {0:?} are not accepted (master only)")]
    BranchRejected(String),

    #[error("could not write push status: {0}")]
    Status(#[source] std::io::Error),
}
