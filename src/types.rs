//! Data structures shared by the push pipeline and its stores.
//!
//! `Repository` only lives for the duration of one push; `AppHeader` and
//! `PublicKey` are persisted as JSON records through the backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// How a pushed tree gets built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProjectKind {
    None,
    Dockerfile,
    Compose,
}

impl ProjectKind {
    pub const DOCKERFILE: &'static str = "Dockerfile";
    pub const COMPOSE_FILES: [&'static str; 4] = [
        "docker-compose.yml",
        "docker-compose.yaml",
        "compose.yml",
        "compose.yaml",
    ];

    /// Classifies a top-level archive entry, if it is a build marker.
    pub fn from_marker(path: &str) -> Option<Self> {
        if path == Self::DOCKERFILE {
            Some(ProjectKind::Dockerfile)
        } else if Self::COMPOSE_FILES.contains(&path) {
            Some(ProjectKind::Compose)
        } else {
            None
        }
    }
}

impl std::fmt::Display for ProjectKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProjectKind::None => "none",
            ProjectKind::Dockerfile => "dockerfile",
            ProjectKind::Compose => "compose",
        };
        f.write_str(s)
    }
}

/// A checked-out push, ready to be built.
#[derive(Debug, Clone)]
pub struct Repository {
    /// App identity: repository name, with `_<branch>` for non-master pushes.
    pub name: String,
    pub branch: String,
    pub commit: String,
    /// Archive entry paths in archive order.
    pub files: Vec<String>,
    pub kind: ProjectKind,
    /// Path of the marker file that decided `kind`.
    pub target_file: Option<String>,
    pub domain: String,
    /// The raw tar payload, kept for the image build.
    pub archive: Vec<u8>,
}

/// Where a deployed app stands with respect to the reverse proxy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RouteState {
    /// The unit runs but no proxy route points at it (yet).
    Unpublished { reason: String },
    Published { url: String },
    /// The unit has no binding for port 80, so nothing was published.
    NoHttpPort,
}

/// Identifies one deployed, running app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppHeader {
    pub name: String,
    pub repository: String,
    pub branch: String,
    pub commit: String,
    pub public_url: String,
    pub container_id: String,
    pub status: String,
    pub start_time: DateTime<Utc>,
    pub route: RouteState,
}

/// An SSH public key allowed to push.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKey {
    pub fingerprint: String,
    /// Key in wire encoding.
    pub key: Vec<u8>,
    pub comment: String,
}

impl PublicKey {
    pub fn new(key: Vec<u8>, comment: impl Into<String>) -> Self {
        Self {
            fingerprint: fingerprint(&key),
            key,
            comment: comment.into(),
        }
    }
}

/// SHA-256 of the key's wire encoding, formatted as colon separated hex.
pub fn fingerprint(key_bytes: &[u8]) -> String {
    let digest = Sha256::digest(key_bytes);
    hex::encode(digest)
        .as_bytes()
        .chunks(2)
        .map(|pair| String::from_utf8_lossy(pair).into_owned())
        .collect::<Vec<_>>()
        .join(":")
}
