//! Turns the tar stream of a pushed commit into a [`Repository`].
//!
//! The archive is drained into memory once and then scanned in a single
//! pass. Classification is applied as each entry is seen: a compose file
//! always wins, and a later `Dockerfile` never downgrades it.

use std::io::{Cursor, Read};
use std::path::Path;

use log::debug;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::CheckoutError;
use crate::types::{ProjectKind, Repository};

pub const MASTER_BRANCH: &str = "master";
const CNAME_FILE: &str = "CNAME";
const PAX_GLOBAL_HEADER: &str = "pax_global_header";

/// Routing metadata for one push.
#[derive(Debug, Clone)]
pub struct PushContext {
    /// The pushed repository path, e.g. `demo.git` or `team/demo.git`.
    pub repository: String,
    pub branch: String,
    pub commit: String,
    pub hostname: String,
}

impl PushContext {
    /// Bare repository name without directories or the `.git` suffix.
    pub fn repository_name(&self) -> String {
        let trimmed = self.repository.trim().trim_end_matches('/');
        let base = Path::new(trimmed)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or(trimmed);
        base.strip_suffix(".git").unwrap_or(base).to_string()
    }

    /// App identity; non-master branches get a `_<branch>` suffix.
    pub fn app_name(&self) -> String {
        let name = self.repository_name();
        if self.branch == MASTER_BRANCH {
            name
        } else {
            format!("{}_{}", name, self.branch.replace('/', "-"))
        }
    }
}

/// Reads the whole archive from `reader`, then scans it.
pub async fn checkout<R>(mut reader: R, push: &PushContext) -> Result<Repository, CheckoutError>
where
    R: AsyncRead + Unpin,
{
    let mut archive = Vec::new();
    reader
        .read_to_end(&mut archive)
        .await
        .map_err(CheckoutError::ReadFailure)?;
    scan(archive, push)
}

/// Scans an archive that is already in memory.
pub fn scan(archive: Vec<u8>, push: &PushContext) -> Result<Repository, CheckoutError> {
    let name = push.app_name();
    debug!("Processing {} ({} bytes)", name, archive.len());

    let mut files = Vec::new();
    let mut kind = ProjectKind::None;
    let mut target_file = None;
    let mut domain = format!("{}.{}", name, push.hostname);

    {
        let mut tar = tar::Archive::new(Cursor::new(&archive));
        let entries = tar.entries().map_err(CheckoutError::MalformedArchive)?;

        for entry in entries {
            let mut entry = entry.map_err(CheckoutError::MalformedArchive)?;
            let header = entry.header();
            if header.entry_type().is_dir() || header.entry_type().is_pax_global_extensions() {
                continue;
            }

            let path = entry
                .path()
                .map_err(CheckoutError::MalformedArchive)?
                .to_string_lossy()
                .into_owned();
            if path == PAX_GLOBAL_HEADER {
                continue;
            }

            let top_level = path.strip_prefix("./").unwrap_or(&path).to_string();

            if top_level == CNAME_FILE {
                let mut contents = String::new();
                entry
                    .read_to_string(&mut contents)
                    .map_err(CheckoutError::MalformedArchive)?;
                domain = strip_one_newline(&contents).to_string();
                debug!("Found a CNAME file, using the domain {}", domain);
            } else {
                match ProjectKind::from_marker(&top_level) {
                    Some(ProjectKind::Compose) => {
                        debug!("Found a compose file at {}", path);
                        kind = ProjectKind::Compose;
                        target_file = Some(path.clone());
                    }
                    Some(ProjectKind::Dockerfile) if kind != ProjectKind::Compose => {
                        debug!("Found a Dockerfile at {}", path);
                        kind = ProjectKind::Dockerfile;
                        target_file = Some(path.clone());
                    }
                    _ => {}
                }
            }

            files.push(path);
        }
    }

    if kind == ProjectKind::None {
        debug!("Couldn't find a Dockerfile or compose file in {}", name);
        return Err(CheckoutError::NoBuildableProject);
    }

    Ok(Repository {
        name,
        branch: push.branch.clone(),
        commit: push.commit.clone(),
        files,
        kind,
        target_file,
        domain,
        archive,
    })
}

fn strip_one_newline(s: &str) -> &str {
    match s.strip_suffix('\n') {
        Some(rest) => rest.strip_suffix('\r').unwrap_or(rest),
        None => s,
    }
}
