//! Pre-receive hook entry point.
//!
//! Git runs the provisioned hook with the bare repository as working
//! directory and one `<old> <new> <ref>` line per updated ref on stdin.
//! Each pushed branch is archived and sent through the pipeline; its
//! progress lines reach the pushing client through the hook's stdout.

use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use log::{debug, info};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;

use crate::backend::Backend;
use crate::checkout::PushContext;
use crate::config::Configuration;
use crate::pipeline::Pipeline;

/// Exit status of the hook process when any pushed ref failed to deploy.
pub const FAILURE_EXIT: i32 = 128;

const BRANCH_PREFIX: &str = "refs/heads/";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefUpdate {
    pub old: String,
    pub new: String,
    pub branch: String,
}

impl RefUpdate {
    /// Parses one pre-receive line. Returns `None` for non-branch refs.
    pub fn parse(line: &str) -> Option<Self> {
        let mut fields = line.split_whitespace();
        let old = fields.next()?;
        let new = fields.next()?;
        let branch = fields.next()?.strip_prefix(BRANCH_PREFIX)?;
        Some(Self {
            old: old.to_string(),
            new: new.to_string(),
            branch: branch.to_string(),
        })
    }

    /// A push that deletes the branch carries an all-zero new revision.
    pub fn is_delete(&self) -> bool {
        !self.new.is_empty() && self.new.bytes().all(|b| b == b'0')
    }
}

/// Runs `git archive` for `revision` in the current repository.
async fn archive(revision: &str) -> anyhow::Result<Vec<u8>> {
    let output = Command::new("git")
        .args(["archive", "--format=tar", revision])
        .output()
        .await
        .context("could not run git archive")?;
    if !output.status.success() {
        bail!(
            "git archive {} failed: {}",
            revision,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(output.stdout)
}

/// Deploys every branch named on stdin. Any failure fails the whole push.
pub async fn run(
    config: &Configuration,
    backend: Arc<dyn Backend>,
    repository: &str,
) -> anyhow::Result<()> {
    let pipeline = Pipeline::connect(config, backend)?;
    let mut stdout = tokio::io::stdout();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let Some(update) = RefUpdate::parse(&line) else {
            debug!("Ignoring ref update {:?}", line);
            continue;
        };
        debug!("{} {} -> {}", update.branch, update.old, update.new);
        if update.is_delete() {
            info!("Branch {} of {} deleted, nothing to deploy", update.branch, repository);
            continue;
        }

        let push = PushContext {
            repository: repository.to_string(),
            branch: update.branch.clone(),
            commit: update.new.clone(),
            hostname: config.hostname.clone(),
        };
        let tar = archive(&update.new).await?;
        if let Err(e) = pipeline.run(&push, &tar[..], &mut stdout).await {
            let _ = stdout.write_all(format!("-----> {}\n", e).as_bytes()).await;
            let _ = stdout.flush().await;
            return Err(anyhow!(e).context(format!("deploy of {} failed", push.app_name())));
        }
    }
    Ok(())
}
