//! Exec command parsing and bare repository provisioning.

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;

use log::info;
use tokio::process::Command;

use crate::config::{Configuration, CONFIG_PATH_ENV};
use crate::error::ProvisionError;

const RECEIVE_PACK: [&str; 2] = ["git-receive-pack", "git receive-pack"];
const GIT_SUFFIX: &str = ".git";
const DATA_DIR_ENV: &str = "DOCKHAND_DATA_DIR";

/// A validated `git-receive-pack '<repo>'` request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivePack {
    /// Repository path relative to the git root, e.g. `demo.git`.
    pub repository: String,
    /// The command exactly as the client sent it.
    pub original: String,
}

/// Parses an exec payload. Only receive-pack is served.
pub fn parse_exec(command: &str) -> Result<ReceivePack, ProvisionError> {
    let trimmed = command.trim();
    let Some(args) = RECEIVE_PACK
        .iter()
        .find_map(|program| trimmed.strip_prefix(program))
        .filter(|rest| rest.starts_with(char::is_whitespace))
    else {
        return Err(ProvisionError::UnsupportedCommand(trimmed.to_string()));
    };

    let repository = last_quoted(args)
        .unwrap_or_else(|| args.split_whitespace().last().unwrap_or(""))
        .trim_start_matches('/')
        .to_string();
    validate_name(&repository)?;

    Ok(ReceivePack {
        repository,
        original: trimmed.to_string(),
    })
}

fn last_quoted(s: &str) -> Option<&str> {
    let end = s.rfind('\'')?;
    let start = s[..end].rfind('\'')?;
    Some(&s[start + 1..end])
}

/// The final segment must end in `.git` and keep a non-blank stem; the
/// path must stay below the git root.
pub fn validate_name(repository: &str) -> Result<(), ProvisionError> {
    let invalid = || ProvisionError::InvalidName(repository.to_string());

    let path = Path::new(repository);
    if !path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(invalid());
    }

    let last = path.file_name().and_then(|n| n.to_str()).ok_or_else(invalid)?;
    let stem = last.strip_suffix(GIT_SUFFIX).ok_or_else(invalid)?;
    if stem.trim().is_empty() {
        return Err(invalid());
    }
    Ok(())
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Body of the pre-receive hook installed into every repository.
///
/// Git runs hooks from inside the repository, so every path handed to the
/// hook must be absolute.
#[derive(Debug, Clone)]
pub struct HookScript {
    exe: PathBuf,
    config: Option<PathBuf>,
    data_dir: PathBuf,
}

impl HookScript {
    pub fn new(
        exe: impl Into<PathBuf>,
        config: Option<PathBuf>,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            exe: exe.into(),
            config,
            data_dir: data_dir.into(),
        }
    }

    /// Hooks call back into the running binary. `data_dir` must exist.
    pub fn current(config: &Configuration) -> std::io::Result<Self> {
        Ok(Self::new(
            std::env::current_exe()?,
            config.source.clone(),
            std::fs::canonicalize(&config.data_dir)?,
        ))
    }

    pub fn render(&self, repository: &str) -> String {
        let mut script = String::from("#!/bin/sh\nset -e\n");
        if let Some(config) = &self.config {
            script.push_str(&format!(
                "export {}={}\n",
                CONFIG_PATH_ENV,
                shell_quote(&config.to_string_lossy())
            ));
        }
        script.push_str(&format!(
            "export {}={}\n",
            DATA_DIR_ENV,
            shell_quote(&self.data_dir.to_string_lossy())
        ));
        script.push_str(&format!(
            "exec {} hook {}\n",
            shell_quote(&self.exe.to_string_lossy()),
            shell_quote(repository)
        ));
        script
    }
}

/// Makes sure `<root>/<repository>` is a bare repository with our hook.
/// Existing paths are left alone. Returns the absolute repository path.
pub async fn provision(
    root: &Path,
    repository: &str,
    hook: &HookScript,
) -> Result<PathBuf, ProvisionError> {
    validate_name(repository)?;
    let path = root.join(repository);

    if !tokio::fs::try_exists(&path).await? {
        tokio::fs::create_dir_all(&path).await?;
        if let Err(e) = init_bare(&path, repository, hook).await {
            let _ = tokio::fs::remove_dir_all(&path).await;
            return Err(e);
        }
        info!("Provisioned repository {}", path.display());
    }

    Ok(tokio::fs::canonicalize(&path).await?)
}

async fn init_bare(path: &Path, repository: &str, hook: &HookScript) -> Result<(), ProvisionError> {
    let output = Command::new("git")
        .arg("init")
        .arg("--bare")
        .arg(path)
        .stdin(Stdio::null())
        .output()
        .await?;
    if !output.status.success() {
        return Err(ProvisionError::GitInit(
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }

    let hooks = path.join("hooks");
    tokio::fs::create_dir_all(&hooks).await?;
    let script = hooks.join("pre-receive");
    tokio::fs::write(&script, hook.render(repository)).await?;
    set_executable(&script).await?;
    Ok(())
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// `git receive-pack` for an already provisioned repository, with every
/// stdio stream piped.
pub fn receive_pack(path: &Path, request: &ReceivePack) -> Command {
    let mut cmd = Command::new("git");
    cmd.arg("receive-pack")
        .arg(path)
        .env("REPO_NAME", &request.repository)
        .env("SSH_ORIGINAL_COMMAND", &request.original)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn receive_pack_takes_last_quoted_token() {
        let req = parse_exec("git-receive-pack '/team/demo.git'").unwrap();
        assert_eq!(req.repository, "team/demo.git");

        let req = parse_exec("git receive-pack 'demo.git'\n").unwrap();
        assert_eq!(req.repository, "demo.git");
        assert_eq!(req.original, "git receive-pack 'demo.git'");

        let req = parse_exec("git-receive-pack demo.git").unwrap();
        assert_eq!(req.repository, "demo.git");
    }

    #[test]
    fn other_commands_are_unsupported() {
        for cmd in ["git-upload-pack 'demo.git'", "ls -la", "git-receive-packx 'a.git'", ""] {
            assert!(matches!(
                parse_exec(cmd),
                Err(ProvisionError::UnsupportedCommand(_))
            ));
        }
    }

    #[test]
    fn names_must_end_in_git_with_a_stem() {
        assert!(validate_name("demo.git").is_ok());
        assert!(validate_name("team/demo.git").is_ok());
        for bad in ["demo", ".git", "  .git", "", "../demo.git", "/srv/demo.git", "a/../b.git"] {
            assert!(
                matches!(validate_name(bad), Err(ProvisionError::InvalidName(_))),
                "{:?} should be rejected",
                bad
            );
        }
    }

    #[tokio::test]
    async fn invalid_name_leaves_no_trace() {
        let root = tempfile::tempdir().unwrap();
        let hook = HookScript::new("/usr/local/bin/dockhand", None, "/var/lib/dockhand");

        let err = provision(root.path(), "demo", &hook).await.unwrap_err();
        assert!(matches!(err, ProvisionError::InvalidName(_)));
        assert_eq!(std::fs::read_dir(root.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn existing_repository_is_left_alone() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(root.path().join("demo.git")).unwrap();
        let hook = HookScript::new("/usr/local/bin/dockhand", None, "/var/lib/dockhand");

        let path = provision(root.path(), "demo.git", &hook).await.unwrap();
        assert!(path.is_absolute());
        assert!(!path.join("hooks").exists());
    }

    #[test]
    fn hook_calls_back_with_config() {
        let hook = HookScript::new(
            "/usr/local/bin/dockhand",
            Some(PathBuf::from("/etc/dockhand.toml")),
            "/var/lib/dockhand",
        );
        let script = hook.render("demo.git");
        assert!(script.starts_with("#!/bin/sh\n"));
        assert!(script.contains("export DOCKHAND_CONFIG='/etc/dockhand.toml'\n"));
        assert!(script.contains("export DOCKHAND_DATA_DIR='/var/lib/dockhand'\n"));
        assert!(script.ends_with("exec '/usr/local/bin/dockhand' hook 'demo.git'\n"));
    }

    #[test]
    fn quotes_in_paths_are_escaped() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
