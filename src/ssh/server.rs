//! russh session handling for git pushes.
//!
//! Only the `git` user gets in. Each session channel serves exactly one
//! exec request, which is piped to a `git receive-pack` subprocess; its exit
//! code is reported back as the channel exit status (0 or 1).

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::anyhow;
use async_trait::async_trait;
use log::{debug, info, warn};
use russh::server::{Auth, Handle, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodSet, Pty};
use russh_keys::key::{KeyPair, PublicKey};
use russh_keys::PublicKeyBase64;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::process::{Child, ChildStdin};
use tokio::sync::{mpsc, oneshot};

use super::git::{self, HookScript};
use crate::error::{BackendError, ProvisionError};
use crate::store::KeyStore;
use crate::types::fingerprint;

/// The only user allowed to push.
pub const GIT_USER: &str = "git";

pub const HOST_KEY_FILE: &str = "ssh_host_ed25519_key";

const STDERR_EXT: u32 = 1;

/// Shared by every session of one server.
pub struct GitContext {
    pub keys: KeyStore,
    pub git_path: PathBuf,
    pub hook: HookScript,
}

/// Loads the host key from `data_dir`, generating and saving one on first
/// start.
pub fn host_key(data_dir: &Path) -> anyhow::Result<KeyPair> {
    let path = data_dir.join(HOST_KEY_FILE);
    if path.exists() {
        debug!("Loading host key from {}", path.display());
        return Ok(russh_keys::load_secret_key(&path, None)?);
    }

    let key = KeyPair::generate_ed25519().ok_or_else(|| anyhow!("could not generate host key"))?;
    std::fs::create_dir_all(data_dir)?;
    let mut file = std::fs::File::create(&path)?;
    russh_keys::encode_pkcs8_pem(&key, &mut file)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    }
    info!("Generated host key {}", path.display());
    Ok(key)
}

pub fn server_config(key: KeyPair) -> russh::server::Config {
    russh::server::Config {
        methods: MethodSet::PUBLICKEY,
        auth_rejection_time: std::time::Duration::from_secs(1),
        keys: vec![key],
        ..Default::default()
    }
}

/// User must be `git`; once any key is registered, the offered key must be
/// one of them.
pub async fn authorize(keys: &KeyStore, user: &str, key: &[u8]) -> Result<bool, BackendError> {
    if user != GIT_USER {
        return Ok(false);
    }
    keys.is_allowed(&fingerprint(key)).await
}

/// Accepts connections until `shutdown` fires. Running sessions are left
/// to finish on their own.
pub async fn serve(
    listener: TcpListener,
    config: Arc<russh::server::Config>,
    ctx: Arc<GitContext>,
    mut shutdown: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = &mut shutdown => {
                debug!("SSH accept loop stopping");
                break;
            }
            accepted = listener.accept() => {
                let (socket, peer) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!("SSH accept failed: {}", e);
                        continue;
                    }
                };
                let _ = socket.set_nodelay(true);
                let handler = GitSession::new(Arc::clone(&ctx), peer);
                let config = Arc::clone(&config);
                tokio::spawn(async move {
                    match russh::server::run_stream(config, socket, handler).await {
                        Ok(session) => {
                            if let Err(e) = session.await {
                                debug!("SSH session with {} ended: {}", peer, e);
                            }
                        }
                        Err(e) => debug!("SSH handshake with {} failed: {}", peer, e),
                    }
                });
            }
        }
    }
}

pub struct GitSession {
    ctx: Arc<GitContext>,
    peer: SocketAddr,
    stdins: HashMap<ChannelId, mpsc::UnboundedSender<Vec<u8>>>,
}

impl GitSession {
    pub fn new(ctx: Arc<GitContext>, peer: SocketAddr) -> Self {
        Self {
            ctx,
            peer,
            stdins: HashMap::new(),
        }
    }

    async fn start(
        &mut self,
        channel: ChannelId,
        command: &str,
        handle: Handle,
    ) -> Result<(), ProvisionError> {
        let request = git::parse_exec(command)?;
        let path = git::provision(&self.ctx.git_path, &request.repository, &self.ctx.hook).await?;

        let mut child = git::receive_pack(&path, &request).spawn()?;
        if let Some(stdin) = child.stdin.take() {
            self.stdins.insert(channel, feed(stdin));
        }
        info!("{} pushing to {}", self.peer, request.repository);
        tokio::spawn(relay(handle, channel, child));
        Ok(())
    }

    fn decline(&self, channel: ChannelId, request: &str, session: &mut Session) {
        debug!("{} declined {} request on {:?}", self.peer, request, channel);
        session.channel_failure(channel);
    }
}

/// Forwards queued client data to the subprocess. Dropping the sender
/// closes its stdin.
fn feed(mut stdin: ChildStdin) -> mpsc::UnboundedSender<Vec<u8>> {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if stdin.write_all(&chunk).await.is_err() {
                break;
            }
        }
        let _ = stdin.shutdown().await;
    });
    tx
}

async fn forward<R: AsyncRead + Unpin>(
    handle: &Handle,
    channel: ChannelId,
    reader: Option<R>,
    ext: Option<u32>,
) {
    let Some(mut reader) = reader else {
        return;
    };
    let mut buf = vec![0u8; 32 * 1024];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let data = CryptoVec::from_slice(&buf[..n]);
        let sent = match ext {
            Some(code) => handle.extended_data(channel, code, data).await,
            None => handle.data(channel, data).await,
        };
        if sent.is_err() {
            break;
        }
    }
}

/// Pipes the subprocess output to the channel, then reports its exit code
/// and closes the channel.
async fn relay(handle: Handle, channel: ChannelId, mut child: Child) {
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    tokio::join!(
        forward(&handle, channel, stdout, None),
        forward(&handle, channel, stderr, Some(STDERR_EXT)),
    );

    let status = match child.wait().await {
        Ok(status) if status.success() => 0,
        Ok(status) => {
            info!("git receive-pack exited with {}", status);
            1
        }
        Err(e) => {
            warn!("Could not wait for git receive-pack: {}", e);
            1
        }
    };
    let _ = handle.exit_status_request(channel, status).await;
    let _ = handle.eof(channel).await;
    let _ = handle.close(channel).await;
}

#[async_trait]
impl russh::server::Handler for GitSession {
    type Error = anyhow::Error;

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        let allowed = authorize(&self.ctx.keys, user, &key.public_key_bytes()).await?;
        if allowed {
            info!("{} authenticated as {} ({})", self.peer, user, key.fingerprint());
            Ok(Auth::Accept)
        } else {
            info!("{} rejected: user {} with key {}", self.peer, user, key.fingerprint());
            Ok(Auth::Reject {
                proceed_with_methods: None,
            })
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        debug!("{} opened session channel {:?}", self.peer, channel.id());
        Ok(true)
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();
        debug!("{} exec {:?}", self.peer, command);
        session.channel_success(channel);

        if let Err(e) = self.start(channel, &command, session.handle()).await {
            warn!("{} exec {:?} failed: {}", self.peer, command, e);
            session.extended_data(
                channel,
                STDERR_EXT,
                CryptoVec::from_slice(format!("{}\n", e).as_bytes()),
            );
            session.exit_status_request(channel, 1);
            session.eof(channel);
            session.close(channel);
        }
        Ok(())
    }

    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(stdin) = self.stdins.get(&channel) {
            if stdin.send(data.to_vec()).is_err() {
                self.stdins.remove(&channel);
            }
        }
        Ok(())
    }

    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.stdins.remove(&channel);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.stdins.remove(&channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.decline(channel, "shell", session);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.decline(channel, name, session);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        _variable_name: &str,
        _variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.decline(channel, "env", session);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn pty_request(
        &mut self,
        channel: ChannelId,
        _term: &str,
        _col_width: u32,
        _row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.decline(channel, "pty", session);
        Ok(())
    }
}
