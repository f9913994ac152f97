//! Privileged end of the helper channel.
//!
//! Any client that can open the socket is served; access control is the
//! socket file's ownership and mode.

use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use common::ActionResult;
use common::protocol::{self, HelperRequest, HelperResponse};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixListener;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::HELPER_VERSION;
use crate::orchestrator::MountOrchestrator;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct HelperServer {
    listener: UnixListener,
    path: PathBuf,
    orchestrator: Arc<MountOrchestrator>,
}

impl HelperServer {
    /// Bind the socket at `path`, replacing a stale socket left by a
    /// previous run.
    pub fn bind(
        path: impl Into<PathBuf>,
        mode: u32,
        orchestrator: Arc<MountOrchestrator>,
    ) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        match std::fs::symlink_metadata(&path) {
            Ok(meta) if meta.file_type().is_socket() => {
                std::fs::remove_file(&path)
                    .with_context(|| format!("failed to remove stale socket {}", path.display()))?;
            }
            Ok(_) => bail!("{} exists and is not a socket", path.display()),
            Err(_) => {}
        }

        let listener = UnixListener::bind(&path)
            .with_context(|| format!("failed to bind {}", path.display()))?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
            .with_context(|| format!("failed to set mode of {}", path.display()))?;
        info!("helper listening on {}", path.display());

        Ok(Self {
            listener,
            path,
            orchestrator,
        })
    }

    /// Serve until `shutdown` resolves, then let running requests finish
    /// and remove the socket.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        debug!("client connected");
                        connections.spawn(serve_connection(stream, self.orchestrator.clone()));
                    }
                    Err(e) => {
                        // e.g. EMFILE; give open connections a chance to finish
                        warn!("failed to accept connection: {e}");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(done) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = done {
                        error!("connection task failed: {e}");
                    }
                }
            }
        }

        info!("helper shutting down");
        drop(self.listener);
        // two steps plus slack
        let grace = self.orchestrator.step_timeout() * 2 + Duration::from_secs(5);
        let drained = tokio::time::timeout(grace, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!("abandoning {} open connections", connections.len());
        }

        std::fs::remove_file(&self.path)
            .with_context(|| format!("failed to remove {}", self.path.display()))
    }
}

/// Answer every request of one client until it hangs up.
pub async fn serve_connection<S>(stream: S, orchestrator: Arc<MountOrchestrator>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = protocol::framed(stream);
    while let Some(frame) = framed.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(e) => {
                warn!("dropping connection: {e}");
                return;
            }
        };
        let response = match HelperRequest::from_bytes(&frame) {
            Ok(request) => dispatch(request, orchestrator.clone()).await,
            Err(e) => {
                warn!("undecodable request: {e}");
                HelperResponse::error(format!("invalid request: {e}"))
            }
        };
        let bytes = match response.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("failed to encode response: {e}");
                return;
            }
        };
        if let Err(e) = framed.send(bytes).await {
            warn!("failed to answer client: {e}");
            return;
        }
    }
    debug!("client disconnected");
}

async fn dispatch(request: HelperRequest, orchestrator: Arc<MountOrchestrator>) -> HelperResponse {
    match request {
        HelperRequest::GetVersion => HelperResponse::Version(HELPER_VERSION.to_string()),
        HelperRequest::RemountReadWrite(request) => {
            // Own task: the sequence completes even if the client goes away,
            // and a panic still produces an answer.
            let sequence =
                tokio::spawn(async move { orchestrator.remount_read_write(&request).await });
            match sequence.await {
                Ok(result) => HelperResponse::Remount(result),
                Err(e) => {
                    error!("remount task failed: {e}");
                    HelperResponse::Remount(ActionResult::failed(format!("Execution error: {e}")))
                }
            }
        }
    }
}
