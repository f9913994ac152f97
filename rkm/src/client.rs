//! Unprivileged end of the helper channel.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use common::config::RkmConfig;
use common::protocol::{self, HelperRequest, HelperResponse, ProtocolError};
use common::{ActionRequest, ActionResult};
use futures::{SinkExt, StreamExt};
use tokio::net::UnixStream;
use tracing::debug;

/// Connection level failures. A failing mount tool is not one of them: it
/// comes back as an unsuccessful [`ActionResult`].
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("failed to connect to helper at `{path}`: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("helper did not answer within {0:?}")]
    Timeout(Duration),
    #[error("helper closed the connection")]
    Closed,
    #[error(transparent)]
    Codec(#[from] ProtocolError),
    #[error("helper connection error: {0}")]
    Io(#[from] std::io::Error),
    #[error("helper rejected the request: {0}")]
    Remote(String),
}

/// Operations that need the privileged helper.
#[async_trait]
pub trait PrivilegedActions: Send + Sync {
    async fn remount_read_write(&self, request: ActionRequest) -> Result<ActionResult, ChannelError>;

    async fn helper_version(&self) -> Result<String, ChannelError>;
}

/// Talks to `rkm-helper` over its Unix socket.
///
/// Every call opens its own connection, so a restarted helper is picked up by
/// the next call and a dead one fails that call without retrying.
#[derive(Debug, Clone)]
pub struct HelperClient {
    socket_path: PathBuf,
    request_timeout: Duration,
}

impl HelperClient {
    pub fn new(socket_path: impl Into<PathBuf>, request_timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            request_timeout,
        }
    }

    pub fn from_config(config: &RkmConfig) -> Self {
        Self::new(
            &config.socket_path,
            Duration::from_secs(config.helper.request_timeout_secs),
        )
    }

    async fn call(&self, request: HelperRequest) -> Result<HelperResponse, ChannelError> {
        let stream = UnixStream::connect(&self.socket_path)
            .await
            .map_err(|source| ChannelError::Connect {
                path: self.socket_path.clone(),
                source,
            })?;
        let mut framed = protocol::framed(stream);

        let exchange = async {
            framed.send(request.to_bytes()?).await?;
            let frame = framed.next().await.ok_or(ChannelError::Closed)??;
            Ok::<_, ChannelError>(HelperResponse::from_bytes(&frame)?)
        };
        let response = tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| ChannelError::Timeout(self.request_timeout))??;

        match response {
            HelperResponse::Error(message) => Err(ChannelError::Remote(message)),
            response => Ok(response),
        }
    }
}

#[async_trait]
impl PrivilegedActions for HelperClient {
    async fn remount_read_write(&self, request: ActionRequest) -> Result<ActionResult, ChannelError> {
        debug!(device = %request.device_node, volume = %request.volume_name, "requesting remount");
        match self.call(HelperRequest::RemountReadWrite(request)).await? {
            HelperResponse::Remount(result) => Ok(result),
            other => Err(ChannelError::Remote(format!("unexpected response {other:?}"))),
        }
    }

    async fn helper_version(&self) -> Result<String, ChannelError> {
        match self.call(HelperRequest::GetVersion).await? {
            HelperResponse::Version(version) => Ok(version),
            other => Err(ChannelError::Remote(format!("unexpected response {other:?}"))),
        }
    }
}
