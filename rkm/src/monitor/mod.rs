//! Volume arrival monitoring.
//!
//! An [`EventSource`] yields raw arrival notifications. The [`VolumeMonitor`]
//! turns the ones that carry the target filesystem into [`VolumeIdentity`]
//! values and forwards them, in arrival order, to the channel given to
//! [`VolumeMonitor::start`].

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use common::VolumeIdentity;
use futures::StreamExt;
use futures::stream::BoxStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub mod lsblk;
pub mod udev;

pub use udev::UdevSource;

/// The fields of an arrival notification the pipeline relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawVolumeEvent {
    pub media_name: Option<String>,
    pub content_type: Option<String>,
    pub media_uuid: Option<String>,
    pub device_node: Option<String>,
}

pub type EventStream = BoxStream<'static, RawVolumeEvent>;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("`{0}` has no stdout")]
    NoStdout(PathBuf),
    #[error("volume scan failed: {0}")]
    Scan(String),
    #[error("unexpected lsblk output: {0}")]
    ScanOutput(#[source] serde_json::Error),
    #[error("event source is already shut down")]
    Closed,
}

/// Subscription to volume arrival notifications.
///
/// Dropping the returned stream ends the subscription.
pub trait EventSource: Send + Sync {
    fn subscribe(&self) -> Result<EventStream, MonitorError>;
}

/// Why an arrival was not turned into a [`VolumeIdentity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Discard {
    /// Not the target filesystem. The common case, not an error.
    Filtered,
    NoDeviceNode,
}

pub fn extract_identity(
    event: &RawVolumeEvent,
    target_fs_type: &str,
) -> Result<VolumeIdentity, Discard> {
    let content_type = match non_empty(&event.content_type) {
        Some(content_type) if content_type.eq_ignore_ascii_case(target_fs_type) => content_type,
        _ => return Err(Discard::Filtered),
    };
    let device_node = non_empty(&event.device_node).ok_or(Discard::NoDeviceNode)?;

    let display_name = match non_empty(&event.media_name) {
        Some(name) => name.to_string(),
        None => Path::new(device_node)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| device_node.to_string()),
    };

    Ok(VolumeIdentity {
        uuid: non_empty(&event.media_uuid).map(str::to_string),
        device_node: device_node.to_string(),
        display_name,
        content_type: content_type.to_string(),
    })
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Stopped,
    Listening,
}

pub struct VolumeMonitor {
    source: Arc<dyn EventSource>,
    target_fs_type: String,
    task: Option<JoinHandle<()>>,
}

impl VolumeMonitor {
    pub fn new(source: Arc<dyn EventSource>, target_fs_type: impl Into<String>) -> Self {
        Self {
            source,
            target_fs_type: target_fs_type.into(),
            task: None,
        }
    }

    /// Subscribe to the source and deliver identities to `sink`.
    ///
    /// Calling this while listening drops the previous subscription first.
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self, sink: mpsc::Sender<VolumeIdentity>) -> Result<(), MonitorError> {
        if self.task.is_some() {
            debug!("volume monitor restarting");
            self.stop();
        }
        let events = self.source.subscribe()?;
        let target = self.target_fs_type.clone();
        self.task = Some(tokio::spawn(deliver(events, target, sink)));
        info!(fs_type = %self.target_fs_type, "volume monitor listening");
        Ok(())
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            info!("volume monitor stopped");
        }
    }

    pub fn state(&self) -> MonitorState {
        match &self.task {
            Some(task) if !task.is_finished() => MonitorState::Listening,
            _ => MonitorState::Stopped,
        }
    }
}

impl Drop for VolumeMonitor {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn deliver(mut events: EventStream, target: String, sink: mpsc::Sender<VolumeIdentity>) {
    while let Some(event) = events.next().await {
        let identity = match extract_identity(&event, &target) {
            Ok(identity) => identity,
            Err(Discard::Filtered) => {
                debug!(?event, "ignoring volume");
                continue;
            }
            Err(Discard::NoDeviceNode) => {
                warn!(?event, "volume without a device node, skipping");
                continue;
            }
        };
        debug!(device = %identity.device_node, uuid = ?identity.uuid, "volume arrived");
        if sink.send(identity).await.is_err() {
            debug!("volume receiver closed, monitor exiting");
            return;
        }
    }
    warn!("volume event source ended");
}

/// An in-memory [`EventSource`] fed through a [`ChannelFeed`].
#[derive(Clone, Default)]
pub struct ChannelSource {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<RawVolumeEvent>>>>,
}

/// Sending half of a [`ChannelSource`].
#[derive(Clone)]
pub struct ChannelFeed {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<RawVolumeEvent>>>>,
}

impl ChannelSource {
    pub fn new() -> (Self, ChannelFeed) {
        let source = Self::default();
        let feed = ChannelFeed {
            subscribers: source.subscribers.clone(),
        };
        (source, feed)
    }
}

impl EventSource for ChannelSource {
    fn subscribe(&self) -> Result<EventStream, MonitorError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .map_err(|_| MonitorError::Closed)?
            .push(tx);
        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(stream.boxed())
    }
}

impl ChannelFeed {
    /// Deliver `event` to every live subscription. Returns how many received it.
    pub fn send(&self, event: RawVolumeEvent) -> usize {
        let Ok(mut subscribers) = self.subscribers.lock() else {
            return 0;
        };
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        subscribers.len()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .map(|mut subscribers| {
                subscribers.retain(|tx| !tx.is_closed());
                subscribers.len()
            })
            .unwrap_or(0)
    }
}
