//! Applies the stored policy to every arriving volume.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use common::{ActionRequest, MountPolicy, VolumeIdentity};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::client::PrivilegedActions;
use crate::policy::PolicyStore;
use crate::service::{HelperStatus, ServiceProbe};

/// What happened to one arrival.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Remounted,
    /// The helper ran the remount and reported a failure.
    RemountFailed(String),
    /// The helper could not be reached or answered nonsense.
    ChannelFailed(String),
    Skipped(MountPolicy),
    HelperUnavailable(HelperStatus),
    /// A remount of the same device node is still running.
    AlreadyInFlight,
    StoreFailed(String),
}

#[derive(Clone)]
pub struct Controller {
    store: Arc<PolicyStore>,
    actions: Arc<dyn PrivilegedActions>,
    probe: Option<Arc<dyn ServiceProbe>>,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl Controller {
    pub fn new(store: Arc<PolicyStore>, actions: Arc<dyn PrivilegedActions>) -> Self {
        Self {
            store,
            actions,
            probe: None,
            in_flight: Arc::default(),
        }
    }

    /// Only elevate when `probe` reports a usable helper.
    pub fn with_service_probe(mut self, probe: Arc<dyn ServiceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Handle every identity received until the monitor drops its sender.
    ///
    /// Volumes are handled concurrently, so a slow remount does not hold up
    /// the registration of the next arrival.
    pub async fn run(&self, mut volumes: mpsc::Receiver<VolumeIdentity>) {
        let mut tasks = JoinSet::new();
        while let Some(volume) = volumes.recv().await {
            let controller = self.clone();
            tasks.spawn(async move { controller.handle(volume).await });
            while let Some(done) = tasks.try_join_next() {
                if let Err(e) = done {
                    error!("volume task failed: {e}");
                }
            }
        }
        while let Some(done) = tasks.join_next().await {
            if let Err(e) = done {
                error!("volume task failed: {e}");
            }
        }
    }

    pub async fn handle(&self, volume: VolumeIdentity) -> Outcome {
        let key = volume.policy_key();
        let policy = match self.register(&key, &volume.display_name).await {
            Ok(policy) => policy,
            Err(message) => {
                error!(device = %volume.device_node, "{message}");
                return Outcome::StoreFailed(message);
            }
        };
        info!(
            uuid = %key,
            device = %volume.device_node,
            name = %volume.display_name,
            %policy,
            "volume arrived"
        );

        if policy != MountPolicy::ReadWrite {
            return Outcome::Skipped(policy);
        }

        let Some(_guard) = InFlightGuard::acquire(&self.in_flight, &volume.device_node) else {
            warn!(device = %volume.device_node, "remount already in progress, dropping arrival");
            return Outcome::AlreadyInFlight;
        };

        if let Some(probe) = &self.probe {
            let status = probe.status().await;
            if !status.allows_elevation() {
                warn!(device = %volume.device_node, %status, "privileged helper unavailable");
                return Outcome::HelperUnavailable(status);
            }
        }

        let request = ActionRequest::new(&volume.device_node, &volume.display_name);
        match self.actions.remount_read_write(request).await {
            Ok(result) if result.success => {
                info!(device = %volume.device_node, name = %volume.display_name, "remounted read/write");
                Outcome::Remounted
            }
            Ok(result) => {
                let message = result
                    .error_message
                    .unwrap_or_else(|| "remount failed without a message".to_string());
                error!(device = %volume.device_node, "remount failed: {message}");
                Outcome::RemountFailed(message)
            }
            Err(e) => {
                error!(device = %volume.device_node, "helper request failed: {e}");
                Outcome::ChannelFailed(e.to_string())
            }
        }
    }

    /// Register the sighting and return the policy to apply. The file I/O
    /// and the store's lock wait run on the blocking pool.
    async fn register(&self, key: &str, name: &str) -> Result<MountPolicy, String> {
        let store = self.store.clone();
        let key = key.to_string();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || match store.register(&key, &name, None) {
            Ok(record) => record.mode,
            Err(e) => {
                warn!(uuid = %key, "failed to register volume: {e}");
                store.policy(&key)
            }
        })
        .await
        .map_err(|e| format!("policy lookup failed: {e}"))
    }
}

/// Marks a device node busy until dropped.
struct InFlightGuard {
    set: Arc<Mutex<HashSet<String>>>,
    device: String,
}

impl InFlightGuard {
    fn acquire(set: &Arc<Mutex<HashSet<String>>>, device: &str) -> Option<Self> {
        let inserted = set.lock().ok()?.insert(device.to_string());
        if !inserted {
            return None;
        }
        debug!(device, "remount started");
        Some(Self {
            set: set.clone(),
            device: device.to_string(),
        })
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.device);
        }
    }
}
