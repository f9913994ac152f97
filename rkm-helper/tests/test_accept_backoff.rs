//! Runs alone in its own binary: it lowers the process fd limit.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::config::HelperConfig;
use common::protocol::{self, HelperRequest, HelperResponse};
use futures::{SinkExt, StreamExt};
use nix::sys::resource::{Resource, getrlimit, setrlimit};
use rkm_helper::HELPER_VERSION;
use rkm_helper::exec::{CommandRunner, ExecError, StepStatus};
use rkm_helper::orchestrator::MountOrchestrator;
use rkm_helper::server::HelperServer;
use tokio::net::UnixStream;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

struct NoTools;

#[async_trait]
impl CommandRunner for NoTools {
    async fn run(
        &self,
        _program: &Path,
        _args: &[String],
        _timeout: Duration,
    ) -> Result<StepStatus, ExecError> {
        Ok(StepStatus::Exited(0))
    }
}

struct CountWarnings(Arc<AtomicUsize>);

impl<S: Subscriber> Layer<S> for CountWarnings {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() == Level::WARN {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test]
async fn test_accept_failures_back_off_and_recover() {
    let warnings = Arc::new(AtomicUsize::new(0));
    let _subscriber = tracing::subscriber::set_default(
        tracing_subscriber::registry().with(CountWarnings(warnings.clone())),
    );

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("helper.sock");
    let config = HelperConfig {
        volumes_root: dir.path().join("media"),
        ..HelperConfig::default()
    };
    let orchestrator = Arc::new(MountOrchestrator::new(config, Arc::new(NoTools)));
    let server = HelperServer::bind(&path, 0o600, orchestrator).unwrap();
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let running = tokio::spawn(server.run(async {
        let _ = stop_rx.await;
    }));

    // exhaust the fd table, then free one slot for the client's socket
    let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE).unwrap();
    setrlimit(Resource::RLIMIT_NOFILE, hard.min(512), hard).unwrap();
    let mut hogs = Vec::new();
    while let Ok(file) = File::open("/dev/null") {
        hogs.push(file);
    }
    hogs.pop();
    let client = UnixStream::connect(&path).await.unwrap();

    // the pending connection keeps failing with EMFILE
    tokio::time::sleep(Duration::from_millis(500)).await;
    let failed_accepts = warnings.load(Ordering::SeqCst);

    drop(hogs);
    setrlimit(Resource::RLIMIT_NOFILE, soft, hard).unwrap();

    assert!(failed_accepts >= 1, "accept never failed");
    assert!(failed_accepts <= 10, "accept retried {failed_accepts} times");

    // once descriptors are available the queued client is served
    let mut client = protocol::framed(client);
    client
        .send(HelperRequest::GetVersion.to_bytes().unwrap())
        .await
        .unwrap();
    let frame = tokio::time::timeout(Duration::from_secs(5), client.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(
        HelperResponse::from_bytes(&frame).unwrap(),
        HelperResponse::Version(HELPER_VERSION.to_string())
    );

    drop(client);
    stop_tx.send(()).unwrap();
    running.await.unwrap().unwrap();
}
