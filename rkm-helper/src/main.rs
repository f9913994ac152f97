use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use common::config::{DEFAULT_CONFIG_PATH, RkmConfig};
use common::logging::{self, LogFormat};
use rkm_helper::HELPER_VERSION;
use rkm_helper::exec::ProcessRunner;
use rkm_helper::orchestrator::MountOrchestrator;
use rkm_helper::server::HelperServer;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "rkm-helper")]
#[command(about = "Privileged helper that remounts volumes on behalf of rkm", long_about = None)]
struct Cli {
    #[arg(long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.log_format);
    let config = RkmConfig::load(&cli.config)?;

    if !nix::unistd::geteuid().is_root() {
        warn!("rkm-helper is not running as root, unmount and mount will likely fail");
    }
    info!(version = HELPER_VERSION, "starting rkm-helper");

    let mode = config.helper.socket_mode()?;
    let orchestrator = Arc::new(MountOrchestrator::new(
        config.helper.clone(),
        Arc::new(ProcessRunner),
    ));
    let server = HelperServer::bind(&config.socket_path, mode, orchestrator)?;
    server.run(common::signal::shutdown_signal()).await
}
