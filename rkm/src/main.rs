use std::fs::{self, File};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::config::{DEFAULT_CONFIG_PATH, RkmConfig};
use common::logging::{self, LogFormat};
use daemonize::Daemonize;
use rkm::client::HelperClient;
use rkm::commands::{self, HelperCommand, PolicyCommand};
use rkm::policy::PolicyStore;
use rkm::service::SystemdService;
use rkm::{daemon, rt};

#[derive(Parser)]
#[command(name = "rkm")]
#[command(about = "Remount removable NTFS volumes read/write according to per-volume policies", long_about = None)]
struct Cli {
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Watch for volume arrivals and apply their policies")]
    Daemon {
        #[arg(long, help = "Run in the background, logging to the run directory")]
        detach: bool,
    },
    #[command(subcommand, about = "Inspect or change volume policies")]
    Policy(PolicyCommand),
    #[command(subcommand, about = "Manage the privileged helper")]
    Helper(HelperCommand),
    #[command(about = "Remount one volume read/write using ./rkm remount /dev/sdb1 Backup")]
    Remount {
        #[arg(value_name = "DEVICE")]
        device: String,
        #[arg(value_name = "VOLUME_NAME")]
        volume: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RkmConfig::load(&cli.config)?;

    // Fork before any runtime or subscriber exists.
    if matches!(cli.command, Commands::Daemon { detach: true }) {
        detach(&config)?;
    }
    logging::init(cli.log_format);

    match cli.command {
        Commands::Daemon { .. } => rt::block_on(daemon::run(config))?,
        Commands::Policy(command) => {
            let store = PolicyStore::open(&config.policy.state_dir)?;
            commands::policy::execute(&store, command)
        }
        Commands::Helper(command) => {
            let service = SystemdService::from_config(&config.helper);
            let client = HelperClient::from_config(&config);
            rt::block_on(commands::helper::execute(&service, &client, command))?
        }
        Commands::Remount { device, volume } => {
            let client = HelperClient::from_config(&config);
            rt::block_on(commands::helper::remount(&client, &device, &volume))?
        }
    }
}

fn detach(config: &RkmConfig) -> Result<()> {
    let run_dir = &config.monitor.run_dir;
    fs::create_dir_all(run_dir)
        .with_context(|| format!("failed to create {}", run_dir.display()))?;
    let out = File::create(run_dir.join("rkm.out"))?;
    let err = File::create(run_dir.join("rkm.err"))?;
    Daemonize::new()
        .pid_file(run_dir.join("rkm.pid"))
        .stdout(out)
        .stderr(err)
        .start()?;
    Ok(())
}
