use clap::Subcommand;
use common::MountPolicy;

pub mod helper;
pub mod policy;

#[derive(Subcommand, Debug)]
pub enum PolicyCommand {
    #[command(about = "List every volume seen so far and its policy")]
    List,
    #[command(about = "Set the policy of a volume using ./rkm policy set <uuid> <mode>")]
    Set {
        #[arg(value_name = "UUID")]
        uuid: String,
        #[arg(value_name = "MODE", help = "ReadWrite, ReadOnly or Ignore")]
        mode: MountPolicy,
        #[arg(long, help = "Display name of the volume")]
        name: Option<String>,
    },
    #[command(about = "Forget a volume")]
    Delete {
        #[arg(value_name = "UUID")]
        uuid: String,
    },
    #[command(about = "Show the default policy, or change it when MODE is given")]
    Default {
        #[arg(value_name = "MODE")]
        mode: Option<MountPolicy>,
    },
}

#[derive(Subcommand, Debug)]
pub enum HelperCommand {
    #[command(about = "Show whether the helper service is enabled")]
    Status,
    #[command(about = "Enable and start the helper service")]
    Install,
    #[command(about = "Stop and disable the helper service")]
    Uninstall,
    #[command(about = "Ask the running helper for its version")]
    Version,
}
