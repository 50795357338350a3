use clap::{Args, Parser, Subcommand};
use log::{debug, LevelFilter};
use miette::Result;
use nautilus_flash::{
    cli::{self, config::Config, ConnectArgs, EraseArgs as BaseEraseArgs, FirmwareArgs},
    logging::initialize_logger,
};

#[derive(Debug, Parser)]
#[command(about, max_term_width = 100, propagate_version = true, version)]
struct Cli {
    /// Verbosity of log output
    #[arg(long, global = true, default_value = "info", env = "NAUTILUS_LOG")]
    log_level: LevelFilter,

    #[command(subcommand)]
    subcommand: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Display information about the connected board and exit without flashing
    BoardInfo(ConnectArgs),
    /// Flash Nautilus firmware to a connected device
    Flash(FlashArgs),
    /// Erase the entire flash of a connected device
    Erase(EraseArgs),
    /// List the published firmware releases
    Releases(ReleasesArgs),
    /// Connect, flash and erase from an interactive menu
    Interactive(InteractiveArgs),
}

#[derive(Debug, Args)]
struct FlashArgs {
    #[clap(flatten)]
    connect_args: ConnectArgs,
    #[clap(flatten)]
    firmware_args: FirmwareArgs,
}

#[derive(Debug, Args)]
struct EraseArgs {
    #[clap(flatten)]
    connect_args: ConnectArgs,
    #[clap(flatten)]
    erase_args: BaseEraseArgs,
}

#[derive(Debug, Args)]
struct ReleasesArgs {
    #[clap(flatten)]
    firmware_args: FirmwareArgs,
}

#[derive(Debug, Args)]
struct InteractiveArgs {
    #[clap(flatten)]
    connect_args: ConnectArgs,
    #[clap(flatten)]
    firmware_args: FirmwareArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    miette::set_panic_hook();

    // Attempt to parse any provided command-line arguments, or print the help
    // message and terminate if the invocation is not correct.
    let args = Cli::parse();
    initialize_logger(args.log_level);
    debug!("{:#?}", args.subcommand);

    // Load any user configuration, if present.
    let config = Config::load()?;

    // Execute the correct action based on the provided subcommand and its
    // associated arguments.
    match args.subcommand {
        Commands::BoardInfo(args) => cli::board_info(&args, &config).await,
        Commands::Flash(args) => {
            cli::flash(&args.connect_args, &args.firmware_args, &config).await
        }
        Commands::Erase(args) => {
            cli::erase(&args.connect_args, &args.erase_args, &config).await
        }
        Commands::Releases(args) => cli::list_releases(&args.firmware_args, &config).await,
        Commands::Interactive(args) => {
            cli::interactive(&args.connect_args, &args.firmware_args, &config).await
        }
    }
}
