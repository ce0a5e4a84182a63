//! CLI for supervising cloud-hypervisor micro-VMs.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod ctl;
mod run;

use anyhow::Result;
use chv::LogLevel;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "chv", version, about = "Supervise cloud-hypervisor micro-VMs")]
struct Cli {
    /// Log level for chv and the VMM. `RUST_LOG` overrides the host side.
    #[arg(long, global = true, default_value = "info")]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Boot a machine from a JSON config and supervise it until it stops.
    Run(Box<run::RunArgs>),

    /// Print the VMM version.
    Ping(ctl::Target),

    /// Print the guest's configuration and state.
    Info(ctl::Target),

    /// Pause the guest.
    Pause(ctl::Target),

    /// Resume a paused guest.
    Resume(ctl::Target),

    /// Reboot the guest.
    Reboot(ctl::Target),

    /// Press the guest's power button.
    PowerButton(ctl::Target),

    /// Shut the guest down.
    Shutdown(ctl::ShutdownArgs),

    /// Delete the guest definition.
    Delete(ctl::Target),

    /// Snapshot a paused guest into a directory.
    Snapshot(ctl::SnapshotArgs),

    /// Restore a guest from a snapshot directory.
    Restore(ctl::RestoreArgs),

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_level);
    if let Err(e) = cli.dispatch().await {
        eprintln!("chv: {e:#}");
        std::process::exit(1);
    }
}

impl Cli {
    async fn dispatch(self) -> Result<()> {
        match self.command {
            Command::Run(args) => args.run(self.log_level).await,
            Command::Ping(target) => ctl::ping(&target).await,
            Command::Info(target) => ctl::info(&target).await,
            Command::Pause(target) => ctl::pause(&target).await,
            Command::Resume(target) => ctl::resume(&target).await,
            Command::Reboot(target) => ctl::reboot(&target).await,
            Command::PowerButton(target) => ctl::power_button(&target).await,
            Command::Shutdown(args) => ctl::shutdown(&args).await,
            Command::Delete(target) => ctl::delete(&target).await,
            Command::Snapshot(args) => ctl::snapshot(&args).await,
            Command::Restore(args) => ctl::restore(&args).await,
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "chv", &mut std::io::stdout());
                Ok(())
            }
        }
    }
}

/// Logs to stderr; `RUST_LOG` wins over `--log-level`.
fn init_logging(level: LogLevel) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
