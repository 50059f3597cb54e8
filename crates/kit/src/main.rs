use clap::{Parser, Subcommand};
use color_eyre::{Report, Result};

mod bootstrap;
mod channel;
mod config;
mod controller;
mod engine;
mod guest_install;
mod keys;
mod principal;
mod provision;
mod registration;
mod ssh;
mod status;
mod store;
mod trust;
mod units;
mod vm;

/// Default working directory holding keys, trust store and channel staging.
pub const DEFAULT_STATEDIR: &str = "/var/lib/buildvm";

/// Provision and supervise a persistent virtual machine used as a remote
/// build target.
///
/// buildvm defines a single named VM, establishes mutual SSH trust between
/// the host and the guest on first boot via a one-shot credential channel,
/// and then runs the VM in the foreground so an external supervisor can
/// restart it whenever it exits.
#[derive(Parser)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Available buildvm commands.
#[derive(Subcommand)]
enum Commands {
    /// Define the VM if it is absent, then run it in the foreground
    ///
    /// This is the supervised entrypoint: it blocks for the VM's entire
    /// lifetime and exits normally on any VM exit so the supervisor's
    /// restart loop can re-enter it.
    Run(controller::RunOpts),

    /// Define the VM and its credentials without starting it
    Ensure(controller::EnsureOpts),

    /// Show instance and credential status
    Status(status::StatusOpts),

    /// Connect to the VM using the emitted client configuration
    Ssh(ssh::SshOpts),

    /// Provision the host account, working directory and supervisor unit
    Provision(provision::ProvisionOpts),

    /// Install guest credentials from the transfer channel (guest side)
    #[clap(name = "guest-install", hide = true)]
    GuestInstall(guest_install::GuestInstallOpts),
}

/// Install and configure the tracing/logging system.
///
/// Sets up structured logging with environment-based filtering,
/// error layer integration, and console output formatting.
/// Logs are filtered by RUST_LOG environment variable, defaulting to 'info'.
fn install_tracing() {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let fmt_layer = fmt::layer().with_target(false).with_writer(std::io::stderr);
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .with(ErrorLayer::default())
        .init();
}

/// Main entry point for the buildvm CLI application.
fn main() -> Result<(), Report> {
    install_tracing();
    color_eyre::install()?;

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(opts) => controller::run(opts)?,
        Commands::Ensure(opts) => controller::ensure(opts)?,
        Commands::Status(opts) => status::run(opts)?,
        Commands::Ssh(opts) => ssh::run(opts)?,
        Commands::Provision(opts) => provision::run(opts)?,
        Commands::GuestInstall(opts) => guest_install::run(opts)?,
    }
    Ok(())
}
