//! CLI surface for quarry.
//!
//! Thin handlers over the library: the lock daemon lifecycle plus small
//! version-engine helpers for scripting and debugging.

use std::ffi::OsString;

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::config::{self, IpcConfig};
use crate::ipc::{self, LockClient, SocketFamily};
use crate::version::{Version, VersionRange, compare};
use crate::{Error, Result};

// =============================================================================
// Entry + global options
// =============================================================================

#[derive(Parser, Debug)]
#[command(
    name = "quarry",
    version,
    about = "Build-artifact resolver toolkit",
    arg_required_else_help = true
)]
pub struct Cli {
    /// Debug output (repeat for more).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Lock daemon lifecycle.
    #[command(subcommand)]
    Daemon(DaemonCommands),

    /// Version engine helpers.
    #[command(subcommand)]
    Version(VersionCommands),
}

#[derive(Subcommand, Debug)]
pub enum DaemonCommands {
    /// Run the lock daemon in the foreground.
    Run(DaemonRunArgs),

    /// Spawned-daemon entry: bind, dial the rendezvous endpoint, serve.
    #[command(hide = true)]
    Serve(DaemonServeArgs),

    /// Ask a running daemon to shut down.
    Stop,
}

#[derive(Args, Debug)]
pub struct DaemonRunArgs {
    /// Socket family to bind (unix | inet).
    #[arg(long, value_name = "FAMILY")]
    pub family: Option<String>,

    /// Idle grace period before auto-shutdown, seconds or `Nms`.
    #[arg(long, value_name = "TIMEOUT")]
    pub idle_timeout: Option<String>,

    /// Per-request debug logging.
    #[arg(long, default_value_t = false)]
    pub debug: bool,
}

#[derive(Args, Debug)]
pub struct DaemonServeArgs {
    /// Socket family to bind (unix | inet).
    pub family: String,
    /// One-shot rendezvous address of the spawning client.
    pub rendezvous: String,
    /// Nonce echoed back through the rendezvous connection.
    pub nonce: String,
}

#[derive(Subcommand, Debug)]
pub enum VersionCommands {
    /// Compare two version strings; prints -1, 0 or 1.
    Compare { left: String, right: String },

    /// Test whether a version lies in a range; exits nonzero when outside.
    Range { range: String, version: String },
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::parse_from(args)
}

// =============================================================================
// Handlers
// =============================================================================

pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Daemon(command) => run_daemon_command(command),
        Commands::Version(command) => run_version_command(command),
    }
}

fn run_daemon_command(command: DaemonCommands) -> Result<()> {
    match command {
        DaemonCommands::Run(args) => {
            let mut config = IpcConfig::from_env();
            if let Some(raw) = &args.family {
                config.family = parse_family(raw)?;
            }
            if let Some(raw) = &args.idle_timeout {
                config.idle_timeout = parse_timeout(raw)?;
            }
            if args.debug {
                config.debug = true;
            }
            ipc::server::run_daemon(config)?;
            Ok(())
        }
        DaemonCommands::Serve(args) => {
            let family = parse_family(&args.family)?;
            let config = IpcConfig::from_env();
            ipc::server::run_spawned(family, &args.rendezvous, &args.nonce, config)?;
            Ok(())
        }
        DaemonCommands::Stop => {
            let config = IpcConfig::from_env();
            let client = LockClient::connect(&config)?;
            client.stop()?;
            println!("lock daemon stopped");
            Ok(())
        }
    }
}

fn run_version_command(command: VersionCommands) -> Result<()> {
    match command {
        VersionCommands::Compare { left, right } => {
            println!("{}", compare(&left, &right) as i8);
            Ok(())
        }
        VersionCommands::Range { range, version } => {
            let range = VersionRange::parse(&range).map_err(Error::from)?;
            let version = Version::parse(version);
            if range.contains(&version) {
                println!("{version} in {range}");
                Ok(())
            } else {
                println!("{version} not in {range}");
                std::process::exit(1);
            }
        }
    }
}

fn parse_family(raw: &str) -> Result<SocketFamily> {
    SocketFamily::parse(raw).ok_or_else(|| {
        Error::Ipc(ipc::IpcError::protocol(format!(
            "unknown socket family `{raw}`"
        )))
    })
}

fn parse_timeout(raw: &str) -> Result<std::time::Duration> {
    config::parse_timeout(raw).ok_or_else(|| {
        Error::Ipc(ipc::IpcError::protocol(format!(
            "invalid idle timeout `{raw}`"
        )))
    })
}
