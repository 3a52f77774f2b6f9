//! remora: name service, pub/sub broker and remote object tooling.

mod commands;
mod config;
mod logging;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::config::Config;

#[derive(Parser)]
#[command(name = "remora")]
#[command(author, version, about = "Remora - remote objects and federated pub/sub", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Config file (default: the user's remora/remora.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "remora_pubsub=trace"
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the name service until Ctrl-C
    Nameserver {
        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to bind
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Run a pub/sub broker until Ctrl-C
    Pubsub {
        /// Broker name registered with the name service
        #[arg(short, long)]
        name: Option<String>,

        /// Address to bind
        #[arg(long)]
        host: Option<String>,

        /// Port to bind (0 = ephemeral)
        #[arg(short, long)]
        port: Option<u16>,

        /// Name service hosts, "[user@]host[:port]" separated by commas
        #[arg(long)]
        ns: Option<String>,
    },

    /// Call a method on a service (logical name or host:port)
    Call {
        target: String,
        method: String,

        /// Arguments as JSON literals; anything else is sent as a string
        args: Vec<String>,

        #[arg(long)]
        ns: Option<String>,

        /// Force TLS
        #[arg(long)]
        secure: bool,
    },

    /// List registered services
    Names {
        /// Only this service
        name: Option<String>,

        #[arg(long)]
        ns: Option<String>,
    },

    /// Probe a service with ro_echo
    Ping {
        target: String,

        /// Number of probes
        #[arg(short = 'n', long, default_value = "1")]
        count: u32,

        #[arg(long)]
        ns: Option<String>,

        #[arg(long)]
        secure: bool,
    },

    /// Print the default configuration
    DefaultConfig,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    let log = logging::init(cli.log_level.as_deref(), &config.log.level)?;

    match cli.command {
        Commands::Nameserver { host, port } => commands::nameserver::run(&config, host, port),
        Commands::Pubsub { name, host, port, ns } => commands::pubsub::run(
            &config,
            commands::pubsub::PubSubArgs { name, host, port, ns },
            log,
        ),
        Commands::Call {
            target,
            method,
            args,
            ns,
            secure,
        } => commands::call::run(&config, &target, &method, &args, ns.as_deref(), secure),
        Commands::Names { name, ns } => {
            commands::names::run(&config, ns.as_deref(), name.as_deref())
        }
        Commands::Ping {
            target,
            count,
            ns,
            secure,
        } => commands::ping::run(&config, &target, count, ns.as_deref(), secure),
        Commands::DefaultConfig => {
            print!("{}", Config::default_toml()?);
            Ok(())
        }
    }
}
