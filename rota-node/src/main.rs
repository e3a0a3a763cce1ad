//! The `rota-node` binary.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use rota_node::account::decode_seed;
use rota_node::{create_genesis, init_logging, load_genesis, write_genesis, Node, NodeConfig, NodeError};

#[derive(Parser, Debug)]
#[command(name = "rota-node", version, about = "Round-robin block producer node")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a node until interrupted
    Run {
        /// Path to the TOML config file
        #[arg(long, short, default_value = "rota.toml")]
        config: PathBuf,

        /// Listen address, overriding the config file
        #[arg(long)]
        listen: Option<SocketAddr>,

        /// Extra peer to dial (repeatable)
        #[arg(long = "peer", value_name = "ADDR")]
        peers: Vec<String>,

        /// Genesis file, overriding the config file
        #[arg(long)]
        genesis: Option<PathBuf>,

        /// Default log filter; RUST_LOG still wins
        #[arg(long, value_name = "LEVEL")]
        log_level: Option<String>,
    },

    /// Write a genesis block registering the given members
    Genesis {
        /// Output file
        #[arg(long, short, default_value = "genesis.hex")]
        out: PathBuf,

        /// Genesis time in unix millis; defaults to now
        #[arg(long)]
        timestamp: Option<i64>,

        /// Hex-encoded 32-byte member seed, in registration order (repeatable)
        #[arg(long = "key", value_name = "HEX", required = true)]
        keys: Vec<String>,
    },
}

fn genesis_command(out: PathBuf, timestamp: Option<i64>, keys: &[String]) -> Result<(), NodeError> {
    let members = keys
        .iter()
        .map(|k| decode_seed(k, "--key"))
        .collect::<Result<Vec<_>, NodeError>>()?;
    let timestamp = timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

    let genesis = create_genesis(&members, timestamp)?;
    write_genesis(&genesis, &out)?;
    println!("{} {}", genesis.hash(), out.display());
    Ok(())
}

async fn run_node(
    path: PathBuf,
    listen: Option<SocketAddr>,
    peers: Vec<String>,
    genesis: Option<PathBuf>,
    log_level: Option<String>,
) -> Result<(), NodeError> {
    let mut config = NodeConfig::load(&path)?;
    if let Some(addr) = listen {
        config.listen_addr = addr;
    }
    config.peers.extend(peers);
    if let Some(genesis) = genesis {
        config.genesis_path = genesis;
    }
    if let Some(level) = log_level {
        config.log_level = level;
    }
    init_logging(&config.log_level);
    info!(config = %path.display(), listen = %config.listen_addr, "Starting rota node");

    let genesis = load_genesis(&config.genesis_path)?;
    let node = Node::build(config, &genesis)?;
    node.run(async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Signal handler failed");
        }
    })
    .await?;
    info!("Stopped");
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Run {
            config,
            listen,
            peers,
            genesis,
            log_level,
        } => run_node(config, listen, peers, genesis, log_level).await,
        Command::Genesis {
            out,
            timestamp,
            keys,
        } => genesis_command(out, timestamp, &keys),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("rota-node: {e}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_overrides() {
        let cli = Cli::try_parse_from([
            "rota-node",
            "run",
            "--config",
            "node.toml",
            "--listen",
            "127.0.0.1:7000",
            "--peer",
            "10.0.0.2:9333",
            "--peer",
            "10.0.0.3:9333",
        ])
        .unwrap();
        match cli.command {
            Command::Run {
                config,
                listen,
                peers,
                genesis,
                log_level,
            } => {
                assert_eq!(config, PathBuf::from("node.toml"));
                assert_eq!(listen, Some("127.0.0.1:7000".parse().unwrap()));
                assert_eq!(peers, vec!["10.0.0.2:9333", "10.0.0.3:9333"]);
                assert!(genesis.is_none());
                assert!(log_level.is_none());
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn test_genesis_requires_keys() {
        assert!(Cli::try_parse_from(["rota-node", "genesis"]).is_err());

        let cli = Cli::try_parse_from([
            "rota-node",
            "genesis",
            "--out",
            "g.hex",
            "--timestamp",
            "1000",
            "--key",
            "ab",
        ])
        .unwrap();
        assert!(matches!(
            cli.command,
            Command::Genesis { timestamp: Some(1000), ref keys, .. } if keys.len() == 1
        ));
    }

    #[test]
    fn test_genesis_command_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("genesis.hex");
        let keys = vec![hex::encode(rota_core::SecretKey::generate().as_bytes())];

        genesis_command(out.clone(), Some(1_000), &keys).unwrap();
        let genesis = load_genesis(&out).unwrap();
        assert_eq!(genesis.header.timestamp, 1_000);

        let bad = vec!["abcd".to_string()];
        assert!(matches!(
            genesis_command(out, Some(1_000), &bad),
            Err(NodeError::Config(_))
        ));
    }
}
