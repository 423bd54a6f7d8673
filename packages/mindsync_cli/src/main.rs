use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::mpsc;

use mindsync::convergent::{OperationKind, OperationType};
use mindsync::mindmap::{hierarchical_to_relational, relational_to_hierarchical, MindMap, RelationalMindMap};
use mindsync::sync::{CollaborationSession, LoopbackNetwork, SessionConfig};
use mindsync::Operation;

#[derive(Parser)]
#[command(name = "mindsync", about = "Mind map conversion and edit reconciliation")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Convert between tree and relational JSON
    Convert {
        #[command(subcommand)]
        direction: Direction,
    },
    /// Print the content digest of a tree-form mind map
    Digest { input: PathBuf },
    /// Replay concurrent edits from several replicas and check convergence
    Simulate {
        scenario: PathBuf,
        /// Session config JSON; defaults apply to anything missing
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum Direction {
    ToRelational {
        input: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    ToTree {
        input: PathBuf,
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

/// Edits are grouped into rounds; replicas only hear about each other's
/// edits at the end of a round.
#[derive(Deserialize)]
struct Scenario {
    map: MindMap,
    replicas: Vec<String>,
    rounds: Vec<Vec<Edit>>,
}

#[derive(Deserialize)]
struct Edit {
    replica: String,
    target_id: String,
    operation_type: OperationType,
    #[serde(default = "empty_object")]
    data: Value,
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

struct Replica {
    session: CollaborationSession,
    inbox: mpsc::UnboundedReceiver<Operation>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Convert { direction } => match direction {
            Direction::ToRelational { input, output } => {
                let map: MindMap = read_json(&input)?;
                write_json(&hierarchical_to_relational(&map), output.as_deref())
            }
            Direction::ToTree { input, output } => {
                let bundle: RelationalMindMap = read_json(&input)?;
                let map = relational_to_hierarchical(&bundle)
                    .with_context(|| format!("rebuilding tree from {}", input.display()))?;
                write_json(&map, output.as_deref())
            }
        },
        Command::Digest { input } => {
            let map: MindMap = read_json(&input)?;
            println!("{}", map.digest());
            Ok(())
        }
        Command::Simulate { scenario, config } => {
            let config = match config {
                Some(path) => SessionConfig::load(&path)
                    .with_context(|| format!("loading config {}", path.display()))?,
                None => SessionConfig::default(),
            };
            simulate(read_json(&scenario)?, config).await
        }
    }
}

async fn simulate(scenario: Scenario, config: SessionConfig) -> Result<()> {
    if scenario.replicas.is_empty() {
        bail!("scenario names no replicas");
    }
    let network = LoopbackNetwork::new();
    let mut replicas: Vec<Replica> = scenario
        .replicas
        .iter()
        .map(|name| {
            let (transport, inbox) = network.connect(name.as_str());
            Replica {
                session: CollaborationSession::new(
                    name.as_str(),
                    scenario.map.clone(),
                    transport,
                    config.clone(),
                ),
                inbox,
            }
        })
        .collect();

    for (round, edits) in scenario.rounds.into_iter().enumerate() {
        for edit in edits {
            let Some(replica) = replicas.iter_mut().find(|r| r.session.replica() == edit.replica) else {
                bail!("round {}: unknown replica {}", round, edit.replica);
            };
            let kind = OperationKind::from_data(edit.operation_type, edit.data)
                .with_context(|| format!("round {}: bad {} payload", round, edit.operation_type))?;
            if let Err(e) = replica.session.submit(kind, edit.target_id.as_str()) {
                log::warn!("round {}: {} rejected {} on {}: {}", round, edit.replica, edit.operation_type, edit.target_id, e);
            }
        }

        for replica in &replicas {
            replica.session.flush().await;
        }
        for replica in replicas.iter_mut() {
            for outcome in replica.session.receive_pending(&mut replica.inbox) {
                log::info!("round {}: {} {:?}", round, replica.session.replica(), outcome);
            }
        }
    }

    let digests: Vec<(String, String)> = replicas
        .iter()
        .map(|r| (r.session.replica().to_string(), r.session.digest()))
        .collect();
    for (name, digest) in &digests {
        println!("{}\t{}", name, digest);
    }
    if digests.windows(2).any(|pair| pair[0].1 != pair[1].1) {
        bail!("replicas diverged");
    }
    write_json(&*replicas[0].session.snapshot(), None)
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn write_json<T: serde::Serialize>(value: &T, output: Option<&Path>) -> Result<()> {
    let text = serde_json::to_string_pretty(value)?;
    match output {
        Some(path) => std::fs::write(path, text).with_context(|| format!("writing {}", path.display()))?,
        None => println!("{}", text),
    }
    Ok(())
}
