//! Script administration for the rule engine
//!
//! Edits the script table directly and asks a running engine to reload.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mq_bus::Bus;
use mq_config::{ExeConfig, SystemConfig};
use mq_core::topics::EXE_RELOAD;
use mq_exe::{ScriptCatalog, ScriptScanner};
use mq_server::{connect_bus, init_logging, CommonArgs};
use mq_store::Store;
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::time::Duration;
use tracing::warn;

/// How long `reload` waits for the broker to echo the request
const RELOAD_ECHO_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "mq-script", version, about = "Manage MQ System rule engine scripts")]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,

    /// Script database; defaults to the rule engine's configured store
    #[arg(long)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List stored scripts
    List,
    /// Print a script body
    Show { name: String },
    /// Store a script from a file, replacing any previous body
    Put { name: String, file: PathBuf },
    /// Delete a script
    Remove { name: String },
    /// Scan a file and print the values it registers
    Check { file: PathBuf },
    /// Ask the running engine to reload every script
    Reload,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_dir = &cli.common.config_dir;
    let system = SystemConfig::load(config_dir).context("Failed to load system configuration")?;
    let _guard = init_logging(&system, None)?;

    match &cli.command {
        Command::Check { file } => check(file),
        Command::Reload => reload(&system),
        command => {
            let db = match &cli.db {
                Some(db) => db.clone(),
                None => {
                    ExeConfig::load(config_dir)
                        .context("Failed to load rule engine configuration")?
                        .uri
                }
            };
            let store = Store::open_scripts(&db)
                .with_context(|| format!("Failed to open store {}", db.display()))?;
            let catalog = ScriptCatalog::new(Arc::new(store))?;
            manage(&catalog, command)
        }
    }
}

fn manage(catalog: &ScriptCatalog, command: &Command) -> Result<()> {
    match command {
        Command::List => {
            for name in catalog.names()? {
                println!("{name}");
            }
        }
        Command::Show { name } => match catalog.get(name)? {
            Some(body) => print!("{body}"),
            None => bail!("No script named {name}"),
        },
        Command::Put { name, file } => {
            let body = read_script(file)?;
            let script = catalog.save(name, &body)?;
            println!("Stored {name} ({} values)", script.references.len());
        }
        Command::Remove { name } => {
            if !catalog.remove(name)? {
                bail!("No script named {name}");
            }
            println!("Removed {name}");
        }
        Command::Check { .. } | Command::Reload => {}
    }
    Ok(())
}

fn read_script(file: &Path) -> Result<String> {
    std::fs::read_to_string(file).with_context(|| format!("Failed to read {}", file.display()))
}

fn check(file: &Path) -> Result<()> {
    let body = read_script(file)?;
    let references = ScriptScanner::new()?
        .scan(&body)
        .with_context(|| format!("{} rejected", file.display()))?;
    for reference in references {
        println!("{reference}");
    }
    Ok(())
}

/// Publish the reload request and wait until the broker routes it back
fn reload(system: &SystemConfig) -> Result<()> {
    let (bus, incoming) = connect_bus(system, "mq_script")?;
    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    let bus_thread = incoming.spawn(Box::new(move |topic, _| {
        if topic == EXE_RELOAD {
            let _ = tx.lock().send(());
        }
    }))?;

    bus.subscribe(EXE_RELOAD)?;
    bus.publish(EXE_RELOAD, "")?;
    let echoed = rx.recv_timeout(RELOAD_ECHO_TIMEOUT).is_ok();

    if let Err(e) = bus.disconnect() {
        warn!(error = %e, "Failed to disconnect from broker");
    }
    let _ = bus_thread.join();

    if !echoed {
        bail!("Broker did not confirm the reload request");
    }
    println!("Reload requested");
    Ok(())
}
