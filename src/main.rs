use clap::Parser;
use miette::{IntoDiagnostic, Result};
use paygate::application::engine::PaymentEngine;
use paygate::config::Config;
use paygate::domain::ports::{PaymentMethodStoreRef, SystemClock, TransactionStoreRef};
use paygate::infrastructure::in_memory::InMemoryStore;
use paygate::infrastructure::simulated_gateway::SimulatedGateway;
use paygate::interfaces::batch::BatchRunner;
use paygate::interfaces::csv::command_reader::CommandReader;
use paygate::interfaces::csv::outcome_writer::OutcomeWriter;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Input commands CSV file
    input: PathBuf,

    /// Path to persistent database (optional). If provided, uses RocksDB.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// JSON configuration file (optional). Defaults apply to missing fields.
    #[arg(long)]
    config: Option<PathBuf>,
}

fn stores(db_path: Option<PathBuf>) -> Result<(TransactionStoreRef, PaymentMethodStoreRef)> {
    match db_path {
        #[cfg(feature = "storage-rocksdb")]
        Some(path) => {
            let store = paygate::infrastructure::rocksdb::RocksDBStore::open(path).into_diagnostic()?;
            Ok((Arc::new(store.clone()), Arc::new(store)))
        }
        #[cfg(not(feature = "storage-rocksdb"))]
        Some(_) => Err(miette::miette!(
            "--db-path requires a build with the `storage-rocksdb` feature"
        )),
        None => {
            let store = InMemoryStore::new();
            Ok((Arc::new(store.clone()), Arc::new(store)))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_path(path).into_diagnostic()?,
        None => Config::default(),
    };
    let (transactions, methods) = stores(cli.db_path)?;
    let engine = PaymentEngine::new(
        transactions,
        methods,
        Arc::new(SimulatedGateway::new()),
        Arc::new(SystemClock),
        config,
    );
    let runner = BatchRunner::new(&engine);

    let file = File::open(&cli.input).into_diagnostic()?;
    let reader = CommandReader::new(file);
    let stdout = io::stdout();
    let mut writer = OutcomeWriter::new(stdout.lock());
    let mut executed = 0usize;
    for command in reader.commands() {
        match command {
            Ok(command) => {
                let outcome = runner.run(command).await;
                writer.write(&outcome).into_diagnostic()?;
                executed += 1;
            }
            Err(e) => {
                eprintln!("Error reading command: {}", e);
            }
        }
    }
    writer.flush().into_diagnostic()?;
    info!(executed, "batch finished");

    Ok(())
}
