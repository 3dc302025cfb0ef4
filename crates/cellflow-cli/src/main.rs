//! cellflow command line tools.
//!
//! Provides the `cellflow` binary for operating on a cellflow database:
//! draining the recompute outbox once, running a polling worker, and
//! printing the evaluation order of a table's computed fields.
//!
//! Settings come from the `CELLFLOW_*` environment variables; flags given
//! on the command line take precedence.

use std::process;

use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use cellflow_core::TableId;
use cellflow_engine::{Engine, EngineConfig, EngineError, OutboxRunner, OutboxWorker};

/// cellflow computed-field engine tools.
#[derive(Parser)]
#[command(name = "cellflow", about = "cellflow computed-field engine tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process queued recomputations until the queue is empty.
    Drain {
        /// Path to the database file.
        #[arg(short, long)]
        db: Option<String>,

        /// Tasks claimed per batch.
        #[arg(short, long)]
        batch: Option<usize>,

        /// Worker id recorded on claimed tasks.
        #[arg(short, long)]
        worker: Option<String>,
    },
    /// Run a polling outbox worker until Ctrl-C.
    Watch {
        /// Path to the database file.
        #[arg(short, long)]
        db: Option<String>,

        /// Tasks claimed per batch.
        #[arg(short, long)]
        batch: Option<usize>,

        /// Worker id recorded on claimed tasks.
        #[arg(short, long)]
        worker: Option<String>,
    },
    /// Print the evaluation order of a table's computed fields.
    Order {
        /// Path to the database file.
        #[arg(short, long)]
        db: Option<String>,

        /// Table id, e.g. tblXXXXXXXXXXXXXXXX.
        #[arg(short, long)]
        table: String,
    },
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let exit_code = match cli.command {
        Commands::Drain { db, batch, worker } => run_drain(db, batch, worker),
        Commands::Watch { db, batch, worker } => run_watch(db, batch, worker),
        Commands::Order { db, table } => run_order(db, &table),
    };
    process::exit(exit_code);
}

/// Environment configuration with the flags applied over it.
fn config(db: Option<String>, batch: Option<usize>) -> Result<EngineConfig, EngineError> {
    let mut config = EngineConfig::from_env()?;
    if let Some(db) = db {
        config.db_path = db;
    }
    if let Some(batch) = batch {
        if batch == 0 {
            return Err(EngineError::Config("--batch must be positive".to_string()));
        }
        config.outbox_batch_size = batch;
    }
    Ok(config)
}

/// Reports `err` and maps it to an exit code: 1 = engine error,
/// 2 = invalid configuration.
fn fail(err: &EngineError) -> i32 {
    eprintln!("Error: {err}");
    match err {
        EngineError::Config(_) => 2,
        _ => 1,
    }
}

fn run_drain(db: Option<String>, batch: Option<usize>, worker: Option<String>) -> i32 {
    let config = match config(db, batch) {
        Ok(c) => c,
        Err(e) => return fail(&e),
    };
    let batch = config.outbox_batch_size;
    let worker_id = worker.unwrap_or_else(|| format!("drain-{}", Uuid::new_v4()));
    let engine = match Engine::open(config) {
        Ok(e) => e,
        Err(e) => return fail(&e),
    };

    let mut worker = OutboxWorker::new(engine);
    let result = worker.reclaim_stale().and_then(|reclaimed| {
        let mut processed = 0;
        loop {
            let handled = worker.run_once(&worker_id, batch)?;
            if handled == 0 {
                return Ok((reclaimed, processed));
            }
            processed += handled;
        }
    });
    match result {
        Ok((reclaimed, processed)) => {
            info!(worker = %worker_id, processed, "outbox drained");
            println!(
                "{}",
                serde_json::json!({ "worker": worker_id, "reclaimed": reclaimed, "processed": processed })
            );
            0
        }
        Err(e) => fail(&e),
    }
}

fn run_watch(db: Option<String>, batch: Option<usize>, worker: Option<String>) -> i32 {
    let config = match config(db, batch) {
        Ok(c) => c,
        Err(e) => return fail(&e),
    };
    let engine = match Engine::open(config) {
        Ok(e) => e,
        Err(e) => return fail(&e),
    };
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {e}");
            return 1;
        }
    };

    runtime.block_on(async move {
        let runner = OutboxRunner::spawn(OutboxWorker::new(engine), worker);
        if let Err(e) = tokio::signal::ctrl_c().await {
            eprintln!("Error: failed to listen for Ctrl-C: {e}");
        }
        info!("stopping outbox worker");
        match runner.shutdown().await {
            Ok(_) => 0,
            Err(e) => fail(&e),
        }
    })
}

fn run_order(db: Option<String>, table: &str) -> i32 {
    let table_id = match TableId::parse(table) {
        Ok(id) => id,
        Err(e) => {
            eprintln!("Error: {e}");
            return 2;
        }
    };
    let config = match config(db, None) {
        Ok(c) => c,
        Err(e) => return fail(&e),
    };
    let engine = match Engine::open(config) {
        Ok(e) => e,
        Err(e) => return fail(&e),
    };
    let Some(table) = engine.schema().table(&table_id) else {
        eprintln!("Error: table {table_id} not found");
        return 1;
    };

    match engine.evaluation_order(&table_id) {
        Ok(order) => {
            let fields: Vec<serde_json::Value> = order
                .iter()
                .filter_map(|id| table.field(id))
                .map(|f| serde_json::json!({ "id": f.id, "name": f.name, "type": f.kind.type_name() }))
                .collect();
            let json = serde_json::to_string_pretty(&fields)
                .unwrap_or_else(|e| format!("{{\"error\": \"failed to serialize order: {e}\"}}"));
            println!("{json}");
            0
        }
        Err(e) => fail(&e),
    }
}
