//! `chainscand`: indexes the blocks found in a blk-file directory and keeps
//! the pending transaction table alongside.

pub mod blkfile;
pub mod config;
pub mod engine;

use std::fs;
use std::sync::Arc;

use chainscan_chainstate::HeaderRecord;
use chainscan_log as logging;
use chainscan_mempool::{NullSink, OfflineNetwork};
use chainscan_storage::fjall::FjallStore;
use chainscan_storage::memory::MemoryStore;
use chainscan_storage::KeyValueStore;

pub use blkfile::BlkFileSource;
pub use config::{parse_args, parse_args_from, usage, Backend, CliAction, Config, Network};
pub use engine::{Engine, EngineConfig, EngineError, EngineStatus};

/// Headers handed to the engine per `add_blocks` call.
const IMPORT_CHUNK: usize = 2_000;

pub fn run_entry() -> Result<(), String> {
    match parse_args()? {
        CliAction::PrintHelp => {
            println!("{}", usage());
            Ok(())
        }
        CliAction::PrintVersion => {
            println!("chainscand {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        CliAction::Run(config) => run(*config),
    }
}

fn run(config: Config) -> Result<(), String> {
    logging::init(config.log.clone());
    if !config.unknown_conf_keys.is_empty() {
        logging::log_warn!(
            "ignoring unsupported keys in {}: {}",
            config.conf_path.display(),
            config.unknown_conf_keys.join(", ")
        );
    }
    fs::create_dir_all(&config.data_dir).map_err(|err| {
        format!(
            "failed to create data dir {}: {err}",
            config.data_dir.display()
        )
    })?;
    logging::log_info!(
        "starting chainscand {} ({}, {:?} backend, data dir {})",
        env!("CARGO_PKG_VERSION"),
        config.network.as_str(),
        config.backend,
        config.data_dir.display()
    );

    match config.backend {
        Backend::Memory => {
            let store = Arc::new(MemoryStore::new());
            run_with_store(&config, store)?;
        }
        Backend::Fjall => {
            let db_dir = config.db_dir();
            let store = Arc::new(
                FjallStore::open(&db_dir)
                    .map_err(|err| format!("failed to open {}: {err}", db_dir.display()))?,
            );
            run_with_store(&config, Arc::clone(&store))?;
            store.persist().map_err(|err| err.to_string())?;
        }
    }
    Ok(())
}

/// Imports every block in the blocks dir, scans it and reports the status.
pub fn run_with_store<S: KeyValueStore + 'static>(
    config: &Config,
    store: Arc<S>,
) -> Result<EngineStatus, String> {
    let source = Arc::new(BlkFileSource::new(
        config.blocks_dir.clone(),
        config.network.magic(),
    ));
    let records = source.import().map_err(|err| err.to_string())?;
    let engine = Engine::open(
        config.engine_config(),
        store,
        source,
        Arc::new(OfflineNetwork),
        Arc::new(NullSink),
    )
    .map_err(|err| err.to_string())?;

    let result = import_records(&engine, records).and_then(|()| engine.status());
    let shutdown = engine.shutdown();
    let status = result.map_err(|err| {
        logging::log_error!("import failed: {err}");
        err.to_string()
    })?;
    shutdown.map_err(|err| err.to_string())?;

    if config.status_json {
        let json = serde_json::to_string_pretty(&status).map_err(|err| err.to_string())?;
        println!("{json}");
    } else {
        logging::log_info!(
            "headers {}, top {:?}, scanned to {:?} in {} batches, {} pending txs",
            status.headers,
            status.top_height,
            status.scan_height,
            status.scan_batches,
            status.pending_txs
        );
    }
    Ok(status)
}

fn import_records<S: KeyValueStore + 'static>(
    engine: &Engine<S>,
    mut records: Vec<HeaderRecord>,
) -> Result<(), EngineError> {
    while !records.is_empty() {
        let rest = records.split_off(records.len().min(IMPORT_CHUNK));
        let state = engine.add_blocks(records)?;
        if state.is_reorg() {
            logging::log_debug!("import chunk reorganized the best chain");
        }
        records = rest;
    }
    Ok(())
}
