//! Command line and `chainscan.conf` handling.
//!
//! Flags given on the command line win over the config file; the file only
//! fills in what the command line left unset.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chainscan_log::{Format, Level, LogConfig, TargetLevel};
use chainscan_mempool::{MempoolConfig, DEFAULT_BROADCAST_TIMEOUT};
use chainscan_scanner::ScanConfig;

use crate::engine::EngineConfig;

pub const DEFAULT_DATA_DIR: &str = "data";
pub const CONF_FILE_NAME: &str = "chainscan.conf";

const SUPPORTED_CONF_KEYS: [&str; 15] = [
    "blocksdir",
    "broadcasttimeout",
    "clearmempool",
    "db",
    "ingestqueue",
    "logformat",
    "loglevel",
    "logtarget",
    "logtimestamps",
    "mempoolworkers",
    "network",
    "scanbatchbytes",
    "scanthreads",
    "writequeuedepth",
    "statusjson",
];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Backend {
    Memory,
    Fjall,
}

impl Backend {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "memory" => Some(Self::Memory),
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Network {
    Mainnet,
    Testnet,
    Regtest,
    Signet,
}

impl Network {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "mainnet" | "main" => Some(Self::Mainnet),
            "testnet" | "test" => Some(Self::Testnet),
            "regtest" => Some(Self::Regtest),
            "signet" => Some(Self::Signet),
            _ => None,
        }
    }

    /// Message start bytes that prefix every record in the block files.
    pub fn magic(self) -> [u8; 4] {
        match self {
            Self::Mainnet => [0xf9, 0xbe, 0xb4, 0xd9],
            Self::Testnet => [0x0b, 0x11, 0x09, 0x07],
            Self::Regtest => [0xfa, 0xbf, 0xb5, 0xda],
            Self::Signet => [0x0a, 0x03, 0xcf, 0x40],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Mainnet => "mainnet",
            Self::Testnet => "testnet",
            Self::Regtest => "regtest",
            Self::Signet => "signet",
        }
    }
}

#[derive(Clone, Debug)]
pub struct Config {
    pub backend: Backend,
    pub data_dir: PathBuf,
    pub conf_path: PathBuf,
    pub blocks_dir: PathBuf,
    pub network: Network,
    pub log: LogConfig,
    pub scan: ScanConfig,
    pub mempool: MempoolConfig,
    pub broadcast_timeout: Duration,
    pub status_json: bool,
    /// Keys in the config file this build does not understand.
    pub unknown_conf_keys: Vec<String>,
}

impl Config {
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            scan: self.scan,
            mempool: self.mempool,
            broadcast_timeout: self.broadcast_timeout,
        }
    }

    pub fn db_dir(&self) -> PathBuf {
        self.data_dir.join("db")
    }
}

#[derive(Debug)]
pub enum CliAction {
    Run(Box<Config>),
    PrintHelp,
    PrintVersion,
}

/// Values taken from the command line; `None` means "not given".
#[derive(Default)]
struct Overrides {
    backend: Option<Backend>,
    data_dir: Option<PathBuf>,
    conf_path: Option<PathBuf>,
    blocks_dir: Option<PathBuf>,
    network: Option<Network>,
    log_level: Option<Level>,
    log_format: Option<Format>,
    log_timestamps: Option<bool>,
    log_targets: Vec<TargetLevel>,
    scan_threads: Option<usize>,
    scan_batch_bytes: Option<usize>,
    write_queue_depth: Option<usize>,
    mempool_workers: Option<usize>,
    ingest_queue: Option<usize>,
    broadcast_timeout_secs: Option<u64>,
    clear_mempool: Option<bool>,
    status_json: bool,
}

pub fn parse_args() -> Result<CliAction, String> {
    parse_args_from(std::env::args().skip(1))
}

pub fn parse_args_from<I>(raw_args: I) -> Result<CliAction, String>
where
    I: IntoIterator<Item = String>,
{
    let mut args = raw_args.into_iter().peekable();
    match args.peek().map(String::as_str) {
        Some("help") => return Ok(CliAction::PrintHelp),
        Some("version") => return Ok(CliAction::PrintVersion),
        _ => {}
    }

    let mut cli = Overrides::default();
    while let Some(arg) = args.next() {
        let mut value_for = |flag: &str| {
            args.next()
                .ok_or_else(|| format!("missing value for {flag}\n{}", usage()))
        };
        match arg.as_str() {
            "--datadir" | "--data-dir" => {
                cli.data_dir = Some(PathBuf::from(value_for("--datadir")?));
            }
            "--conf" => {
                cli.conf_path = Some(PathBuf::from(value_for("--conf")?));
            }
            "--blocksdir" | "--blocks-dir" => {
                cli.blocks_dir = Some(PathBuf::from(value_for("--blocksdir")?));
            }
            "--network" => {
                let value = value_for("--network")?;
                cli.network = Some(
                    Network::parse(&value)
                        .ok_or_else(|| format!("invalid network '{value}'\n{}", usage()))?,
                );
            }
            "--db" | "--backend" => {
                let value = value_for("--db")?;
                cli.backend = Some(
                    Backend::parse(&value)
                        .ok_or_else(|| format!("invalid db backend '{value}'\n{}", usage()))?,
                );
            }
            "--log-level" | "--loglevel" => {
                let value = value_for("--log-level")?;
                cli.log_level = Some(
                    Level::parse(&value)
                        .ok_or_else(|| format!("invalid log level '{value}'\n{}", usage()))?,
                );
            }
            "--log-format" | "--logformat" => {
                let value = value_for("--log-format")?;
                cli.log_format = Some(
                    Format::parse(&value)
                        .ok_or_else(|| format!("invalid log format '{value}'\n{}", usage()))?,
                );
            }
            "--log-timestamps" | "--logtimestamps" => cli.log_timestamps = Some(true),
            "--no-log-timestamps" | "--no-logtimestamps" => cli.log_timestamps = Some(false),
            "--log-target" => {
                let value = value_for("--log-target")?;
                cli.log_targets.push(
                    TargetLevel::parse(&value)
                        .ok_or_else(|| format!("invalid log target '{value}'\n{}", usage()))?,
                );
            }
            "--scan-threads" => {
                let value = value_for("--scan-threads")?;
                cli.scan_threads = Some(parse_positive(&value, "scan threads")?);
            }
            "--scan-batch-bytes" => {
                let value = value_for("--scan-batch-bytes")?;
                cli.scan_batch_bytes = Some(parse_positive(&value, "scan batch bytes")?);
            }
            "--write-queue-depth" => {
                let value = value_for("--write-queue-depth")?;
                cli.write_queue_depth = Some(parse_positive(&value, "write queue depth")?);
            }
            "--mempool-workers" => {
                let value = value_for("--mempool-workers")?;
                cli.mempool_workers = Some(parse_positive(&value, "mempool workers")?);
            }
            "--ingest-queue" => {
                let value = value_for("--ingest-queue")?;
                cli.ingest_queue = Some(parse_positive(&value, "ingest queue")?);
            }
            "--broadcast-timeout-secs" => {
                let value = value_for("--broadcast-timeout-secs")?;
                cli.broadcast_timeout_secs = Some(
                    value
                        .parse::<u64>()
                        .map_err(|_| format!("invalid broadcast timeout '{value}'\n{}", usage()))?,
                );
            }
            "--clear-mempool" => cli.clear_mempool = Some(true),
            "--status-json" => cli.status_json = true,
            "--help" | "-h" => return Ok(CliAction::PrintHelp),
            "--version" | "-V" => return Ok(CliAction::PrintVersion),
            other => {
                return Err(format!("unknown argument '{other}'\n{}", usage()));
            }
        }
    }

    let data_dir = cli
        .data_dir
        .take()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    let conf_path = cli
        .conf_path
        .take()
        .unwrap_or_else(|| data_dir.join(CONF_FILE_NAME));
    let conf = load_conf(&conf_path)?.unwrap_or_default();
    merge(cli, conf, data_dir, conf_path).map(|config| CliAction::Run(Box::new(config)))
}

fn merge(
    cli: Overrides,
    conf: HashMap<String, Vec<String>>,
    data_dir: PathBuf,
    conf_path: PathBuf,
) -> Result<Config, String> {
    let file = ConfValues {
        values: &conf,
        path: &conf_path,
    };

    let backend = match cli.backend {
        Some(backend) => backend,
        None => file.parse("db", Backend::parse)?.unwrap_or(Backend::Fjall),
    };
    let network = match cli.network {
        Some(network) => network,
        None => file.parse("network", Network::parse)?.unwrap_or(Network::Mainnet),
    };
    let blocks_dir = match cli.blocks_dir {
        Some(dir) => dir,
        None => file
            .last("blocksdir")
            .map(|raw| resolve_relative(&data_dir, raw))
            .unwrap_or_else(|| data_dir.join("blocks")),
    };

    let mut log = LogConfig::default();
    log.level = match cli.log_level {
        Some(level) => level,
        None => file.parse("loglevel", Level::parse)?.unwrap_or(log.level),
    };
    log.format = match cli.log_format {
        Some(format) => format,
        None => file.parse("logformat", Format::parse)?.unwrap_or(log.format),
    };
    log.timestamps = match cli.log_timestamps {
        Some(timestamps) => timestamps,
        None => file.parse("logtimestamps", parse_conf_bool)?.unwrap_or(log.timestamps),
    };
    for raw in file.all("logtarget") {
        log.targets.push(TargetLevel::parse(raw).ok_or_else(|| file.invalid("logtarget", raw))?);
    }
    // Command line targets come last so they win for the same prefix.
    log.targets.extend(cli.log_targets);

    let defaults = ScanConfig::default();
    let scan = ScanConfig {
        threads: pick(cli.scan_threads, file.positive("scanthreads")?, defaults.threads),
        batch_bytes: pick(
            cli.scan_batch_bytes,
            file.positive("scanbatchbytes")?,
            defaults.batch_bytes,
        ),
        write_queue_depth: pick(
            cli.write_queue_depth,
            file.positive("writequeuedepth")?,
            defaults.write_queue_depth,
        ),
    };

    let defaults = MempoolConfig::default();
    let mempool = MempoolConfig {
        workers: pick(cli.mempool_workers, file.positive("mempoolworkers")?, defaults.workers),
        ingest_queue: pick(
            cli.ingest_queue,
            file.positive("ingestqueue")?,
            defaults.ingest_queue,
        ),
        clear_on_open: match cli.clear_mempool {
            Some(clear) => clear,
            None => file
                .parse("clearmempool", parse_conf_bool)?
                .unwrap_or(defaults.clear_on_open),
        },
    };

    let broadcast_timeout = match cli.broadcast_timeout_secs {
        Some(secs) => Duration::from_secs(secs),
        None => file
            .parse("broadcasttimeout", |raw| raw.trim().parse::<u64>().ok())?
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_BROADCAST_TIMEOUT),
    };
    let status_json = cli.status_json || file.parse("statusjson", parse_conf_bool)?.unwrap_or(false);

    let mut unknown_conf_keys: Vec<String> = conf
        .keys()
        .filter(|key| !SUPPORTED_CONF_KEYS.contains(&key.as_str()))
        .cloned()
        .collect();
    unknown_conf_keys.sort();

    Ok(Config {
        backend,
        data_dir,
        conf_path,
        blocks_dir,
        network,
        log,
        scan,
        mempool,
        broadcast_timeout,
        status_json,
        unknown_conf_keys,
    })
}

struct ConfValues<'a> {
    values: &'a HashMap<String, Vec<String>>,
    path: &'a Path,
}

impl ConfValues<'_> {
    fn last(&self, key: &str) -> Option<&str> {
        self.values.get(key)?.last().map(String::as_str)
    }

    fn all(&self, key: &str) -> impl Iterator<Item = &str> {
        self.values.get(key).into_iter().flatten().map(String::as_str)
    }

    fn invalid(&self, key: &str, raw: &str) -> String {
        format!("invalid {key} '{raw}' in {}", self.path.display())
    }

    fn parse<T>(&self, key: &str, parse: impl Fn(&str) -> Option<T>) -> Result<Option<T>, String> {
        match self.last(key) {
            Some(raw) => parse(raw).map(Some).ok_or_else(|| self.invalid(key, raw)),
            None => Ok(None),
        }
    }

    fn positive(&self, key: &str) -> Result<Option<usize>, String> {
        self.parse(key, |raw| raw.trim().parse::<usize>().ok().filter(|value| *value > 0))
    }
}

fn pick(cli: Option<usize>, conf: Option<usize>, default: usize) -> usize {
    cli.or(conf).unwrap_or(default)
}

fn parse_positive(value: &str, what: &str) -> Result<usize, String> {
    match value.parse::<usize>() {
        Ok(parsed) if parsed > 0 => Ok(parsed),
        _ => Err(format!("invalid {what} '{value}'\n{}", usage())),
    }
}

fn resolve_relative(base: &Path, raw: &str) -> PathBuf {
    let path = PathBuf::from(raw);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

/// Reads a `key=value` config file. A missing file is `Ok(None)`.
pub fn load_conf(path: &Path) -> Result<Option<HashMap<String, Vec<String>>>, String> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(format!("failed to read {}: {err}", path.display())),
    };

    let mut out: HashMap<String, Vec<String>> = HashMap::new();
    for raw_line in contents.lines() {
        let mut line = raw_line.trim();
        if let Some(idx) = line.find(['#', ';']) {
            line = &line[..idx];
        }
        line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = match line.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => (line, "1"),
        };
        if key.is_empty() {
            continue;
        }
        out.entry(key.to_ascii_lowercase())
            .or_default()
            .push(value.to_string());
    }
    Ok(Some(out))
}

pub fn parse_conf_bool(value: &str) -> Option<bool> {
    let value = value.trim();
    if value.is_empty() {
        return Some(true);
    }
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

pub fn usage() -> String {
    [
        "Usage:",
        "  chainscand [options]",
        "  chainscand <command>",
        "",
        "Commands:",
        "  help     Print this help and exit",
        "  version  Print version and exit",
        "",
        "Options:",
        "  --help, -h  Print this help and exit",
        "  --version, -V  Print version and exit",
        "  --datadir  Base data directory (default: ./data)",
        "  --conf  Config file path (default: <datadir>/chainscan.conf)",
        "  --blocksdir  Directory holding blkNNNNN.dat files (default: <datadir>/blocks)",
        "  --network  Block file magic to expect (mainnet|testnet|regtest|signet) (default: mainnet)",
        "  --db  Storage backend (memory|fjall) (default: fjall)",
        "  --log-level  Log verbosity (error|warn|info|debug|trace) (default: info)",
        "  --log-format  Log output format (text|json) (default: text)",
        "  --log-timestamps  Enable timestamps in text logs (default: on)",
        "  --no-log-timestamps  Disable timestamps in text logs",
        "  --log-target  Per-module level override, e.g. chainscan_scanner=debug (repeatable)",
        "  --scan-threads  Worker threads for the scan passes (default: all cores)",
        "  --scan-batch-bytes  Block bytes per scan batch (default: 33554432)",
        "  --write-queue-depth  Scan batches allowed to wait for the writer (default: 2)",
        "  --mempool-workers  Threads draining the transaction ingest queue (default: 2)",
        "  --ingest-queue  Capacity of the transaction ingest queue (default: 1024)",
        "  --broadcast-timeout-secs  How long to wait for a peer to answer a broadcast (default: 10)",
        "  --clear-mempool  Drop the stored pending transactions on startup",
        "  --status-json  Print the final status as JSON on stdout",
    ]
    .join("\n")
}
