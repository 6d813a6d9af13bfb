//! MapWAL - Pluggable Write-Ahead Log for Replicated Maps
//!
//! Command-line tool for creating configurations, appending records to a
//! map's log and inspecting segment files.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mapwal::backend::segment::{self, read_records};
use mapwal::backend::BackendRegistry;
use mapwal::config::MapWalConfig;
use mapwal::error::{Error, Result};
use mapwal::fs::{FileSystem, LocalFileSystem};
use mapwal::sequence::{decompose, SequenceGenerator};
use mapwal::wal::segment::{list_segments, read_segment};
use mapwal::wal::{MapRecord, WalWriter};
use mapwal::serializer::{self, Serializer};
use mapwal::tuning;

/// MapWAL - Pluggable Write-Ahead Log for Replicated Maps
#[derive(Parser)]
#[command(name = "mapwal")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "mapwal.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "mapwal.toml")]
        output: PathBuf,

        /// Storage root for WAL directories
        #[arg(long)]
        root: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },

    /// Validate configuration file
    Validate,

    /// Show hardware sizing, backends and resolved settings
    Info,

    /// Append records to a map's log
    Append {
        /// Map name; the log lives under maps/<name> in the storage root
        map: String,

        /// Records: key=value for a put, -key for a delete
        #[arg(required = true, allow_hyphen_values = true)]
        records: Vec<String>,

        /// Member name used to derive sequence numbers
        #[arg(long, default_value = "member-1")]
        member: String,

        /// Write to the in-memory backend instead of disk
        #[arg(long)]
        dry_run: bool,
    },

    /// List a map's segments
    Inspect {
        /// Map name
        map: String,

        /// Print every record as JSON
        #[arg(long)]
        dump: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let logging = if cli.config.exists() {
        MapWalConfig::from_file(&cli.config)
            .map(|c| c.logging)
            .unwrap_or_default()
    } else {
        Default::default()
    };
    let level = cli.log_level.as_deref().unwrap_or(&logging.level);
    init_logging(level, &logging.format);

    match cli.command {
        Commands::Init {
            output,
            root,
            force,
        } => run_init(output, root, force),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
        Commands::Append {
            map,
            records,
            member,
            dry_run,
        } => run_append(cli.config, map, records, member, dry_run),
        Commands::Inspect { map, dump } => run_inspect(cli.config, map, dump),
    }
}

/// Initialize logging
fn init_logging(level: &str, format: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    let registry = tracing_subscriber::registry().with(env_filter);
    if format == "compact" {
        registry
            .with(tracing_subscriber::fmt::layer().compact())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Create a configuration file
fn run_init(output: PathBuf, root: Option<PathBuf>, force: bool) -> Result<()> {
    if output.exists() && !force {
        return Err(Error::Config(format!(
            "{} already exists (use --force to overwrite)",
            output.display()
        )));
    }

    let mut config = MapWalConfig::default();
    if let Some(root) = root {
        config.storage.root = root;
    }

    let content = format!(
        "# MapWAL Configuration\n# Generated configuration file\n\n{}",
        config.to_toml_string()?
    );
    std::fs::write(&output, content)?;

    println!("Configuration file created: {}", output.display());
    println!("Then append with: mapwal --config {} append <map> key=value", output.display());
    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match MapWalConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Backend:    {}", config.storage.backend);
            println!("  Root:       {}", config.storage.root.display());
            println!("  Serializer: {}", config.storage.serializer);
            println!("  Mode:       {}", config.wal.mode);

            BackendRegistry::global().resolve(&config.storage.backend)?;
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show sizing and settings
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = if config_path.exists() {
        MapWalConfig::from_file(&config_path)?
    } else {
        MapWalConfig::default()
    };
    let sizing = config.wal.pool.sizing();

    println!("MapWAL Information");
    println!("==================");
    println!();
    println!("{}", tuning::sizing_summary(&sizing));
    println!();
    println!("Backends:         {}", BackendRegistry::global().names().join(", "));
    println!();
    println!("Storage Configuration:");
    println!("  Backend:        {}", config.storage.backend);
    println!("  Root:           {}", config.storage.root.display());
    println!("  Block Size:     {} bytes", config.storage.block_size);
    println!("  Serializer:     {}", config.storage.serializer);
    println!("  Compression:    {}", config.storage.compression);
    println!("  Fsync:          {}", config.storage.fsync);
    println!();
    println!("WAL Configuration:");
    println!("  Mode:           {}", config.wal.mode);
    println!("  Close Timeout:  {} ms", config.wal.close_timeout_ms);
    println!("  Rejection:      {:?}", config.wal.pool.rejection);
    println!("  Shutdown:       {:?}", config.wal.pool.shutdown);

    Ok(())
}

/// Parse `key=value` into a put and `-key` into a delete
fn parse_record(generator: &SequenceGenerator, arg: &str) -> Result<MapRecord> {
    if let Some(key) = arg.strip_prefix('-') {
        if key.is_empty() {
            return Err(Error::Config("delete needs a key: -<key>".into()));
        }
        return Ok(MapRecord::delete(generator.next(), key, "String"));
    }

    match arg.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok(MapRecord::put(
            generator.next(),
            key,
            "String",
            value,
            "String",
        )),
        _ => Err(Error::Config(format!(
            "expected key=value or -key, got {:?}",
            arg
        ))),
    }
}

/// Generator for `member` that continues after the newest record on disk
fn resume_generator(
    fs: &dyn FileSystem,
    config: &MapWalConfig,
    dir: &Path,
    serializer: &dyn Serializer,
    member: &str,
) -> Result<SequenceGenerator> {
    let member = SequenceGenerator::parse_member(member);
    if config.storage.backend != segment::NAME {
        return Ok(SequenceGenerator::new(member));
    }

    let last = read_records(fs, dir, serializer)?
        .iter()
        .map(MapRecord::sequence)
        .max();
    Ok(match last {
        Some(last) => {
            tracing::debug!(last, "resuming sequence numbers");
            SequenceGenerator::resume_after(member, last)
        }
        None => SequenceGenerator::new(member),
    })
}

/// Write records through a writer in the configured mode
fn run_append(
    config_path: PathBuf,
    map: String,
    records: Vec<String>,
    member: String,
    dry_run: bool,
) -> Result<()> {
    let mut config = MapWalConfig::from_file(&config_path)?;
    if dry_run {
        config.storage.backend = "memory".to_string();
    }

    let fs: Arc<dyn FileSystem> = Arc::new(LocalFileSystem::new(&config.storage.root));
    let dir = config.map_path(&map);
    let serializer = serializer::by_name(&config.storage.serializer)?;

    let generator = resume_generator(fs.as_ref(), &config, &dir, serializer.as_ref(), &member)?;
    let records = records
        .iter()
        .map(|arg| parse_record(&generator, arg))
        .collect::<Result<Vec<_>>>()?;

    let writer = WalWriter::open(fs, &config.storage, &config.wal, &dir, serializer)?;

    for record in records {
        tracing::debug!(%record, "appending");
        if let Err(e) = writer.write(record) {
            tracing::error!("write failed: {}", e);
            writer.close()?;
            return Err(e);
        }
    }

    let report = writer.close()?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// List segments and optionally dump records
fn run_inspect(config_path: PathBuf, map: String, dump: bool) -> Result<()> {
    let config = MapWalConfig::from_file(&config_path)?;
    let fs = LocalFileSystem::new(&config.storage.root);
    let dir = config.map_path(&map);

    let segments = list_segments(&fs, &dir)?;
    if segments.is_empty() {
        println!("No segments under {}", fs.root().join(&dir).display());
        return Ok(());
    }

    println!("Map: {} ({})", map, fs.root().join(&dir).display());
    for (index, path) in &segments {
        let contents = read_segment(&fs, path)?;
        println!(
            "  {:>6}  {:>8} records  {:<8} {}{}",
            index,
            contents.payloads.len(),
            if contents.header.sealed { "sealed" } else { "open" },
            segment_name(path),
            if contents.torn_tail { "  (torn tail)" } else { "" },
        );
    }

    if dump {
        let serializer = serializer::by_name(&config.storage.serializer)?;
        for record in read_records(&fs, &dir, serializer.as_ref())? {
            let (issued_at_ms, member, _) = decompose(record.sequence());
            let line = serde_json::json!({
                "sequence": record.sequence(),
                "member": member,
                "issued_at_ms": issued_at_ms,
                "operation": record.operation().to_string(),
                "key": String::from_utf8_lossy(record.key()),
                "key_class": record.key_class(),
                "value": record.value().map(String::from_utf8_lossy),
                "value_class": record.value_class(),
                "timestamp": record.timestamp(),
            });
            println!("{}", line);
        }
    }

    Ok(())
}

fn segment_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
