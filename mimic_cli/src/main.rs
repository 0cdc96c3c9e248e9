use mimic_core::builder::{BuildOptions, TableBuilder};
use mimic_core::config::MimicConfig;
use mimic_core::encoder::{EncodedToken, Encoder};
use mimic_core::mapper::PositionMapper;
use mimic_core::oracle::OracleClient;
use mimic_core::store::{FileTableStore, TableStore};
use mimic_core::table::Table;
use mimic_core::verifier::Verifier;

use anyhow::{Context, anyhow, bail};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(short, long, value_parser)]
    config_file: Option<PathBuf>,
    /// Table file, overriding `[table] path`.
    #[clap(short, long)]
    table: Option<PathBuf>,
    /// Oracle endpoint, overriding `[oracle] endpoint`.
    #[clap(long)]
    endpoint: Option<String>,
    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Learn every alphabet symbol for positions `from..to` by querying the oracle.
    Build {
        #[clap(long, default_value_t = 0)]
        from: usize,
        /// One past the last position to learn.
        #[clap(long)]
        to: usize,
        /// Stop cleanly after this many oracle calls.
        #[clap(long)]
        max_queries: Option<u64>,
        /// Re-query recorded entries and fail on any disagreement.
        #[clap(long)]
        recheck: bool,
    },
    /// Print the token for a plaintext using only the learned table.
    Encode { plaintext: String },
    /// Compare the local token with a reference, fetched live when none is given.
    Verify {
        plaintext: String,
        #[clap(long)]
        reference: Option<String>,
    },
    /// Summarise the learned table.
    Show,
    /// Rewrite the table journal into canonical form.
    Compact,
}

fn load_config(path: Option<PathBuf>) -> Result<MimicConfig, anyhow::Error> {
    match path {
        Some(config_path) => {
            info!(path = ?config_path, "Loading configuration");
            MimicConfig::load_from_file(&config_path)
        }
        None => {
            let default_config_path = PathBuf::from("mimic.toml");
            if default_config_path.exists() {
                info!(path = ?default_config_path, "Loading default configuration");
                MimicConfig::load_from_file(&default_config_path)
            } else {
                info!("No config file specified and 'mimic.toml' not found, using built-in defaults");
                Ok(MimicConfig::default())
            }
        }
    }
}

fn load_table(path: &Path) -> Result<Table, anyhow::Error> {
    if !path.exists() {
        bail!("Table {path:?} does not exist; run `mimic build` first");
    }
    FileTableStore::load(path).with_context(|| format!("Failed to load table {path:?}"))
}

fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(cli.config_file)?;
    if let Some(table) = cli.table {
        config.table.path = table;
    }
    if let Some(endpoint) = cli.endpoint {
        config.oracle.endpoint = Some(endpoint);
    }

    let mapper = config.mapper.mapper()?;
    let table_path = config.table.path.clone();

    match cli.command {
        Command::Build {
            from,
            to,
            max_queries,
            recheck,
        } => {
            if from >= to {
                bail!("Empty position range {from}..{to}");
            }
            let alphabet = config.alphabet.plan()?;
            let options = BuildOptions {
                recheck: recheck || config.build.recheck,
                max_queries: max_queries.or(config.build.max_queries),
                header_len: config.table.header_len,
                header: config.table.header()?,
            };
            let oracle = OracleClient::from_settings(&config.oracle)?;
            let store = FileTableStore::open(&table_path)?;

            let start_time = Instant::now();
            let mut builder = TableBuilder::new(oracle, store, mapper, options);
            let report = builder.build(from..to, &alphabet)?;
            let (oracle, store) = builder.into_parts();

            if report.frame_disagreements > 0 {
                warn!(
                    disagreements = report.frame_disagreements,
                    "Frame bytes varied between probes; verify before trusting encoded tokens"
                );
            }
            println!(
                "Learned {} entries ({} skipped, {} rechecked) over positions {:?} in {:.2?}",
                report.learned,
                report.skipped,
                report.rechecked,
                report.positions_completed,
                start_time.elapsed()
            );
            println!(
                "Oracle requests: {}, table now holds {} entries",
                oracle.requests(),
                store.table().entry_count()
            );
            if report.interrupted {
                println!("Query budget reached; rerun the same command to resume.");
            }
        }
        Command::Encode { plaintext } => {
            let table = load_table(&table_path)?;
            let token = Encoder::new(&table, &mapper).encode(&plaintext)?;
            println!("{token}");
        }
        Command::Verify {
            plaintext,
            reference,
        } => {
            let table = load_table(&table_path)?;
            let verifier = Verifier::new(&table, &mapper);
            let report = match reference {
                Some(reference) => {
                    let reference: EncodedToken = reference.parse()?;
                    verifier.verify(&plaintext, &reference)?
                }
                None => {
                    let mut oracle = OracleClient::from_settings(&config.oracle)?;
                    verifier.verify_live(&plaintext, &mut oracle)?
                }
            };
            println!("{report}");
            if !report.is_exact() {
                return Err(anyhow!("Local token differs from reference"));
            }
        }
        Command::Show => {
            let table = load_table(&table_path)?;
            show(&table, &mapper);
        }
        Command::Compact => {
            if !table_path.exists() {
                bail!("Table {table_path:?} does not exist");
            }
            let mut store = FileTableStore::open(&table_path)?;
            store.compact()?;
            println!(
                "Compacted {:?}: {} entries",
                store.path(),
                store.table().entry_count()
            );
        }
    }

    Ok(())
}

fn show(table: &Table, mapper: &PositionMapper) {
    match table.header() {
        Some(header) => println!("header ({} bytes): {}", header.len(), header.to_hex()),
        None => println!("header: <not captured>"),
    }
    match table.mapper() {
        Some(stamp) if stamp.fingerprint == mapper.fingerprint() => println!("mapper: {stamp}"),
        Some(stamp) => println!(
            "mapper: {stamp} (configured mapper is {} {}, tables are not interchangeable)",
            mapper.version(),
            mapper.fingerprint()
        ),
        None => println!("mapper: <not stamped>"),
    }
    println!("frame bytes: {}", table.frame().len());
    for position in table.positions() {
        let symbols: String = table.entries_at(position).iter().map(|(c, _)| *c).collect();
        println!(
            "{position:>4} @ offset {:>4}: {:>3} symbols  {symbols}",
            mapper.map(position),
            symbols.chars().count()
        );
    }
    println!(
        "{} entries, encodes plaintexts up to {} characters",
        table.entry_count(),
        table.highest_position().map_or(0, |p| p + 1)
    );
}
