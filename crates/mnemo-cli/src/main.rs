//! Reference CLI surface for `mnemo` (§6): a thin `clap`-derived wrapper
//! over [`mnemo::MemoryEngine`]. Every subcommand opens (or initializes)
//! one chain directory, performs a single operation, and prints either a
//! human-readable summary or (for `list`/`search`/`export`) JSON.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use mnemo::{
    AddEntryInput, Error, InitOptions, KeyMode, MemoryEngine, PasswordProvider,
    RetrievalFilters, RetrieveOptions, Tier, VerifyOptions,
};
use serde_json::json;

/// Exit code for a successful operation.
const EXIT_OK: u8 = 0;
/// Exit code for a generic (non-integrity) failure.
const EXIT_FAILURE: u8 = 1;
/// Exit code reserved for integrity failures (a `verify` with errors).
const EXIT_INTEGRITY: u8 = 2;
/// Exit code for caller misuse (bad flags, unknown type/tier).
const EXIT_MISUSE: u8 = 3;

#[derive(Parser, Debug)]
#[command(name = "mnemo", about = "Tamper-evident, verifiable memory store for AI agents")]
struct Cli {
    /// Chain directory. Defaults to `$MEMORY_CHAIN_DIR`, then `./mnemo-data`.
    #[arg(long, global = true)]
    dir: Option<PathBuf>,

    /// Password for an `encrypted` key mode (also read from signing operations).
    #[arg(long, global = true)]
    password: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a fresh chain directory with a genesis identity entry.
    Init {
        /// Agent name recorded in the genesis entry and `config.json`.
        #[arg(long, default_value = "agent")]
        name: String,
        /// How the private signing key is stored: `raw`, `encrypted`, or `env`.
        #[arg(long, default_value = "raw")]
        key_mode: String,
    },
    /// Append a new memory entry.
    Add {
        /// The entry's text content.
        content: String,
        /// Entry type: `memory`, `decision`, or `redaction`.
        #[arg(long, default_value = "memory")]
        r#type: String,
        /// Persistence tier: `committed`, `relationship`, or `ephemeral`.
        #[arg(long, default_value = "relationship")]
        tier: String,
        /// Repeatable `KEY=VALUE` metadata pairs.
        #[arg(long = "metadata", value_name = "KEY=VAL")]
        metadata: Vec<String>,
    },
    /// Verify the chain's hash linkage, signatures, and (by default) content.
    Verify {
        /// Skip recomputing and comparing each entry's content blob.
        #[arg(long)]
        skip_content: bool,
    },
    /// Run hybrid retrieval against the index.
    Search {
        /// Free-text query.
        query: String,
        /// Token budget for the packed result.
        #[arg(long, default_value_t = 2000)]
        max_tokens: u64,
        /// Maximum results to consider before token budgeting.
        #[arg(long, default_value_t = 20)]
        max_results: usize,
        /// Restrict to these entry types (repeatable).
        #[arg(long = "type")]
        types: Vec<String>,
        /// Restrict to these tiers (repeatable).
        #[arg(long = "tier")]
        tiers: Vec<String>,
    },
    /// List every entry currently on the chain.
    List {
        /// Include each entry's decoded content alongside its metadata.
        #[arg(long)]
        show_content: bool,
    },
    /// Print chain, CAS, and index summary statistics.
    Stats,
    /// Write a self-contained export of the chain (and its blobs) to a file.
    Export {
        /// Destination path for the export JSON.
        out: PathBuf,
        /// Omit blob bytes from the export (chain entries only).
        #[arg(long)]
        skip_blobs: bool,
    },
    /// Initialize a fresh chain directory from a previously written export.
    Import {
        /// Path to an export JSON previously written by `export`.
        input: PathBuf,
        /// Skip verifying the imported chain before rebuilding its index.
        #[arg(long)]
        skip_verify: bool,
    },
}

struct StaticPasswordProvider(String);

impl PasswordProvider for StaticPasswordProvider {
    fn password(&self) -> String {
        self.0.clone()
    }
}

fn resolve_dir(cli_dir: Option<PathBuf>) -> PathBuf {
    cli_dir
        .or_else(|| std::env::var_os("MEMORY_CHAIN_DIR").map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("./mnemo-data"))
}

fn parse_key_mode(s: &str) -> Result<KeyMode, String> {
    match s {
        "raw" => Ok(KeyMode::Raw),
        "encrypted" => Ok(KeyMode::Encrypted),
        "env" => Ok(KeyMode::Env),
        other => Err(format!("unknown --key-mode {other:?}, expected raw|encrypted|env")),
    }
}

fn parse_entry_type(s: &str) -> Result<mnemo::EntryType, String> {
    match s {
        "memory" => Ok(mnemo::EntryType::Memory),
        "decision" => Ok(mnemo::EntryType::Decision),
        "identity" => Ok(mnemo::EntryType::Identity),
        "redaction" => Ok(mnemo::EntryType::Redaction),
        other => Err(format!("unknown --type {other:?}, expected memory|decision|identity|redaction")),
    }
}

fn parse_tier(s: &str) -> Result<Tier, String> {
    match s {
        "committed" => Ok(Tier::Committed),
        "relationship" => Ok(Tier::Relationship),
        "ephemeral" => Ok(Tier::Ephemeral),
        other => Err(format!("unknown --tier {other:?}, expected committed|relationship|ephemeral")),
    }
}

fn parse_metadata(pairs: &[String]) -> Result<Option<serde_json::Value>, String> {
    if pairs.is_empty() {
        return Ok(None);
    }
    let mut map = serde_json::Map::new();
    for pair in pairs {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("malformed --metadata {pair:?}, expected KEY=VALUE"))?;
        map.insert(key.to_string(), json!(value));
    }
    Ok(Some(serde_json::Value::Object(map)))
}

fn main() -> ExitCode {
    // A second CLI invocation never shares a process with the first, so
    // `AlreadyInitialized` here would only mean a global subscriber got
    // installed some other way; logging just stays whatever it already is.
    let _ = mnemo_telemetry::init_logging();
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => ExitCode::from(code),
        Err(Failure { code, message }) => {
            eprintln!("error: {message}");
            ExitCode::from(code)
        }
    }
}

struct Failure {
    code: u8,
    message: String,
}

impl Failure {
    fn misuse(message: impl Into<String>) -> Self {
        Self { code: EXIT_MISUSE, message: message.into() }
    }
}

impl From<Error> for Failure {
    fn from(err: Error) -> Self {
        Self { code: EXIT_FAILURE, message: err.to_string() }
    }
}

impl From<String> for Failure {
    fn from(message: String) -> Self {
        Self::misuse(message)
    }
}

fn run(cli: Cli) -> Result<u8, Failure> {
    let dir = resolve_dir(cli.dir.clone());
    let password_provider = cli.password.clone().map(StaticPasswordProvider);
    let provider_ref: Option<&dyn PasswordProvider> =
        password_provider.as_ref().map(|p| p as &dyn PasswordProvider);

    match cli.cmd {
        Command::Init { name, key_mode } => {
            let key_mode = parse_key_mode(&key_mode)?;
            if key_mode == KeyMode::Encrypted && cli.password.is_none() {
                return Err(Failure::misuse("--key-mode encrypted requires --password"));
            }
            let engine = MemoryEngine::init(
                &dir,
                InitOptions {
                    agent_name: name,
                    key_mode,
                    password: cli.password.as_deref(),
                    identity_content: None,
                },
            )?;
            println!("initialized chain for {:?} at {:?}", engine.config().agent_name, dir);
            Ok(EXIT_OK)
        }
        Command::Add { content, r#type, tier, metadata } => {
            let engine = MemoryEngine::open(&dir)?;
            let kind = parse_entry_type(&r#type)?;
            let tier = parse_tier(&tier)?;
            let metadata = parse_metadata(&metadata)?;
            let entry = engine.add_entry(
                AddEntryInput { kind, tier, content, metadata, source: mnemo_index::Source::Manual },
                provider_ref,
            )?;
            println!("added entry seq={} content_hash={}", entry.seq, entry.content_hash);
            Ok(EXIT_OK)
        }
        Command::Verify { skip_content } => {
            let engine = MemoryEngine::open(&dir)?;
            let report = engine.verify(VerifyOptions { check_content: !skip_content })?;
            println!("{}", serde_json::to_string_pretty(&json!({
                "valid": report.valid,
                "entries_checked": report.entries_checked,
                "errors": report.errors.iter().map(|e| e.to_string()).collect::<Vec<_>>(),
            })).map_err(|e| Failure { code: EXIT_FAILURE, message: e.to_string() })?);
            if report.valid {
                Ok(EXIT_OK)
            } else {
                Ok(EXIT_INTEGRITY)
            }
        }
        Command::Search { query, max_tokens, max_results, types, tiers } => {
            let engine = MemoryEngine::open(&dir)?;
            let filters = RetrievalFilters {
                types: (!types.is_empty()).then_some(types),
                tiers: (!tiers.is_empty()).then_some(tiers),
                min_importance: None,
            };
            let options = RetrieveOptions { filters, offset: 0, max_results, max_tokens };
            let results = engine.retrieve(&query, &options)?;
            print_scored(&results);
            Ok(EXIT_OK)
        }
        Command::List { show_content } => {
            let engine = MemoryEngine::open(&dir)?;
            let entries = engine.read_chain()?;
            let rows: Vec<_> = entries
                .iter()
                .map(|e| {
                    let mut row = json!({
                        "seq": e.seq,
                        "ts": e.ts.to_rfc3339_millis(),
                        "type": e.kind.as_str(),
                        "tier": e.tier.as_str(),
                        "content_hash": e.content_hash,
                    });
                    if show_content {
                        if let Ok(Some(bytes)) = engine.get_content_verified(&e.content_hash) {
                            row["content"] = json!(String::from_utf8_lossy(&bytes));
                        }
                    }
                    row
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&rows).map_err(|e| Failure {
                code: EXIT_FAILURE,
                message: e.to_string(),
            })?);
            Ok(EXIT_OK)
        }
        Command::Stats => {
            let engine = MemoryEngine::open(&dir)?;
            let entries = engine.read_chain()?;
            let out = json!({
                "agent_name": engine.config().agent_name,
                "entries": entries.len(),
                "dir": dir,
            });
            println!("{}", serde_json::to_string_pretty(&out).map_err(|e| Failure {
                code: EXIT_FAILURE,
                message: e.to_string(),
            })?);
            Ok(EXIT_OK)
        }
        Command::Export { out, skip_blobs } => {
            let engine = MemoryEngine::open(&dir)?;
            let export = engine.export(!skip_blobs)?;
            let bytes = serde_json::to_vec_pretty(&export).map_err(|e| Failure {
                code: EXIT_FAILURE,
                message: e.to_string(),
            })?;
            std::fs::write(&out, bytes).map_err(|e| Failure { code: EXIT_FAILURE, message: e.to_string() })?;
            println!("wrote export ({} entries) to {:?}", export.entries.len(), out);
            Ok(EXIT_OK)
        }
        Command::Import { input, skip_verify } => {
            let bytes = std::fs::read(&input).map_err(|e| Failure { code: EXIT_FAILURE, message: e.to_string() })?;
            let export: mnemo::ChainExport = serde_json::from_slice(&bytes).map_err(|e| Failure {
                code: EXIT_MISUSE,
                message: format!("malformed export: {e}"),
            })?;
            let (engine, result) = MemoryEngine::import(&export, &dir, !skip_verify)?;
            println!(
                "imported {} entries, {} blobs into {:?}",
                result.entries_imported,
                result.blobs_imported,
                engine.dir()
            );
            Ok(EXIT_OK)
        }
    }
}

fn print_scored(results: &[mnemo::ScoredMemory]) {
    let rows: Vec<_> = results
        .iter()
        .map(|r| {
            json!({
                "seq": r.memory.seq,
                "score": r.score,
                "type": r.memory.entry_type,
                "tier": r.memory.tier,
                "content": r.memory.content,
            })
        })
        .collect();
    match serde_json::to_string_pretty(&rows) {
        Ok(s) => println!("{s}"),
        Err(e) => eprintln!("error formatting results: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_metadata_builds_an_object() {
        let meta = parse_metadata(&["k=v".to_string(), "n=1".to_string()]).unwrap().unwrap();
        assert_eq!(meta["k"], "v");
        assert_eq!(meta["n"], "1");
    }

    #[test]
    fn parse_metadata_rejects_missing_equals() {
        assert!(parse_metadata(&["nokeyvalue".to_string()]).is_err());
    }

    #[test]
    fn parse_tier_rejects_unknown_values() {
        assert!(parse_tier("forever").is_err());
        assert!(matches!(parse_tier("committed"), Ok(Tier::Committed)));
    }

    #[test]
    fn resolve_dir_prefers_explicit_flag() {
        let dir = resolve_dir(Some(PathBuf::from("/tmp/explicit")));
        assert_eq!(dir, PathBuf::from("/tmp/explicit"));
    }

    #[test]
    fn end_to_end_init_add_verify_search() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("chain");

        let engine = MemoryEngine::init(
            &dir,
            InitOptions {
                agent_name: "Tester".to_string(),
                key_mode: KeyMode::Raw,
                password: None,
                identity_content: None,
            },
        )
        .unwrap();
        engine
            .add_entry(AddEntryInput::memory(Tier::Relationship, "prefers dark mode"), None)
            .unwrap();

        let report = engine.verify(VerifyOptions { check_content: true }).unwrap();
        assert!(report.valid);

        let results = engine.retrieve("dark mode", &RetrieveOptions::default()).unwrap();
        assert!(!results.is_empty());
    }
}
