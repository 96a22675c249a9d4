//! Docbridge CLI
//!
//! Drives the reconciliation engine against a directory of collection dumps
//! and a SQLite target:
//! - `init-schema`, `migrate`, `resolve` move data across
//! - `verify`, `coverage`, `inspect` only read
//! - `dedup` cleans duplicates left by earlier runs, with backups
//! - `mapping` exports or merges the identifier mapping

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use docbridge_core::dedup::{DedupSpec, DuplicateReconciler};
use docbridge_core::{
    collect_pending, reference_coverage, resolve_pending, Family, IdentifierTranslator,
    MappingSnapshot, MigrationConfig, Migrator, TransformOptions, Verifier,
};
use docbridge_source::{profile_collection, Filter, MemorySource, SourceStore};
use docbridge_target::SqliteTarget;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

mod summary;

#[derive(Parser)]
#[command(name = "docbridge")]
#[command(
    author,
    version,
    about = "Docbridge: document store to relational reconciliation"
)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct GlobalArgs {
    /// JSON configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Directory of collection dumps (`<collection>.json` or `.jsonl`)
    #[arg(long, global = true)]
    source_dir: Option<PathBuf>,
    /// SQLite target database
    #[arg(long, global = true)]
    target_db: Option<PathBuf>,
    /// Identifier mapping file
    #[arg(long, global = true)]
    mapping: Option<PathBuf>,
    /// Debug logging
    #[arg(short, long, global = true, conflicts_with = "quiet")]
    verbose: bool,
    /// Warnings and errors only
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the relational schema in the target (no-op when present).
    InitSchema,

    /// Migrate one family, or `all` in dependency order.
    Migrate {
        scope: Scope,
        /// Documents between two mapping snapshots
        #[arg(long)]
        batch_size: Option<usize>,
        /// Never link behaviors to the nearest-dated course
        #[arg(long)]
        no_nearest_date: bool,
    },

    /// Resolve references left pending in the target.
    Resolve {
        #[arg(default_value = "all")]
        scope: Scope,
    },

    /// Compare the target against the source. Fails when discrepancies exist.
    Verify {
        family: Family,
        /// Report directory (defaults to the configured one)
        #[arg(long)]
        out: Option<PathBuf>,
        /// Print only, do not write the JSON report
        #[arg(long, conflicts_with = "out")]
        no_report: bool,
    },

    /// Remove duplicate rows, keeping the most recent of each group.
    Dedup {
        /// `student-absences` or `grades`
        preset: String,
        /// Report the groups without changing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Field profile of a source collection.
    Inspect {
        collection: String,
        /// Print the profile as JSON
        #[arg(long)]
        json: bool,
    },

    /// How many of a family's references are already mapped.
    Coverage {
        family: Family,
        /// Most used missing ids to list
        #[arg(long, default_value_t = 10)]
        top: usize,
    },

    /// Identifier mapping snapshots.
    Mapping {
        #[command(subcommand)]
        command: MappingCommands,
    },
}

#[derive(Subcommand)]
enum MappingCommands {
    /// Write the current mapping to a file.
    Export { file: PathBuf },
    /// Merge a snapshot into the mapping. Conflicting entries abort the import.
    Import { file: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scope {
    All,
    One(Family),
}

impl Scope {
    fn families(self) -> Vec<Family> {
        match self {
            Scope::All => Family::in_dependency_order(),
            Scope::One(family) => vec![family],
        }
    }
}

impl FromStr for Scope {
    type Err = docbridge_core::family::UnknownFamily;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            return Ok(Scope::All);
        }
        s.parse().map(Scope::One)
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.global);
    let config = load_config(&cli.global)?;

    match cli.command {
        Commands::InitSchema => cmd_init_schema(&config),
        Commands::Migrate {
            scope,
            batch_size,
            no_nearest_date,
        } => {
            let mut config = config;
            if let Some(batch_size) = batch_size {
                config.batch_size = batch_size;
            }
            if no_nearest_date {
                config.nearest_date_fallback = false;
            }
            cmd_migrate(&config, scope)
        }
        Commands::Resolve { scope } => cmd_resolve(&config, scope),
        Commands::Verify {
            family,
            out,
            no_report,
        } => {
            let out = if no_report {
                None
            } else {
                Some(out.unwrap_or_else(|| config.report_dir.clone()))
            };
            cmd_verify(&config, family, out.as_deref())
        }
        Commands::Dedup { preset, dry_run } => cmd_dedup(&config, &preset, dry_run),
        Commands::Inspect { collection, json } => cmd_inspect(&config, &collection, json),
        Commands::Coverage { family, top } => cmd_coverage(&config, family, top),
        Commands::Mapping { command } => match command {
            MappingCommands::Export { file } => cmd_mapping_export(&config, &file),
            MappingCommands::Import { file } => cmd_mapping_import(&config, &file),
        },
    }
}

// ============================================================================
// Setup
// ============================================================================

fn init_logging(global: &GlobalArgs) {
    let level = if global.verbose {
        tracing::Level::DEBUG
    } else if global.quiet {
        tracing::Level::WARN
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .init();
}

/// Defaults, then `--config`, then the environment, then flags.
fn load_config(global: &GlobalArgs) -> Result<MigrationConfig> {
    let mut config = MigrationConfig::load(global.config.as_deref()).context("loading configuration")?;
    if let Some(dir) = &global.source_dir {
        config.source_dir = Some(dir.clone());
    }
    if let Some(db) = &global.target_db {
        config.target_db = Some(db.clone());
    }
    if let Some(mapping) = &global.mapping {
        config.mapping_path = mapping.clone();
    }
    Ok(config)
}

fn open_source(config: &MigrationConfig) -> Result<MemorySource> {
    let dir = config.source_dir()?;
    MemorySource::from_dump_dir(dir).with_context(|| format!("loading dumps from {}", dir.display()))
}

fn open_target(config: &MigrationConfig) -> Result<SqliteTarget> {
    let path = config.target_db()?;
    let mut target = SqliteTarget::open(path).with_context(|| format!("opening {}", path.display()))?;
    target
        .ensure_schema()
        .with_context(|| format!("creating schema in {}", path.display()))?;
    Ok(target)
}

fn open_translator(config: &MigrationConfig) -> Result<IdentifierTranslator> {
    IdentifierTranslator::open(&config.mapping_path)
        .with_context(|| format!("loading mapping {}", config.mapping_path.display()))
}

fn options(config: &MigrationConfig) -> TransformOptions {
    TransformOptions {
        now: Utc::now(),
        nearest_date_fallback: config.nearest_date_fallback,
    }
}

// ============================================================================
// Commands
// ============================================================================

fn cmd_init_schema(config: &MigrationConfig) -> Result<()> {
    let path = config.target_db()?;
    let mut target = SqliteTarget::open(path).with_context(|| format!("opening {}", path.display()))?;
    let created = target.ensure_schema().context("creating schema")?;
    let version = target.schema_version()?;
    if created {
        println!("{} schema v{} in {}", "created".green().bold(), version, path.display());
    } else {
        println!("{} schema v{} already in {}", "ok".green().bold(), version, path.display());
    }
    Ok(())
}

fn cmd_migrate(config: &MigrationConfig, scope: Scope) -> Result<()> {
    config.validate()?;
    let source = open_source(config)?;
    let mut target = open_target(config)?;
    let mut translator = open_translator(config)?;

    let mut migrator = Migrator::new(&source, &mut target, &mut translator)
        .with_batch_size(config.batch_size)
        .with_options(options(config));
    for family in scope.families() {
        println!("{} {}", "Migrating".green().bold(), family.to_string().bold());
        let report = migrator
            .run_family(family)
            .with_context(|| format!("migrating {family}"))?;
        summary::family(&report);
    }
    println!(
        "{} {} mappings in {}",
        "→".yellow(),
        migrator.translator().len(),
        config.mapping_path.display()
    );
    Ok(())
}

fn cmd_resolve(config: &MigrationConfig, scope: Scope) -> Result<()> {
    let mut target = open_target(config)?;
    let translator = open_translator(config)?;
    for family in scope.families() {
        let pending = collect_pending(&target, family)?;
        let report = resolve_pending(&mut target, &translator, &pending)
            .with_context(|| format!("resolving {family}"))?;
        println!("{} {}", "Resolved".green().bold(), family.to_string().bold());
        summary::resolution(&report);
    }
    Ok(())
}

fn cmd_verify(config: &MigrationConfig, family: Family, out: Option<&Path>) -> Result<()> {
    let source = open_source(config)?;
    let target = open_target(config)?;
    let translator = open_translator(config)?;

    let report = Verifier::new(&source, &target, &translator)
        .with_options(options(config))
        .verify(family)
        .with_context(|| format!("verifying {family}"))?;
    summary::verification(&report);

    if let Some(dir) = out {
        let path = report
            .write_json(dir)
            .with_context(|| format!("writing report to {}", dir.display()))?;
        eprintln!("{} {}", "wrote".green().bold(), path.display().to_string().bold());
    }
    if !report.is_clean() {
        bail!("{} discrepancies in {family}", report.discrepancies.len());
    }
    Ok(())
}

fn cmd_dedup(config: &MigrationConfig, preset: &str, dry_run: bool) -> Result<()> {
    let spec = DedupSpec::preset(preset)
        .ok_or_else(|| anyhow!("unknown dedup preset `{preset}` (expected student-absences or grades)"))?;
    let mut target = open_target(config)?;
    let report = DuplicateReconciler::run(&mut target, spec, Utc::now(), dry_run)
        .with_context(|| format!("deduplicating {preset}"))?;
    summary::dedup(&report);
    Ok(())
}

fn cmd_inspect(config: &MigrationConfig, collection: &str, json: bool) -> Result<()> {
    let source = open_source(config)?;
    let docs = source
        .find(collection, &Filter::all())
        .with_context(|| format!("reading {collection}"))?;
    let profile = profile_collection(&docs);
    if json {
        println!("{}", serde_json::to_string_pretty(&profile)?);
    } else {
        summary::profile(collection, &profile);
    }
    Ok(())
}

fn cmd_coverage(config: &MigrationConfig, family: Family, top: usize) -> Result<()> {
    let source = open_source(config)?;
    let translator = open_translator(config)?;
    let report = reference_coverage(&source, &translator, family)
        .with_context(|| format!("checking references of {family}"))?;
    summary::coverage(&report, top);
    Ok(())
}

fn cmd_mapping_export(config: &MigrationConfig, file: &Path) -> Result<()> {
    let translator = open_translator(config)?;
    translator
        .persist_to(file)
        .with_context(|| format!("writing {}", file.display()))?;
    println!(
        "{} {} mappings to {}",
        "exported".green().bold(),
        translator.len(),
        file.display()
    );
    Ok(())
}

fn cmd_mapping_import(config: &MigrationConfig, file: &Path) -> Result<()> {
    let contents = fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let snapshot: MappingSnapshot =
        serde_json::from_str(&contents).with_context(|| format!("parsing {}", file.display()))?;

    let mut translator = open_translator(config)?;
    let added = translator
        .bulk_import(snapshot)
        .with_context(|| format!("merging {}", file.display()))?;
    translator.persist().context("saving mapping")?;
    println!(
        "{} {} new mappings ({} total) into {}",
        "imported".green().bold(),
        added,
        translator.len(),
        config.mapping_path.display()
    );
    Ok(())
}
