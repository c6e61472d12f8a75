use std::fs;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use relforge_core::{CandidateRelation, DEFAULT_MIN_OVERLAP, EngineConfig, OverlapMode};
use relforge_sqlite::{CleanupOptions, Database, api, cleanup_with, introspect};
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

/// Output format for discovery results.
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliOutputFormat {
    Json,
    Table,
}

/// Log line format.
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

/// Overlap acceptance rule, as accepted on the command line.
#[derive(Debug, Clone, Copy, clap::ValueEnum)]
enum CliOverlap {
    Exact,
    AtLeast,
    Any,
}

#[derive(Debug, Parser)]
#[command(name = "relforge")]
#[command(version)]
#[command(about = "Infer, materialize and merge relations in SQLite databases")]
struct Cli {
    /// YAML configuration file; command-line flags override its values.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log level filter (error, warn, info, debug, trace); RUST_LOG wins if set.
    #[arg(long, global = true, default_value = "warn")]
    log_level: String,
    /// Log line format.
    #[arg(long, global = true, default_value = "text")]
    log_format: LogFormat,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Propose candidate foreign-key relations (read-only).
    Discover(DiscoverArgs),
    /// Normalize id columns and materialize relations as foreign keys.
    Normalize(NormalizeArgs),
    /// Merge a source database into a target database.
    Merge(MergeArgs),
    /// Show tables, or the columns and foreign keys of one table.
    Inspect(InspectArgs),
    /// Drop empty tables, empty columns and leftover temp tables.
    Cleanup(CleanupArgs),
}

#[derive(Debug, Args)]
struct DiscoverArgs {
    /// Database file path.
    #[arg(long)]
    db: PathBuf,
    /// Name similarity (0.0-1.0) a column must exceed.
    #[arg(long)]
    threshold: Option<f64>,
    /// Data overlap rule.
    #[arg(long)]
    overlap: Option<CliOverlap>,
    /// Minimum overlap percentage for the at-least rule.
    #[arg(long)]
    min_overlap: Option<f64>,
    /// Write the relation list as JSON to this file.
    #[arg(long)]
    output: Option<PathBuf>,
    /// Output format for stdout.
    #[arg(long, default_value = "json")]
    format: CliOutputFormat,
}

#[derive(Debug, Args)]
struct NormalizeArgs {
    /// Database file path.
    #[arg(long)]
    db: PathBuf,
    /// JSON file with the relations to materialize.
    #[arg(long, conflicts_with = "discover")]
    relations: Option<PathBuf>,
    /// Discover relations first and materialize all of them.
    #[arg(long)]
    discover: bool,
}

#[derive(Debug, Args)]
struct MergeArgs {
    /// Database merged from (prepared in place).
    #[arg(long)]
    source: PathBuf,
    /// Database merged into.
    #[arg(long)]
    target: PathBuf,
    /// Append the source name and merge time to merged project labels.
    #[arg(long)]
    annotate_origin: bool,
}

#[derive(Debug, Args)]
struct InspectArgs {
    /// Database file path.
    #[arg(long)]
    db: PathBuf,
    /// Show the columns and foreign keys of this table.
    #[arg(long)]
    table: Option<String>,
}

#[derive(Debug, Args)]
struct CleanupArgs {
    /// Database file path.
    #[arg(long)]
    db: PathBuf,
    /// Drop tables without rows.
    #[arg(long)]
    empty_tables: bool,
    /// Drop columns holding only NULL or empty strings.
    #[arg(long)]
    empty_columns: bool,
    /// Drop temp tables left by interrupted rebuilds.
    #[arg(long)]
    temp_tables: bool,
}

fn main() {
    let cli = Cli::parse();

    if let Err(err) = setup_logging(&cli.log_level, cli.log_format) {
        eprintln!("error: {err}");
        std::process::exit(1);
    }

    let result = load_config(cli.config.as_deref()).and_then(|config| match cli.command {
        Command::Discover(args) => run_discover(args, config),
        Command::Normalize(args) => run_normalize(args, config),
        Command::Merge(args) => run_merge(args, config),
        Command::Inspect(args) => run_inspect(args, config),
        Command::Cleanup(args) => run_cleanup(args, config),
    });

    if let Err(err) = result {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn setup_logging(level: &str, format: LogFormat) -> Result<(), String> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .map_err(|err| format!("Invalid --log-level '{level}': {err}"))?,
    };
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => subscriber.json().try_init(),
        LogFormat::Text => subscriber.try_init(),
    }
    .map_err(|err| format!("Failed to install logger: {err}"))
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig, String> {
    match path {
        Some(path) => {
            let config = EngineConfig::load(path)
                .map_err(|e| format!("Failed to load config '{}': {e}", path.display()))?;
            info!(path = %path.display(), "loaded configuration");
            Ok(config)
        }
        None => Ok(EngineConfig::default()),
    }
}

fn run_discover(args: DiscoverArgs, mut config: EngineConfig) -> Result<(), String> {
    if let Some(threshold) = args.threshold {
        config.discovery.name_threshold = threshold;
    }
    config.discovery.overlap =
        overlap_mode(args.overlap, args.min_overlap, config.discovery.overlap);
    config
        .validate()
        .map_err(|e| format!("Invalid discovery settings: {e}"))?;
    debug!(discovery = ?config.discovery, "discovery settings");

    let relations = api::discover_candidate_relations_with_config(&args.db, &config)
        .map_err(|e| format!("Discovery failed for '{}': {e}", args.db.display()))?;

    if let Some(output) = &args.output {
        let raw = serde_json::to_string_pretty(&relations)
            .map_err(|e| format!("Failed to serialize relations: {e}"))?;
        fs::write(output, raw)
            .map_err(|e| format!("Failed to write '{}': {e}", output.display()))?;
        eprintln!(
            "Wrote {} relation(s) to '{}'.",
            relations.len(),
            output.display()
        );
    }

    match args.format {
        CliOutputFormat::Json => {
            let raw = serde_json::to_string_pretty(&relations)
                .map_err(|e| format!("Failed to serialize relations: {e}"))?;
            println!("{raw}");
        }
        CliOutputFormat::Table => print!("{}", format_relation_table(&relations)),
    }
    Ok(())
}

/// Combines `--overlap` and `--min-overlap` with the configured rule.
fn overlap_mode(
    overlap: Option<CliOverlap>,
    min_overlap: Option<f64>,
    configured: OverlapMode,
) -> OverlapMode {
    let configured_percent = match configured {
        OverlapMode::AtLeast { percent } => percent,
        _ => DEFAULT_MIN_OVERLAP,
    };
    match (overlap, min_overlap) {
        (Some(CliOverlap::Exact), _) => OverlapMode::Exact,
        (Some(CliOverlap::Any), _) => OverlapMode::AnyIntersection,
        (Some(CliOverlap::AtLeast), percent) => OverlapMode::AtLeast {
            percent: percent.unwrap_or(configured_percent),
        },
        (None, Some(percent)) => OverlapMode::AtLeast { percent },
        (None, None) => configured,
    }
}

fn run_normalize(args: NormalizeArgs, config: EngineConfig) -> Result<(), String> {
    let relations: Vec<CandidateRelation> = if let Some(path) = &args.relations {
        let raw = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read '{}': {e}", path.display()))?;
        serde_json::from_str(&raw)
            .map_err(|e| format!("Failed to parse relations in '{}': {e}", path.display()))?
    } else if args.discover {
        api::discover_candidate_relations_with_config(&args.db, &config)
            .map_err(|e| format!("Discovery failed for '{}': {e}", args.db.display()))?
    } else {
        Vec::new()
    };

    let report =
        api::normalize_and_materialize_relations_with_config(&args.db, &relations, &config)
            .map_err(|e| format!("Normalization failed: {e}"))?;

    println!("Normalization complete:");
    println!("  Id columns renamed: {}", report.renamed_ids.len());
    println!("  Id columns synthesized: {}", report.synthesized_ids.len());
    println!(
        "  Tracking columns added: {}",
        report.tracking_columns_added.len()
    );
    println!(
        "  Project table created: {}",
        if report.project_table_created { "yes" } else { "no" }
    );
    println!("  Rows back-filled: {}", report.backfilled_rows);
    println!(
        "  Foreign keys re-pointed: {}",
        report.repointed_foreign_keys.len()
    );
    println!("  Relations materialized: {}", report.materialized.len());
    for rel in &report.materialized {
        println!(
            "    {}.{} -> {}.{} ({} unresolved)",
            rel.table, rel.foreign_key_column, rel.target_table, rel.target_column, rel.unresolved
        );
    }
    print_skipped(&report.skipped);
    Ok(())
}

fn run_merge(args: MergeArgs, mut config: EngineConfig) -> Result<(), String> {
    if args.annotate_origin {
        config.merge.annotate_origin = true;
    }
    let report = api::merge_databases_with_config(&args.source, &args.target, &config)
        .map_err(|e| format!("Merge failed: {e}"))?;

    println!(
        "Merged '{}' into '{}':",
        args.source.display(),
        args.target.display()
    );
    println!(
        "  Projects merged: {} ({} renumbered)",
        report.id_mapping.len(),
        report.id_mapping.remapped_count()
    );
    for (old, new) in report.id_mapping.iter().filter(|(old, new)| old != new) {
        println!("    project {old} -> {new}");
    }
    println!("  Tables created: {}", report.tables_created.len());
    println!("  Tables merged: {}", report.tables_merged.len());
    println!("  Columns added: {}", report.columns_added.len());
    println!(
        "  Rows inserted: {} ({} already present)",
        report.rows.inserted, report.rows.ignored
    );
    println!("  Tracking values reconciled: {}", report.reconciled_rows);
    print_skipped(&report.skipped);
    Ok(())
}

fn run_inspect(args: InspectArgs, config: EngineConfig) -> Result<(), String> {
    let db = Database::open_read_only(&args.db, config.retry)
        .map_err(|e| format!("Failed to open database '{}': {e}", args.db.display()))?;
    let conn = db.connection();

    let Some(table) = args.table else {
        let summaries =
            introspect::table_summaries(conn).map_err(|e| format!("Failed to read tables: {e}"))?;
        let width = summaries
            .iter()
            .map(|s| s.name.len())
            .max()
            .unwrap_or(0)
            .max("TABLE".len());
        println!("{:<width$}  {:>8}  {:>7}", "TABLE", "ROWS", "COLUMNS");
        for summary in &summaries {
            println!(
                "{:<width$}  {:>8}  {:>7}",
                summary.name, summary.row_count, summary.column_count
            );
        }
        return Ok(());
    };

    let columns = introspect::table_columns(conn, &table).map_err(|e| e.to_string())?;
    let keys = introspect::foreign_keys(conn, &table).map_err(|e| e.to_string())?;
    let rows = introspect::row_count(conn, &table).map_err(|e| e.to_string())?;

    println!("Table {table} ({rows} row(s))");
    for column in &columns {
        let mut notes = Vec::new();
        if column.is_primary_key() {
            notes.push("primary key".to_string());
        }
        if column.not_null {
            notes.push("not null".to_string());
        }
        if let Some(default) = &column.default_value {
            notes.push(format!("default {default}"));
        }
        let declared = if column.declared_type.is_empty() {
            "(untyped)"
        } else {
            column.declared_type.as_str()
        };
        if notes.is_empty() {
            println!("  {} {declared}", column.name);
        } else {
            println!("  {} {declared} [{}]", column.name, notes.join(", "));
        }
    }
    if !keys.is_empty() {
        println!("Foreign keys:");
        for key in &keys {
            println!(
                "  {} -> {}({})",
                key.column,
                key.target_table,
                key.target_column.as_deref().unwrap_or("primary key")
            );
        }
    }
    Ok(())
}

fn run_cleanup(args: CleanupArgs, config: EngineConfig) -> Result<(), String> {
    let options = if args.empty_tables || args.empty_columns || args.temp_tables {
        CleanupOptions {
            empty_tables: args.empty_tables,
            empty_columns: args.empty_columns,
            temp_tables: args.temp_tables,
        }
    } else {
        CleanupOptions::default()
    };

    let db = Database::open_with(&args.db, config.retry)
        .map_err(|e| format!("Failed to open database '{}': {e}", args.db.display()))?;
    let report = cleanup_with(&db, &options).map_err(|e| format!("Cleanup failed: {e}"))?;

    println!("Cleanup complete:");
    println!("  Tables dropped: {}", report.tables_dropped.len());
    for table in &report.tables_dropped {
        println!("    {table}");
    }
    println!("  Columns dropped: {}", report.columns_dropped.len());
    for column in &report.columns_dropped {
        println!("    {column}");
    }
    println!("  Temp tables dropped: {}", report.temp_tables_dropped.len());
    print_skipped(&report.skipped);
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn print_skipped(skipped: &[relforge_core::SkippedTable]) {
    if skipped.is_empty() {
        return;
    }
    eprintln!("{} table(s) skipped:", skipped.len());
    for skip in skipped {
        eprintln!("  {}: {}", skip.table, skip.reason);
    }
}

/// Renders relations as an aligned plain-text table.
fn format_relation_table(relations: &[CandidateRelation]) -> String {
    let header = ["SOURCE", "TARGET", "NAME", "OVERLAP"];
    let rows: Vec<[String; 4]> = relations
        .iter()
        .map(|rel| {
            [
                format!("{}.{}", rel.source_table, rel.source_column),
                format!("{}.{}", rel.target_table, rel.target_id_column),
                format!("{:.2}", rel.name_score),
                format!("{:.1}%", rel.data_overlap),
            ]
        })
        .collect();

    let mut widths = header.map(str::len);
    for row in &rows {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.len());
        }
    }

    let mut out = format!(
        "{:<w0$}  {:<w1$}  {:>w2$}  {:>w3$}\n",
        header[0],
        header[1],
        header[2],
        header[3],
        w0 = widths[0],
        w1 = widths[1],
        w2 = widths[2],
        w3 = widths[3]
    );
    for row in &rows {
        out.push_str(&format!(
            "{:<w0$}  {:<w1$}  {:>w2$}  {:>w3$}\n",
            row[0],
            row[1],
            row[2],
            row[3],
            w0 = widths[0],
            w1 = widths[1],
            w2 = widths[2],
            w3 = widths[3]
        ));
    }
    if rows.is_empty() {
        out.push_str("(no candidate relations)\n");
    }
    out
}
