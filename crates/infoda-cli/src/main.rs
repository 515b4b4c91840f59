use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use infoda_core::TableLayout;
use infoda_load::{LoadSummary, LoaderConfig};
use infoda_normalize::{NormalizeConfig, NormalizeSummary};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "infoda-cli")]
#[command(about = "INFODA roster normalizer, loader and query API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LayoutArg {
    Canonical,
    Extended,
}

impl From<LayoutArg> for TableLayout {
    fn from(value: LayoutArg) -> Self {
        match value {
            LayoutArg::Canonical => TableLayout::Canonical,
            LayoutArg::Extended => TableLayout::Extended,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Merge the roster exports of a directory into one table (default).
    Normalize {
        #[arg(long)]
        input_dir: Option<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
        #[arg(long, value_enum)]
        layout: Option<LayoutArg>,
    },
    /// Load a merged table into PostgreSQL.
    Load {
        #[arg(long)]
        input: Option<PathBuf>,
        /// Run against an in-memory store instead of the database.
        #[arg(long)]
        dry_run: bool,
    },
    /// Normalize in the extended layout, then load the result.
    Pipeline {
        #[arg(long)]
        input_dir: Option<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Serve the read-only query API.
    Serve {
        #[arg(long)]
        port: Option<u16>,
    },
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn normalize_config(
    input_dir: Option<PathBuf>,
    output: Option<PathBuf>,
    layout: Option<TableLayout>,
) -> NormalizeConfig {
    let mut config = NormalizeConfig::from_env();
    if let Some(dir) = input_dir {
        config.input_dir = dir;
    }
    if let Some(path) = output {
        config.output_path = path;
    }
    if let Some(layout) = layout {
        config.layout = layout;
    }
    config
}

fn print_normalize(summary: &NormalizeSummary) {
    println!(
        "normalize complete: run_id={} files={} failed={} records={} duplicates_dropped={} output={} bytes={} sha256={}",
        summary.run_id,
        summary.files.len(),
        summary.failures.len(),
        summary.records,
        summary.duplicates_dropped,
        summary.output.path.display(),
        summary.output.byte_size,
        summary.output.content_hash
    );
    for failure in &summary.failures {
        println!("  skipped {}: {}", failure.file_name, failure.message);
    }
}

fn print_load(summary: &LoadSummary) {
    println!(
        "load complete{}: run_id={} attempted={} inserted={} unresolved={} rows_read={} rows_kept={} programs={} sections={} source_files={}",
        if summary.dry_run { " (dry run)" } else { "" },
        summary.run_id,
        summary.attempted,
        summary.inserted,
        summary.unresolved,
        summary.rows_read,
        summary.rows_kept,
        summary.programs,
        summary.sections,
        summary.source_files
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_logging();

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Normalize {
        input_dir: None,
        output: None,
        layout: None,
    });

    match command {
        Commands::Normalize {
            input_dir,
            output,
            layout,
        } => {
            let config = normalize_config(input_dir, output, layout.map(TableLayout::from));
            let summary = infoda_normalize::run_normalize(&config).await?;
            print_normalize(&summary);
        }
        Commands::Load { input, dry_run } => {
            let mut config = LoaderConfig::from_env();
            if let Some(path) = input {
                config.merged_table = path;
            }
            let summary = if dry_run {
                infoda_load::run_dry_load(&config).await?
            } else {
                infoda_load::run_load(&config).await?
            };
            print_load(&summary);
        }
        Commands::Pipeline { input_dir, output } => {
            let config = normalize_config(input_dir, output, Some(TableLayout::Extended));
            let normalized = infoda_normalize::run_normalize(&config).await?;
            print_normalize(&normalized);

            let mut loader = LoaderConfig::from_env();
            loader.merged_table = normalized.output.path.clone();
            let loaded = infoda_load::run_load(&loader).await?;
            print_load(&loaded);
        }
        Commands::Serve { port } => {
            infoda_web::serve_from_env(port).await?;
        }
    }

    Ok(())
}
