//! Command-line access to stored experiment data.
//!
//! ```text
//! arvak-expdata list --store ./store
//! arvak-expdata show --store ./store <experiment-id> --results
//! arvak-expdata export --store ./store <experiment-id> -o exp.json
//! arvak-expdata inspect exp.json
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arvak_expdata::{
    AnalysisResult, ExpDataConfig, ExperimentData, ExperimentService, LocalExperimentService,
    LoggingConfig, ResultQuery, WorkerPool, init_tracing,
};
use clap::{Parser, Subcommand};
use console::style;

/// Inspect and export experiment data
#[derive(Parser)]
#[command(name = "arvak-expdata")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (YAML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the summary of a snapshot file
    Inspect {
        /// Snapshot file (JSON)
        path: PathBuf,
    },

    /// List the experiments in a local store
    List {
        /// Store directory
        #[arg(long)]
        store: PathBuf,
    },

    /// Load an experiment from a local store and print its summary
    Show {
        /// Store directory
        #[arg(long)]
        store: PathBuf,

        /// Experiment ID
        experiment_id: String,

        /// Also print the analysis results
        #[arg(long)]
        results: bool,
    },

    /// Load an experiment from a local store and write it as a snapshot
    Export {
        /// Store directory
        #[arg(long)]
        store: PathBuf,

        /// Experiment ID
        experiment_id: String,

        /// Output file (stdout if omitted)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    let format = LoggingConfig::from_env().format;
    init_tracing(&LoggingConfig::new(filter, format))?;

    let result = run(cli).await;

    if let Err(e) = result {
        eprintln!("{} {}", style("Error:").red().bold(), e);
        std::process::exit(1);
    }

    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    let config = Arc::new(ExpDataConfig::load(cli.config.as_deref())?);

    match cli.command {
        Commands::Inspect { path } => inspect(&path, config).await,
        Commands::List { store } => list(&store).await,
        Commands::Show {
            store,
            experiment_id,
            results,
        } => show(&store, &experiment_id, results, config).await,
        Commands::Export {
            store,
            experiment_id,
            output,
        } => export(&store, &experiment_id, output.as_deref(), config).await,
    }
}

async fn inspect(path: &Path, config: Arc<ExpDataConfig>) -> Result<()> {
    let json = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let exp = ExperimentData::from_json(&json, WorkerPool::current()?, config)?;
    println!("{}", exp.summary().await);
    Ok(())
}

async fn open_store(store: &Path) -> Result<Arc<LocalExperimentService>> {
    let service = LocalExperimentService::new(store)
        .await
        .with_context(|| format!("Failed to open store {}", store.display()))?;
    Ok(Arc::new(service))
}

async fn load(
    store: &Path,
    experiment_id: &str,
    config: Arc<ExpDataConfig>,
) -> Result<ExperimentData> {
    let service: Arc<dyn ExperimentService> = open_store(store).await?;
    eprintln!(
        "{} Loading experiment {}",
        style("→").cyan().bold(),
        style(experiment_id).dim()
    );
    let exp =
        ExperimentData::load_in(experiment_id, Some(service), None, WorkerPool::current()?, config)
            .await?;
    Ok(exp)
}

async fn list(store: &Path) -> Result<()> {
    let service = open_store(store).await?;
    let ids = service.experiment_ids().await;

    println!(
        "{} {} experiment(s) in {}\n",
        style("Arvak").cyan().bold(),
        ids.len(),
        store.display()
    );
    for id in ids {
        match service.experiment(&id).await {
            Ok(record) => println!(
                "  {} {} {}",
                style("●").green(),
                style(&id).bold(),
                style(record.experiment_type).dim()
            ),
            Err(e) => println!("  {} {} ({})", style("○").red(), style(&id).bold(), e),
        }
    }
    Ok(())
}

async fn show(
    store: &Path,
    experiment_id: &str,
    with_results: bool,
    config: Arc<ExpDataConfig>,
) -> Result<()> {
    let exp = load(store, experiment_id, config).await?;
    println!("{}", exp.summary().await);

    if with_results {
        let query = ResultQuery {
            block: false,
            ..Default::default()
        };
        let results = exp.analysis_results_with(.., query).await?;
        print_results(&results);
    }
    Ok(())
}

fn print_results(results: &[AnalysisResult]) {
    if results.is_empty() {
        println!("\n{}", style("No analysis results").dim());
        return;
    }

    println!("\n{}", style("Analysis Results:").bold());
    println!(
        "  {:<36}  {:<16}  {:<10}  {}",
        style("Result ID").dim(),
        style("Name").dim(),
        style("Quality").dim(),
        style("Value").dim()
    );
    for result in results {
        println!(
            "  {:<36}  {:<16}  {:<10}  {}",
            result.result_id(),
            result.name(),
            format!("{:?}", result.quality()),
            result.value()
        );
    }
}

async fn export(
    store: &Path,
    experiment_id: &str,
    output: Option<&Path>,
    config: Arc<ExpDataConfig>,
) -> Result<()> {
    let exp = load(store, experiment_id, config).await?;
    let json = exp.to_json()?;

    match output {
        Some(path) => {
            tokio::fs::write(path, &json)
                .await
                .with_context(|| format!("Failed to write {}", path.display()))?;
            eprintln!(
                "{} Wrote {} bytes to {}",
                style("✓").green().bold(),
                json.len(),
                path.display()
            );
        }
        None => println!("{json}"),
    }
    Ok(())
}
