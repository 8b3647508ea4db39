use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::EnvFilter;
use train_dispatch::config::{self, Settings};
use train_dispatch::dispatch::RUN_ID_ENV;
use train_dispatch::shutdown::install_shutdown_handler;
use train_dispatch::{
    BlobStore, Daemon, DispatchError, ResultReporter, RunId, RunResult, ScriptId, Submission,
    Submitter, Tags,
};

#[derive(Parser)]
#[command(name = "train-dispatch")]
#[command(about = "Submit training scripts and run them on a cluster worker pool")]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/train-dispatch/config.yaml)
    #[arg(long, global = true, env = "TRAIN_DISPATCH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a default config file
    Init {
        /// Overwrite an existing config file
        #[arg(long)]
        force: bool,
    },
    /// Start the dispatcher daemon
    Daemon,
    /// Submit a job
    Submit {
        /// Local script path, or the id of an uploaded script
        script: PathBuf,
        job_config: PathBuf,
        model_config: PathBuf,
    },
    /// List all runs
    List,
    /// Show one run
    Show { run_id: String },
    /// Delete a run record
    DeleteRun { run_id: String },
    /// List uploaded scripts
    ListScripts,
    /// Download an uploaded script
    DownloadScript {
        script_id: String,
        /// Destination file (default: the script's original file name)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Download the weights a run reported
    DownloadWeights {
        run_id: String,
        /// Destination file (default: the weights' file name)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Report the results of a run (called by the running script)
    Report {
        /// Run id (default: the id of the run executing this command)
        #[arg(env = RUN_ID_ENV)]
        run_id: String,
        #[arg(long)]
        train_score: Option<f64>,
        #[arg(long)]
        validation_score: Option<f64>,
        /// Local weights file to upload
        #[arg(long)]
        weights: Option<PathBuf>,
        /// JSON file with the training configuration
        #[arg(long)]
        train_config: Option<PathBuf>,
        /// JSON file with the model configuration
        #[arg(long)]
        model_config: Option<PathBuf>,
        /// Comma-separated tags
        #[arg(long, value_delimiter = ',')]
        tags: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let filter = match "train_dispatch=info".parse() {
        Ok(directive) => EnvFilter::from_default_env().add_directive(directive),
        Err(_) => EnvFilter::from_default_env(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = match cli.config {
        Some(path) => path,
        None => config::resolve_config_path()?,
    };

    match cli.command {
        Commands::Init { force } => {
            if config_path.exists() && !force {
                bail!(
                    "config file {} already exists (use --force to overwrite)",
                    config_path.display()
                );
            }
            init_settings().write(&config_path)?;
            println!("Wrote config to {}", config_path.display());
        }
        Commands::Daemon => {
            let settings = Settings::load(Some(&config_path))?;
            info!(config = %config_path.display(), "Starting daemon");

            let daemon = Daemon::start(settings, Some(&config_path)).await?;
            let shutdown = install_shutdown_handler();
            daemon.run(shutdown).await?;
        }
        Commands::Submit {
            script,
            job_config,
            model_config,
        } => {
            let settings = Settings::load(Some(&config_path))?;
            let store = train_dispatch::connect_store(&settings.metadata).await?;
            let blobs = train_dispatch::build_blob_store(&settings.blob)?;
            let bus = train_dispatch::build_bus(&settings.bus)?;

            let submission = Submission::from_paths(&script, &job_config, &model_config, &store).await?;
            let submitter = Submitter::new(store, blobs, bus, settings.bus.channel.clone());
            let run_id = submitter.submit_loaded(submission).await?;
            println!("Submitted job with run id {}", run_id);
        }
        Commands::List => {
            let settings = Settings::load(Some(&config_path))?;
            let store = train_dispatch::connect_store(&settings.metadata).await?;

            let runs = store.list_runs().await?;
            if runs.is_empty() {
                println!("No runs found.");
                return Ok(());
            }

            println!(
                "{:<38} {:<10} {:<12} {:<12} {:<20}",
                "RUN ID", "STATUS", "TRAIN", "VALIDATION", "TAGS"
            );
            println!("{}", "-".repeat(94));
            for run in runs {
                println!(
                    "{:<38} {:<10} {:<12} {:<12} {:<20}",
                    run.run_id.as_str(),
                    run.status.as_str(),
                    score(run.train_score),
                    score(run.validation_score),
                    run.tags.as_deref().unwrap_or("-"),
                );
            }
        }
        Commands::Show { run_id } => {
            let settings = Settings::load(Some(&config_path))?;
            let store = train_dispatch::connect_store(&settings.metadata).await?;

            let run_id = RunId::new(run_id);
            let run = store
                .get_run(&run_id)
                .await?
                .ok_or_else(|| DispatchError::not_found("run", run_id.as_str()))?;

            println!("Run:              {}", run.run_id);
            println!("Status:           {}", run.status);
            println!(
                "Script:           {}",
                run.script_key.as_ref().map(ToString::to_string).unwrap_or_else(|| "-".to_string())
            );
            println!("Train score:      {}", score(run.train_score));
            println!("Validation score: {}", score(run.validation_score));
            println!(
                "Weights:          {}",
                run.weights_path.as_ref().map(ToString::to_string).unwrap_or_else(|| "-".to_string())
            );
            println!("Tags:             {}", run.tags.as_deref().unwrap_or("-"));
            if let Some(train_config) = &run.train_config {
                println!("Train config:     {}", train_config);
            }
            if let Some(model_config) = &run.model_config {
                println!("Model config:     {}", model_config);
            }
            if let Some(created) = &run.created_at {
                println!("Created:          {}", created);
            }
            if let Some(updated) = &run.updated_at {
                println!("Updated:          {}", updated);
            }
        }
        Commands::DeleteRun { run_id } => {
            let settings = Settings::load(Some(&config_path))?;
            let store = train_dispatch::connect_store(&settings.metadata).await?;

            let deleted = store.delete_run(&RunId::new(run_id)).await?;
            println!("Deleted run {}", deleted.run_id);
        }
        Commands::ListScripts => {
            let settings = Settings::load(Some(&config_path))?;
            let store = train_dispatch::connect_store(&settings.metadata).await?;

            let scripts = store.list_scripts().await?;
            if scripts.is_empty() {
                println!("No scripts found.");
                return Ok(());
            }

            println!("{:<38} {:<24} {:<40}", "SCRIPT ID", "FILE", "PATH");
            println!("{}", "-".repeat(102));
            for script in scripts {
                println!(
                    "{:<38} {:<24} {:<40}",
                    script.script_id.as_str(),
                    script.file_name,
                    script.script_path.as_str()
                );
            }
        }
        Commands::DownloadScript { script_id, output } => {
            let settings = Settings::load(Some(&config_path))?;
            let store = train_dispatch::connect_store(&settings.metadata).await?;
            let blobs = train_dispatch::build_blob_store(&settings.blob)?;

            let script_id = ScriptId::new(script_id);
            let script = store.resolve_script(&script_id).await?;

            let body = blobs.get(&script.script_path).await?;
            let output = output.unwrap_or_else(|| PathBuf::from(&script.file_name));
            tokio::fs::write(&output, body)
                .await
                .with_context(|| format!("writing {}", output.display()))?;
            println!("Downloaded script {} to {}", script_id, output.display());
        }
        Commands::DownloadWeights { run_id, output } => {
            let settings = Settings::load(Some(&config_path))?;
            let store = train_dispatch::connect_store(&settings.metadata).await?;
            let blobs = train_dispatch::build_blob_store(&settings.blob)?;
            let reporter = ResultReporter::new(store, blobs);

            let (run, body) = reporter.download_weights(&RunId::new(run_id)).await?;
            let output = output.unwrap_or_else(|| {
                let key = run.weights_path.as_ref().map(|k| k.as_str()).unwrap_or("weights");
                PathBuf::from(key.rsplit('/').next().unwrap_or(key))
            });
            tokio::fs::write(&output, body)
                .await
                .with_context(|| format!("writing {}", output.display()))?;
            println!("Downloaded weights of {} to {}", run.run_id, output.display());
        }
        Commands::Report {
            run_id,
            train_score,
            validation_score,
            weights,
            train_config,
            model_config,
            tags,
        } => {
            let settings = Settings::load(Some(&config_path))?;
            let store = train_dispatch::connect_store(&settings.metadata).await?;
            let blobs = train_dispatch::build_blob_store(&settings.blob)?;
            let reporter = ResultReporter::new(store, blobs);

            let run_id = RunId::new(run_id);
            let weights_path = match weights {
                Some(path) => Some(reporter.upload_weights(&run_id, &path).await?),
                None => None,
            };

            let result = RunResult {
                train_score,
                validation_score,
                weights_path,
                train_config: train_config.as_deref().map(read_json).transpose()?,
                model_config: model_config.as_deref().map(read_json).transpose()?,
                tags: Tags::new(tags)?,
            };

            let record = reporter.report(&run_id, result).await?;
            println!("Recorded results for {}", record);
        }
    }

    Ok(())
}

/// Settings written by `init`: services reachable from several processes.
/// Database credentials from the environment are written as `${VAR}` references.
fn init_settings() -> Settings {
    let mut settings = Settings::default();
    settings.metadata = settings.metadata.with_credential_placeholders();
    settings.metadata.url = "ws://127.0.0.1:8000".to_string();
    settings.blob.endpoint = "http://127.0.0.1:9000".to_string();
    settings
}

fn read_json(path: &Path) -> Result<serde_json::Value> {
    let raw = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parsing {}", path.display()))
}

fn score(value: Option<f64>) -> String {
    value.map(|v| format!("{v:.4}")).unwrap_or_else(|| "-".to_string())
}
