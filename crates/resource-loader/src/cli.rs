//! Exposes the command line application.
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use console::style;
use resource_loader_service::config::Config;
use resource_loader_service::loader::{LoaderEvent, ResourceLoader};
use resource_loader_service::metrics;
use resource_loader_service::types::{LoadOptions, PRELOAD_PRIORITY, Resource, ResponseKind};
use tokio::sync::broadcast::error::RecvError;

use crate::logging;
use crate::service;

/// How loaded bodies are decoded.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum Kind {
    Json,
    Text,
    Bytes,
}

impl From<Kind> for ResponseKind {
    fn from(kind: Kind) -> Self {
        match kind {
            Kind::Json => ResponseKind::Json,
            Kind::Text => ResponseKind::Text,
            Kind::Bytes => ResponseKind::Bytes,
        }
    }
}

/// Experiment commands.
#[derive(Debug, Subcommand)]
enum ExperimentCommand {
    /// Print the aggregated results of every strategy as JSON.
    Results,

    /// Forget the assigned strategy and draw a new one.
    Reset {
        /// Also delete all recorded samples.
        #[arg(long)]
        clear_results: bool,
    },
}

/// Resource loader commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Load resources and print a summary.
    Load {
        /// The urls to load.
        #[arg(required = true)]
        urls: Vec<String>,

        /// How to decode the bodies.
        #[arg(long, value_enum, default_value = "bytes")]
        kind: Kind,

        /// Declared priority of the loads.
        #[arg(long)]
        priority: Option<u32>,

        /// Skip the cache.
        #[arg(long)]
        bypass_cache: bool,
    },

    /// Preload resources in the background at low priority and wait for completion.
    Preload {
        /// The urls to preload.
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Inspect or reset the concurrency strategy experiment.
    Experiment {
        #[command(subcommand)]
        command: ExperimentCommand,
    },
}

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(bin_name = "resource-loader", version)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: The runtime has not been started yet, so this is single-threaded.
    unsafe { logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        let mut tags = config.metrics.custom_tags.clone();
        if let Some(tag) = config.metrics.hostname_tag.clone() {
            if let Some(name) = hostname::get().ok().and_then(|s| s.into_string().ok()) {
                tags.insert(tag, name);
            }
        }
        metrics::configure_statsd(&config.metrics.prefix, statsd, tags)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("resource-loader")
        .build()
        .context("failed to create the runtime")?;

    match cli.command {
        Command::Load {
            urls,
            kind,
            priority,
            bypass_cache,
        } => {
            let mut options = LoadOptions::default().with_response_kind(kind.into());
            if let Some(priority) = priority {
                options = options.with_priority(priority);
            }
            if bypass_cache {
                options = options.bypassing_cache();
            }
            runtime.block_on(load(&config, runtime.handle().clone(), urls, options))
        }
        Command::Preload { urls } => {
            runtime.block_on(preload(&config, runtime.handle().clone(), urls))
        }
        Command::Experiment { command } => experiment(&config, command),
    }
}

async fn load(
    config: &Config,
    runtime: tokio::runtime::Handle,
    urls: Vec<String>,
    options: LoadOptions,
) -> Result<()> {
    let service = service::create_loader(config, runtime).await?;
    let loader = &service.loader;
    let results = loader.load_batch(&urls, options).await;

    for (url, result) in urls.iter().zip(&results) {
        match result {
            Some(resource) => println!("{} {url} {}", style("ok").green(), describe(resource)),
            None => println!("{} {url}", style("failed").red()),
        }
    }
    print_stats(loader)?;
    service.shutdown().await;

    let failed = results.iter().filter(|result| result.is_none()).count();
    if failed > 0 {
        anyhow::bail!("{failed} of {} resources failed to load", urls.len());
    }
    Ok(())
}

async fn preload(config: &Config, runtime: tokio::runtime::Handle, urls: Vec<String>) -> Result<()> {
    let service = service::create_loader(config, runtime).await?;
    let loader = &service.loader;
    let mut events = loader.subscribe();
    loader.preload(
        &urls,
        Some(LoadOptions::default().with_priority(PRELOAD_PRIORITY)),
    );

    loop {
        match events.recv().await {
            Ok(LoaderEvent::PreloadCompleted { requested, loaded }) => {
                println!("preloaded {loaded} of {requested} resources");
                break;
            }
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {}
            Err(RecvError::Closed) => anyhow::bail!("loader shut down during preload"),
        }
    }
    print_stats(loader)?;
    service.shutdown().await;
    Ok(())
}

fn experiment(config: &Config, command: ExperimentCommand) -> Result<()> {
    let harness = service::create_harness(&config.experiment);
    match command {
        ExperimentCommand::Results => {
            let results = harness.get_test_results();
            println!("{}", serde_json::to_string_pretty(&results)?);
        }
        ExperimentCommand::Reset { clear_results } => match harness.reset_test(clear_results) {
            Some(strategy) => println!("assigned strategy {}", style(strategy).bold()),
            None => println!("no strategy registered"),
        },
    }
    Ok(())
}

fn describe(resource: &Resource) -> String {
    let source = if resource.from_cache { "cache" } else { "network" };
    match &resource.content_type {
        Some(content_type) => format!("({} bytes, {content_type}, {source})", resource.len()),
        None => format!("({} bytes, {source})", resource.len()),
    }
}

fn print_stats(loader: &ResourceLoader) -> Result<()> {
    let stats = loader.stats();
    let summary: BTreeMap<&str, u64> = [
        ("loaded", stats.loaded),
        ("failed", stats.failed),
        ("cache_hits", stats.cache_hits),
        ("merged", stats.merged),
        ("retried", stats.retried),
        ("batches", stats.batches),
    ]
    .into_iter()
    .collect();
    eprintln!("{}", serde_json::to_string(&summary)?);
    Ok(())
}
