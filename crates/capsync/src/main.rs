//! capsync - resolve capability definitions from a cluster.

use mimalloc::MiMalloc;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

use capsync::cluster::KubeCluster;
use capsync::install::HelmCli;
use capsync::render::{self, OutputFormat};
use capsync::template::HttpFetcher;
use capsync::{
    sync_all, sync_one, BatchResult, DependencyInstaller, IoStreams, LocalCache, Pipeline,
    TemplateResolver,
};
use capsync_core::config::DEFAULT_CONFIG_PATH;
use capsync_core::{Config, DefinitionKind};
use clap::{Parser, Subcommand, ValueEnum};
use eyre::{bail, Result, WrapErr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

/// Resolve ComponentDefinitions and TraitDefinitions into capabilities.
#[derive(Parser)]
#[command(name = "capsync", version)]
struct Cli {
    /// Config file path (overrides .capsync/config)
    #[arg(long, global = true, env = "CAPSYNC_CONFIG")]
    config: Option<PathBuf>,

    /// Namespace to read definitions from (default: vela-system)
    #[arg(short, long, global = true)]
    namespace: Option<String>,

    /// Definitions resolved concurrently
    #[arg(long, global = true)]
    concurrency: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum KindFilter {
    Component,
    Trait,
    All,
}

#[derive(Subcommand)]
enum Command {
    /// List capabilities in the namespace
    List {
        #[arg(long, value_enum, default_value_t = KindFilter::All)]
        kind: KindFilter,

        /// Label selector (overrides the configured selector)
        #[arg(short = 'l', long)]
        selector: Option<String>,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },

    /// Resolve one capability and show its parameters
    Show {
        name: String,

        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },

    /// Resolve capabilities and cache their templates locally
    Sync {
        /// Sync only this capability
        name: Option<String>,

        /// Cache directory (overrides cache_dir)
        #[arg(long)]
        cache_dir: Option<PathBuf>,
    },
}

fn main() {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to create tokio runtime");

    if let Err(e) = runtime.block_on(run(cli)) {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let mut config = load_config(cli.config.as_deref())?;
    if let Some(namespace) = cli.namespace {
        config.namespace = namespace;
    }
    if let Some(concurrency) = cli.concurrency {
        config.concurrency = concurrency.max(1);
    }

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("received interrupt, cancelling");
            on_interrupt.cancel();
        }
    });

    let pipeline = build_pipeline(&config).await?;

    match cli.command {
        Command::List {
            kind,
            selector,
            output,
        } => {
            let selector = selector.unwrap_or_else(|| config.selector.clone());
            let selector = Some(selector.as_str()).filter(|s| !s.is_empty());
            list(&pipeline, &config.namespace, kind, selector, output, &cancel).await
        }
        Command::Show { name, output } => {
            let capability = pipeline
                .resolve_one(&config.namespace, &name, &cancel)
                .await
                .wrap_err_with(|| format!("failed to resolve '{name}'"))?;
            print!("{}", render::render_details(&capability, output)?);
            Ok(())
        }
        Command::Sync { name, cache_dir } => {
            let cache = LocalCache::new(cache_dir.unwrap_or_else(|| config.cache_dir.clone()));
            let report = match name {
                Some(name) => sync_one(&pipeline, &cache, &config.namespace, &name, &cancel)
                    .await
                    .wrap_err_with(|| format!("failed to sync '{name}'"))?,
                None => sync_all(&pipeline, &cache, &config.namespace, &cancel)
                    .await
                    .wrap_err("sync failed")?,
            };
            print!("{}", render::render_sync_report(&report, cache.dir()));
            Ok(())
        }
    }
}

async fn list(
    pipeline: &Pipeline,
    namespace: &str,
    kind: KindFilter,
    selector: Option<&str>,
    output: OutputFormat,
    cancel: &CancellationToken,
) -> Result<()> {
    let fetched = match kind {
        KindFilter::All => pipeline.fetch_all(namespace, selector, cancel).await,
        KindFilter::Component => {
            pipeline
                .fetch_class(namespace, DefinitionKind::Component, selector, cancel)
                .await
        }
        KindFilter::Trait => {
            pipeline
                .fetch_class(namespace, DefinitionKind::Trait, selector, cancel)
                .await
        }
    };

    // An interrupted list still prints what resolved before the interrupt.
    let (batch, interrupted): (BatchResult, bool) = match fetched {
        Ok(batch) => (batch, false),
        Err(e) => (
            e.into_partial()
                .wrap_err_with(|| format!("failed to list capabilities in {namespace}"))?,
            true,
        ),
    };

    for err in &batch.errors {
        eprintln!("{}", err.warning());
    }
    print!("{}", render::render_list(&batch.capabilities, output)?);
    if interrupted {
        bail!(
            "interrupted after resolving {} capabilities in {namespace}",
            batch.capabilities.len()
        );
    }
    Ok(())
}

/// Defaults, then `.capsync/config`, then `--config`.
fn load_config(path: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();
    let workspace_default = Path::new(DEFAULT_CONFIG_PATH);
    if workspace_default.is_file() {
        config
            .load_file(workspace_default)
            .wrap_err_with(|| format!("failed to load {DEFAULT_CONFIG_PATH}"))?;
    }
    if let Some(path) = path {
        config
            .load_file(path)
            .wrap_err_with(|| format!("failed to load config {}", path.display()))?;
    }
    let cwd = std::env::current_dir().wrap_err("failed to read current directory")?;
    config.resolve_paths(&cwd);
    Ok(config)
}

async fn build_pipeline(config: &Config) -> Result<Pipeline> {
    let cluster = KubeCluster::connect()
        .await
        .wrap_err("failed to connect to cluster")?;

    let timeout = (config.fetch_timeout_sec > 0).then(|| Duration::from_secs(config.fetch_timeout_sec));
    let fetcher = HttpFetcher::new(timeout).wrap_err("failed to build http client")?;

    let streams = if config.interactive_install {
        IoStreams::Terminal
    } else {
        IoStreams::Captured
    };
    let installer = DependencyInstaller::new(Arc::new(HelmCli::new(&config.helm_bin)), streams);

    Ok(Pipeline::new(
        Arc::new(cluster.clone()),
        Arc::new(cluster),
        TemplateResolver::new(Arc::new(fetcher)),
        installer,
    )
    .with_concurrency(config.concurrency))
}
