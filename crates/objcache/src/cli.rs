//! Exposes the command line application.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};

use objcache_service::caching::{CacheKey, PropertyOverrides};
use objcache_service::config::Config;
use objcache_service::dispatch::{ExecutionContext, SerialExecutor};
use objcache_service::download::FetchSource;
use objcache_service::metrics;
use objcache_service::service::Services;

/// Command line interface parser.
#[derive(Debug, Parser)]
#[command(bin_name = "objcache", version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

/// Object cache commands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Fetch a file into the files cache and print its path.
    Fetch {
        /// URL or local path of the file.
        location: String,
        /// The cache key, defaults to the location.
        #[arg(long)]
        key: Option<String>,
        /// Fetch the file again if it is older than this, e.g. `1h`.
        #[arg(long, value_parser = humantime::parse_duration)]
        max_age: Option<Duration>,
    },

    /// Fetch and decode an image, and print its format and size.
    Image {
        /// URL or local path of the image.
        location: String,
        /// Width to decode the image to.
        #[arg(long)]
        width: Option<u32>,
        /// Height to decode the image to.
        #[arg(long)]
        height: Option<u32>,
        /// Construct the image on a dedicated serial thread.
        #[arg(long)]
        serial: bool,
    },

    /// Print the number of entries and their size for every cache.
    Stats,

    /// Remove one entry, or all entries, from the caches.
    Clear {
        /// The cache key to remove. Without one, the caches are emptied.
        key: Option<String>,
        #[arg(long, value_enum, default_value_t = CacheSelection::All)]
        cache: CacheSelection,
    },

    /// Clean local caches.
    Cleanup {
        /// Only log what would be removed.
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum CacheSelection {
    Images,
    Files,
    All,
}

impl CacheSelection {
    fn images(self) -> bool {
        matches!(self, Self::Images | Self::All)
    }

    fn files(self) -> bool {
        matches!(self, Self::Files | Self::All)
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::get(cli.config.as_deref()).context("failed loading config")?;

    let _sentry = sentry::init(sentry::ClientOptions {
        dsn: config.sentry_dsn.clone(),
        release: sentry::release_name!(),
        ..Default::default()
    });

    // SAFETY: No other threads have been spawned yet.
    unsafe { crate::logging::init_logging(&config) };

    if let Some(ref statsd) = config.metrics.statsd {
        metrics::configure_statsd(
            &config.metrics.prefix,
            statsd.as_str(),
            config.metrics.custom_tags.clone(),
        )
        .context("failed to configure statsd")?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("objcache-io")
        .enable_all()
        .build()
        .context("failed to create runtime")?;

    runtime.block_on(run(config, cli.command))
}

async fn run(config: Config, command: Command) -> Result<()> {
    let context = match command {
        Command::Image { serial: true, .. } => {
            let executor = SerialExecutor::new("objcache-decode", config.serial_queue_size)
                .context("failed to start serial executor")?;
            Some(Arc::new(executor) as Arc<dyn ExecutionContext>)
        }
        _ => None,
    };
    let services = Services::create(config, context).context("failed to create services")?;

    match command {
        Command::Fetch {
            location,
            key,
            max_age,
        } => {
            let key = key.unwrap_or_else(|| location.clone());
            let entry = services
                .files
                .get_file(key, FetchSource::parse(&location), max_age)
                .await
                .with_context(|| format!("failed to fetch `{location}`"))?;
            println!("{}", entry.path.display());
        }
        Command::Image {
            location,
            width,
            height,
            ..
        } => {
            let mut overrides = PropertyOverrides::new();
            if let Some(width) = width {
                overrides.push(("DecodePixelWidth".into(), width.into()));
            }
            if let Some(height) = height {
                overrides.push(("DecodePixelHeight".into(), height.into()));
            }

            let bitmap = services
                .images
                .get(location.as_str(), FetchSource::parse(&location), overrides)
                .await
                .with_context(|| format!("failed to load image `{location}`"))?;
            println!(
                "{:?} {}x{}",
                bitmap.format(),
                bitmap.pixel_width(),
                bitmap.pixel_height()
            );
        }
        Command::Stats => {
            for store in [services.images.store(), &services.files] {
                let stats = store
                    .stats()
                    .with_context(|| format!("failed to read `{}` cache", store.name()))?;
                println!(
                    "{}: {} entries, {} bytes",
                    store.name(),
                    stats.entries,
                    stats.total_bytes
                );
            }
        }
        Command::Clear { key, cache } => {
            let key = key.map(CacheKey::new);
            if cache.images() {
                services
                    .images
                    .clear(key.as_ref())
                    .await
                    .context("failed to clear images")?;
            }
            if cache.files() {
                services
                    .files
                    .clear(key.as_ref())
                    .await
                    .context("failed to clear files")?;
            }
        }
        Command::Cleanup { dry_run } => {
            let caches = services.caches.clone();
            tokio::task::spawn_blocking(move || caches.cleanup(dry_run))
                .await?
                .context("failed to clean up caches")?;
        }
    }

    Ok(())
}
