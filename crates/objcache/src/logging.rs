use std::env;

use objcache_service::config::{Config, LogFormat};
use objcache_service::logging::{default_filter, init_json_logging, sentry_layer};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Initializes logging to `stderr` in the configured format.
///
/// `RUST_LOG` takes precedence over the configured level.
///
/// # Safety
/// Sets `RUST_BACKTRACE` through [`std::env::set_var`], so this must run before any other thread
/// is spawned.
pub unsafe fn init_logging(config: &Config) {
    if config.logging.enable_backtraces {
        // SAFETY: As documented, no other threads exist yet.
        unsafe { env::set_var("RUST_BACKTRACE", "1") };
    }

    let filter =
        env::var("RUST_LOG").unwrap_or_else(|_| default_filter(config.logging.level).to_owned());

    let pretty = match config.logging.format {
        LogFormat::Json => return init_json_logging(&filter, std::io::stderr),
        LogFormat::Pretty => true,
        LogFormat::Simplified => false,
        LogFormat::Auto => console::user_attended_stderr(),
    };

    let console = fmt::layer().with_writer(std::io::stderr);
    let console = if pretty {
        console.pretty().boxed()
    } else {
        console.compact().with_ansi(false).boxed()
    };

    tracing_subscriber::registry()
        .with(console.with_filter(EnvFilter::new(&filter)))
        .with(sentry_layer())
        .init();
}

/// Logs an error to the configured logger or `stderr` if not yet configured.
pub fn ensure_log_error(error: &anyhow::Error) {
    if LevelFilter::current() >= LevelFilter::ERROR {
        tracing::error!("{:?}", error);
    } else {
        eprintln!("{error:?}");
    }
}
