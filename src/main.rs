//! Bootstrap for the `dynproxy` binary: parse flags, install tracing, load
//! a config file once, apply it, and run until interrupted (spec §4.G).
//!
//! On-disk config *watching* is out of scope (spec §1); this entry point
//! only loads the file once at startup. A long-running deployment is
//! expected to drive [`dynproxy::Controller::apply_diff`] itself from
//! whatever config-watching shell it's embedded in.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dynproxy::{diff, Config, Controller, HealthCheckConfig};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dynproxy", about = "dynamic TCP reverse proxy")]
struct ProxyOptions {
    /// Path to the JSON config file to load at startup.
    #[arg(long, env = "DYNPROXY_CONFIG")]
    config: PathBuf,

    /// Log level passed to the tracing env-filter (overridden by RUST_LOG).
    #[arg(long, env = "DYNPROXY_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Route accepted ports through the kernel echo-dispatch accelerator
    /// instead of dedicated listeners, when supported.
    #[arg(long, env = "DYNPROXY_ECHO_DISPATCH", default_value_t = false)]
    echo_dispatch: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let opts = ProxyOptions::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&opts.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let raw = std::fs::read_to_string(&opts.config)
        .with_context(|| format!("reading config file {}", opts.config.display()))?;
    let config: Config = serde_json::from_str(&raw).context("parsing config file as JSON")?;
    config.validate().context("validating config")?;

    let echo_dispatch = Arc::new(dynproxy::echodispatch::Unsupported);
    if opts.echo_dispatch && !echo_dispatch.supported() {
        warn!("echo-dispatch requested but not supported on this build; falling back to listeners");
    }
    let controller = Controller::new(echo_dispatch, opts.echo_dispatch, HealthCheckConfig::default());

    let ops = diff(&Config::default(), &config);
    info!(count = ops.len(), "applying initial configuration");
    if let Err((applied, e)) = controller.apply_diff(ops).await {
        error!(applied, error = %e, "failed to apply initial configuration");
        return Err(e.into());
    }

    info!("dynproxy running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
    info!("shutting down");
    Ok(())
}
