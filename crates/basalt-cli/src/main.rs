//! Command-line interface for the Basalt host.

mod config;
mod modules;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use basalt_api::ServerState;
use basalt_core::extension::{bootstrap, install_extension_panic_hook, NoIdentity, Registry};
use basalt_core::RuntimeConfig;
use clap::{Parser, Subcommand};

use crate::config::{HostConfig, DEFAULT_CONFIG_PATH};

/// Basalt - self-hosted backend with compiled-in extension modules.
#[derive(Parser, Debug)]
#[command(name = "basalt")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,

    /// Verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Start the web server.
    Serve {
        /// Host configuration file.
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,
        /// Host to bind to, overriding the config file.
        #[arg(long)]
        host: Option<String>,
        /// Port to bind to, overriding the config file.
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// List the modules compiled into this binary.
    Modules,
    /// Validate a configuration file and exit.
    CheckConfig {
        /// Path to the configuration file.
        #[arg(required = true)]
        path: PathBuf,
    },
}

fn init_tracing(verbose: bool) {
    // JSON logs for production/container environments
    let json_logging = std::env::var("BASALT_LOG_JSON")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(false);

    let default_level = if verbose { "basalt=debug" } else { "basalt=info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(default_level)
            .add_directive(tracing::Level::WARN.into())
    });

    if json_logging {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.verbose);

    match args.command {
        Command::Serve { config, host, port } => run_server(config, host, port).await,
        Command::Modules => list_modules(),
        Command::CheckConfig { path } => check_config(path),
    }
}

async fn run_server(path: PathBuf, host: Option<String>, port: Option<u16>) -> Result<()> {
    let mut config = HostConfig::load(&path)?;
    if let Some(host) = host {
        config.server.host = host;
    }
    if let Some(port) = port {
        config.server.port = port;
    }
    let addr = config.server.socket_addr()?;

    // Module panics are contained; the hook only records where they happened.
    install_extension_panic_hook();

    let identity = Arc::new(NoIdentity);
    let services = basalt_storage::open_host_services(&config.storage, identity.clone())
        .with_context(|| format!("failed to open storage at {}", config.storage.path))?;
    let registry = Registry::new(config.runtime.clone(), services);

    let report = bootstrap(&registry, modules::compiled_modules(), &config.extensions).await;
    tracing::info!(
        registered = report.registered.len(),
        enabled = report.enabled.len(),
        failed = report.failures.len(),
        "Extension bootstrap complete"
    );
    for name in &report.unknown {
        tracing::warn!(module = %name, "load_order names a module that is not compiled in");
    }

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(%addr, namespace = %config.runtime.namespace, "Basalt listening");

    let state = ServerState::new(registry, identity);
    basalt_api::serve(listener, state, Router::new()).await?;
    Ok(())
}

fn list_modules() -> Result<()> {
    let modules = modules::compiled_modules();
    if modules.is_empty() {
        println!("No modules compiled in.");
        return Ok(());
    }
    let namespace = RuntimeConfig::default().namespace;
    for module in modules {
        let descriptor = module.descriptor();
        println!(
            "{:<20} {:<10} /{}/{}",
            descriptor.name,
            descriptor.version.to_string(),
            namespace,
            descriptor.name
        );
        if let Some(description) = &descriptor.description {
            println!("    {description}");
        }
        if !descriptor.dependencies.is_empty() {
            println!("    depends on: {}", descriptor.dependencies.join(", "));
        }
    }
    Ok(())
}

fn check_config(path: PathBuf) -> Result<()> {
    if !path.exists() {
        anyhow::bail!("{} does not exist", path.display());
    }
    let config = HostConfig::load(&path)?;

    let compiled: Vec<String> = modules::compiled_modules()
        .iter()
        .map(|m| m.descriptor().name)
        .collect();
    let mut warnings = 0;
    for name in config
        .extensions
        .load_order
        .iter()
        .chain(config.extensions.modules.keys())
    {
        if !compiled.contains(name) {
            println!("warning: module `{name}` is not compiled in");
            warnings += 1;
        }
    }

    println!(
        "{} is valid ({} module setting(s), {} warning(s))",
        path.display(),
        config.extensions.modules.len(),
        warnings
    );
    Ok(())
}
