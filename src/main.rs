//! docbroker binary entry point.
//!
//! The broker core is a library; the socket front-end embeds it. This
//! binary provides the operational surface: config validation and a
//! single-document run mode used for smoke testing a kit + storage pair
//! from the command line.

use anyhow::Result;
use clap::{Parser, Subcommand};
use docbroker::{Config, DocBrokerHandle, ProcessContext};
use mimalloc::MiMalloc;
use std::path::PathBuf;
use std::sync::Arc;

/// mimalloc performs better than the system allocator under the broker's
/// many-small-buffers workload.
#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser)]
#[command(name = "docbroker", version = VERSION, about = "Per-document broker core for a collaborative office server")]
struct Cli {
    /// Path to the configuration file (JSON).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and print the effective configuration.
    CheckConfig,

    /// Host a single document until its last session leaves.
    ///
    /// The front-end connects sessions through the broker handle; this
    /// mode exists for smoke-testing a kit and storage host pairing.
    Host {
        /// Public WOPI URI of the document (including access token).
        uri: String,

        /// Cap the document lifetime (convert-to style), in seconds.
        #[arg(long)]
        limit_secs: Option<u64>,
    },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_ref())?;

    match cli.command {
        Commands::CheckConfig => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
        Commands::Host { uri, limit_secs } => host_document(config, &uri, limit_secs),
    }
}

/// Run one broker until it stops on its own (idle, closed, or expired).
fn host_document(config: Config, uri: &str, limit_secs: Option<u64>) -> Result<()> {
    let seed = config.child_root.display().to_string();
    let ctx = Arc::new(ProcessContext::new(VERSION, &seed));
    let config = Arc::new(config);

    log::info!("docbroker {VERSION} hosting one document (host id {})", ctx.host_identifier);

    let handle = DocBrokerHandle::spawn(uri.to_string(), config, Arc::clone(&ctx))?;
    if let Some(secs) = limit_secs {
        let limit = std::time::Duration::from_secs(secs);
        handle.add_callback(move |broker| broker.set_life_limit(limit));
    }

    log::info!("broker running for docKey [{}]; press Ctrl-C to stop", handle.doc_key());
    handle.join();
    Ok(())
}
