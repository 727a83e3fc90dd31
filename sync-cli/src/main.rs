//! # tether-cli
//!
//! CLI tool for exercising the Tether sync engine against the in-memory
//! backbone.
//!
//! ## Commands
//!
//! - `check-config`: Validate a configuration file and print the result
//! - `demo`: Run a relationship handshake between two identities
//!
//! ## Example
//!
//! ```bash
//! # Validate a config file
//! tether-cli check-config tether.toml
//!
//! # Handshake, then exchange a message
//! tether-cli demo
//!
//! # Handshake that ends in a rejection
//! tether-cli demo --reject
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use tether_sync_client::{AccountController, Config, DeviceSecrets, MockBackbone};
use tether_sync_types::{DeviceId, Realm, SyncScope};
use tracing_subscriber::EnvFilter;

/// CLI tool for exercising the Tether sync engine.
#[derive(Parser, Debug)]
#[command(name = "tether-cli")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Configuration file (defaults apply when omitted)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate a configuration file
    CheckConfig {
        /// Path to the TOML file
        path: PathBuf,
    },

    /// Run a handshake between two identities on an in-memory backbone
    Demo {
        /// Reject the request instead of accepting it
        #[arg(long)]
        reject: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("Failed to load {}", path.display()))?,
        None => Config::default(),
    };
    init_logging(&config);
    tracing::debug!("Using configuration {:?}", cli.config);

    match cli.command {
        Commands::CheckConfig { path } => check_config(&path),
        Commands::Demo { reject } => demo(&config, reject).await,
    }
}

fn init_logging(config: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn check_config(path: &std::path::Path) -> Result<()> {
    let config = Config::from_file(path).context("Invalid configuration")?;

    println!("=== {} ===", path.display());
    println!("Account:");
    println!("  Realm:  {}", config.account.realm);
    println!("  Device: {}", config.account.device_name);
    println!("Sync:");
    println!(
        "  Datawallet version:    {}",
        config.sync.supported_datawallet_version
    );
    println!(
        "  Opportunistic push:    {}",
        config.sync.opportunistic_datawallet_sync
    );
    println!("  Event page size:       {}", config.sync.external_event_page_size);
    println!("  Datawallet page size:  {}", config.sync.datawallet_page_size);
    println!("Logging:");
    println!("  Filter: {}", config.logging.filter);
    Ok(())
}

async fn open(
    backbone: &MockBackbone,
    config: &Config,
) -> Result<AccountController> {
    let device = DeviceSecrets::generate();
    let identity = device.identity(Realm::new(config.account.realm.clone()));
    let device_id = DeviceId::generate();
    let session = backbone
        .session(identity.address, device_id.clone())
        .with_supported_datawallet_version(config.sync.supported_datawallet_version);
    Ok(AccountController::init(config, device, device_id, Arc::new(session)).await?)
}

async fn demo(config: &Config, reject: bool) -> Result<()> {
    let backbone = MockBackbone::new();
    let alice = open(&backbone, config).await?;
    let bob = open(&backbone, config).await?;
    println!("Alice: {}", alice.identity().address);
    println!("Bob:   {}", bob.identity().address);

    let template = alice
        .templates()
        .create_own_template(json!({"name": "Alice"}), None, Some(1))
        .await?;
    let reference = alice.templates().reference(&template)?.to_truncated();
    println!("Template reference: {}", reference);

    let peer_template = bob
        .templates()
        .load_peer_template_by_reference(&reference)
        .await?;
    let sent = bob
        .relationships()
        .send_relationship(&peer_template, json!({"name": "Bob"}))
        .await?;
    println!("Bob requested relationship {}", sent.id);

    let changed = alice.sync(SyncScope::Everything).await?;
    let request = changed
        .relationships
        .first()
        .context("Alice received no request")?;
    let change_id = request
        .creation_change()
        .context("Request has no creation change")?
        .id
        .clone();

    if reject {
        alice
            .relationships()
            .reject_change(&request.id, &change_id, json!({"reason": "demo"}))
            .await?;
    } else {
        alice
            .relationships()
            .accept_change(&request.id, &change_id, json!({"welcome": "Bob"}))
            .await?;
    }

    bob.sync(SyncScope::Everything).await?;
    let at_bob = bob
        .relationships()
        .get_relationship(&sent.id)
        .await?
        .context("Bob lost the relationship")?;
    println!("Relationship status at Bob: {:?}", at_bob.status);

    if !reject {
        bob.messages()
            .send_message(vec![alice.identity().address.clone()], json!({"text": "hi"}))
            .await?;
        let changed = alice.sync(SyncScope::Everything).await?;
        for message in &changed.messages {
            println!("Alice received {}: {}", message.id, message.content);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn demo_flag_parses() {
        let cli = Cli::try_parse_from(["tether-cli", "demo", "--reject"]).unwrap();
        assert!(matches!(cli.command, Commands::Demo { reject: true }));
    }

    #[tokio::test]
    async fn demo_runs_to_completion() {
        demo(&Config::default(), false).await.unwrap();
        demo(&Config::default(), true).await.unwrap();
    }
}
