use anyhow::{bail, Context, Result};
use std::sync::Arc;
use tracing::info;
use whoop_sync::api::{ApiClient, DateRange, Resource};
use whoop_sync::credentials::CipherKey;
use whoop_sync::oauth::authorize_interactive;
use whoop_sync::token::{HttpTokenExchange, TokenManager};
use whoop_sync::SyncConfig;

const USAGE: &str = "\
Usage: whoop-sync <command>

Commands:
  status                    Show token state and expiry
  token                     Print a valid access token
  refresh                   Force a token refresh
  auth [port]               Authorize interactively in a browser
  fetch <resource> [days]   Print the first page of a resource as JSON
  generate-key              Print a new base64 encryption key
  logout                    Delete stored credentials

Resources: profile, body, cycles, recovery, sleep, workouts";

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "whoop_sync=info".into()),
        )
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some(command) = args.first().map(String::as_str) else {
        println!("{}", USAGE);
        return Ok(());
    };

    // Needs no configuration
    if command == "generate-key" {
        println!("{}", CipherKey::generate().to_base64());
        return Ok(());
    }
    if matches!(command, "help" | "-h" | "--help") {
        println!("{}", USAGE);
        return Ok(());
    }

    let config = SyncConfig::from_env().context("Failed to load configuration")?;
    let store = config.open_store()?;

    info!(
        backend = ?config.storage.backend,
        path = %config.storage.path,
        encrypted = config.storage.encryption_key.is_some(),
        "Configuration loaded"
    );

    if command == "logout" {
        let removed = store.clear().context("Failed to clear credentials")?;
        println!("{}", if removed { "Credentials removed" } else { "No stored credentials" });
        return Ok(());
    }

    // Status never talks to the token endpoint
    if command != "status" {
        config.client_credentials()?;
    }
    let exchange = Arc::new(HttpTokenExchange::new(
        config.oauth.token_url.clone(),
        config.oauth.client_id.clone(),
        config.oauth.client_secret.clone().unwrap_or_default(),
        config.oauth.scopes.clone(),
    )?);
    let manager = Arc::new(TokenManager::new(
        store,
        exchange.clone(),
        config.bootstrap_tokens()?,
    ));

    match command {
        "status" => {
            let status = manager.status()?;
            println!("state:      {}", status.state);
            match status.expires_at {
                Some(at) => println!("expires_at: {}", at.to_rfc3339()),
                None => println!("expires_at: -"),
            }
            match status.updated_at {
                Some(at) => println!("updated_at: {}", at.to_rfc3339()),
                None => println!("updated_at: -"),
            }
        }
        "token" => {
            println!("{}", manager.get_valid_token().await?);
        }
        "refresh" => {
            manager.force_refresh().await?;
            let status = manager.status()?;
            if let Some(at) = status.expires_at {
                println!("Refreshed, expires at {}", at.to_rfc3339());
            }
        }
        "auth" => {
            let port = args
                .get(1)
                .map(|p| p.parse::<u16>())
                .transpose()
                .context("auth port must be a number between 1 and 65535")?;
            authorize_interactive(&config.oauth, &exchange, &manager, port).await?;
            println!("Authorization stored");
        }
        "fetch" => {
            let resource: Resource = args
                .get(1)
                .context("fetch requires a resource name")?
                .parse()
                .map_err(anyhow::Error::msg)?;
            let days = match args.get(2) {
                Some(d) => d.parse().context("days must be a positive integer")?,
                None => config.api.scrape_days,
            };

            let client = ApiClient::new(config.api.base_url.clone(), manager)?;
            let body = if resource.is_collection() {
                let range = DateRange::last_days(days)?;
                let page = client.fetch_page(resource, &range, None).await?;
                serde_json::to_value(page)?
            } else {
                client.fetch_one(resource).await?
            };
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        other => bail!("Unknown command '{}'\n\n{}", other, USAGE),
    }

    Ok(())
}
