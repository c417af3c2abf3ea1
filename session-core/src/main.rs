//! NoChat session layer - command line entry point
//!
//! Opens the local database, registers or logs in against the server
//! (prekey publication and replenishment) and prints the identity
//! fingerprint and prekey status.

use std::path::Path;
use std::sync::Arc;

use anyhow::Context;

use nochat_session::api::ApiClient;
use nochat_session::config::Config;
use nochat_session::crypto::{SecretKeyVault, VaultKey};
use nochat_session::db;
use nochat_session::service::SessionService;

fn required_env(name: &str) -> anyhow::Result<String> {
    std::env::var(name).with_context(|| format!("{} must be set", name))
}

/// Relative database paths live under ~/.nochat
fn resolve_database_path(configured: &str) -> anyhow::Result<String> {
    if Path::new(configured).is_absolute() {
        return Ok(configured.to_string());
    }
    let dir = home::home_dir()
        .context("Cannot determine home directory")?
        .join(".nochat");
    std::fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    Ok(dir.join(configured).to_string_lossy().to_string())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    nochat_session::init_tracing();

    let config = Config::from_env()?;
    let user_id = required_env("NOCHAT_USER_ID")?;
    let secret = required_env("NOCHAT_VAULT_SECRET")?;

    let db_path = resolve_database_path(&config.database_path)?;
    tracing::info!("Database path: {}", db_path);
    let pool = db::connect(&db_path).await?;

    // The auth token lives in the vault; the environment overrides it
    let vault = SecretKeyVault::new(pool.clone(), VaultKey::derive(secret.as_bytes(), user_id.as_bytes())?);
    let token = match std::env::var("NOCHAT_AUTH_TOKEN") {
        Ok(token) => {
            vault.save_auth_token(&token).await?;
            token
        }
        Err(_) => vault
            .load_auth_token()
            .await?
            .context("No auth token stored; set NOCHAT_AUTH_TOKEN")?,
    };

    let client = ApiClient::new(&config)?;
    client.set_token(Some(token));

    let vault_key = VaultKey::derive(secret.as_bytes(), user_id.as_bytes())?;
    let (service, _notifications) =
        SessionService::start(config, Arc::new(client), pool, vault_key, &user_id).await?;

    let report = service.startup_report();
    tracing::info!(
        "Prekeys: server had {}, generated {}, replaced pool: {}, rotated signed prekey: {}",
        report.server_count,
        report.generated,
        report.replaced,
        report.rotated_signed_prekey
    );

    println!("User:        {}", service.user_id());
    println!("Fingerprint: {}", service.fingerprint());
    println!(
        "Prekeys:     {}",
        serde_json::to_string_pretty(&service.prekey_status().await?)?
    );
    for stats in service.all_session_stats().await? {
        println!("Session:     {}", serde_json::to_string(&stats)?);
    }

    let remaining = service.flush().await;
    if remaining > 0 {
        tracing::warn!("{} session saves still pending at exit", remaining);
    }
    Ok(())
}
