use anyhow::{Context, Result};
use reqwest::Method;
use std::sync::Arc;

use session_client::auth::{mask_token, AuthManager, SqliteCredentialStore, StoreKey};
use session_client::config::{Command, Config, LogFormat};
use session_client::{ApiClient, ClientError, CredentialStore, RequestDescriptor};

#[tokio::main]
async fn main() -> Result<()> {
    let (config, command) = Config::load()?;
    config.validate()?;

    init_logging(&config);

    tracing::debug!("Base URL: {}", config.base_url);
    tracing::debug!("Credential store: {}", config.credential_store.display());

    let store = Arc::new(
        SqliteCredentialStore::open(&config.credential_store)
            .context("Failed to open credential store")?,
    );
    let client = Arc::new(
        ApiClient::new(config.client_settings(), store.clone())
            .context("Failed to create API client")?,
    );
    let auth = AuthManager::new(client.clone());

    let result = run(command, &auth, &client, &store).await;

    if let Err(ref e) = result {
        if let Some(client_err) = e.downcast_ref::<ClientError>() {
            if auth.handle_error(client_err).await? {
                eprintln!("Your session has expired. Run `session-client login` to sign in again.");
            }
        }
    }

    result
}

/// Initialize logging with the configured level and format
fn init_logging(config: &Config) {
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true);

    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn run(
    command: Command,
    auth: &AuthManager,
    client: &ApiClient,
    store: &SqliteCredentialStore,
) -> Result<()> {
    match command {
        Command::Login { email, password } => {
            let password = match password {
                Some(p) => p,
                None => dialoguer::Password::new()
                    .with_prompt("Password")
                    .interact()
                    .context("Failed to read password")?,
            };

            let user = auth.login(&email, &password).await?;
            println!("✅ Logged in as {}", email);
            if let Some(user) = user {
                println!("{}", serde_json::to_string_pretty(&user)?);
            }
        }

        Command::Logout => {
            auth.logout().await?;
            println!("Logged out");
        }

        Command::Whoami => match auth.current_user()? {
            Some(user) => println!("{}", serde_json::to_string_pretty(&user)?),
            None if auth.is_authenticated()? => println!("Logged in (no cached profile)"),
            None => println!("Not logged in"),
        },

        Command::Status => {
            for key in [StoreKey::AccessToken, StoreKey::RefreshToken] {
                let value = store.read(key)?;
                let updated = store.updated_at(key)?;
                match (value, updated) {
                    (Some(token), Some(at)) => println!(
                        "{:<14} {} (updated {})",
                        key.as_str(),
                        mask_token(&token),
                        at.to_rfc3339()
                    ),
                    (Some(token), None) => println!("{:<14} {}", key.as_str(), mask_token(&token)),
                    (None, _) => println!("{:<14} -", key.as_str()),
                }
            }
            println!(
                "{:<14} {}",
                StoreKey::UserInfo.as_str(),
                if store.user_info()?.is_some() { "cached" } else { "-" }
            );
        }

        Command::Request { method, path, data } => {
            let method = Method::from_bytes(method.to_uppercase().as_bytes())
                .with_context(|| format!("Invalid HTTP method: {}", method))?;

            let mut descriptor = RequestDescriptor::new(method, path);
            if let Some(data) = data {
                let body: serde_json::Value =
                    serde_json::from_str(&data).context("--data must be valid JSON")?;
                descriptor = descriptor.json(body);
            }

            let response = client.send(descriptor).await?;
            println!("{}", response.status());

            match response.json::<serde_json::Value>() {
                Ok(json) => println!("{}", serde_json::to_string_pretty(&json)?),
                Err(_) => println!("{}", response.text()),
            }

            if !response.status().is_success() {
                anyhow::bail!("Request failed with status {}", response.status());
            }
        }
    }

    Ok(())
}
