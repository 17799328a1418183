use anyhow::{Context, Result};
use clap::Parser;
use dialoguer::{Input, Password};
use std::sync::Arc;

use bearer_session::auth::{
    spawn_auto_refresh, CredentialRefreshCoordinator, HttpAuthTransport, SqliteStore, TokenInfo,
    TokenStatus,
};
use bearer_session::config::{CliArgs, Command, Config};
use bearer_session::error::AuthError;
use bearer_session::http_client::{HttpRequestTransport, RequestSpec};
use reqwest::header::{HeaderName, HeaderValue};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env before clap so env fallbacks see it
    dotenvy::dotenv().ok();
    let args = CliArgs::parse();

    let config = Config::load(&args)?;
    config.validate()?;

    // Initialize logging with a configured level
    let log_level = config.log_level.to_lowercase();
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(true)
        .with_line_number(true)
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!("Backend: {}", config.base_url);
    tracing::debug!("Token store: {}", config.db_file.display());

    let coordinator = build_coordinator(&config)?;
    coordinator.restore();

    match args.command {
        Command::Login { username } => login(&coordinator, username).await,
        Command::Status { remote } => {
            print_status(&coordinator.token_info());
            if remote {
                let status = coordinator
                    .server_token_status()
                    .await
                    .map_err(with_login_hint)?;
                print_server_status(&status);
            }
            Ok(())
        }
        Command::Refresh => {
            let token = coordinator.refresh().await.map_err(with_login_hint)?;
            println!("✅ Tokens refreshed (access token: {}...)", preview(&token));
            Ok(())
        }
        Command::Get { path, headers } => {
            let mut spec = RequestSpec::get(path);
            for header in &headers {
                let (name, value) = parse_header(header)?;
                spec = spec.with_header(name, value);
            }
            let response = coordinator
                .authorized_request(&spec)
                .await
                .map_err(with_login_hint)?;
            println!("{}", response.status);
            println!("{}", response.text());
            Ok(())
        }
        Command::Logout => {
            coordinator.logout().await;
            println!("✅ Logged out");
            Ok(())
        }
        Command::Watch => watch(coordinator, &config).await,
    }
}

/// Wire the HTTP transports and SQLite store into a coordinator
fn build_coordinator(config: &Config) -> Result<CredentialRefreshCoordinator> {
    let store = SqliteStore::open(&config.db_file).context("Failed to open token store")?;

    let auth_transport = HttpAuthTransport::new(
        &config.base_url,
        config.http_connect_timeout,
        config.http_request_timeout,
    )?;

    let request_transport = HttpRequestTransport::new(
        &config.base_url,
        config.http_connect_timeout,
        config.http_request_timeout,
        config.http_max_retries,
    )?
    .with_refresh_token_header(config.forward_refresh_token);

    Ok(
        CredentialRefreshCoordinator::builder(Arc::new(auth_transport), Arc::new(request_transport))
            .store(Arc::new(store))
            .build(),
    )
}

async fn login(coordinator: &CredentialRefreshCoordinator, username: Option<String>) -> Result<()> {
    let username = match username {
        Some(u) => u,
        None => Input::<String>::new()
            .with_prompt("Username")
            .interact_text()
            .context("Failed to read username")?,
    };
    let password: String = Password::new()
        .with_prompt("Password")
        .interact()
        .context("Failed to read password")?;

    coordinator.login(&username, &password).await?;
    println!("✅ Login successful, tokens saved");
    Ok(())
}

/// Refresh ahead of expiry until Ctrl+C
async fn watch(coordinator: CredentialRefreshCoordinator, config: &Config) -> Result<()> {
    if !coordinator.is_authenticated() {
        anyhow::bail!("No stored session, run `bearer-session login` first");
    }

    let handle = spawn_auto_refresh(coordinator, config.auto_refresh());
    shutdown_signal().await;
    handle.abort();
    tracing::info!("👋 Stopped background refresh");
    Ok(())
}

fn print_status(info: &TokenInfo) {
    let fmt_exp = |exp: Option<chrono::DateTime<chrono::Utc>>| {
        exp.map(|e| e.to_rfc3339())
            .unwrap_or_else(|| "unknown".to_string())
    };

    println!("  Authenticated:  {}", info.is_authenticated);
    println!("  Access token:   {}", if info.has_access_token { "present" } else { "absent" });
    println!("  Refresh token:  {}", if info.has_refresh_token { "present" } else { "absent" });
    if info.is_authenticated {
        println!("  Access expires:  {}", fmt_exp(info.access_expires_at));
        println!("  Refresh expires: {}", fmt_exp(info.refresh_expires_at));
    }
}

fn print_server_status(status: &TokenStatus) {
    println!("  Server says:    {}", if status.valid { "valid" } else { "invalid" });
    if let Some(reason) = &status.reason {
        println!("  Reason:         {}", reason);
    }
    if let Some(secs) = status.time_until_expiry {
        println!("  Expires in:     {:.0}s", secs);
    }
    println!("  Needs refresh:  {}", status.needs_refresh);
}

fn preview(token: &str) -> String {
    token.chars().take(20).collect()
}

/// Parse a `Name: value` header argument
fn parse_header(raw: &str) -> Result<(HeaderName, HeaderValue)> {
    let (name, value) = raw
        .split_once(':')
        .with_context(|| format!("Header must look like `Name: value`, got {:?}", raw))?;
    let name = HeaderName::from_bytes(name.trim().as_bytes())
        .with_context(|| format!("Invalid header name in {:?}", raw))?;
    let value = HeaderValue::from_str(value.trim())
        .with_context(|| format!("Invalid header value in {:?}", raw))?;
    Ok((name, value))
}

fn with_login_hint(err: AuthError) -> anyhow::Error {
    if err.requires_login() {
        anyhow::Error::new(err).context("Session is no longer valid, run `bearer-session login`")
    } else {
        err.into()
    }
}

/// Handle shutdown signal
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C signal, shutting down...");
        },
        _ = terminate => {
            tracing::info!("Received terminate signal, shutting down...");
        },
    }
}
