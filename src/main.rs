//! oidc-session - OpenID Connect session lifecycle from the command line
//!
//! Sessions are stored as JSON files so they can be inspected and fed back
//! into later commands.

use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use oidc_session::{
    OidcProvider, Session,
    cli::{Cli, Command},
    config::Config,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    let provider = match build_provider(cli.config.as_deref()) {
        Ok(provider) => provider,
        Err(e) => {
            error!("Failed to configure provider: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let outcome = match cli.command {
        Command::Redeem {
            code,
            redirect_url,
            out,
        } => run_redeem(&provider, &code, &redirect_url, out.as_deref()).await,
        Command::Refresh { session } => run_refresh(&provider, &session).await,
        Command::Validate { session } => run_validate(&provider, &session).await,
        Command::Authorize { session } => run_authorize(&provider, &session).await,
        Command::Userinfo { session } => run_userinfo(&provider, &session).await,
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn build_provider(config_path: Option<&Path>) -> anyhow::Result<OidcProvider> {
    let config = Config::load(config_path).context("loading configuration")?;
    let provider = OidcProvider::from_config(&config.provider)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        provider = provider.name(),
        "Starting oidc-session"
    );
    Ok(provider)
}

fn load_session(path: &Path) -> anyhow::Result<Session> {
    Session::load(path).with_context(|| format!("reading session from {}", path.display()))
}

/// Redeem a code and print or store the session
async fn run_redeem(
    provider: &OidcProvider,
    code: &str,
    redirect_url: &str,
    out: Option<&Path>,
) -> anyhow::Result<ExitCode> {
    let session = provider.redeem(redirect_url, code).await?;

    match out {
        Some(path) => {
            session
                .save(path)
                .with_context(|| format!("writing session to {}", path.display()))?;
            println!("Session for {} written to {}", session.email, path.display());
        }
        None => println!("{}", serde_json::to_string_pretty(&session)?),
    }
    Ok(ExitCode::SUCCESS)
}

/// Refresh a stored session, rewriting the file only when it changed
async fn run_refresh(provider: &OidcProvider, path: &Path) -> anyhow::Result<ExitCode> {
    let mut session = load_session(path)?;

    if provider.refresh_if_needed(&mut session).await? {
        session
            .save(path)
            .with_context(|| format!("writing session to {}", path.display()))?;
        println!("Refreshed: {session}");
    } else {
        println!("Not refreshed: {session}");
    }
    Ok(ExitCode::SUCCESS)
}

/// Exit 0 if the identity token still verifies, 1 otherwise
async fn run_validate(provider: &OidcProvider, path: &Path) -> anyhow::Result<ExitCode> {
    let session = load_session(path)?;

    if provider.validate_session(&session).await {
        println!("valid: {session}");
        Ok(ExitCode::SUCCESS)
    } else {
        println!("invalid: {session}");
        Ok(ExitCode::FAILURE)
    }
}

/// Exit 0 if the group policy allows the session, 1 otherwise
async fn run_authorize(provider: &OidcProvider, path: &Path) -> anyhow::Result<ExitCode> {
    let session = load_session(path)?;

    if provider.authorize(&session).await {
        println!("allowed: {}", session.email);
        Ok(ExitCode::SUCCESS)
    } else {
        println!("denied: {}", session.email);
        Ok(ExitCode::FAILURE)
    }
}

/// Print the email reported by the userinfo endpoint
async fn run_userinfo(provider: &OidcProvider, path: &Path) -> anyhow::Result<ExitCode> {
    let session = load_session(path)?;
    let email = provider.fetch_email(&session).await?;
    println!("{email}");
    Ok(ExitCode::SUCCESS)
}
