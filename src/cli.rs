//! Command-line interface

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// OpenID Connect session tool - redeem, refresh, validate and authorize sessions
#[derive(Parser, Debug)]
#[command(name = "oidc-session")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "OIDC_SESSION_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "OIDC_SESSION_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "OIDC_SESSION_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Exchange an authorization code for a session
    Redeem {
        /// Authorization code returned to the callback
        #[arg(long)]
        code: String,

        /// Redirect URL used in the authorization request
        #[arg(long)]
        redirect_url: String,

        /// Write the session here instead of stdout
        #[arg(short, long)]
        out: Option<PathBuf>,
    },

    /// Refresh a stored session if it has expired
    Refresh {
        /// Session JSON file, rewritten in place when refreshed
        #[arg(short, long)]
        session: PathBuf,
    },

    /// Check that a stored session's identity token still verifies
    Validate {
        /// Session JSON file
        #[arg(short, long)]
        session: PathBuf,
    },

    /// Evaluate the configured group policy for a stored session
    Authorize {
        /// Session JSON file
        #[arg(short, long)]
        session: PathBuf,
    },

    /// Look up the session's email at the userinfo endpoint
    Userinfo {
        /// Session JSON file
        #[arg(short, long)]
        session: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_redeem_with_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "oidc-session",
            "redeem",
            "--code",
            "abc123",
            "--redirect-url",
            "https://app.example.com/cb",
            "--config",
            "oidc.yaml",
            "--log-format",
            "json",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("oidc.yaml")));
        assert_eq!(cli.log_format.as_deref(), Some("json"));
        match cli.command {
            Command::Redeem {
                code,
                redirect_url,
                out,
            } => {
                assert_eq!(code, "abc123");
                assert_eq!(redirect_url, "https://app.example.com/cb");
                assert!(out.is_none());
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn refresh_requires_session_path() {
        assert!(Cli::try_parse_from(["oidc-session", "refresh"]).is_err());
    }
}
