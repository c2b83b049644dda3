use std::path::Path;

use clap::Parser;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "secmgr", about = "SAML identity provider for search appliances", version)]
struct Cli {
    /// Path to configuration file
    #[arg(long, default_value = "secmgr.toml")]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Write a default configuration file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
    /// Validate the configuration file
    CheckConfig {
        /// Accept configurations whose default group breaks the username invariant
        #[arg(long)]
        permissive_config: bool,
    },
    /// Print an Argon2id hash for a local account password
    HashPassword {
        password: String,
    },
    /// Start the IdP web server
    Serve {
        /// Port to listen on
        #[arg(long, default_value = "8443")]
        port: u16,
        /// Accept configurations whose default group breaks the username invariant
        #[arg(long)]
        permissive_config: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config_path = Path::new(&cli.config);

    match cli.command {
        Commands::Init { force } => {
            commands::init::run(config_path, force)?;
        }
        Commands::CheckConfig { permissive_config } => {
            commands::check_config::run(config_path, permissive_config)?;
        }
        Commands::HashPassword { password } => {
            commands::hash_password::run(&password)?;
        }
        Commands::Serve {
            port,
            permissive_config,
        } => {
            commands::serve::run(config_path, port, permissive_config).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn cli_parse_init_defaults() {
        let cli = Cli::parse_from(["secmgr", "init"]);
        assert_eq!(cli.config, "secmgr.toml");
        match cli.command {
            Commands::Init { force } => assert!(!force),
            _ => panic!("expected Init command"),
        }
    }

    #[test]
    fn cli_parse_init_custom() {
        let cli = Cli::parse_from(["secmgr", "--config", "/etc/secmgr.toml", "init", "--force"]);
        assert_eq!(cli.config, "/etc/secmgr.toml");
        match cli.command {
            Commands::Init { force } => assert!(force),
            _ => panic!("expected Init command"),
        }
    }

    #[test]
    fn cli_parse_check_config() {
        let cli = Cli::parse_from(["secmgr", "check-config"]);
        match cli.command {
            Commands::CheckConfig { permissive_config } => assert!(!permissive_config),
            _ => panic!("expected CheckConfig command"),
        }

        let cli = Cli::parse_from(["secmgr", "check-config", "--permissive-config"]);
        match cli.command {
            Commands::CheckConfig { permissive_config } => assert!(permissive_config),
            _ => panic!("expected CheckConfig command"),
        }
    }

    #[test]
    fn cli_parse_hash_password() {
        let cli = Cli::parse_from(["secmgr", "hash-password", "s3cret"]);
        match cli.command {
            Commands::HashPassword { password } => assert_eq!(password, "s3cret"),
            _ => panic!("expected HashPassword command"),
        }
    }

    #[test]
    fn cli_parse_hash_password_requires_argument() {
        assert!(Cli::try_parse_from(["secmgr", "hash-password"]).is_err());
    }

    #[test]
    fn cli_parse_serve_defaults() {
        let cli = Cli::parse_from(["secmgr", "serve"]);
        match cli.command {
            Commands::Serve {
                port,
                permissive_config,
            } => {
                assert_eq!(port, 8443);
                assert!(!permissive_config);
            }
            _ => panic!("expected Serve command"),
        }
    }

    #[test]
    fn cli_parse_serve_custom() {
        let cli = Cli::parse_from(["secmgr", "serve", "--port", "3000", "--permissive-config"]);
        match cli.command {
            Commands::Serve {
                port,
                permissive_config,
            } => {
                assert_eq!(port, 3000);
                assert!(permissive_config);
            }
            _ => panic!("expected Serve command"),
        }
    }
}
