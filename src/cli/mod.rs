use clap::{Parser, Subcommand};

pub mod config;
pub mod registration;
pub mod run;
pub mod version;

#[derive(Parser)]
#[command(name = "courier")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Operator CLI for the Courier Matrix bridge", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the bridge
    Run {
        /// Path to config file (default: ~/.local/share/courier/config.toml)
        #[arg(long, short)]
        config: Option<String>,
    },

    /// Generate appservice tokens and the homeserver registration file
    GenerateRegistration {
        /// Path to config file (default: ~/.local/share/courier/config.toml)
        #[arg(long, short)]
        config: Option<String>,

        /// Where to write the registration YAML
        #[arg(long, short, default_value = "registration.yaml")]
        registration: String,
    },

    /// Display version information
    Version,
}

pub async fn execute(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    match cli.command {
        Commands::Run { config } => run::execute(config).await,
        Commands::GenerateRegistration {
            config,
            registration,
        } => registration::execute(config, registration).await,
        Commands::Version => {
            version::execute();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parse_run() {
        let cli = Cli::parse_from(["courier", "run"]);
        match cli.command {
            Commands::Run { config } => assert_eq!(config, None),
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_cli_parse_run_with_config() {
        let cli = Cli::parse_from(["courier", "run", "--config", "/etc/courier/config.toml"]);
        match cli.command {
            Commands::Run { config } => {
                assert_eq!(config.as_deref(), Some("/etc/courier/config.toml"))
            }
            _ => panic!("Expected Run command"),
        }
    }

    #[test]
    fn test_cli_parse_generate_registration() {
        let cli = Cli::parse_from(["courier", "generate-registration"]);
        match cli.command {
            Commands::GenerateRegistration {
                config,
                registration,
            } => {
                assert_eq!(config, None);
                assert_eq!(registration, "registration.yaml"); // default
            }
            _ => panic!("Expected GenerateRegistration command"),
        }
    }

    #[test]
    fn test_cli_parse_generate_registration_with_paths() {
        let cli = Cli::parse_from([
            "courier",
            "generate-registration",
            "-c",
            "config.toml",
            "-r",
            "/etc/synapse/courier.yaml",
        ]);
        match cli.command {
            Commands::GenerateRegistration {
                config,
                registration,
            } => {
                assert_eq!(config.as_deref(), Some("config.toml"));
                assert_eq!(registration, "/etc/synapse/courier.yaml");
            }
            _ => panic!("Expected GenerateRegistration command"),
        }
    }

    #[test]
    fn test_cli_parse_version() {
        let cli = Cli::parse_from(["courier", "version"]);
        assert!(matches!(cli.command, Commands::Version));
    }

    #[test]
    fn test_cli_rejects_unknown_command() {
        assert!(Cli::try_parse_from(["courier", "register"]).is_err());
    }
}
