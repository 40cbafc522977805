//! Appservice registration generation
//!
//! Creates fresh `as_token`/`hs_token` values, stores them in the config and
//! writes the registration YAML the homeserver needs to route the bridge's
//! namespace to it.

use super::config::{default_config_path, CourierConfig};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

const TOKEN_BYTES: usize = 32;

/// Generate a registration file
pub async fn execute(
    config_path: Option<String>,
    registration_path: String,
) -> Result<(), Box<dyn std::error::Error>> {
    let config_path = config_path
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);
    let registration_path = PathBuf::from(registration_path);

    if !config_path.exists() {
        CourierConfig::create_default(&config_path)?;
        println!("📝 Created default configuration: {}", config_path.display());
    }
    let mut config = CourierConfig::load(&config_path)?;

    config.appservice.as_token = generate_token();
    config.appservice.hs_token = generate_token();
    config.save(&config_path)?;

    write_registration(&config, &registration_path)?;

    println!("✅ Registration generated and saved to {}", registration_path.display());
    println!("   Tokens saved to {}", config_path.display());
    println!();
    println!("Add the registration file to your homeserver's app_service_config_files");
    println!("and restart the homeserver.");
    Ok(())
}

fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn write_registration(config: &CourierConfig, path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let contents = registration_yaml(config)?;

    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create registration directory: {}", e))?;
    }
    fs::write(path, contents)
        .map_err(|e| format!("Failed to write registration '{}': {}", path.display(), e))?;
    Ok(())
}

/// Appservice registration as the homeserver reads it
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Registration {
    pub id: String,
    pub url: String,
    pub as_token: String,
    pub hs_token: String,
    pub sender_localpart: String,
    pub rate_limited: bool,
    pub namespaces: Namespaces,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Namespaces {
    pub users: Vec<Namespace>,
}

#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct Namespace {
    pub exclusive: bool,
    pub regex: String,
}

impl Registration {
    /// Registration for the ghosts and bot user of `config`
    pub fn from_config(config: &CourierConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let ghosts = config.ghost_namespace()?;
        let bot_regex = regex::escape(&format!(
            "@{}:{}",
            config.appservice.bot_username, config.homeserver.domain
        ));

        Ok(Self {
            id: config.appservice.id.clone(),
            url: config.appservice.address.clone(),
            as_token: config.appservice.as_token.clone(),
            hs_token: config.appservice.hs_token.clone(),
            sender_localpart: config.appservice.bot_username.clone(),
            rate_limited: false,
            namespaces: Namespaces {
                users: vec![
                    Namespace {
                        exclusive: true,
                        regex: ghosts.regex(),
                    },
                    Namespace {
                        exclusive: true,
                        regex: bot_regex,
                    },
                ],
            },
        })
    }
}

/// Registration YAML for `config`
pub fn registration_yaml(config: &CourierConfig) -> Result<String, Box<dyn std::error::Error>> {
    let registration = Registration::from_config(config)?;
    serde_yaml::to_string(&registration)
        .map_err(|e| format!("Failed to serialize registration: {}", e).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_tokens_are_random_hex() {
        let a = generate_token();
        let b = generate_token();
        assert_eq!(a.len(), TOKEN_BYTES * 2);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(a, b);
    }

    fn test_config() -> CourierConfig {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        CourierConfig::create_default(&config_path).unwrap();
        let mut config = CourierConfig::load(&config_path).unwrap();
        config.appservice.as_token = "astoken".into();
        config.appservice.hs_token = "hstoken".into();
        config
    }

    #[test]
    fn test_registration_contents() {
        let config = test_config();

        let yaml = registration_yaml(&config).unwrap();
        let registration: Registration = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(registration.id, "courier");
        assert_eq!(registration.url, "http://127.0.0.1:29330");
        assert_eq!(registration.as_token, "astoken");
        assert_eq!(registration.hs_token, "hstoken");
        assert_eq!(registration.sender_localpart, "courierbot");
        assert!(!registration.rate_limited);
        assert_eq!(
            registration.namespaces.users,
            vec![
                Namespace {
                    exclusive: true,
                    regex: r"@courier_.+:example\.com".into(),
                },
                Namespace {
                    exclusive: true,
                    regex: r"@courierbot:example\.com".into(),
                },
            ]
        );
    }

    #[test]
    fn test_registration_survives_yaml_special_characters() {
        let mut config = test_config();
        config.appservice.id = "it's: #courier".into();
        config.appservice.as_token = "- '\"quoted\"\n".into();

        let yaml = registration_yaml(&config).unwrap();
        let registration: Registration = serde_yaml::from_str(&yaml).unwrap();

        assert_eq!(registration.id, "it's: #courier");
        assert_eq!(registration.as_token, "- '\"quoted\"\n");
        assert_eq!(registration, Registration::from_config(&config).unwrap());
    }

    #[test]
    fn test_registered_ghost_regex_matches_namespace() {
        let config = test_config();
        let ghosts = config.ghost_namespace().unwrap();
        let registration = Registration::from_config(&config).unwrap();
        let ghost_regex =
            regex::Regex::new(&format!("^{}$", registration.namespaces.users[0].regex)).unwrap();

        for mxid in [
            "@courier_42:example.com",
            "@courier_:example.com",
            "@courier_42:exampleXcom",
            "@alice:example.com",
        ] {
            assert_eq!(
                ghost_regex.is_match(mxid),
                ghosts.contains(&courier::matrix::UserId::from(mxid)),
                "{mxid}"
            );
        }
    }

    #[tokio::test]
    async fn test_execute_saves_tokens_and_registration() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.toml");
        let registration_path = temp_dir.path().join("registration.yaml");

        execute(
            Some(config_path.to_string_lossy().to_string()),
            registration_path.to_string_lossy().to_string(),
        )
        .await
        .unwrap();

        let config = CourierConfig::load(&config_path).unwrap();
        assert_eq!(config.appservice.as_token.len(), TOKEN_BYTES * 2);
        assert_ne!(config.appservice.as_token, config.appservice.hs_token);

        let yaml = fs::read_to_string(&registration_path).unwrap();
        assert!(yaml.contains(&config.appservice.as_token));
        assert!(yaml.contains(&config.appservice.hs_token));
    }
}
