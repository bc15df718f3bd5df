//! Configuration file loading

use super::Config;
use anyhow::{Context, Result};
use std::path::Path;

/// Default config file locations
const CONFIG_PATHS: &[&str] = &["/etc/onionlink/config.toml", "./config.toml"];

/// Load configuration from the first default location that exists
pub fn load_config() -> Result<Config> {
    load_from_path(find_config_file()?)
}

fn find_config_file() -> Result<&'static str> {
    for path in CONFIG_PATHS {
        if Path::new(path).exists() {
            return Ok(path);
        }
    }
    anyhow::bail!("No configuration file found. Tried: {:?}", CONFIG_PATHS)
}

/// Load and parse config from path
pub fn load_from_path(path: impl AsRef<Path>) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

    super::validate(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[tor]
data_dir = "/tmp/onionlink/tor"
hidden_service_dir = "/tmp/onionlink/hs"
"#,
        )
        .unwrap();

        let config = load_from_path(&path).unwrap();
        assert!(config.tor.executable.is_none());
        assert_eq!(config.service.service_port, 9878);
        assert_eq!(config.service.target_address, "127.0.0.1");
        assert_eq!(config.friends.wanted_friends, 10);
        assert!(config.friends.server_address.is_none());
    }

    #[test]
    fn full_config_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[tor]
executable = "/opt/tor/bin/tor"
data_dir = "/var/lib/onionlink/tor"
hidden_service_dir = "/var/lib/onionlink/hs"

[service]
service_port = 443
target_address = "127.0.0.1"
target_port = 8443

[friends]
server_address = "friendserveraddress.onion"
server_port = 2017
wanted_friends = 20
"#,
        )
        .unwrap();

        let config = load_from_path(&path).unwrap();
        assert_eq!(config.service.service_port, 443);
        assert_eq!(
            config.friends.server_address.as_deref(),
            Some("friendserveraddress.onion")
        );
        assert_eq!(config.friends.wanted_friends, 20);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[tor]
data_dir = ""
hidden_service_dir = "/tmp/hs"
"#,
        )
        .unwrap();
        assert!(load_from_path(&path).is_err());
    }
}
