//! Configuration validation
//!
//! Fail-fast validation of configuration invariants.

use super::Config;
use anyhow::{bail, Result};

/// Validate configuration invariants
pub fn validate(config: &Config) -> Result<()> {
    validate_tor(config)?;
    validate_service(config)?;
    validate_friends(config)?;
    Ok(())
}

fn validate_tor(config: &Config) -> Result<()> {
    if config.tor.data_dir.as_os_str().is_empty() {
        bail!("tor.data_dir cannot be empty");
    }
    if config.tor.hidden_service_dir.as_os_str().is_empty() {
        bail!("tor.hidden_service_dir cannot be empty");
    }
    if config.tor.data_dir == config.tor.hidden_service_dir {
        bail!("tor.data_dir and tor.hidden_service_dir must differ");
    }
    Ok(())
}

fn validate_service(config: &Config) -> Result<()> {
    if config.service.service_port == 0 {
        bail!("service.service_port cannot be 0");
    }
    if config.service.target_port == 0 {
        bail!("service.target_port cannot be 0");
    }
    if config.service.target_address.is_empty() {
        bail!("service.target_address cannot be empty");
    }
    Ok(())
}

fn validate_friends(config: &Config) -> Result<()> {
    let friends = &config.friends;
    if let Some(addr) = &friends.server_address {
        if addr.is_empty() {
            bail!("friends.server_address cannot be empty when set");
        }
        if friends.server_port == 0 {
            bail!("friends.server_port cannot be 0");
        }
        if friends.wanted_friends == 0 {
            bail!("friends.wanted_friends cannot be 0");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FriendsConfig, ServiceConfig, TorConfig};
    use std::path::PathBuf;

    fn valid() -> Config {
        Config {
            tor: TorConfig {
                executable: None,
                data_dir: PathBuf::from("/tmp/a"),
                hidden_service_dir: PathBuf::from("/tmp/b"),
            },
            service: ServiceConfig::default(),
            friends: FriendsConfig::default(),
        }
    }

    #[test]
    fn accepts_valid_config() {
        assert!(validate(&valid()).is_ok());
    }

    #[test]
    fn rejects_shared_directories() {
        let mut config = valid();
        config.tor.hidden_service_dir = config.tor.data_dir.clone();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn rejects_zero_wanted_friends_when_server_set() {
        let mut config = valid();
        config.friends.server_address = Some("someserver.onion".into());
        config.friends.wanted_friends = 0;
        assert!(validate(&config).is_err());
    }
}
