use std::path::Path;

use anyhow::bail;
use secrecy::SecretString;
use serde::Deserialize;

use crate::{Config, Error};

/// Environment variable consulted for the upstream bearer token; takes
/// precedence over `upstream.bearer_token` in the TOML file so the secret
/// itself never has to live on disk.
const UPSTREAM_BEARER_TOKEN_ENV: &str = "UPSTREAM_BEARER_TOKEN";

/// Loads configuration from a TOML file, then applies environment overrides.
pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(Error::ConfigOpen)?;
    let mut config = Config::deserialize(toml::de::Deserializer::new(&content)).map_err(Error::ConfigParse)?;

    if let Ok(token) = std::env::var(UPSTREAM_BEARER_TOKEN_ENV) {
        config.upstream.bearer_token = Some(SecretString::from(token));
    }

    validate(&config)?;

    Ok(config)
}

/// Cross-field invariants that can't be expressed as plain `serde` defaults.
pub(crate) fn validate(config: &Config) -> anyhow::Result<()> {
    if config.history.summary_keep_recent >= config.history.max_messages && config.history.auto_truncate_enabled {
        bail!(
            "history.summary_keep_recent ({}) must be smaller than history.max_messages ({})",
            config.history.summary_keep_recent,
            config.history.max_messages
        );
    }

    if config.model_routing.enabled {
        for keyword in &config.model_routing.force_opus_keywords {
            if config.model_routing.force_sonnet_keywords.contains(keyword) {
                log::warn!(
                    "model routing keyword '{keyword}' is present in both force_opus_keywords and \
                     force_sonnet_keywords; force-Opus takes priority"
                );
            }
        }
    }

    if config.continuation.max_continuation_attempts == 0 {
        bail!("continuation.max_continuation_attempts must be at least 1");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;
    use temp_env::with_var;

    #[test]
    fn env_overrides_bearer_token() {
        let toml = indoc! {r#"
            [upstream]
            base_url = "http://localhost:11434"
            bearer_token = "from-file"
        "#};

        let mut config = Config::deserialize(toml::de::Deserializer::new(toml)).unwrap();
        validate(&config).unwrap();

        with_var(UPSTREAM_BEARER_TOKEN_ENV, Some("from-env"), || {
            if let Ok(token) = std::env::var(UPSTREAM_BEARER_TOKEN_ENV) {
                config.upstream.bearer_token = Some(SecretString::from(token));
            }
        });

        assert_eq!(
            secrecy::ExposeSecret::expose_secret(config.upstream.bearer_token.as_ref().unwrap()),
            "from-env"
        );
    }

    #[test]
    fn rejects_bad_summary_keep_recent() {
        let toml = indoc! {r#"
            [history]
            max_messages = 4
            summary_keep_recent = 8
        "#};

        let config = Config::deserialize(toml::de::Deserializer::new(toml)).unwrap();
        assert!(validate(&config).is_err());
    }
}
