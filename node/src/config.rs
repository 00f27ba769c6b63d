use crate::errors::SurveyError;
use std::path::PathBuf;
use std::str::FromStr;

/// Shape of the in-process cluster.
#[derive(Clone, Debug, PartialEq)]
pub struct ClusterConfig {
    pub computing_nodes: usize,
    pub providers_per_node: usize,
    pub verifying_nodes: usize,
    pub channel_capacity: usize,
    /// Largest absolute value the client can decrypt.
    pub decryption_limit: i64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            computing_nodes: 3,
            providers_per_node: 2,
            verifying_nodes: 3,
            channel_capacity: 100,
            decryption_limit: 10_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct Config {
    pub addr: String,
    pub data_dir: PathBuf,
    pub api_key: String,
    pub cluster: ClusterConfig,
    /// Synthetic rows served by each data provider.
    pub rows_per_provider: usize,
    /// Synthetic values are drawn from `[0, value_max]`.
    pub value_max: i64,
}

impl Config {
    pub fn from_env() -> Result<Self, SurveyError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SurveyError> {
        let defaults = ClusterConfig::default();
        let cluster = ClusterConfig {
            computing_nodes: parse(&lookup, "SURVEY_COMPUTING_NODES", defaults.computing_nodes)?,
            providers_per_node: parse(&lookup, "SURVEY_PROVIDERS_PER_NODE", defaults.providers_per_node)?,
            verifying_nodes: parse(&lookup, "SURVEY_VERIFYING_NODES", defaults.verifying_nodes)?,
            channel_capacity: parse(&lookup, "SURVEY_CHANNEL_CAPACITY", defaults.channel_capacity)?,
            decryption_limit: parse(&lookup, "SURVEY_DECRYPTION_LIMIT", defaults.decryption_limit)?,
        };
        if cluster.computing_nodes == 0 {
            return Err(SurveyError::Validation(vec!["SURVEY_COMPUTING_NODES must be at least 1".into()]));
        }
        if cluster.channel_capacity == 0 {
            return Err(SurveyError::Validation(vec!["SURVEY_CHANNEL_CAPACITY must be at least 1".into()]));
        }

        Ok(Self {
            addr: lookup("SURVEY_ADDR").unwrap_or_else(|| "127.0.0.1:8080".to_string()),
            data_dir: PathBuf::from(lookup("SURVEY_DATA_DIR").unwrap_or_else(|| "data".to_string())),
            // In production, this should be a strong secret from environment.
            api_key: lookup("API_KEY").unwrap_or_else(|| "dev-secret-key".to_string()),
            cluster,
            rows_per_provider: parse(&lookup, "SURVEY_ROWS_PER_PROVIDER", 20)?,
            value_max: parse(&lookup, "SURVEY_VALUE_MAX", 10)?,
        })
    }
}

fn parse<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T, SurveyError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| SurveyError::Validation(vec![format!("{key}={raw}: {e}")])),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_nothing_is_set() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.addr, "127.0.0.1:8080");
        assert_eq!(config.data_dir, PathBuf::from("data"));
        assert_eq!(config.api_key, "dev-secret-key");
        assert_eq!(config.cluster, ClusterConfig::default());
    }

    #[test]
    fn overrides_are_parsed() {
        let config = Config::from_lookup(lookup(&[
            ("SURVEY_COMPUTING_NODES", "5"),
            ("SURVEY_VERIFYING_NODES", " 4 "),
            ("SURVEY_DECRYPTION_LIMIT", "500"),
            ("API_KEY", "k"),
        ]))
        .unwrap();
        assert_eq!(config.cluster.computing_nodes, 5);
        assert_eq!(config.cluster.verifying_nodes, 4);
        assert_eq!(config.cluster.decryption_limit, 500);
        assert_eq!(config.api_key, "k");
    }

    #[test]
    fn bad_values_are_rejected() {
        assert!(matches!(
            Config::from_lookup(lookup(&[("SURVEY_PROVIDERS_PER_NODE", "many")])),
            Err(SurveyError::Validation(_))
        ));
        assert!(Config::from_lookup(lookup(&[("SURVEY_COMPUTING_NODES", "0")])).is_err());
    }
}
