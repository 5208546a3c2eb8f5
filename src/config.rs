use std::{collections::HashMap, path::Path};

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{FeatureStoreError, Result};

pub const CONFIG_FILE_NAME: &str = "featurestore.toml";
const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 60;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeatureStoreConfig {
    pub host: String,
    pub token: String,
    pub refresh_interval_secs: u64,
    pub feature_db_username: Option<String>,
    pub feature_db_password: Option<String>,
    pub datasources: HashMap<String, DatasourceConfig>,
}

impl Default for FeatureStoreConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            token: String::new(),
            refresh_interval_secs: DEFAULT_REFRESH_INTERVAL_SECS,
            feature_db_username: None,
            feature_db_password: None,
            datasources: HashMap::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub enum DatasourceConfig {
    Hologres {
        dsn: String,
    },
    Redis {
        uri: String,
    },
    FeatureDB {
        address: String,
        token: String,
        vpc_address: String,
    },
    IGraph {
        endpoint: String,
        username: String,
        password: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct RawFeatureStoreConfig {
    host: String,
    token: Option<String>,
    env_token: Option<String>,
    refresh_interval_secs: Option<u64>,
    feature_db_username: Option<String>,
    env_feature_db_username: Option<String>,
    feature_db_password: Option<String>,
    env_feature_db_password: Option<String>,
    #[serde(default)]
    datasources: Vec<RawDatasourceConfig>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RawDatasourceConfig {
    name: String,
    datasource_type: String,
    env_uri: Option<String>,
    env_token: Option<String>,
    env_username: Option<String>,
    env_password: Option<String>,
    uri: Option<String>,
    token: Option<String>,
    vpc_address: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

impl FeatureStoreConfig {
    /// Loads `featurestore.toml` from `path`, resolving `env_*` indirections
    /// against the process environment and the `.env` file next to it.
    pub fn from_dir(path: &Path) -> Result<Self> {
        let config_path = path.join(CONFIG_FILE_NAME);
        let dotenv_path = path.join(".env");
        dotenv::from_path(dotenv_path.as_path()).ok();

        let raw_config = read_toml_to_raw_config(config_path.as_path())?;
        let config = raw_to_config(raw_config)?;
        debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        raw_to_config(toml::from_str(content)?)
    }

    pub fn has_feature_db_login(&self) -> bool {
        matches!(
            (&self.feature_db_username, &self.feature_db_password),
            (Some(u), Some(p)) if !u.is_empty() && !p.is_empty()
        )
    }
}

fn read_toml_to_raw_config(filename: &Path) -> Result<RawFeatureStoreConfig> {
    let config: RawFeatureStoreConfig =
        toml::from_str(std::fs::read_to_string(filename)?.as_str())?;
    Ok(config)
}

fn resolve(value: Option<String>, env_name: Option<String>) -> Option<String> {
    value.or_else(|| env_name.and_then(|name| dotenv::var(name).ok()))
}

fn raw_to_config(raw_config: RawFeatureStoreConfig) -> Result<FeatureStoreConfig> {
    let mut datasources = HashMap::new();
    for ds in raw_config.datasources {
        debug!("Datasource Config: {:?}", ds);
        let uri = resolve(ds.uri, ds.env_uri).unwrap_or_default();
        let token = resolve(ds.token, ds.env_token).unwrap_or_default();
        let username = resolve(ds.username, ds.env_username).unwrap_or_default();
        let password = resolve(ds.password, ds.env_password).unwrap_or_default();
        let datasource_config = match ds.datasource_type.as_str() {
            "hologres" => DatasourceConfig::Hologres {
                dsn: if uri.starts_with("postgres://") || uri.starts_with("postgresql://") {
                    uri
                } else {
                    format!("postgres://{username}:{password}@{uri}")
                },
            },
            "redis" => DatasourceConfig::Redis {
                uri: if uri.starts_with("redis://") {
                    uri
                } else {
                    format!("redis://{uri}")
                },
            },
            "featuredb" => DatasourceConfig::FeatureDB {
                address: uri,
                token,
                vpc_address: ds.vpc_address.unwrap_or_default(),
            },
            "igraph" => DatasourceConfig::IGraph {
                endpoint: uri,
                username,
                password,
            },
            other => {
                return Err(FeatureStoreError::config(format!(
                    "unknown datasource type {other} for datasource {}",
                    ds.name
                )))
            }
        };
        datasources.insert(ds.name, datasource_config);
    }
    debug!("Datasources: {:?}", datasources);
    Ok(FeatureStoreConfig {
        host: raw_config.host,
        token: resolve(raw_config.token, raw_config.env_token).unwrap_or_default(),
        refresh_interval_secs: raw_config
            .refresh_interval_secs
            .unwrap_or(DEFAULT_REFRESH_INTERVAL_SECS),
        feature_db_username: resolve(
            raw_config.feature_db_username,
            raw_config.env_feature_db_username,
        ),
        feature_db_password: resolve(
            raw_config.feature_db_password,
            raw_config.env_feature_db_password,
        ),
        datasources,
    })
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;

    #[test]
    fn test_parse_toml() {
        let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        let config =
            read_toml_to_raw_config(dir.join("demos/quickstart/featurestore.toml").as_path())
                .unwrap();
        assert_eq!(config.datasources.len(), 3);
    }

    #[test]
    fn test_from_dir() {
        let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"));
        let config = FeatureStoreConfig::from_dir(dir.join("demos/quickstart").as_path()).unwrap();
        assert_eq!(config.refresh_interval_secs, 60);
        assert_eq!(config.token, "quickstart-token");
        assert!(config.has_feature_db_login());
        assert_eq!(
            config.datasources.get("fdb"),
            Some(&DatasourceConfig::FeatureDB {
                address: "http://127.0.0.1:8080".into(),
                token: "fdb-token".into(),
                vpc_address: String::new(),
            })
        );
    }

    #[test]
    fn test_raw_to_config() {
        std::env::set_var("FS_TEST_REDIS_URI", "127.0.0.1:6379");
        let config = FeatureStoreConfig::from_toml_str(
            r#"
            host = "http://localhost"
            token = "t"
            refresh_interval_secs = 5

            [[datasources]]
            name = "holo"
            datasource_type = "hologres"
            uri = "holo.example:80/db"
            username = "u"
            password = "p"

            [[datasources]]
            name = "cache"
            datasource_type = "redis"
            env_uri = "FS_TEST_REDIS_URI"
            "#,
        )
        .unwrap();
        assert_eq!(config.refresh_interval_secs, 5);
        assert!(!config.has_feature_db_login());
        assert_eq!(
            config.datasources["holo"],
            DatasourceConfig::Hologres {
                dsn: "postgres://u:p@holo.example:80/db".into()
            }
        );
        assert_eq!(
            config.datasources["cache"],
            DatasourceConfig::Redis {
                uri: "redis://127.0.0.1:6379".into()
            }
        );
    }

    #[test]
    fn test_unknown_datasource_type() {
        let err = FeatureStoreConfig::from_toml_str(
            r#"
            host = "h"
            [[datasources]]
            name = "x"
            datasource_type = "cassandra"
            "#,
        )
        .unwrap_err();
        assert!(err.to_string().contains("cassandra"));
    }
}
