//! Connections to the online stores, keyed by datasource name. The
//! [ConnectionRegistry] is shared by every project loaded by a client and is
//! the only place backend handles are created.

pub mod featuredb;
pub mod graph;
pub mod hologres;
pub mod redis;
pub mod wide_column;

use std::{
    collections::HashMap,
    sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use base64::{engine::general_purpose, Engine as _};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::{
    config::{DatasourceConfig, FeatureStoreConfig},
    error::{FeatureStoreError, Result},
};
pub use featuredb::FeatureDbClient;
pub use graph::{GraphClient, HttpGraphClient};
pub use hologres::HologresConnector;
pub use redis::RedisConnector;
pub use wide_column::WideColumnClient;

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub enum InfraIdentifier {
    Hologres(String),
    Redis(String),
    IGraph(String),
    TableStore(String),
}

#[derive(Debug, Clone)]
pub enum Infra {
    Hologres(HologresConnector),
    Redis(RedisConnector),
    IGraph(Arc<dyn GraphClient>),
    TableStore(Arc<dyn WideColumnClient>),
}

#[derive(Debug, Default)]
struct FeatureDbSlot {
    client: Option<Arc<FeatureDbClient>>,
    signature: Option<String>,
    health_check: Option<JoinHandle<()>>,
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    infras: RwLock<HashMap<InfraIdentifier, Infra>>,
    feature_db: RwLock<FeatureDbSlot>,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn from_config(config: &FeatureStoreConfig) -> Result<Self> {
        let registry = Self::new();
        for (name, datasource) in &config.datasources {
            debug!("Creating infra: {name} {datasource:?}");
            match datasource {
                DatasourceConfig::Hologres { dsn } => {
                    registry.register_hologres(name, HologresConnector::new(name, dsn)?);
                }
                DatasourceConfig::Redis { uri } => {
                    registry.register_redis(name, RedisConnector::new(uri.as_str())?);
                }
                DatasourceConfig::FeatureDB {
                    address,
                    token,
                    vpc_address,
                } => {
                    registry.init_feature_db(address, token, vpc_address).await?;
                }
                DatasourceConfig::IGraph {
                    endpoint,
                    username,
                    password,
                } => {
                    registry.register_graph_client(
                        name,
                        Arc::new(HttpGraphClient::new(endpoint, username, password)?),
                    );
                }
            }
        }
        if let (Some(username), Some(password)) =
            (&config.feature_db_username, &config.feature_db_password)
        {
            registry.login_feature_db(username, password);
        }
        info!("Registered datasources: {:?}", registry.datasource_names());
        Ok(registry)
    }

    #[inline]
    pub fn add_infra(&self, infra_id: InfraIdentifier, infra: Infra) {
        debug!("Adding infra: {infra_id:?}");
        write(&self.infras).insert(infra_id, infra);
    }

    #[inline]
    fn get_infra(&self, id: &InfraIdentifier) -> Option<Infra> {
        read(&self.infras).get(id).cloned()
    }

    pub fn contains(&self, id: &InfraIdentifier) -> bool {
        read(&self.infras).contains_key(id)
    }

    pub fn register_hologres(&self, name: impl Into<String>, connector: HologresConnector) {
        self.add_infra(
            InfraIdentifier::Hologres(name.into()),
            Infra::Hologres(connector),
        );
    }

    pub fn get_hologres(&self, name: &str) -> Result<HologresConnector> {
        match self.get_infra(&InfraIdentifier::Hologres(name.to_string())) {
            Some(Infra::Hologres(connector)) => Ok(connector),
            _ => Err(not_registered("hologres", name)),
        }
    }

    pub fn register_redis(&self, name: impl Into<String>, connector: RedisConnector) {
        self.add_infra(InfraIdentifier::Redis(name.into()), Infra::Redis(connector));
    }

    pub fn get_redis(&self, name: &str) -> Result<RedisConnector> {
        match self.get_infra(&InfraIdentifier::Redis(name.to_string())) {
            Some(Infra::Redis(connector)) => Ok(connector),
            _ => Err(not_registered("redis", name)),
        }
    }

    pub fn register_graph_client(&self, name: impl Into<String>, client: Arc<dyn GraphClient>) {
        self.add_infra(InfraIdentifier::IGraph(name.into()), Infra::IGraph(client));
    }

    pub fn get_graph_client(&self, name: &str) -> Result<Arc<dyn GraphClient>> {
        match self.get_infra(&InfraIdentifier::IGraph(name.to_string())) {
            Some(Infra::IGraph(client)) => Ok(client),
            _ => Err(not_registered("igraph", name)),
        }
    }

    /// Wide-column stores have no built-in driver; callers register one per
    /// datasource name before loading projects that use it.
    pub fn register_wide_column_client(
        &self,
        name: impl Into<String>,
        client: Arc<dyn WideColumnClient>,
    ) {
        self.add_infra(
            InfraIdentifier::TableStore(name.into()),
            Infra::TableStore(client),
        );
    }

    pub fn get_wide_column_client(&self, name: &str) -> Result<Arc<dyn WideColumnClient>> {
        match self.get_infra(&InfraIdentifier::TableStore(name.to_string())) {
            Some(Infra::TableStore(client)) => Ok(client),
            _ => Err(not_registered("tablestore", name)),
        }
    }

    /// Creates the feature database client once. Later calls keep the first
    /// client.
    pub async fn init_feature_db(
        &self,
        address: &str,
        token: &str,
        vpc_address: &str,
    ) -> Result<()> {
        if read(&self.feature_db).client.is_some() {
            return Ok(());
        }
        let (client, handle) = FeatureDbClient::connect(address, token, vpc_address).await?;
        let mut slot = write(&self.feature_db);
        if slot.client.is_some() {
            if let Some(handle) = handle {
                handle.abort();
            }
            return Ok(());
        }
        slot.client = Some(client);
        slot.health_check = handle;
        Ok(())
    }

    pub fn set_feature_db_client(&self, client: Arc<FeatureDbClient>) {
        write(&self.feature_db).client = Some(client);
    }

    pub fn feature_db_client(&self) -> Option<Arc<FeatureDbClient>> {
        read(&self.feature_db).client.clone()
    }

    pub fn login_feature_db(&self, username: &str, password: &str) {
        let signature = general_purpose::STANDARD.encode(format!("{username}:{password}"));
        write(&self.feature_db).signature = Some(signature);
    }

    pub fn feature_db_signature(&self) -> Option<String> {
        read(&self.feature_db).signature.clone()
    }

    pub fn datasource_names(&self) -> Vec<InfraIdentifier> {
        read(&self.infras).keys().cloned().collect()
    }
}

impl Drop for ConnectionRegistry {
    fn drop(&mut self) {
        let slot = write(&self.feature_db);
        if let Some(handle) = &slot.health_check {
            handle.abort();
        }
    }
}

fn not_registered(kind: &str, name: &str) -> FeatureStoreError {
    warn!("{kind} datasource {name} is not registered");
    FeatureStoreError::config(format!("{kind} datasource {name} is not registered"))
}
