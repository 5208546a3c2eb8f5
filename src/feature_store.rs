use std::{
    collections::HashMap,
    path::Path,
    sync::{Arc, RwLock},
    time::Duration,
};

use log::{debug, error, info};
use tokio::task::JoinHandle;

use crate::{
    config::FeatureStoreConfig,
    domain::Project,
    error::{FeatureStoreError, Result},
    feature_registry::{ControlPlane, FeatureRegistry},
    infra::ConnectionRegistry,
};

struct ClientState {
    registry: Arc<ConnectionRegistry>,
    feature_registry: FeatureRegistry,
    projects: RwLock<HashMap<String, Arc<Project>>>,
}

impl ClientState {
    /// Builds a fresh snapshot of every project and swaps it in. Nothing is
    /// replaced when any project fails to load.
    async fn load(&self) -> Result<()> {
        let resources = self.feature_registry.load_projects().await?;
        let mut projects = HashMap::with_capacity(resources.len());
        for resources in resources {
            let meta = &resources.project;
            if !meta.feature_db_address.is_empty() && !meta.feature_db_token.is_empty() {
                self.registry
                    .init_feature_db(
                        &meta.feature_db_address,
                        &meta.feature_db_token,
                        &meta.feature_db_vpc_address,
                    )
                    .await?;
            }
            let project = Project::new(resources, &self.registry)?;
            projects.insert(project.name().to_string(), Arc::new(project));
        }
        debug!("Loaded projects: {:?}", projects.keys().collect::<Vec<_>>());
        *self
            .projects
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = projects;
        Ok(())
    }
}

/// Entry point of the SDK: loads every project once and keeps them fresh in
/// the background.
pub struct FeatureStoreClient {
    state: Arc<ClientState>,
    refresh_handle: Option<JoinHandle<()>>,
}

impl FeatureStoreClient {
    pub async fn new(
        config: &FeatureStoreConfig,
        control_plane: Arc<dyn ControlPlane>,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Self> {
        info!("Creating feature store client for {}", config.host);
        if config.has_feature_db_login() {
            if let (Some(username), Some(password)) =
                (&config.feature_db_username, &config.feature_db_password)
            {
                registry.login_feature_db(username, password);
            }
        }
        let state = Arc::new(ClientState {
            registry,
            feature_registry: FeatureRegistry::new(control_plane),
            projects: RwLock::new(HashMap::new()),
        });
        state.load().await?;

        let refresh_handle = (config.refresh_interval_secs > 0).then(|| {
            let state = state.clone();
            let period = Duration::from_secs(config.refresh_interval_secs);
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    match state.load().await {
                        Ok(()) => debug!("Refreshed projects"),
                        Err(e) => error!("refresh projects failed, keeping previous ones: {e}"),
                    }
                }
            })
        });

        Ok(Self {
            state,
            refresh_handle,
        })
    }

    /// Reads `featurestore.toml` in `path` and connects the datasources it
    /// declares.
    pub async fn from_dir(path: &Path, control_plane: Arc<dyn ControlPlane>) -> Result<Self> {
        let config = FeatureStoreConfig::from_dir(path)?;
        let registry = Arc::new(ConnectionRegistry::from_config(&config).await?);
        Self::new(&config, control_plane, registry).await
    }

    pub fn get_project(&self, name: &str) -> Result<Arc<Project>> {
        self.state
            .projects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(name)
            .cloned()
            .ok_or_else(|| FeatureStoreError::ProjectNotFound(name.to_string()))
    }

    pub fn project_names(&self) -> Vec<String> {
        self.state
            .projects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    /// Reloads all projects now instead of waiting for the next tick.
    pub async fn refresh(&self) -> Result<()> {
        self.state.load().await
    }

    pub fn login_feature_db(&self, username: &str, password: &str) {
        self.state.registry.login_feature_db(username, password);
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.state.registry
    }
}

impl Drop for FeatureStoreClient {
    fn drop(&mut self) {
        if let Some(handle) = self.refresh_handle.take() {
            handle.abort();
        }
    }
}
