use std::{
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        RwLock, RwLockReadGuard,
    },
};

use async_trait::async_trait;
use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::{ControlPlane, FeatureViewPage};
use crate::{
    error::{FeatureStoreError, Result},
    feature::{
        DatasourceMeta, FeatureEntity, FeatureViewMeta, LabelTable, ModelMeta, ProjectMeta,
    },
};

/// A full dump of the control plane's metadata.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct Catalog {
    #[serde(default)]
    pub projects: Vec<ProjectMeta>,
    #[serde(default)]
    pub feature_entities: Vec<FeatureEntity>,
    #[serde(default)]
    pub feature_views: Vec<FeatureViewMeta>,
    #[serde(default)]
    pub models: Vec<ModelMeta>,
    #[serde(default)]
    pub label_tables: Vec<LabelTable>,
    #[serde(default)]
    pub datasources: Vec<DatasourceMeta>,
}

/// Serves a [Catalog] held in memory. The catalog can be swapped at runtime,
/// which the next refresh of a client picks up.
#[derive(Debug, Default)]
pub struct CatalogControlPlane {
    catalog: RwLock<Catalog>,
    feature_view_pages: AtomicUsize,
}

impl CatalogControlPlane {
    pub fn new(catalog: Catalog) -> Self {
        Self {
            catalog: RwLock::new(catalog),
            feature_view_pages: AtomicUsize::new(0),
        }
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        Ok(Self::new(serde_json::from_str(content)?))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        info!("Loading catalog from {}", path.display());
        Self::from_json_str(&std::fs::read_to_string(path)?)
    }

    pub fn replace(&self, catalog: Catalog) {
        *self
            .catalog
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = catalog;
    }

    /// Number of feature view pages served so far.
    pub fn feature_view_pages(&self) -> usize {
        self.feature_view_pages.load(Ordering::Relaxed)
    }

    fn catalog(&self) -> RwLockReadGuard<'_, Catalog> {
        self.catalog
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ControlPlane for CatalogControlPlane {
    async fn list_projects(&self) -> Result<Vec<ProjectMeta>> {
        Ok(self.catalog().projects.clone())
    }

    async fn list_feature_entities(&self, project_id: i64) -> Result<Vec<FeatureEntity>> {
        Ok(self
            .catalog()
            .feature_entities
            .iter()
            .filter(|e| e.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn list_feature_views(
        &self,
        project_id: i64,
        page_number: usize,
        page_size: usize,
    ) -> Result<FeatureViewPage> {
        self.feature_view_pages.fetch_add(1, Ordering::Relaxed);
        let catalog = self.catalog();
        let views: Vec<&FeatureViewMeta> = catalog
            .feature_views
            .iter()
            .filter(|v| v.project_id == project_id)
            .collect();
        debug!("List feature views of project {project_id}, page {page_number}");
        Ok(FeatureViewPage {
            feature_views: views
                .iter()
                .skip(page_number.saturating_sub(1) * page_size)
                .take(page_size)
                .map(|v| (*v).clone())
                .collect(),
            total_count: views.len(),
        })
    }

    async fn list_models(&self, project_id: i64) -> Result<Vec<ModelMeta>> {
        Ok(self
            .catalog()
            .models
            .iter()
            .filter(|m| m.project_id == project_id)
            .cloned()
            .collect())
    }

    async fn get_label_table(&self, label_table_id: i64) -> Result<LabelTable> {
        self.catalog()
            .label_tables
            .iter()
            .find(|t| t.label_table_id == label_table_id)
            .cloned()
            .ok_or_else(|| {
                FeatureStoreError::config(format!("label table not exist, id={label_table_id}"))
            })
    }

    async fn get_datasource(&self, datasource_id: i64) -> Result<DatasourceMeta> {
        self.catalog()
            .datasources
            .iter()
            .find(|d| d.datasource_id == datasource_id)
            .cloned()
            .ok_or_else(|| {
                FeatureStoreError::config(format!("datasource not exist, id={datasource_id}"))
            })
    }
}
