//! Reading project metadata from the control plane.

mod catalog;

use std::{collections::BTreeSet, sync::Arc};

use async_trait::async_trait;
use futures::future::try_join_all;
use log::{debug, info};

use crate::{
    domain::ProjectResources,
    error::Result,
    feature::{
        DatasourceMeta, FeatureEntity, FeatureViewMeta, LabelTable, ModelMeta, ProjectMeta,
    },
};
pub use catalog::{Catalog, CatalogControlPlane};

pub const FEATURE_VIEW_PAGE_SIZE: usize = 100;

/// One page of feature views and the total number of views in the project.
#[derive(Debug, Clone, Default)]
pub struct FeatureViewPage {
    pub feature_views: Vec<FeatureViewMeta>,
    pub total_count: usize,
}

/// The metadata service projects, entities, views and models are read from.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn list_projects(&self) -> Result<Vec<ProjectMeta>>;

    async fn list_feature_entities(&self, project_id: i64) -> Result<Vec<FeatureEntity>>;

    /// `page_number` starts at 1.
    async fn list_feature_views(
        &self,
        project_id: i64,
        page_number: usize,
        page_size: usize,
    ) -> Result<FeatureViewPage>;

    async fn list_models(&self, project_id: i64) -> Result<Vec<ModelMeta>>;

    async fn get_label_table(&self, label_table_id: i64) -> Result<LabelTable>;

    async fn get_datasource(&self, datasource_id: i64) -> Result<DatasourceMeta>;
}

pub struct FeatureRegistry {
    control_plane: Arc<dyn ControlPlane>,
}

impl FeatureRegistry {
    pub fn new(control_plane: Arc<dyn ControlPlane>) -> Self {
        Self { control_plane }
    }

    /// Reads every project together with the resources it is built from.
    pub async fn load_projects(&self) -> Result<Vec<ProjectResources>> {
        let projects = self.control_plane.list_projects().await?;
        info!("Loading {} projects", projects.len());
        try_join_all(projects.into_iter().map(|project| self.load_project(project))).await
    }

    async fn load_project(&self, mut project: ProjectMeta) -> Result<ProjectResources> {
        if project.online_datasource_name.is_empty() && project.online_datasource_id > 0 {
            let datasource = self
                .control_plane
                .get_datasource(project.online_datasource_id)
                .await?;
            project.online_datasource_name = datasource.name;
        }
        let feature_entities = self
            .control_plane
            .list_feature_entities(project.project_id)
            .await?;
        let feature_views = self.list_all_feature_views(project.project_id).await?;
        let models = self.control_plane.list_models(project.project_id).await?;

        let label_table_ids: BTreeSet<i64> = models
            .iter()
            .map(|m| m.label_table_id)
            .filter(|id| *id != 0)
            .collect();
        let label_tables = try_join_all(
            label_table_ids
                .into_iter()
                .map(|id| self.control_plane.get_label_table(id)),
        )
        .await?;

        debug!(
            "Project {}: {} entities, {} feature views, {} models",
            project.project_name,
            feature_entities.len(),
            feature_views.len(),
            models.len()
        );
        Ok(ProjectResources {
            project,
            feature_entities,
            feature_views,
            models,
            label_tables,
        })
    }

    async fn list_all_feature_views(&self, project_id: i64) -> Result<Vec<FeatureViewMeta>> {
        let mut feature_views = Vec::new();
        let mut page_number = 1;
        loop {
            let page = self
                .control_plane
                .list_feature_views(project_id, page_number, FEATURE_VIEW_PAGE_SIZE)
                .await?;
            let empty = page.feature_views.is_empty();
            feature_views.extend(page.feature_views);
            if empty || FEATURE_VIEW_PAGE_SIZE * page_number >= page.total_count {
                break;
            }
            page_number += 1;
        }
        Ok(feature_views)
    }
}
