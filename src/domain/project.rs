use std::{collections::HashMap, sync::Arc};

use log::{debug, info};

use super::{BaseFeatureView, FeatureView, Model, OnlineStore, SequenceFeatureView};
use crate::{
    error::{FeatureStoreError, Result},
    feature::{
        FeatureEntity, FeatureViewMeta, FeatureViewType, LabelTable, ModelMeta, ProjectMeta,
        SequenceConfig,
    },
    infra::ConnectionRegistry,
};

/// Everything the control plane knows about one project.
#[derive(Debug, Clone)]
pub struct ProjectResources {
    pub project: ProjectMeta,
    pub feature_entities: Vec<FeatureEntity>,
    pub feature_views: Vec<FeatureViewMeta>,
    pub models: Vec<ModelMeta>,
    pub label_tables: Vec<LabelTable>,
}

/// A loaded project: its feature views bound to their online stores and its
/// models ready to join.
#[derive(Debug)]
pub struct Project {
    meta: ProjectMeta,
    online_store: OnlineStore,
    feature_entities: HashMap<String, FeatureEntity>,
    feature_views: HashMap<String, Arc<FeatureView>>,
    models: HashMap<String, Arc<Model>>,
    label_tables: HashMap<i64, LabelTable>,
}

impl Project {
    /// Views are built before models. Sequence views that read another
    /// view's tables come last so the referenced view already exists.
    pub fn new(resources: ProjectResources, registry: &Arc<ConnectionRegistry>) -> Result<Self> {
        let ProjectResources {
            project,
            feature_entities,
            feature_views,
            models,
            label_tables,
        } = resources;
        let online_store = OnlineStore::new(&project)?;
        let feature_entities: HashMap<String, FeatureEntity> = feature_entities
            .into_iter()
            .map(|entity| (entity.name.clone(), entity))
            .collect();

        let (sequence_views, regular_views): (Vec<_>, Vec<_>) = feature_views
            .into_iter()
            .partition(|view| view.view_type == FeatureViewType::Sequence);
        let (referencing_views, sequence_views): (Vec<_>, Vec<_>) =
            sequence_views.into_iter().partition(|view| {
                SequenceConfig::parse(&view.config)
                    .map(|config| config.has_reference())
                    .unwrap_or(false)
            });

        let mut views: HashMap<String, Arc<FeatureView>> = HashMap::new();
        for meta in regular_views {
            let entity = entity_of(&feature_entities, &meta)?;
            let view = BaseFeatureView::new(meta, &project, &online_store, entity, registry)?;
            views.insert(view.meta().name.clone(), Arc::new(FeatureView::Base(view)));
        }
        for meta in sequence_views.into_iter().chain(referencing_views) {
            let entity = entity_of(&feature_entities, &meta)?;
            let view =
                SequenceFeatureView::new(meta, &project, &online_store, entity, registry, &views)?;
            views.insert(view.meta().name.clone(), Arc::new(FeatureView::Sequence(view)));
        }

        let label_tables: HashMap<i64, LabelTable> = label_tables
            .into_iter()
            .map(|table| (table.label_table_id, table))
            .collect();
        let mut built_models = HashMap::new();
        for meta in models {
            let label_table = match label_tables.get(&meta.label_table_id) {
                Some(table) => Some(table.clone()),
                None if meta.label_table_id == 0 => None,
                None => {
                    return Err(FeatureStoreError::config(format!(
                        "label table not exist, id={}",
                        meta.label_table_id
                    )))
                }
            };
            let model = Model::new(meta, &views, &feature_entities, label_table)?;
            debug!("Loaded model {}", model.name());
            built_models.insert(model.name().to_string(), Arc::new(model));
        }

        info!(
            "Loaded project {} with {} feature views and {} models",
            project.project_name,
            views.len(),
            built_models.len()
        );
        Ok(Self {
            meta: project,
            online_store,
            feature_entities,
            feature_views: views,
            models: built_models,
            label_tables,
        })
    }

    pub fn meta(&self) -> &ProjectMeta {
        &self.meta
    }

    pub fn name(&self) -> &str {
        &self.meta.project_name
    }

    pub fn online_store(&self) -> &OnlineStore {
        &self.online_store
    }

    pub fn get_feature_view(&self, name: &str) -> Result<Arc<FeatureView>> {
        self.feature_views
            .get(name)
            .cloned()
            .ok_or_else(|| FeatureStoreError::FeatureViewNotFound(name.to_string()))
    }

    pub fn get_feature_entity(&self, name: &str) -> Result<&FeatureEntity> {
        self.feature_entities
            .get(name)
            .ok_or_else(|| FeatureStoreError::FeatureEntityNotFound(name.to_string()))
    }

    pub fn get_model(&self, name: &str) -> Result<Arc<Model>> {
        self.models
            .get(name)
            .cloned()
            .ok_or_else(|| FeatureStoreError::ModelNotFound(name.to_string()))
    }

    pub fn get_label_table(&self, label_table_id: i64) -> Option<&LabelTable> {
        self.label_tables.get(&label_table_id)
    }

    pub fn feature_view_names(&self) -> Vec<&str> {
        self.feature_views.keys().map(String::as_str).collect()
    }
}

fn entity_of(
    entities: &HashMap<String, FeatureEntity>,
    meta: &FeatureViewMeta,
) -> Result<FeatureEntity> {
    entities
        .get(&meta.feature_entity_name)
        .cloned()
        .ok_or_else(|| FeatureStoreError::FeatureEntityNotFound(meta.feature_entity_name.clone()))
}
