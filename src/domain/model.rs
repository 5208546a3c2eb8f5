use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use futures::future::join_all;
use log::{debug, error};
use tokio::sync::mpsc;

use super::FeatureView;
use crate::{
    error::{FeatureStoreError, Result},
    feature::{FeatureEntity, LabelTable, ModelMeta},
    FeatureValue, Row,
};

/// Join id name to the keys requested for it.
pub type JoinIds = HashMap<String, Vec<FeatureValue>>;

/// The features a model consumes, joined across feature entities.
///
/// Entities without a parent are roots. A child entity is reached through
/// the value its parent's rows carry under the child's join id.
#[derive(Debug)]
pub struct Model {
    meta: ModelMeta,
    label_table: Option<LabelTable>,
    feature_entities: HashMap<String, FeatureEntity>,
    /// Online feature names per feature view.
    feature_names: HashMap<String, Arc<Vec<String>>>,
    alias_names: HashMap<String, Arc<HashMap<String, String>>>,
    join_id_views: HashMap<String, BTreeMap<String, Arc<FeatureView>>>,
    root_join_ids: Vec<String>,
    child_join_ids: HashMap<String, Vec<String>>,
}

impl Model {
    pub fn new(
        meta: ModelMeta,
        views: &HashMap<String, Arc<FeatureView>>,
        entities: &HashMap<String, FeatureEntity>,
        label_table: Option<LabelTable>,
    ) -> Result<Self> {
        let mut feature_entities = HashMap::new();
        let mut entity_order = Vec::new();
        let mut feature_names: HashMap<String, Vec<String>> = HashMap::new();
        let mut alias_names: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut join_id_views: HashMap<String, BTreeMap<String, Arc<FeatureView>>> =
            HashMap::new();

        for feature in &meta.features {
            let view = views
                .get(&feature.feature_view_name)
                .ok_or_else(|| FeatureStoreError::FeatureViewNotFound(feature.feature_view_name.clone()))?;
            let entity = entities
                .get(view.feature_entity_name())
                .ok_or_else(|| FeatureStoreError::FeatureEntityNotFound(view.feature_entity_name().to_string()))?;
            if !feature_entities.contains_key(&entity.name) {
                entity_order.push(entity.name.clone());
                feature_entities.insert(entity.name.clone(), entity.clone());
            }
            feature_names
                .entry(feature.feature_view_name.clone())
                .or_default()
                .push(view.offline2online(&feature.name));
            if !feature.alias_name.is_empty() {
                alias_names
                    .entry(feature.feature_view_name.clone())
                    .or_default()
                    .insert(feature.name.clone(), feature.alias_name.clone());
            }
            join_id_views
                .entry(entity.join_id.clone())
                .or_default()
                .insert(feature.feature_view_name.clone(), view.clone());
        }

        let mut root_join_ids = Vec::new();
        let mut child_join_ids: HashMap<String, Vec<String>> = HashMap::new();
        for name in &entity_order {
            let entity = &feature_entities[name];
            if entity.is_root() {
                root_join_ids.push(entity.join_id.clone());
            } else {
                child_join_ids
                    .entry(entity.parent_join_id.clone())
                    .or_default()
                    .push(entity.join_id.clone());
            }
        }

        Ok(Self {
            meta,
            label_table,
            feature_entities,
            feature_names: feature_names
                .into_iter()
                .map(|(view, names)| (view, Arc::new(names)))
                .collect(),
            alias_names: alias_names
                .into_iter()
                .map(|(view, alias)| (view, Arc::new(alias)))
                .collect(),
            join_id_views,
            root_join_ids,
            child_join_ids,
        })
    }

    pub fn meta(&self) -> &ModelMeta {
        &self.meta
    }

    pub fn name(&self) -> &str {
        &self.meta.name
    }

    pub fn label_table(&self) -> Option<&LabelTable> {
        self.label_table.as_ref()
    }

    /// Output names of the declared features, aliases applied.
    pub fn feature_names(&self) -> Vec<String> {
        self.meta
            .features
            .iter()
            .map(|f| {
                if f.alias_name.is_empty() {
                    f.name.clone()
                } else {
                    f.alias_name.clone()
                }
            })
            .collect()
    }

    /// One row per position of the root keys. Every root join id must be
    /// given with keys of the same length.
    pub async fn get_online_features(&self, join_ids: &JoinIds) -> Result<Vec<Row>> {
        let mut size = None;
        for join_id in &self.root_join_ids {
            let keys = join_ids
                .get(join_id)
                .ok_or_else(|| FeatureStoreError::JoinIdNotFound(join_id.clone()))?;
            match size {
                None => size = Some(keys.len()),
                Some(size) if size != keys.len() => {
                    return Err(FeatureStoreError::JoinIdLengthNotEqual(join_id.clone()))
                }
                _ => {}
            }
        }
        self.join(&self.root_join_ids, join_ids, size.unwrap_or_default())
            .await
    }

    /// Like [get_online_features](Self::get_online_features) but anchored on
    /// one entity: its own features plus those of its children.
    pub async fn get_online_features_with_entity(
        &self,
        join_ids: &JoinIds,
        feature_entity_name: &str,
    ) -> Result<Vec<Row>> {
        let entity = self
            .feature_entities
            .get(feature_entity_name)
            .ok_or_else(|| FeatureStoreError::FeatureEntityNotFound(feature_entity_name.to_string()))?;
        let keys = join_ids
            .get(&entity.join_id)
            .ok_or_else(|| FeatureStoreError::JoinIdNotFound(entity.join_id.clone()))?;
        self.join(std::slice::from_ref(&entity.join_id), join_ids, keys.len())
            .await
    }

    async fn join(&self, anchors: &[String], join_ids: &JoinIds, size: usize) -> Result<Vec<Row>> {
        let requests = anchors
            .iter()
            .filter_map(|join_id| Some((join_id.clone(), join_ids.get(join_id)?.clone())))
            .collect();
        let anchor_rows = self.fetch(requests).await;

        let mut result = vec![Row::new(); size];
        for join_id in anchors {
            let mut positions: HashMap<String, Vec<usize>> = HashMap::new();
            for (i, key) in join_ids.get(join_id).into_iter().flatten().enumerate() {
                if let Some(key) = key.to_key_string() {
                    positions.entry(key).or_default().push(i);
                }
            }
            for row in anchor_rows.get(join_id).into_iter().flatten() {
                let Some(key) = row.get(join_id).and_then(FeatureValue::to_key_string) else {
                    continue;
                };
                for &i in positions.get(&key).into_iter().flatten() {
                    result[i].extend(row.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
            }
        }

        let child_keys = self.child_keys(anchors, &anchor_rows);
        if child_keys.is_empty() {
            return Ok(result);
        }
        let child_rows = self.fetch(child_keys).await;

        let mut child_index: HashMap<&str, HashMap<String, Row>> = HashMap::new();
        for (join_id, rows) in &child_rows {
            let by_key = child_index.entry(join_id.as_str()).or_default();
            for row in rows {
                let Some(key) = row.get(join_id).and_then(FeatureValue::to_key_string) else {
                    continue;
                };
                if key.is_empty() {
                    continue;
                }
                by_key
                    .entry(key)
                    .or_default()
                    .extend(row.iter().map(|(k, v)| (k.clone(), v.clone())));
            }
        }

        for join_id in anchors {
            for child in self.child_join_ids.get(join_id).into_iter().flatten() {
                let Some(by_key) = child_index.get(child.as_str()) else {
                    continue;
                };
                for row in result.iter_mut() {
                    let Some(key) = row.get(child).and_then(FeatureValue::to_key_string) else {
                        continue;
                    };
                    if let Some(child_row) = by_key.get(&key) {
                        row.extend(child_row.iter().map(|(k, v)| (k.clone(), v.clone())));
                    }
                }
            }
        }
        Ok(result)
    }

    /// Distinct foreign keys found in the anchor rows, first seen first.
    fn child_keys(
        &self,
        anchors: &[String],
        anchor_rows: &HashMap<String, Vec<Row>>,
    ) -> Vec<(String, Vec<FeatureValue>)> {
        let mut keys: Vec<(String, Vec<FeatureValue>)> = Vec::new();
        for join_id in anchors {
            let Some(children) = self.child_join_ids.get(join_id) else {
                continue;
            };
            for child in children {
                let mut seen = HashSet::new();
                let mut child_keys = Vec::new();
                for row in anchor_rows.get(join_id).into_iter().flatten() {
                    let Some(value) = row.get(child) else {
                        continue;
                    };
                    match value.to_key_string() {
                        Some(key) if !key.is_empty() => {
                            if seen.insert(key) {
                                child_keys.push(value.clone());
                            }
                        }
                        _ => {}
                    }
                }
                if !child_keys.is_empty() {
                    keys.push((child.clone(), child_keys));
                }
            }
        }
        keys
    }

    /// Queries every feature view of every requested join id concurrently.
    /// A failing view is logged and contributes no rows.
    async fn fetch(&self, requests: Vec<(String, Vec<FeatureValue>)>) -> HashMap<String, Vec<Row>> {
        let (tx, mut rx) = mpsc::unbounded_channel::<(String, Vec<Row>)>();
        let mut handles = Vec::new();
        for (join_id, keys) in requests {
            let Some(views) = self.join_id_views.get(&join_id) else {
                continue;
            };
            let keys = Arc::new(keys);
            for (name, view) in views {
                let tx = tx.clone();
                let view = view.clone();
                let keys = keys.clone();
                let join_id = join_id.clone();
                let features = self.feature_names.get(name).cloned().unwrap_or_default();
                let alias = self.alias_names.get(name).cloned().unwrap_or_default();
                handles.push(tokio::spawn(async move {
                    match view.get_online_features(&keys, &features, &alias).await {
                        Ok(rows) => {
                            debug!("feature view {} returned {} rows", view.name(), rows.len());
                            let _ = tx.send((join_id, rows));
                        }
                        Err(e) => {
                            error!("get online features of feature view {} failed: {e}", view.name())
                        }
                    }
                }));
            }
        }
        drop(tx);

        let mut collected: HashMap<String, Vec<Row>> = HashMap::new();
        while let Some((join_id, rows)) = rx.recv().await {
            collected.entry(join_id).or_default().extend(rows);
        }
        for joined in join_all(handles).await {
            if let Err(e) = joined {
                error!("feature view fetch task failed: {e}");
            }
        }
        collected
    }
}
