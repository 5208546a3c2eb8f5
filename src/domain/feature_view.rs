use std::collections::HashMap;

use super::{BaseFeatureView, SequenceFeatureView};
use crate::{
    error::Result,
    feature::{FeatureEntity, FeatureViewMeta, FeatureViewType},
    FeatureValue, Row,
};

/// A feature view bound to its online store.
#[derive(Debug)]
pub enum FeatureView {
    Base(BaseFeatureView),
    Sequence(SequenceFeatureView),
}

impl FeatureView {
    pub fn meta(&self) -> &FeatureViewMeta {
        match self {
            FeatureView::Base(view) => view.meta(),
            FeatureView::Sequence(view) => view.meta(),
        }
    }

    pub fn name(&self) -> &str {
        &self.meta().name
    }

    pub fn feature_entity_name(&self) -> &str {
        &self.meta().feature_entity_name
    }

    pub fn feature_entity(&self) -> &FeatureEntity {
        match self {
            FeatureView::Base(view) => view.feature_entity(),
            FeatureView::Sequence(view) => view.feature_entity(),
        }
    }

    pub fn view_type(&self) -> FeatureViewType {
        self.meta().view_type
    }

    /// Rows keyed by the entity join id, one per key that has data.
    pub async fn get_online_features(
        &self,
        join_ids: &[FeatureValue],
        features: &[String],
        alias: &HashMap<String, String>,
    ) -> Result<Vec<Row>> {
        match self {
            FeatureView::Base(view) => view.get_online_features(join_ids, features, alias).await,
            FeatureView::Sequence(view) => view.get_online_features(join_ids, features, alias).await,
        }
    }

    pub async fn get_online_features_with_count(
        &self,
        join_ids: &[FeatureValue],
        features: &[String],
        alias: &HashMap<String, String>,
        count: usize,
    ) -> Result<Vec<Row>> {
        match self {
            FeatureView::Base(view) => {
                view.get_online_features_with_count(join_ids, features, alias, count)
                    .await
            }
            FeatureView::Sequence(view) => view.get_online_features(join_ids, features, alias).await,
        }
    }

    pub async fn get_behavior_features(
        &self,
        user_ids: &[FeatureValue],
        events: &[String],
        features: &[String],
    ) -> Result<Vec<Row>> {
        match self {
            FeatureView::Base(view) => view.get_behavior_features(user_ids, events, features).await,
            FeatureView::Sequence(view) => {
                view.get_behavior_features(user_ids, events, features).await
            }
        }
    }

    /// Name under which an offline feature is served online.
    pub fn offline2online(&self, name: &str) -> String {
        match self {
            FeatureView::Base(_) => name.to_string(),
            FeatureView::Sequence(view) => view.offline2online(name),
        }
    }
}

/// Moves the value under `from` to `to` in every row.
pub(crate) fn rekey(rows: &mut [Row], from: &str, to: &str) {
    if from == to {
        return;
    }
    for row in rows {
        if let Some(value) = row.remove(from) {
            row.insert(to.to_string(), value);
        }
    }
}

pub(crate) fn apply_alias(rows: &mut [Row], alias: &HashMap<String, String>) {
    for (name, alias_name) in alias {
        rekey(rows, name, alias_name);
    }
}
