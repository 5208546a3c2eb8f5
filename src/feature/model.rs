use serde::{Deserialize, Serialize};

use super::FieldType;

/// A declared model input: one field of one feature view, optionally renamed.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ModelFeature {
    pub feature_view_name: String,
    pub name: String,
    #[serde(default)]
    pub alias_name: String,
    #[serde(rename = "type", default)]
    pub field_type: Option<FieldType>,
}

impl ModelFeature {
    pub fn new(feature_view_name: &str, name: &str) -> Self {
        Self {
            feature_view_name: feature_view_name.to_string(),
            name: name.to_string(),
            ..Default::default()
        }
    }

    pub fn with_alias(mut self, alias: &str) -> Self {
        self.alias_name = alias.to_string();
        self
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ModelMeta {
    #[serde(default)]
    pub model_id: i64,
    #[serde(default)]
    pub project_id: i64,
    pub name: String,
    #[serde(default)]
    pub label_table_id: i64,
    #[serde(default)]
    pub features: Vec<ModelFeature>,
}
