use serde::{Deserialize, Serialize};

use super::FeatureViewField;

#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct LabelTable {
    pub label_table_id: i64,
    #[serde(default)]
    pub project_id: i64,
    pub name: String,
    #[serde(default)]
    pub fields: Vec<FeatureViewField>,
}

impl LabelTable {
    pub fn fields(&self) -> &[FeatureViewField] {
        &self.fields
    }

    /// Every non-partition column.
    pub fn feature_names(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter(|f| !f.is_partition)
            .map(|f| f.name.clone())
            .collect()
    }
}
