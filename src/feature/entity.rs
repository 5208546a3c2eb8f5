use serde::{Deserialize, Serialize};

#[macro_export]
macro_rules! entity {
    ($name: literal, $join_id: literal) => {
        $crate::FeatureEntity {
            name: $name.to_owned(),
            join_id: $join_id.to_owned(),
            ..Default::default()
        }
    };

    ($name: literal, $join_id: literal, $parent: expr) => {{
        let parent: &$crate::FeatureEntity = &$parent;
        $crate::FeatureEntity {
            name: $name.to_owned(),
            join_id: $join_id.to_owned(),
            parent_feature_entity_id: parent.feature_entity_id.max(1),
            parent_name: parent.name.clone(),
            parent_join_id: parent.join_id.clone(),
            ..Default::default()
        }
    }};
}

/// Identity domain (user, item, ...) that feature views are keyed on. An entity
/// points to at most one parent through the parent's join id, so entities form
/// a forest.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct FeatureEntity {
    #[serde(default)]
    pub feature_entity_id: i64,
    #[serde(default)]
    pub project_id: i64,
    pub name: String,
    pub join_id: String,
    #[serde(default)]
    pub parent_feature_entity_id: i64,
    #[serde(default)]
    pub parent_name: String,
    #[serde(default)]
    pub parent_join_id: String,
}

impl FeatureEntity {
    pub fn is_root(&self) -> bool {
        self.parent_feature_entity_id == 0
    }
}
