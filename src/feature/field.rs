use serde::{Deserialize, Serialize};

use super::FieldType;

#[macro_export]
macro_rules! fields {
    ($(($name: literal, $ty: expr $(, $flag: ident)*)),* $(,)?) => {
        vec![$({
            #[allow(unused_mut)]
            let mut field = $crate::FeatureViewField::new($name, $ty);
            $(field.$flag = true;)*
            field
        }),*]
    };
}

/// One column of a feature view or label table.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FeatureViewField {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub is_partition: bool,
    #[serde(default)]
    pub is_primary_key: bool,
    #[serde(default)]
    pub is_event_time: bool,
    #[serde(default)]
    pub position: i32,
}

impl FeatureViewField {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
            is_partition: false,
            is_primary_key: false,
            is_event_time: false,
            position: 0,
        }
    }

    pub fn with_position(mut self, position: i32) -> Self {
        self.position = position;
        self
    }
}
