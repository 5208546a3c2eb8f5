//! Typed metadata of the resources a project is made of: [FeatureEntity],
//! [FeatureViewMeta], [ModelMeta] and [LabelTable], plus the closed
//! [FeatureValue] type carried in result rows.

mod entity;
mod feature_value_type;
mod feature_view;
mod field;
mod label_table;
mod model;
mod project;
mod value;

pub use entity::FeatureEntity;
pub use feature_value_type::{parse_field_type, FieldType, ScalarType};
pub use feature_view::{
    DeduplicationMethod, FeatureViewMeta, FeatureViewType, RegistrationMode, SeqConfig,
    SequenceConfig,
};
pub use field::FeatureViewField;
pub use label_table::LabelTable;
pub use model::{ModelFeature, ModelMeta};
pub use project::{DatasourceMeta, DatasourceType, ProjectMeta};
pub use value::{parse_timestamp, FeatureValue, MapKey, Row};
