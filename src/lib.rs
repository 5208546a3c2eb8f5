pub mod config;
pub mod dao;
pub mod domain;
pub mod error;
pub mod feature;
pub mod feature_registry;
pub mod feature_store;
pub mod infra;

#[cfg(test)]
mod testing;

// re-export commonly used items to alleviate user import burden only
pub use config::FeatureStoreConfig;
pub use domain::{FeatureView, JoinIds, Model, Project};
pub use error::{FeatureStoreError, Result};
pub use feature::{FeatureEntity, FeatureValue, FeatureViewField, FieldType, MapKey, Row};
pub use feature_registry::{CatalogControlPlane, ControlPlane, FeatureRegistry};
pub use feature_store::FeatureStoreClient;
pub use infra::ConnectionRegistry;
