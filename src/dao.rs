//! Data access objects: one implementation of [FeatureViewDao] per online
//! store, chosen once per feature view by [new_feature_view_dao].

pub mod featuredb;
pub mod hologres;
pub mod igraph;
pub mod redis;
pub mod sequence;
pub mod tablestore;

use std::{collections::HashMap, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use log::debug;

use crate::{
    error::{FeatureStoreError, Result},
    feature::{DatasourceType, FeatureViewField, FieldType, SeqConfig, SequenceConfig},
    infra::ConnectionRegistry,
    FeatureValue, Row,
};
pub use featuredb::FeatureViewFeatureDbDao;
pub use hologres::FeatureViewHologresDao;
pub use igraph::FeatureViewIGraphDao;
pub use redis::FeatureViewRedisDao;
pub use tablestore::{FeatureViewOtsDao, FeatureViewTableStoreDao};

/// Fetches rows of one feature view from its online store.
///
/// Rows come back in no particular order and keys without data are simply
/// missing; callers re-index on the primary key carried by every row.
#[async_trait]
pub trait FeatureViewDao: Send + Sync + Debug {
    async fn get_features(&self, keys: &[FeatureValue], select_fields: &[String])
        -> Result<Vec<Row>>;

    /// Like [get_features](Self::get_features) with a hint of how many rows
    /// per key the caller expects.
    async fn get_features_with_count(
        &self,
        keys: &[FeatureValue],
        select_fields: &[String],
        _count: usize,
    ) -> Result<Vec<Row>> {
        self.get_features(keys, select_fields).await
    }

    async fn get_user_sequence_feature(
        &self,
        _keys: &[FeatureValue],
        _user_id_field: &str,
        _sequence_config: &SequenceConfig,
        _seq_configs: &[SeqConfig],
    ) -> Result<Vec<Row>> {
        Err(FeatureStoreError::Unsupported(
            "GetUserSequenceFeature is not supported by this datasource".into(),
        ))
    }

    async fn get_user_behavior_feature(
        &self,
        _user_ids: &[FeatureValue],
        _events: &[String],
        _select_fields: &[String],
        _sequence_config: &SequenceConfig,
    ) -> Result<Vec<Row>> {
        Err(FeatureStoreError::Unsupported(
            "GetUserBehaviorFeature is not supported by this datasource".into(),
        ))
    }
}

/// Everything one DAO needs to reach its table. Assembled by the domain
/// layer, differently per backend and per kind of feature view.
#[derive(Debug, Clone)]
pub struct DaoConfig {
    pub datasource_type: DatasourceType,
    /// Name the connection is registered under.
    pub datasource_name: String,
    pub table_name: String,
    pub primary_key_field: String,
    pub event_time_field: String,
    pub ttl: i64,
    /// Schema order matters for FeatureDB records.
    pub fields: Vec<FeatureViewField>,
    pub field_type_map: HashMap<String, FieldType>,

    // igraph
    pub group_name: String,
    pub label_name: String,
    pub save_original_field: bool,
    /// Name stored in the graph to the feature view field name.
    pub field_map: HashMap<String, String>,

    // sequence views
    pub online_seq_table: String,
    pub offline_seq_table: String,

    // featuredb
    pub feature_db_database: String,
    pub feature_db_schema: String,

    // redis
    pub redis_key_prefix: String,
}

impl DaoConfig {
    pub fn new(datasource_type: DatasourceType, datasource_name: &str) -> Self {
        Self {
            datasource_type,
            datasource_name: datasource_name.to_string(),
            table_name: String::new(),
            primary_key_field: String::new(),
            event_time_field: String::new(),
            ttl: 0,
            fields: Vec::new(),
            field_type_map: HashMap::new(),
            group_name: String::new(),
            label_name: String::new(),
            save_original_field: false,
            field_map: HashMap::new(),
            online_seq_table: String::new(),
            offline_seq_table: String::new(),
            feature_db_database: String::new(),
            feature_db_schema: String::new(),
            redis_key_prefix: String::new(),
        }
    }

    pub fn with_fields(mut self, fields: &[FeatureViewField]) -> Self {
        self.field_type_map = fields
            .iter()
            .map(|f| (f.name.clone(), f.field_type))
            .collect();
        self.fields = fields.to_vec();
        self
    }

    pub fn field_type(&self, name: &str) -> Option<FieldType> {
        self.field_type_map.get(name).copied()
    }
}

/// Picks the DAO implementation for the configured backend and binds it to
/// its connection.
pub fn new_feature_view_dao(
    config: DaoConfig,
    registry: &Arc<ConnectionRegistry>,
) -> Result<Arc<dyn FeatureViewDao>> {
    debug!(
        "Creating {} dao for table {}",
        config.datasource_type, config.table_name
    );
    let dao: Arc<dyn FeatureViewDao> = match config.datasource_type {
        DatasourceType::Hologres => {
            let connector = registry.get_hologres(&config.datasource_name)?;
            Arc::new(FeatureViewHologresDao::new(config, connector))
        }
        DatasourceType::TableStore => {
            let client = registry.get_wide_column_client(&config.datasource_name)?;
            Arc::new(FeatureViewTableStoreDao::new(config, client))
        }
        DatasourceType::Ots => {
            let client = registry.get_wide_column_client(&config.datasource_name)?;
            Arc::new(FeatureViewOtsDao::new(config, client))
        }
        DatasourceType::IGraph => {
            let client = registry.get_graph_client(&config.datasource_name)?;
            Arc::new(FeatureViewIGraphDao::new(config, client))
        }
        DatasourceType::FeatureDB => Arc::new(FeatureViewFeatureDbDao::new(config, registry.clone())),
        DatasourceType::Redis => {
            let connector = registry.get_redis(&config.datasource_name)?;
            Arc::new(FeatureViewRedisDao::new(config, connector))
        }
        other => {
            return Err(FeatureStoreError::config(format!(
                "not found FeatureViewDao implement for datasource type {other}"
            )))
        }
    };
    Ok(dao)
}

/// Splits `items` into consecutive batches of at most `size`.
pub(crate) fn batches<T>(items: &[T], size: usize) -> impl Iterator<Item = &[T]> {
    items.chunks(size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeGraphClient;

    #[test]
    fn test_batches() {
        let keys: Vec<i32> = (0..250).collect();
        let sizes: Vec<usize> = batches(&keys, 100).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![100, 100, 50]);
        assert_eq!(batches::<i32>(&[], 100).count(), 0);
    }

    #[test]
    fn test_dao_factory() {
        let registry = Arc::new(ConnectionRegistry::new());
        registry.register_graph_client("graph", Arc::new(FakeGraphClient::default()));

        let config = DaoConfig::new(DatasourceType::IGraph, "graph");
        assert!(new_feature_view_dao(config, &registry).is_ok());

        let config = DaoConfig::new(DatasourceType::Hologres, "missing");
        assert!(matches!(
            new_feature_view_dao(config, &registry),
            Err(FeatureStoreError::Config(_))
        ));

        let config = DaoConfig::new(DatasourceType::Mysql, "db");
        let err = new_feature_view_dao(config, &registry).unwrap_err();
        assert!(err.to_string().contains("mysql"));

        let config = DaoConfig::new(DatasourceType::FeatureDB, "");
        assert!(new_feature_view_dao(config, &registry).is_ok());
    }
}
