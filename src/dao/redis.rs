use async_trait::async_trait;
use futures::future::try_join_all;
use log::debug;

use super::{batches, DaoConfig, FeatureViewDao};
use crate::{error::Result, infra::RedisConnector, FeatureValue, Row};

const REDIS_BATCH_SIZE: usize = 200;

/// Prefix of every hash key of a feature view: the first four hex digits of
/// the crc32 of its online table name, then `_`.
pub fn redis_key_prefix(project: &str, feature_view: &str) -> String {
    let table = format!("{project}_{feature_view}_online");
    let digest = format!("{:08x}", crc32fast::hash(table.as_bytes()));
    format!("{}_", &digest[..4])
}

/// Each row is a hash at `{prefix}{primary key}` whose entries are the
/// feature values in their textual form.
#[derive(Debug)]
pub struct FeatureViewRedisDao {
    connector: RedisConnector,
    config: DaoConfig,
}

impl FeatureViewRedisDao {
    pub fn new(config: DaoConfig, connector: RedisConnector) -> Self {
        Self { connector, config }
    }

    fn redis_key(&self, key: &FeatureValue) -> String {
        format!("{}{key}", self.config.redis_key_prefix)
    }

    /// `None` when the hash holds none of the requested fields.
    fn to_row(&self, key: &FeatureValue, fields: &[&str], values: Vec<Option<String>>) -> Option<Row> {
        if values.iter().all(Option::is_none) {
            return None;
        }
        let mut row: Row = fields
            .iter()
            .zip(values)
            .filter_map(|(field, value)| {
                let value = value?;
                let parsed = match self.config.field_type(field) {
                    Some(field_type) => FeatureValue::parse_typed(&value, field_type),
                    None => FeatureValue::String(value),
                };
                Some((field.to_string(), parsed))
            })
            .collect();
        row.insert(self.config.primary_key_field.clone(), key.clone());
        Some(row)
    }
}

#[async_trait]
impl FeatureViewDao for FeatureViewRedisDao {
    async fn get_features(
        &self,
        keys: &[FeatureValue],
        select_fields: &[String],
    ) -> Result<Vec<Row>> {
        let fields: Vec<&str> = select_fields
            .iter()
            .map(String::as_str)
            .filter(|f| *f != self.config.primary_key_field)
            .collect();
        if fields.is_empty() || keys.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.connector.get_connection().await?;
        let per_batch = try_join_all(batches(keys, REDIS_BATCH_SIZE).map(|batch| {
            let mut conn = conn.clone();
            let fields = &fields;
            async move {
                let mut pipe = redis::pipe();
                for key in batch {
                    pipe.cmd("HMGET").arg(self.redis_key(key)).arg(fields.as_slice());
                }
                let values: Vec<Vec<Option<String>>> = pipe.query_async(&mut conn).await?;
                debug!("HMGET {} keys from {}", batch.len(), self.config.table_name);
                Ok::<_, crate::error::FeatureStoreError>(
                    batch
                        .iter()
                        .zip(values)
                        .filter_map(|(key, values)| self.to_row(key, fields, values))
                        .collect::<Vec<_>>(),
                )
            }
        }))
        .await?;
        Ok(per_batch.into_iter().flatten().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        feature::{DatasourceType, FieldType},
        fields,
    };

    fn config(prefix: &str) -> DaoConfig {
        let mut config = DaoConfig::new(DatasourceType::Redis, "cache").with_fields(&fields![
            ("user_id", FieldType::String, is_primary_key),
            ("age", FieldType::Int64),
            ("tags", FieldType::ArrayString),
        ]);
        config.primary_key_field = "user_id".into();
        config.table_name = "fs_user_fea_online".into();
        config.redis_key_prefix = prefix.into();
        config
    }

    #[test]
    fn test_key_prefix() {
        let prefix = redis_key_prefix("fs", "user_fea");
        assert_eq!(prefix.len(), 5);
        assert!(prefix.ends_with('_'));
        assert_eq!(prefix, redis_key_prefix("fs", "user_fea"));
        assert_ne!(prefix, redis_key_prefix("fs", "item_fea"));
    }

    #[test]
    fn test_to_row() {
        let connector = RedisConnector::new("redis://127.0.0.1:1").unwrap();
        let dao = FeatureViewRedisDao::new(config("ab12_"), connector);
        let key = FeatureValue::from("u1");
        assert_eq!(dao.redis_key(&key), "ab12_u1");

        let row = dao
            .to_row(&key, &["age", "tags"], vec![Some("12".into()), None])
            .unwrap();
        assert_eq!(row.len(), 2);
        assert_eq!(row["age"], FeatureValue::Int64(12));
        assert_eq!(row["user_id"], key);
        assert!(dao.to_row(&key, &["age", "tags"], vec![None, None]).is_none());
    }

    #[tokio::test]
    async fn test_get_features_live() {
        use redis::AsyncCommands;
        let Ok(uri) = std::env::var("REDIS_URI") else {
            return;
        };
        let connector = RedisConnector::new(uri).unwrap();
        let mut conn = connector.get_connection().await.unwrap();
        let _: () = conn
            .hset_multiple("fs_test_u1", &[("age", "30"), ("tags", "a,b")])
            .await
            .unwrap();

        let dao = FeatureViewRedisDao::new(config("fs_test_"), connector);
        let keys = [FeatureValue::from("u1"), FeatureValue::from("missing")];
        let fields: Vec<String> = vec!["user_id".into(), "age".into(), "tags".into()];
        let rows = dao.get_features(&keys, &fields).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["age"], FeatureValue::Int64(30));
        assert_eq!(
            rows[0]["tags"],
            FeatureValue::StringArray(vec!["a".into(), "b".into()])
        );
        let _: () = conn.del("fs_test_u1").await.unwrap();
    }
}
