use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use futures::future::join_all;
use log::error;

use super::{
    sequence::{
        behavior_row_kept, collect_user_sequences, make_play_time_map, SequenceInfo,
        SequenceSource,
    },
    DaoConfig, FeatureViewDao,
};
use crate::{
    error::{FeatureStoreError, Result},
    feature::{DeduplicationMethod, FieldType, SeqConfig, SequenceConfig},
    infra::GraphClient,
    FeatureValue, Row,
};

/// Value given to numeric graph fields that cannot be parsed.
pub const NUMERIC_SENTINEL: i64 = -1024;

/// Query-string escaping of a graph key: spaces become `+`.
fn escape_key(key: &str) -> String {
    urlencoding::encode(key).replace("%20", "+")
}

#[derive(Debug)]
pub struct FeatureViewIGraphDao {
    client: Arc<dyn GraphClient>,
    config: DaoConfig,
    /// Feature view field name to the name stored in the graph.
    reverse_field_map: HashMap<String, String>,
}

impl FeatureViewIGraphDao {
    pub fn new(config: DaoConfig, client: Arc<dyn GraphClient>) -> Self {
        let reverse_field_map = config
            .field_map
            .iter()
            .map(|(graph_name, name)| (name.clone(), graph_name.clone()))
            .collect();
        Self {
            client,
            config,
            reverse_field_map,
        }
    }

    fn graph_name<'a>(&'a self, field: &'a str) -> &'a str {
        self.reverse_field_map
            .get(field)
            .map(String::as_str)
            .unwrap_or(field)
    }

    pub(crate) fn build_vertex_query(&self, keys: &[FeatureValue], select_fields: &[String]) -> String {
        let pkeys = keys
            .iter()
            .filter_map(FeatureValue::to_key_string)
            .map(|k| escape_key(&k))
            .collect::<Vec<_>>()
            .join(";");
        let mut query = format!(
            "g(\"{}\").V(\"{pkeys}\").hasLabel(\"{}\")",
            self.config.group_name, self.config.label_name
        );
        if self.config.field_map.len() != select_fields.len() {
            let selector = select_fields
                .iter()
                .map(|f| format!("\"{}\"", self.graph_name(f)))
                .collect::<Vec<_>>()
                .join(",");
            query.push_str(&format!(".fields({selector})"));
        }
        query
    }

    fn edge_keys(key: &FeatureValue, events: &[String]) -> String {
        events
            .iter()
            .map(|event| escape_key(&format!("{key}_{event}")))
            .collect::<Vec<_>>()
            .join(";")
    }

    pub(crate) fn build_edge_query(
        &self,
        key: &FeatureValue,
        events: &[String],
        fields: &[String],
        timestamp_field: &str,
        limit: Option<usize>,
    ) -> String {
        let mut query = format!(
            "g(\"{}\").E(\"{}\").hasLabel(\"{}\").fields(\"{}\").order().by(\"{timestamp_field}\",Order.decr)",
            self.config.group_name,
            Self::edge_keys(key, events),
            self.config.online_seq_table,
            fields.join(";"),
        );
        if let Some(limit) = limit {
            query.push_str(&format!(".limit({limit})"));
        }
        query
    }

    /// Coerces numeric fields, tolerating partially written vertices.
    fn coerce(&self, field: &str, value: serde_json::Value) -> FeatureValue {
        let value = FeatureValue::from(value);
        match self.config.field_type(field) {
            Some(FieldType::Double) | Some(FieldType::Float) => {
                value.coerce_float(NUMERIC_SENTINEL as f64)
            }
            Some(FieldType::Int32) | Some(FieldType::Int64) => value.coerce_int(NUMERIC_SENTINEL),
            _ => value,
        }
    }
}

#[async_trait]
impl FeatureViewDao for FeatureViewIGraphDao {
    async fn get_features(
        &self,
        keys: &[FeatureValue],
        select_fields: &[String],
    ) -> Result<Vec<Row>> {
        let query = self.build_vertex_query(keys, select_fields);
        let response = self.client.read(&query).await?;
        let mut result = Vec::with_capacity(keys.len());
        for data in response.result.into_iter().flat_map(|r| r.data) {
            let mut properties = Row::with_capacity(data.len());
            for (field, value) in data {
                if field == "label" {
                    continue;
                }
                let name = self
                    .config
                    .field_map
                    .get(&field)
                    .cloned()
                    .unwrap_or(field);
                let value = self.coerce(&name, value);
                properties.insert(name, value);
            }
            result.push(properties);
        }
        Ok(result)
    }

    async fn get_user_sequence_feature(
        &self,
        keys: &[FeatureValue],
        user_id_field: &str,
        sequence_config: &SequenceConfig,
        seq_configs: &[SeqConfig],
    ) -> Result<Vec<Row>> {
        Ok(collect_user_sequences(self, keys, user_id_field, sequence_config, seq_configs).await)
    }

    async fn get_user_behavior_feature(
        &self,
        user_ids: &[FeatureValue],
        events: &[String],
        select_fields: &[String],
        sequence_config: &SequenceConfig,
    ) -> Result<Vec<Row>> {
        if events.is_empty() {
            return Err(FeatureStoreError::Unsupported(
                "igraph not support GetBehaviorFeatures with empty events".into(),
            ));
        }
        let play_time_map = make_play_time_map(&sequence_config.play_time_filter);
        let pk_event_field = format!(
            "{}_{}",
            self.config.primary_key_field, sequence_config.event_field
        );
        let item_ts_field = format!(
            "{}_{}",
            sequence_config.item_id_field, sequence_config.timestamp_field
        );
        let skipped = |field: &str| {
            field == "label"
                || field == pk_event_field
                || (sequence_config.deduplication == DeduplicationMethod::ItemIdTimestamp
                    && field == item_ts_field)
        };

        let per_user = join_all(user_ids.iter().map(|user_id| {
            let query = self.build_edge_query(
                user_id,
                events,
                select_fields,
                &sequence_config.timestamp_field,
                None,
            );
            let skipped = &skipped;
            let play_time_map = &play_time_map;
            async move {
                let response = match self.client.read(&query).await {
                    Ok(response) => response,
                    Err(e) => {
                        error!("get user behavior feature for {user_id} failed: {e}");
                        return Vec::new();
                    }
                };
                response
                    .result
                    .into_iter()
                    .flat_map(|r| r.data)
                    .map(|data| {
                        data.into_iter()
                            .filter(|(field, _)| !skipped(field))
                            .map(|(field, value)| {
                                let value = self.coerce(&field, value);
                                (field, value)
                            })
                            .collect::<Row>()
                    })
                    .filter(|row| behavior_row_kept(row, sequence_config, play_time_map))
                    .collect::<Vec<_>>()
            }
        }))
        .await;
        Ok(per_user.into_iter().flatten().collect())
    }
}

#[async_trait]
impl SequenceSource for FeatureViewIGraphDao {
    /// Graph sequences live on a single edge table, so only the online side
    /// yields events.
    async fn fetch_events(
        &self,
        key: &FeatureValue,
        _user_id_field: &str,
        seq_config: &SeqConfig,
        sequence_config: &SequenceConfig,
        online: bool,
    ) -> Result<Vec<SequenceInfo>> {
        if !online {
            return Ok(Vec::new());
        }
        let mut fields = vec![
            sequence_config.item_id_field.clone(),
            sequence_config.event_field.clone(),
        ];
        if !sequence_config.play_time_field.is_empty() {
            fields.push(sequence_config.play_time_field.clone());
        }
        fields.push(sequence_config.timestamp_field.clone());
        let query = self.build_edge_query(
            key,
            &seq_config.events(),
            &fields,
            &sequence_config.timestamp_field,
            Some(seq_config.seq_len),
        );
        let response = self.client.read(&query).await?;
        Ok(response
            .result
            .into_iter()
            .flat_map(|r| r.data)
            .map(|data| {
                let mut seq = SequenceInfo::default();
                for (field, value) in data {
                    let value = FeatureValue::from(value);
                    if field == sequence_config.event_field {
                        seq.event = value.to_string();
                    } else if field == sequence_config.item_id_field {
                        seq.item_id = value.to_string();
                    } else if field == sequence_config.play_time_field {
                        seq.play_time = value.as_f64().unwrap_or(0.0);
                    } else if field == sequence_config.timestamp_field {
                        seq.timestamp = value.as_i64().unwrap_or(0);
                    }
                }
                seq
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::{feature::DatasourceType, fields, testing::FakeGraphClient};

    fn config() -> DaoConfig {
        let mut config = DaoConfig::new(DatasourceType::IGraph, "graph").with_fields(&fields![
            ("user_id", FieldType::String, is_primary_key),
            ("age", FieldType::Int32),
            ("score", FieldType::Double),
            ("city", FieldType::String),
        ]);
        config.group_name = "fs_project".into();
        config.label_name = "user_fea".into();
        config.primary_key_field = "user_id".into();
        config.online_seq_table = "fs_project_seq_seq".into();
        config.field_map = HashMap::from([
            ("f1".to_string(), "user_id".to_string()),
            ("f2".to_string(), "age".to_string()),
            ("f3".to_string(), "score".to_string()),
            ("f4".to_string(), "city".to_string()),
        ]);
        config
    }

    #[test]
    fn test_build_vertex_query() {
        let client = Arc::new(FakeGraphClient::default());
        let dao = FeatureViewIGraphDao::new(config(), client);
        let keys = vec![
            FeatureValue::from("u 1"),
            FeatureValue::from(""),
            FeatureValue::from("u2"),
        ];
        let fields: Vec<String> = vec!["user_id".into(), "age".into()];
        assert_eq!(
            dao.build_vertex_query(&keys, &fields),
            r#"g("fs_project").V("u+1;u2").hasLabel("user_fea").fields("f1","f2")"#
        );
        let all: Vec<String> = vec!["user_id".into(), "age".into(), "score".into(), "city".into()];
        assert_eq!(
            dao.build_vertex_query(&keys[2..], &all),
            r#"g("fs_project").V("u2").hasLabel("user_fea")"#
        );
    }

    #[tokio::test]
    async fn test_get_features_coerces_numbers() {
        let client = Arc::new(FakeGraphClient::with_records(vec![HashMap::from([
            ("label".to_string(), json!("user_fea")),
            ("f1".to_string(), json!("u1")),
            ("f2".to_string(), json!("n/a")),
            ("f3".to_string(), json!("2.5")),
            ("f4".to_string(), json!("hz")),
        ])]));
        let dao = FeatureViewIGraphDao::new(config(), client.clone());
        let rows = dao
            .get_features(&[FeatureValue::from("u1")], &["age".to_string()])
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert!(!row.contains_key("label"));
        assert_eq!(row["user_id"], FeatureValue::from("u1"));
        assert_eq!(row["age"], FeatureValue::Int64(NUMERIC_SENTINEL));
        assert_eq!(row["score"], FeatureValue::Double(2.5));
        assert_eq!(row["city"], FeatureValue::from("hz"));
        assert_eq!(client.queries().len(), 1);
    }

    #[test]
    fn test_escape_key() {
        assert_eq!(escape_key("a b+c"), "a+b%2Bc");
        assert_eq!(escape_key("u1;x/y"), "u1%3Bx%2Fy");
        assert_eq!(escape_key("v-1_2.3~"), "v-1_2.3~");
    }

    #[test]
    fn test_build_edge_query() {
        let dao = FeatureViewIGraphDao::new(config(), Arc::new(FakeGraphClient::default()));
        let query = dao.build_edge_query(
            &FeatureValue::from("u1"),
            &["click".to_string(), "like".to_string()],
            &["item_id".to_string(), "event".to_string(), "ts".to_string()],
            "ts",
            Some(50),
        );
        assert_eq!(
            query,
            r#"g("fs_project").E("u1_click;u1_like").hasLabel("fs_project_seq_seq").fields("item_id;event;ts").order().by("ts",Order.decr).limit(50)"#
        );
    }

    #[tokio::test]
    async fn test_behavior_requires_events() {
        let dao = FeatureViewIGraphDao::new(config(), Arc::new(FakeGraphClient::default()));
        let err = dao
            .get_user_behavior_feature(
                &[FeatureValue::from("u1")],
                &[],
                &[],
                &SequenceConfig::default(),
            )
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "igraph not support GetBehaviorFeatures with empty events"
        );
    }

    #[tokio::test]
    async fn test_behavior_skips_key_fields() {
        let client = Arc::new(FakeGraphClient::with_records(vec![HashMap::from([
            ("label".to_string(), json!("edge")),
            ("user_id_event".to_string(), json!("u1_click")),
            ("item_id".to_string(), json!("i1")),
            ("event".to_string(), json!("click")),
            ("ts".to_string(), json!(100)),
        ])]));
        let dao = FeatureViewIGraphDao::new(config(), client);
        let sequence_config = SequenceConfig {
            item_id_field: "item_id".into(),
            event_field: "event".into(),
            timestamp_field: "ts".into(),
            ..Default::default()
        };
        let rows = dao
            .get_user_behavior_feature(
                &[FeatureValue::from("u1")],
                &["click".to_string()],
                &["item_id".to_string(), "event".to_string(), "ts".to_string()],
                &sequence_config,
            )
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].len(), 3);
        assert_eq!(rows[0]["item_id"], FeatureValue::from("i1"));
    }
}
