//! Fakes shared by the unit tests.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use async_trait::async_trait;

use crate::{
    dao::FeatureViewDao,
    error::{FeatureStoreError, Result},
    feature::{DatasourceType, ProjectMeta, SeqConfig, SequenceConfig},
    infra::graph::{GraphClient, GraphReadResponse, GraphResultData},
    FeatureValue, Row,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn project_meta(datasource_type: DatasourceType) -> ProjectMeta {
    ProjectMeta {
        project_id: 1,
        project_name: "fs".into(),
        instance_id: "instance".into(),
        online_datasource_id: 1,
        online_datasource_type: datasource_type,
        online_datasource_name: "online".into(),
        offline_datasource_id: 0,
        feature_db_address: String::new(),
        feature_db_token: String::new(),
        feature_db_vpc_address: String::new(),
    }
}

/// Answers every query with the same records and remembers the queries.
#[derive(Debug, Default)]
pub struct FakeGraphClient {
    records: Vec<HashMap<String, serde_json::Value>>,
    queries: Mutex<Vec<String>>,
}

impl FakeGraphClient {
    pub fn with_records(records: Vec<HashMap<String, serde_json::Value>>) -> Self {
        Self {
            records,
            ..Default::default()
        }
    }

    pub fn queries(&self) -> Vec<String> {
        lock(&self.queries).clone()
    }
}

#[async_trait]
impl GraphClient for FakeGraphClient {
    async fn read(&self, query: &str) -> Result<GraphReadResponse> {
        lock(&self.queries).push(query.to_string());
        Ok(GraphReadResponse {
            result: vec![GraphResultData {
                data: self.records.clone(),
            }],
        })
    }
}

/// In-memory DAO. With a key field only rows whose key is requested come
/// back; without one every row is returned.
#[derive(Debug, Default)]
pub struct MockDao {
    rows: Vec<Row>,
    key_field: Option<String>,
    fail: bool,
    requested_keys: Mutex<Vec<Vec<FeatureValue>>>,
    selected_fields: Mutex<Vec<Vec<String>>>,
    sequence_calls: Mutex<usize>,
}

impl MockDao {
    pub fn with_rows(rows: Vec<Row>) -> Self {
        Self {
            rows,
            ..Default::default()
        }
    }

    pub fn keyed(key_field: &str, rows: Vec<Row>) -> Self {
        Self {
            rows,
            key_field: Some(key_field.to_string()),
            ..Default::default()
        }
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> usize {
        lock(&self.requested_keys).len()
    }

    pub fn requested_keys(&self) -> Vec<Vec<FeatureValue>> {
        lock(&self.requested_keys).clone()
    }

    pub fn selected_fields(&self) -> Vec<Vec<String>> {
        lock(&self.selected_fields).clone()
    }

    pub fn sequence_calls(&self) -> usize {
        *lock(&self.sequence_calls)
    }

    fn lookup(&self, keys: &[FeatureValue]) -> Result<Vec<Row>> {
        if self.fail {
            return Err(FeatureStoreError::Backend("backend unavailable".into()));
        }
        let Some(key_field) = &self.key_field else {
            return Ok(self.rows.clone());
        };
        Ok(self
            .rows
            .iter()
            .filter(|row| row.get(key_field).map_or(false, |key| keys.contains(key)))
            .cloned()
            .collect())
    }
}

#[async_trait]
impl FeatureViewDao for MockDao {
    async fn get_features(
        &self,
        keys: &[FeatureValue],
        select_fields: &[String],
    ) -> Result<Vec<Row>> {
        lock(&self.requested_keys).push(keys.to_vec());
        lock(&self.selected_fields).push(select_fields.to_vec());
        self.lookup(keys)
    }

    async fn get_user_sequence_feature(
        &self,
        keys: &[FeatureValue],
        _user_id_field: &str,
        _sequence_config: &SequenceConfig,
        _seq_configs: &[SeqConfig],
    ) -> Result<Vec<Row>> {
        *lock(&self.sequence_calls) += 1;
        self.lookup(keys)
    }

    async fn get_user_behavior_feature(
        &self,
        user_ids: &[FeatureValue],
        _events: &[String],
        select_fields: &[String],
        _sequence_config: &SequenceConfig,
    ) -> Result<Vec<Row>> {
        lock(&self.selected_fields).push(select_fields.to_vec());
        self.lookup(user_ids)
    }
}
