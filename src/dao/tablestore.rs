use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use log::{error, warn};

use super::{
    batches,
    sequence::{
        behavior_row_kept, collect_user_sequences, combine_behavior_features, filter_events,
        make_play_time_map, SequenceInfo, SequenceSource, ONLINE_SEQUENCE_WINDOW_SECS,
    },
    DaoConfig, FeatureViewDao,
};
use crate::{
    error::{FeatureStoreError, Result},
    feature::{parse_timestamp, DeduplicationMethod, FieldType, SeqConfig, SequenceConfig},
    infra::{
        wide_column::{
            BatchGetRowRequest, GetRangeRequest, PrimaryKey, PrimaryKeyColumn, PrimaryKeyValue,
            RowResult,
        },
        WideColumnClient,
    },
    FeatureValue, Row,
};

pub const TABLESTORE_BATCH_SIZE: usize = 100;

/// Table access shared by the batching and the single-request DAO.
#[derive(Debug)]
struct WideColumnTable {
    client: Arc<dyn WideColumnClient>,
    config: DaoConfig,
    /// Store name used in error messages.
    store: &'static str,
}

impl WideColumnTable {
    fn primary_key(&self, key: &FeatureValue) -> Result<PrimaryKey> {
        let pk = &self.config.primary_key_field;
        let value = match self.config.field_type(pk) {
            Some(FieldType::Int64) | Some(FieldType::Int32) => {
                PrimaryKeyValue::Int64(key.as_i64().unwrap_or_default())
            }
            Some(FieldType::String) => PrimaryKeyValue::String(key.to_string()),
            _ => {
                return Err(FeatureStoreError::config(format!(
                    "primary key type is not supported by {}",
                    self.store
                )))
            }
        };
        Ok(vec![PrimaryKeyColumn::new(pk, value)])
    }

    /// `None` for rows the store reports without a primary key, i.e. keys that
    /// do not exist.
    fn to_row(&self, row: RowResult) -> Result<Option<Row>> {
        if let Some(message) = row.error_message.filter(|m| !m.is_empty()) {
            return Err(FeatureStoreError::RowError(message));
        }
        if row.primary_key.is_empty() {
            return Ok(None);
        }
        let mut properties: Row = row.primary_key.into_iter().collect();
        for (name, value) in row.columns {
            let value = match (self.config.field_type(&name), value) {
                (Some(FieldType::Timestamp), FeatureValue::String(raw)) => {
                    match parse_timestamp(&raw) {
                        Some(t) => FeatureValue::Timestamp(t),
                        None => {
                            warn!("parse timestamp column {name} failed: {raw}");
                            FeatureValue::String(raw)
                        }
                    }
                }
                (_, value) => value,
            };
            properties.insert(name, value);
        }
        Ok(Some(properties))
    }

    async fn batch_get(&self, keys: &[FeatureValue], select_fields: &[String]) -> Result<Vec<Row>> {
        let rows = keys
            .iter()
            .map(|key| self.primary_key(key))
            .collect::<Result<Vec<_>>>()?;
        let results = self
            .client
            .batch_get_row(BatchGetRowRequest {
                table: self.config.table_name.clone(),
                rows,
                columns_to_get: select_fields.to_vec(),
                max_version: 1,
            })
            .await?;
        let mut output = Vec::with_capacity(results.len());
        for row in results {
            if let Some(row) = self.to_row(row)? {
                output.push(row);
            }
        }
        Ok(output)
    }

    /// Reads every version-filtered row between `start` and `end`, following
    /// the continuation key.
    async fn scan(&self, mut request: GetRangeRequest) -> Result<Vec<RowResult>> {
        let mut rows = Vec::new();
        loop {
            let response = self.client.get_range(request.clone()).await?;
            rows.extend(response.rows);
            match response.next_start_primary_key {
                Some(next) => request.start_primary_key = next,
                None => return Ok(rows),
            }
        }
    }

    fn sort_key_field(&self, sequence_config: &SequenceConfig) -> String {
        match sequence_config.deduplication {
            DeduplicationMethod::ItemId => sequence_config.item_id_field.clone(),
            DeduplicationMethod::ItemIdTimestamp => format!(
                "{}_{}",
                sequence_config.item_id_field, sequence_config.timestamp_field
            ),
        }
    }

    fn range_request(
        &self,
        pk_field: &str,
        start: String,
        end: String,
        sort_key_field: &str,
        columns_to_get: Vec<String>,
        online: bool,
    ) -> GetRangeRequest {
        let now = Utc::now().timestamp();
        GetRangeRequest {
            table: self.seq_table(online).to_string(),
            start_primary_key: vec![
                PrimaryKeyColumn::new(pk_field, PrimaryKeyValue::String(start)),
                PrimaryKeyColumn::new(sort_key_field, PrimaryKeyValue::Min),
            ],
            end_primary_key: vec![
                PrimaryKeyColumn::new(pk_field, PrimaryKeyValue::String(end)),
                PrimaryKeyColumn::new(sort_key_field, PrimaryKeyValue::Max),
            ],
            columns_to_get,
            time_range: online.then(|| ((now - ONLINE_SEQUENCE_WINDOW_SECS) * 1000, now * 1000)),
            max_version: (!online).then_some(1),
        }
    }

    fn seq_table(&self, online: bool) -> &str {
        if online {
            &self.config.online_seq_table
        } else {
            &self.config.offline_seq_table
        }
    }
}

/// Sort-key value of a sequence row, which is the item id when events are
/// deduplicated by item id alone.
fn sort_key_value(row: &RowResult) -> Option<&FeatureValue> {
    row.primary_key.get(1).map(|(_, value)| value)
}

/// Splits keys into batches of [TABLESTORE_BATCH_SIZE] read concurrently. A
/// failed batch is logged and contributes no rows.
#[derive(Debug)]
pub struct FeatureViewTableStoreDao {
    table: WideColumnTable,
}

impl FeatureViewTableStoreDao {
    pub fn new(config: DaoConfig, client: Arc<dyn WideColumnClient>) -> Self {
        Self {
            table: WideColumnTable {
                client,
                config,
                store: "TableStore",
            },
        }
    }
}

#[async_trait]
impl FeatureViewDao for FeatureViewTableStoreDao {
    async fn get_features(
        &self,
        keys: &[FeatureValue],
        select_fields: &[String],
    ) -> Result<Vec<Row>> {
        // key type problems are configuration errors, not per batch failures
        if let Some(key) = keys.first() {
            self.table.primary_key(key)?;
        }
        let results = join_all(
            batches(keys, TABLESTORE_BATCH_SIZE).map(|ks| self.table.batch_get(ks, select_fields)),
        )
        .await;
        let mut output = Vec::with_capacity(keys.len());
        for result in results {
            match result {
                Ok(rows) => output.extend(rows),
                Err(e @ FeatureStoreError::RowError(_)) => return Err(e),
                Err(e) => error!("tablestore batch get row failed: {e}"),
            }
        }
        Ok(output)
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
        let table = &self.table;
        let play_time_map = make_play_time_map(&sequence_config.play_time_filter);
        let pk_field = format!(
            "{}_{}",
            table.config.primary_key_field, sequence_config.event_field
        );
        let sort_key_field = table.sort_key_field(sequence_config);
        let ts_field = &sequence_config.timestamp_field;

        let fetch = |user_id: String, event: Option<String>, online: bool| {
            let (start, end) = match &event {
                Some(event) => (format!("{user_id}_{event}"), format!("{user_id}_{event}")),
                None => (user_id.clone(), format!("{user_id}a")),
            };
            let request = table.range_request(
                &pk_field,
                start,
                end,
                &sort_key_field,
                select_fields.to_vec(),
                online,
            );
            let play_time_map = &play_time_map;
            async move {
                let rows = table.scan(request).await?;
                Ok::<_, FeatureStoreError>(
                    rows.into_iter()
                        .filter(|row| !row.primary_key.is_empty())
                        .map(|row| {
                            let mut properties = Row::new();
                            if sequence_config.deduplication == DeduplicationMethod::ItemId {
                                if let Some(item) = sort_key_value(&row) {
                                    properties
                                        .insert(sequence_config.item_id_field.clone(), item.clone());
                                }
                            }
                            properties.extend(row.columns);
                            properties
                        })
                        .filter(|row| behavior_row_kept(row, sequence_config, play_time_map))
                        .collect::<Vec<_>>(),
                )
            }
        };
        let fetch_combined = |user_id: String, event: Option<String>| {
            let fetch = &fetch;
            async move {
                match futures::join!(
                    fetch(user_id.clone(), event.clone(), false),
                    fetch(user_id.clone(), event, true)
                ) {
                    (Ok(offline), Ok(online)) => combine_behavior_features(offline, online, ts_field),
                    (Err(e), _) | (_, Err(e)) => {
                        error!("get user behavior feature for {user_id} failed: {e}");
                        Vec::new()
                    }
                }
            }
        };

        let per_user = join_all(user_ids.iter().map(|user_id| {
            let fetch_combined = &fetch_combined;
            async move {
                let user_id = user_id.to_string();
                let mut rows: Vec<Row> = if events.is_empty() {
                    fetch_combined(user_id, None).await
                } else {
                    join_all(
                        events
                            .iter()
                            .map(|event| fetch_combined(user_id.clone(), Some(event.clone()))),
                    )
                    .await
                    .into_iter()
                    .flatten()
                    .collect()
                };
                rows.sort_by_key(|row| {
                    std::cmp::Reverse(row.get(ts_field).and_then(FeatureValue::as_i64).unwrap_or(0))
                });
                rows
            }
        }))
        .await;
        Ok(per_user.into_iter().flatten().collect())
    }
}

#[async_trait]
impl SequenceSource for FeatureViewTableStoreDao {
    async fn fetch_events(
        &self,
        key: &FeatureValue,
        user_id_field: &str,
        seq_config: &SeqConfig,
        sequence_config: &SequenceConfig,
        online: bool,
    ) -> Result<Vec<SequenceInfo>> {
        let table = &self.table;
        let pk_field = format!("{user_id_field}_{}", sequence_config.event_field);
        let sort_key_field = table.sort_key_field(sequence_config);
        let mut columns = vec![
            sequence_config.item_id_field.clone(),
            sequence_config.event_field.clone(),
        ];
        if !sequence_config.play_time_field.is_empty() {
            columns.push(sequence_config.play_time_field.clone());
        }
        columns.push(sequence_config.timestamp_field.clone());

        let per_event = join_all(seq_config.events().into_iter().map(|event| {
            let pk = format!("{key}_{event}");
            let request = table.range_request(
                &pk_field,
                pk.clone(),
                pk,
                &sort_key_field,
                columns.clone(),
                online,
            );
            table.scan(request)
        }))
        .await;

        let mut events = Vec::new();
        for rows in per_event {
            for row in rows? {
                if row.primary_key.is_empty() {
                    continue;
                }
                let mut seq = SequenceInfo::default();
                if sequence_config.deduplication == DeduplicationMethod::ItemId {
                    if let Some(item) = sort_key_value(&row) {
                        seq.item_id = item.to_string();
                    }
                }
                for (name, value) in &row.columns {
                    if *name == sequence_config.event_field {
                        seq.event = value.to_string();
                    } else if *name == sequence_config.item_id_field {
                        seq.item_id = value.to_string();
                    } else if *name == sequence_config.play_time_field {
                        seq.play_time = value.as_f64().unwrap_or(0.0);
                    } else if *name == sequence_config.timestamp_field {
                        seq.timestamp = value.as_i64().unwrap_or(0);
                    }
                }
                events.push(seq);
            }
        }
        let mut events = filter_events(
            events,
            &make_play_time_map(&sequence_config.play_time_filter),
        );
        events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        events.truncate(seq_config.seq_len);
        Ok(events)
    }
}

/// Reads all keys with a single batched request and returns any failure.
#[derive(Debug)]
pub struct FeatureViewOtsDao {
    table: WideColumnTable,
}

impl FeatureViewOtsDao {
    pub fn new(config: DaoConfig, client: Arc<dyn WideColumnClient>) -> Self {
        Self {
            table: WideColumnTable {
                client,
                config,
                store: "OTS",
            },
        }
    }
}

#[async_trait]
impl FeatureViewDao for FeatureViewOtsDao {
    async fn get_features(
        &self,
        keys: &[FeatureValue],
        select_fields: &[String],
    ) -> Result<Vec<Row>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        self.table.batch_get(keys, select_fields).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        feature::DatasourceType,
        fields,
        infra::wide_column::GetRangeResponse,
    };
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct FakeTable {
        rows: Vec<RowResult>,
        batch_sizes: Mutex<Vec<usize>>,
        /// Pages served to range reads, keyed by the `pk` string.
        ranges: Vec<(String, Vec<RowResult>)>,
        range_calls: Mutex<usize>,
    }

    #[async_trait]
    impl WideColumnClient for FakeTable {
        async fn batch_get_row(&self, request: BatchGetRowRequest) -> Result<Vec<RowResult>> {
            self.batch_sizes.lock().unwrap().push(request.rows.len());
            let mut out = Vec::new();
            for pk in &request.rows {
                let wanted = match &pk[0].value {
                    PrimaryKeyValue::Int64(v) => FeatureValue::Int64(*v),
                    PrimaryKeyValue::String(s) => FeatureValue::String(s.clone()),
                    _ => continue,
                };
                match self.rows.iter().find(|r| r.primary_key[0].1 == wanted) {
                    Some(row) => out.push(row.clone()),
                    None => out.push(RowResult::default()),
                }
            }
            Ok(out)
        }

        async fn get_range(&self, request: GetRangeRequest) -> Result<GetRangeResponse> {
            *self.range_calls.lock().unwrap() += 1;
            let pk = match &request.start_primary_key[0].value {
                PrimaryKeyValue::String(s) => s.clone(),
                _ => String::new(),
            };
            let rows: Vec<RowResult> = self
                .ranges
                .iter()
                .filter(|(k, _)| *k == pk)
                .flat_map(|(_, rows)| rows.clone())
                .collect();
            // serve one row per page to exercise continuation
            let offset = match &request.start_primary_key[1].value {
                PrimaryKeyValue::Int64(i) => *i as usize,
                _ => 0,
            };
            let next = (offset + 1 < rows.len()).then(|| {
                vec![
                    request.start_primary_key[0].clone(),
                    PrimaryKeyColumn::new("sk", PrimaryKeyValue::Int64(offset as i64 + 1)),
                ]
            });
            Ok(GetRangeResponse {
                rows: rows.into_iter().skip(offset).take(1).collect(),
                next_start_primary_key: next,
            })
        }
    }

    fn user_row(id: i64, age: i32) -> RowResult {
        RowResult {
            primary_key: vec![("user_id".into(), FeatureValue::Int64(id))],
            columns: vec![
                ("age".into(), FeatureValue::Int32(age)),
                ("updated".into(), FeatureValue::from("2023-01-02 03:04:05")),
            ],
            error_message: None,
        }
    }

    fn config(pk_type: FieldType) -> DaoConfig {
        let mut config = DaoConfig::new(DatasourceType::TableStore, "ots").with_fields(&fields![
            ("user_id", pk_type, is_primary_key),
            ("age", FieldType::Int32),
            ("updated", FieldType::Timestamp),
        ]);
        config.table_name = "fs_user_online".into();
        config.primary_key_field = "user_id".into();
        config.online_seq_table = "fs_seq_seq".into();
        config.offline_seq_table = "fs_seq_seq_offline".into();
        config
    }

    #[tokio::test]
    async fn test_batched_get_features() {
        let fake = Arc::new(FakeTable {
            rows: (0..250).map(|i| user_row(i, i as i32)).collect(),
            ..Default::default()
        });
        let dao = FeatureViewTableStoreDao::new(config(FieldType::Int64), fake.clone());
        let mut keys: Vec<FeatureValue> = (0..240).map(FeatureValue::from).collect();
        keys.push(FeatureValue::from("7"));
        keys.push(FeatureValue::from(9999i64));
        let rows = dao
            .get_features(&keys, &["age".to_string(), "updated".to_string()])
            .await
            .unwrap();
        assert_eq!(rows.len(), 241);
        let mut sizes = fake.batch_sizes.lock().unwrap().clone();
        sizes.sort();
        assert_eq!(sizes, vec![42, 100, 100]);
        assert!(rows
            .iter()
            .all(|r| matches!(r["updated"], FeatureValue::Timestamp(_))));
    }

    #[tokio::test]
    async fn test_unsupported_primary_key_type() {
        let fake = Arc::new(FakeTable::default());
        let dao = FeatureViewTableStoreDao::new(config(FieldType::Double), fake.clone());
        let err = dao
            .get_features(&[FeatureValue::from(1.0)], &[])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "primary key type is not supported by TableStore");
        assert!(fake.batch_sizes.lock().unwrap().is_empty());

        let dao = FeatureViewOtsDao::new(config(FieldType::Double), fake.clone());
        let err = dao
            .get_features(&[FeatureValue::from(1.0)], &[])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "primary key type is not supported by OTS");
    }

    #[tokio::test]
    async fn test_row_error_is_returned() {
        let mut broken = user_row(1, 1);
        broken.error_message = Some("OTSRowOperationConflict".into());
        let fake = Arc::new(FakeTable {
            rows: vec![broken],
            ..Default::default()
        });
        let ots = FeatureViewOtsDao::new(config(FieldType::Int64), fake.clone());
        let err = ots
            .get_features(&[FeatureValue::from(1i64)], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, FeatureStoreError::RowError(m) if m == "OTSRowOperationConflict"));

        let batching = FeatureViewTableStoreDao::new(config(FieldType::Int64), fake);
        assert!(batching
            .get_features(&[FeatureValue::from(1i64)], &[])
            .await
            .is_err());
    }

    fn seq_row(item: &str, event: &str, ts: i64) -> RowResult {
        RowResult {
            primary_key: vec![
                ("user_id_event".into(), FeatureValue::from("u1_click")),
                ("item_id".into(), FeatureValue::from(item)),
            ],
            columns: vec![
                ("event".into(), FeatureValue::from(event)),
                ("ts".into(), FeatureValue::from(ts)),
            ],
            error_message: None,
        }
    }

    #[tokio::test]
    async fn test_fetch_sequence_events() {
        let fake = Arc::new(FakeTable {
            ranges: vec![(
                "u1_click".into(),
                vec![seq_row("a", "click", 10), seq_row("b", "click", 30), seq_row("c", "click", 20)],
            )],
            ..Default::default()
        });
        let dao = FeatureViewTableStoreDao::new(config(FieldType::String), fake.clone());
        let sequence_config = SequenceConfig {
            item_id_field: "item_id".into(),
            event_field: "event".into(),
            timestamp_field: "ts".into(),
            ..Default::default()
        };
        let seq_config = SeqConfig {
            seq_event: "click".into(),
            seq_len: 2,
            online_seq_name: "click_seq".into(),
            ..Default::default()
        };
        let events = dao
            .fetch_events(
                &FeatureValue::from("u1"),
                "user_id",
                &seq_config,
                &sequence_config,
                false,
            )
            .await
            .unwrap();
        let items: Vec<_> = events.iter().map(|e| e.item_id.as_str()).collect();
        assert_eq!(items, vec!["b", "c"]);
        assert_eq!(*fake.range_calls.lock().unwrap(), 3);
    }
}
