pub mod codec;
pub mod record_block;

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::Arc,
};

use async_trait::async_trait;
use chrono::Utc;
use futures::future::{join_all, try_join_all};
use log::{error, warn};
use reqwest::{
    header::{AUTHORIZATION, CONTENT_TYPE},
    StatusCode,
};
use serde::Serialize;

use self::{
    codec::{decode_record, split_frames},
    record_block::{root_as_kkv_record_block, root_as_record_block},
};
use super::{
    batches,
    sequence::{
        behavior_row_kept, filter_events, make_play_time_map, make_sequence_features,
        SequenceInfo,
    },
    DaoConfig, FeatureViewDao,
};
use crate::{
    error::{FeatureStoreError, Result},
    feature::{DeduplicationMethod, SeqConfig, SequenceConfig},
    infra::{ConnectionRegistry, FeatureDbClient},
    FeatureValue, Row,
};

const MISSING_LOGIN: &str = "FeatureStore DB username and password are not entered, please enter them by adding client.LoginFeatureStoreDB(username, password)";
const MISSING_DATASOURCE: &str = "FeatureDB datasource has not been created";

/// Separates the user id from the event in sequence keys, and the item id
/// from the timestamp in sort keys.
const GROUP_SEPARATOR: char = '\u{1D}';

const MIN_BATCH_SIZE: usize = 200;
const MAX_BATCH_SIZE: usize = 500;

#[derive(Serialize)]
struct BatchGetKkvRequest<'a> {
    pks: &'a [String],
    length: usize,
    with_value: bool,
}

#[derive(Serialize)]
struct ScanKkvRequest<'a> {
    prefixs: &'a [String],
    length: usize,
    with_value: bool,
}

/// Connection and credentials resolved for one call.
struct Session {
    client: Arc<FeatureDbClient>,
    signature: String,
}

/// Reads FeatureDB tables over HTTP.
///
/// The client and the login signature are looked up in the registry on every
/// call so that a login performed after the project was loaded takes effect.
#[derive(Debug)]
pub struct FeatureViewFeatureDbDao {
    registry: Arc<ConnectionRegistry>,
    config: DaoConfig,
}

impl FeatureViewFeatureDbDao {
    pub fn new(config: DaoConfig, registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry, config }
    }

    fn session(&self) -> Result<Session> {
        let signature = self
            .registry
            .feature_db_signature()
            .filter(|s| !s.is_empty())
            .ok_or_else(|| FeatureStoreError::config(MISSING_LOGIN))?;
        let client = self
            .registry
            .feature_db_client()
            .filter(|c| !c.current_address(false).is_empty() && !c.token().is_empty())
            .ok_or_else(|| FeatureStoreError::config(MISSING_DATASOURCE))?;
        Ok(Session { client, signature })
    }

    fn table_url(&self, address: &str, endpoint: &str) -> String {
        format!(
            "{address}/api/v1/tables/{}/{}/{}/{endpoint}",
            self.config.feature_db_database, self.config.feature_db_schema, self.config.table_name
        )
    }

    /// POSTs `body` to a table endpoint, retrying once on the public address
    /// when the request cannot be sent. `None` when the server answered with
    /// anything but 200.
    async fn post<T: Serialize + Sync + ?Sized>(
        &self,
        session: &Session,
        endpoint: &str,
        body: &T,
    ) -> Result<Option<Vec<u8>>> {
        let send = |address: String| {
            session
                .client
                .http()
                .post(self.table_url(&address, endpoint))
                .header(CONTENT_TYPE, "application/json")
                .header(AUTHORIZATION, session.client.token())
                .header("Auth", &session.signature)
                .json(body)
                .send()
        };
        let response = match send(session.client.current_address(false)).await {
            Ok(response) => response,
            Err(e) => {
                warn!("FeatureDB request to {endpoint} failed, retrying: {e}");
                send(session.client.current_address(true)).await?
            }
        };

        let status = response.status();
        let body = response.bytes().await?;
        if status != StatusCode::OK {
            let message = serde_json::from_slice::<serde_json::Value>(&body)
                .ok()
                .and_then(|v| v.get("message").cloned());
            match message {
                Some(message) => warn!("StatusCode: {status}, Response message: {message}"),
                None => warn!("StatusCode: {status}, request to {endpoint} failed"),
            }
            return Ok(None);
        }
        Ok(Some(body.to_vec()))
    }

    async fn fetch_batch(
        &self,
        session: &Session,
        keys: &[FeatureValue],
        selected: &HashSet<&str>,
    ) -> Result<Vec<Row>> {
        let pkeys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        let endpoint = format!("batch_get_kv2?batch_size={}&encoder=", pkeys.len());
        let body = serde_json::json!({ "keys": pkeys });
        match self.post(session, &endpoint, &body).await? {
            Some(body) => self.parse_records(&body, keys, selected),
            None => Ok(Vec::new()),
        }
    }

    /// Values come back in request order, one per key, across as many frames
    /// as the server chose to send.
    fn parse_records(
        &self,
        body: &[u8],
        keys: &[FeatureValue],
        selected: &HashSet<&str>,
    ) -> Result<Vec<Row>> {
        let mut rows = Vec::with_capacity(keys.len());
        let mut key_start = 0;
        for frame in split_frames(body)? {
            let block = root_as_record_block(frame)?;
            let Some(values) = block.values() else {
                continue;
            };
            for (i, column) in values.iter().enumerate() {
                if let Some(mut row) = decode_record(column.value(), &self.config.fields, selected)? {
                    if let Some(key) = keys.get(key_start + i) {
                        row.insert(self.config.primary_key_field.clone(), key.clone());
                    }
                    rows.push(row);
                }
            }
            key_start += values.len();
        }
        Ok(rows)
    }

    async fn fetch_sequence(
        &self,
        session: &Session,
        key: &FeatureValue,
        seq_event: &str,
        length: usize,
        sequence_config: &SequenceConfig,
    ) -> Result<Vec<SequenceInfo>> {
        let pks: Vec<String> = seq_event
            .split('|')
            .map(|event| format!("{key}{GROUP_SEPARATOR}{event}"))
            .collect();
        let request = BatchGetKkvRequest {
            pks: &pks,
            length,
            with_value: false,
        };
        match self.post(session, "batch_get_kkv", &request).await? {
            Some(body) => parse_sequences(&body, sequence_config),
            None => Ok(Vec::new()),
        }
    }

    async fn fetch_behavior(
        &self,
        session: &Session,
        user_id: &FeatureValue,
        events: &[String],
        selected: &HashSet<&str>,
    ) -> Result<Vec<Row>> {
        let body = if events.is_empty() {
            let prefixs = vec![format!("{user_id}{GROUP_SEPARATOR}")];
            let request = ScanKkvRequest {
                prefixs: &prefixs,
                length: 0,
                with_value: true,
            };
            self.post(session, "scan_kkv", &request).await?
        } else {
            let pks: Vec<String> = events
                .iter()
                .map(|event| format!("{user_id}{GROUP_SEPARATOR}{event}"))
                .collect();
            let request = BatchGetKkvRequest {
                pks: &pks,
                length: 0,
                with_value: true,
            };
            self.post(session, "batch_get_kkv", &request).await?
        };
        match body {
            Some(body) => self.parse_behaviors(&body, selected),
            None => Ok(Vec::new()),
        }
    }

    fn parse_behaviors(&self, body: &[u8], selected: &HashSet<&str>) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        for frame in split_frames(body)? {
            let block = root_as_kkv_record_block(frame)?;
            for kkv in block.values().into_iter().flatten() {
                if let Some(row) = decode_record(kkv.value(), &self.config.fields, selected)? {
                    rows.push(row);
                }
            }
        }
        Ok(rows)
    }
}

/// Turns KKV rows into events. Rows whose keys do not split into the
/// expected parts are ignored.
fn parse_sequences(body: &[u8], sequence_config: &SequenceConfig) -> Result<Vec<SequenceInfo>> {
    let mut sequences = Vec::new();
    for frame in split_frames(body)? {
        let block = root_as_kkv_record_block(frame)?;
        for kkv in block.values().into_iter().flatten() {
            let pk = String::from_utf8_lossy(kkv.pk());
            let Some((_, event)) = pk.split_once(GROUP_SEPARATOR) else {
                continue;
            };
            if event.contains(GROUP_SEPARATOR) {
                continue;
            }
            let sk = String::from_utf8_lossy(kkv.sk());
            let item_id = match sequence_config.deduplication {
                DeduplicationMethod::ItemId => sk.as_ref(),
                DeduplicationMethod::ItemIdTimestamp => match sk.split_once(GROUP_SEPARATOR) {
                    Some((item_id, ts)) if !ts.contains(GROUP_SEPARATOR) => item_id,
                    _ => continue,
                },
            };
            sequences.push(SequenceInfo::new(
                item_id,
                event,
                kkv.play_time(),
                kkv.event_timestamp(),
            ));
        }
    }
    Ok(sequences)
}

#[async_trait]
impl FeatureViewDao for FeatureViewFeatureDbDao {
    async fn get_features(
        &self,
        keys: &[FeatureValue],
        select_fields: &[String],
    ) -> Result<Vec<Row>> {
        let session = self.session()?;
        let batch_size = (keys.len() / 4).clamp(MIN_BATCH_SIZE, MAX_BATCH_SIZE);
        let selected: HashSet<&str> = select_fields.iter().map(String::as_str).collect();
        let per_batch = try_join_all(
            batches(keys, batch_size).map(|batch| self.fetch_batch(&session, batch, &selected)),
        )
        .await?;
        Ok(per_batch.into_iter().flatten().collect())
    }

    /// FeatureDB merges the online and offline events itself, so every group
    /// of configs sharing the same events is served by a single request sized
    /// for the longest of them.
    async fn get_user_sequence_feature(
        &self,
        keys: &[FeatureValue],
        user_id_field: &str,
        sequence_config: &SequenceConfig,
        seq_configs: &[SeqConfig],
    ) -> Result<Vec<Row>> {
        let session = self.session()?;
        let now = Utc::now().timestamp();
        let play_time_map = make_play_time_map(&sequence_config.play_time_filter);
        let mut groups: BTreeMap<&str, Vec<&SeqConfig>> = BTreeMap::new();
        for seq_config in seq_configs {
            groups
                .entry(seq_config.seq_event.as_str())
                .or_default()
                .push(seq_config);
        }

        let session = &session;
        let play_time_map = &play_time_map;
        let groups = &groups;
        try_join_all(keys.iter().map(|key| async move {
            let per_group = try_join_all(groups.iter().map(|(seq_event, configs)| async move {
                let max_len = configs.iter().map(|c| c.seq_len).max().unwrap_or_default();
                let events = self
                    .fetch_sequence(session, key, seq_event, max_len, sequence_config)
                    .await?;
                let events = filter_events(events, play_time_map);
                Ok::<_, FeatureStoreError>(
                    configs
                        .iter()
                        .map(|seq_config| {
                            make_sequence_features(
                                Vec::new(),
                                events.clone(),
                                seq_config,
                                sequence_config,
                                now,
                            )
                        })
                        .collect::<Vec<_>>(),
                )
            }))
            .await?;
            let mut properties: Row = per_group.into_iter().flatten().flatten().collect();
            properties.insert(user_id_field.to_string(), key.clone());
            Ok::<_, FeatureStoreError>(properties)
        }))
        .await
    }

    async fn get_user_behavior_feature(
        &self,
        user_ids: &[FeatureValue],
        events: &[String],
        select_fields: &[String],
        sequence_config: &SequenceConfig,
    ) -> Result<Vec<Row>> {
        let session = self.session()?;
        let selected: HashSet<&str> = select_fields.iter().map(String::as_str).collect();
        let play_time_map: HashMap<String, f64> =
            make_play_time_map(&sequence_config.play_time_filter);
        let per_user = join_all(user_ids.iter().map(|user_id| {
            let (session, selected) = (&session, &selected);
            async move {
                self.fetch_behavior(session, user_id, events, selected)
                    .await
                    .unwrap_or_else(|e| {
                        error!("get behavior features of {user_id} from FeatureDB failed: {e}");
                        Vec::new()
                    })
            }
        }))
        .await;
        Ok(per_user
            .into_iter()
            .flatten()
            .filter(|row| behavior_row_kept(row, sequence_config, &play_time_map))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::{
        codec::tests::F1Writer,
        record_block::builder::{kkv_record_block_frame, record_block_frame, Kkv},
        *,
    };
    use crate::{
        feature::{DatasourceType, FieldType},
        fields,
    };

    fn dao(registry: Arc<ConnectionRegistry>) -> FeatureViewFeatureDbDao {
        with_schema(
            registry,
            fields![("age", FieldType::Int64), ("city", FieldType::String)],
        )
    }

    fn behavior_dao() -> FeatureViewFeatureDbDao {
        with_schema(
            Arc::new(ConnectionRegistry::new()),
            fields![
                ("user_id", FieldType::String, is_primary_key),
                ("age", FieldType::Int64),
                ("city", FieldType::String),
            ],
        )
    }

    fn with_schema(
        registry: Arc<ConnectionRegistry>,
        schema: Vec<crate::feature::FeatureViewField>,
    ) -> FeatureViewFeatureDbDao {
        let mut config = DaoConfig::new(DatasourceType::FeatureDB, "").with_fields(&schema);
        config.table_name = "user_fea".into();
        config.primary_key_field = "user_id".into();
        config.feature_db_database = "fs_db".into();
        config.feature_db_schema = "fs_project".into();
        FeatureViewFeatureDbDao::new(config, registry)
    }

    #[tokio::test]
    async fn test_credentials_checked_first() {
        let registry = Arc::new(ConnectionRegistry::new());
        let dao = dao(registry.clone());
        let keys = [FeatureValue::from("u1")];
        let err = dao.get_features(&keys, &[]).await.unwrap_err();
        assert_eq!(err.to_string(), MISSING_LOGIN);

        registry.login_feature_db("user", "pass");
        let err = dao.get_features(&keys, &[]).await.unwrap_err();
        assert_eq!(err.to_string(), MISSING_DATASOURCE);

        registry.set_feature_db_client(Arc::new(
            FeatureDbClient::new("http://127.0.0.1:1", "", "").unwrap(),
        ));
        assert!(matches!(
            dao.get_features(&keys, &[]).await,
            Err(FeatureStoreError::Config(_))
        ));
    }

    #[test]
    fn test_table_url() {
        let dao = dao(Arc::new(ConnectionRegistry::new()));
        assert_eq!(
            dao.table_url("http://fdb", "batch_get_kv2?batch_size=2&encoder="),
            "http://fdb/api/v1/tables/fs_db/fs_project/user_fea/batch_get_kv2?batch_size=2&encoder="
        );
    }

    #[test]
    fn test_parse_records_sets_primary_key() {
        let dao = dao(Arc::new(ConnectionRegistry::new()));
        let u1 = F1Writer::new().raw(&31i64.to_le_bytes()).string("hz").buf;
        let u3 = F1Writer::new().null().string("sh").buf;
        let mut body = record_block_frame(&[&u1, b""]);
        body.extend(record_block_frame(&[&u3]));

        let keys: Vec<FeatureValue> = ["u1", "u2", "u3"].into_iter().map(FeatureValue::from).collect();
        let selected: HashSet<&str> = ["user_id", "age", "city"].into_iter().collect();
        let rows = dao.parse_records(&body, &keys, &selected).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0]["user_id"], FeatureValue::from("u1"));
        assert_eq!(rows[0]["age"], FeatureValue::Int64(31));
        assert_eq!(rows[1]["user_id"], FeatureValue::from("u3"));
        assert_eq!(rows[1]["city"], FeatureValue::from("sh"));
        assert!(!rows[1].contains_key("age"));
    }

    #[test]
    fn test_parse_sequences() {
        let kkv = |pk, sk, ts| Kkv {
            pk,
            sk,
            value: b"",
            event_timestamp: ts,
            play_time: 3.0,
        };
        let body = kkv_record_block_frame(&[
            kkv("u1\u{1D}click", "i1\u{1D}100", 100),
            kkv("u1", "i2\u{1D}90", 90),
            kkv("u1\u{1D}click", "i3", 80),
        ]);

        let mut config = SequenceConfig {
            deduplication: DeduplicationMethod::ItemIdTimestamp,
            ..Default::default()
        };
        let events = parse_sequences(&body, &config).unwrap();
        assert_eq!(events, vec![SequenceInfo::new("i1", "click", 3.0, 100)]);

        config.deduplication = DeduplicationMethod::ItemId;
        let events = parse_sequences(&body, &config).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].item_id, "i1\u{1D}100");
        assert_eq!(events[1].item_id, "i3");
    }

    #[test]
    fn test_parse_behaviors() {
        let dao = behavior_dao();
        let value = F1Writer::new().string("u1").raw(&5i64.to_le_bytes()).null().buf;
        let body = kkv_record_block_frame(&[
            Kkv {
                pk: "u1\u{1D}click",
                sk: "i1",
                value: &value,
                event_timestamp: 100,
                play_time: 0.0,
            },
            Kkv {
                pk: "u1\u{1D}click",
                sk: "i2",
                value: b"",
                event_timestamp: 90,
                play_time: 0.0,
            },
        ]);
        let selected: HashSet<&str> = ["age"].into_iter().collect();
        let rows = dao.parse_behaviors(&body, &selected).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].len(), 1);
        assert_eq!(rows[0]["age"], FeatureValue::Int64(5));
    }
}
