use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use futures::future::join_all;
use log::{debug, error, warn};
use tokio_postgres::types::ToSql;

use super::{
    sequence::{
        behavior_row_kept, collect_user_sequences, combine_behavior_features, make_play_time_map,
        SequenceInfo, SequenceSource, ONLINE_SEQUENCE_WINDOW_SECS,
    },
    DaoConfig, FeatureViewDao,
};
use crate::{
    error::Result,
    feature::{FieldType, SeqConfig, SequenceConfig},
    infra::HologresConnector,
    FeatureValue, Row,
};

/// A bound query parameter, typed after the column it is compared with.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum SqlParam {
    Int32(i32),
    Int64(i64),
    Float8(f64),
    Text(String),
}

impl SqlParam {
    fn as_sql(&self) -> &(dyn ToSql + Sync) {
        match self {
            SqlParam::Int32(v) => v,
            SqlParam::Int64(v) => v,
            SqlParam::Float8(v) => v,
            SqlParam::Text(v) => v,
        }
    }
}

/// Reads feature rows from a columnar-SQL store over the PostgreSQL protocol.
///
/// Prepared statements are bound to a connection, so they are cached by the
/// pool per connection (`prepare_cached`) rather than here.
#[derive(Debug)]
pub struct FeatureViewHologresDao {
    connector: HologresConnector,
    config: DaoConfig,
}

/// Oldest event time still served for a view with `ttl` seconds of retention.
pub fn ttl_cutoff(now: i64, ttl: i64) -> Option<i64> {
    (ttl > 0).then(|| now - ttl)
}

/// Inclusive lower bound: a row exactly `ttl` seconds old is still served.
pub fn is_within_ttl(event_time: i64, now: i64, ttl: i64) -> bool {
    ttl_cutoff(now, ttl).map_or(true, |cutoff| event_time >= cutoff)
}

pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("${i}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// Converts a key to the parameter type of the column it is compared with.
/// `None` when no value of that column can equal the key.
fn key_param(key: &FeatureValue, column_type: Option<FieldType>) -> Option<SqlParam> {
    match (column_type, key.as_i64()) {
        (Some(FieldType::Int64), Some(v)) => Some(SqlParam::Int64(v)),
        (Some(FieldType::Int32), Some(v)) => i32::try_from(v).ok().map(SqlParam::Int32),
        (Some(FieldType::Int32 | FieldType::Int64), None) => None,
        (Some(_), _) => Some(SqlParam::Text(key.to_string())),
        (None, _) => Some(match key {
            FeatureValue::Int32(v) => SqlParam::Int32(*v),
            FeatureValue::Int64(v) => SqlParam::Int64(*v),
            other => SqlParam::Text(other.to_string()),
        }),
    }
}

/// Epoch seconds compared with an integer time column. Saturates for `int4`.
fn seconds_param(seconds: i64, column_type: Option<FieldType>) -> SqlParam {
    match column_type {
        Some(FieldType::Int32) => {
            SqlParam::Int32(seconds.clamp(i32::MIN as i64, i32::MAX as i64) as i32)
        }
        _ => SqlParam::Int64(seconds),
    }
}

fn column_value(row: &tokio_postgres::Row, idx: usize) -> Option<FeatureValue> {
    let column = &row.columns()[idx];
    match column.type_().name() {
        "bool" => row.try_get::<_, Option<bool>>(idx).ok()?.map(FeatureValue::Bool),
        "int2" => row
            .try_get::<_, Option<i16>>(idx)
            .ok()?
            .map(|v| FeatureValue::Int32(v as i32)),
        "int4" => row.try_get::<_, Option<i32>>(idx).ok()?.map(FeatureValue::Int32),
        "int8" => row.try_get::<_, Option<i64>>(idx).ok()?.map(FeatureValue::Int64),
        "float4" => row.try_get::<_, Option<f32>>(idx).ok()?.map(FeatureValue::Float),
        "float8" => row.try_get::<_, Option<f64>>(idx).ok()?.map(FeatureValue::Double),
        "timestamp" => row
            .try_get::<_, Option<NaiveDateTime>>(idx)
            .ok()?
            .map(|t| FeatureValue::Timestamp(t.and_utc())),
        "timestamptz" => row
            .try_get::<_, Option<DateTime<Utc>>>(idx)
            .ok()?
            .map(FeatureValue::Timestamp),
        "_int4" => row
            .try_get::<_, Option<Vec<i32>>>(idx)
            .ok()?
            .map(FeatureValue::Int32Array),
        "_int8" => row
            .try_get::<_, Option<Vec<i64>>>(idx)
            .ok()?
            .map(FeatureValue::Int64Array),
        "_float4" => row
            .try_get::<_, Option<Vec<f32>>>(idx)
            .ok()?
            .map(FeatureValue::FloatArray),
        "_float8" => row
            .try_get::<_, Option<Vec<f64>>>(idx)
            .ok()?
            .map(FeatureValue::DoubleArray),
        "_text" | "_varchar" => row
            .try_get::<_, Option<Vec<String>>>(idx)
            .ok()?
            .map(FeatureValue::StringArray),
        other => match row.try_get::<_, Option<String>>(idx) {
            Ok(v) => v.map(FeatureValue::String),
            Err(e) => {
                warn!("unsupported column type {other} of {}: {e}", column.name());
                None
            }
        },
    }
}

/// Non-null columns of `row` keyed by column name.
fn to_row(row: &tokio_postgres::Row) -> Row {
    row.columns()
        .iter()
        .enumerate()
        .filter_map(|(idx, column)| column_value(row, idx).map(|v| (column.name().to_string(), v)))
        .collect()
}

impl FeatureViewHologresDao {
    pub fn new(config: DaoConfig, connector: HologresConnector) -> Self {
        Self { connector, config }
    }

    async fn query(&self, sql: String, params: Vec<SqlParam>) -> Result<Vec<tokio_postgres::Row>> {
        debug!("hologres query: {sql}");
        let client = self.connector.get().await?;
        let statement = client.prepare_cached(&sql).await?;
        let params: Vec<&(dyn ToSql + Sync)> = params.iter().map(SqlParam::as_sql).collect();
        Ok(client.query(&statement, &params).await?)
    }

    /// `SELECT .. WHERE pk IN (..) [AND event_time >= now - ttl]`. `None` when
    /// no key can match the primary key column.
    pub(crate) fn build_features_query(
        &self,
        keys: &[FeatureValue],
        select_fields: &[String],
        now: i64,
    ) -> Option<(String, Vec<SqlParam>)> {
        let selector = select_fields
            .iter()
            .map(|f| quote_ident(f))
            .collect::<Vec<_>>()
            .join(", ");
        let pk_type = self.config.field_type(&self.config.primary_key_field);
        let mut params: Vec<SqlParam> = keys
            .iter()
            .filter_map(|k| {
                let param = key_param(k, pk_type);
                if param.is_none() {
                    warn!("skip key {k}, it does not fit primary key type {pk_type:?}");
                }
                param
            })
            .collect();
        if params.is_empty() {
            return None;
        }
        let key_count = params.len();
        let mut sql = format!(
            "SELECT {selector} FROM {} WHERE {} IN ({})",
            self.config.table_name,
            quote_ident(&self.config.primary_key_field),
            placeholders(1, key_count)
        );
        if let Some(cutoff) = ttl_cutoff(now, self.config.ttl) {
            let event_time = quote_ident(&self.config.event_time_field);
            let idx = params.len() + 1;
            match self.config.field_type(&self.config.event_time_field) {
                column_type @ Some(FieldType::Int64 | FieldType::Int32) => {
                    sql.push_str(&format!(" AND {event_time} >= ${idx}"));
                    params.push(seconds_param(cutoff, column_type));
                }
                _ => {
                    sql.push_str(&format!(" AND {event_time} >= to_timestamp(${idx})"));
                    params.push(SqlParam::Float8(cutoff as f64));
                }
            }
        }
        Some((sql, params))
    }

    fn build_sequence_query(
        &self,
        key: &FeatureValue,
        user_id_field: &str,
        seq_config: &SeqConfig,
        sequence_config: &SequenceConfig,
        online: bool,
        now: i64,
    ) -> Option<(String, Vec<SqlParam>)> {
        let mut selector = vec![
            quote_ident(&sequence_config.item_id_field),
            quote_ident(&sequence_config.event_field),
        ];
        if !sequence_config.play_time_field.is_empty() {
            selector.push(quote_ident(&sequence_config.play_time_field));
        }
        selector.push(quote_ident(&sequence_config.timestamp_field));
        let table = if online {
            &self.config.online_seq_table
        } else {
            &self.config.offline_seq_table
        };

        let mut params = vec![key_param(key, self.config.field_type(user_id_field))?];
        let mut conditions = vec![format!("{} = $1", quote_ident(user_id_field))];
        let timestamp = quote_ident(&sequence_config.timestamp_field);
        if online {
            params.push(seconds_param(
                now - ONLINE_SEQUENCE_WINDOW_SECS,
                self.config.field_type(&sequence_config.timestamp_field),
            ));
            conditions.push(format!("{timestamp} > ${}", params.len()));
        }
        let events = seq_config.events();
        let event_field = quote_ident(&sequence_config.event_field);
        if events.len() > 1 {
            let start = params.len() + 1;
            conditions.push(format!("{event_field} IN ({})", placeholders(start, events.len())));
            params.extend(events.into_iter().map(SqlParam::Text));
        } else {
            params.push(SqlParam::Text(seq_config.seq_event.clone()));
            conditions.push(format!("{event_field} = ${}", params.len()));
        }
        let sql = format!(
            "SELECT {} FROM {table} WHERE {} ORDER BY {timestamp} DESC LIMIT {}",
            selector.join(", "),
            conditions.join(" AND "),
            seq_config.seq_len
        );
        Some((sql, params))
    }

    fn build_behavior_query(
        &self,
        user_id: &FeatureValue,
        events: &[String],
        select_fields: &[String],
        sequence_config: &SequenceConfig,
        online: bool,
        now: i64,
    ) -> Option<(String, Vec<SqlParam>)> {
        let selector = select_fields
            .iter()
            .map(|f| quote_ident(f))
            .collect::<Vec<_>>()
            .join(", ");
        let table = if online {
            &self.config.online_seq_table
        } else {
            &self.config.offline_seq_table
        };
        let pk = &self.config.primary_key_field;
        let mut params = vec![key_param(user_id, self.config.field_type(pk))?];
        let mut conditions = vec![format!("{} = $1", quote_ident(pk))];
        let timestamp = quote_ident(&sequence_config.timestamp_field);
        if online {
            params.push(seconds_param(
                now - ONLINE_SEQUENCE_WINDOW_SECS,
                self.config.field_type(&sequence_config.timestamp_field),
            ));
            conditions.push(format!("{timestamp} > ${}", params.len()));
        }
        if !events.is_empty() {
            let start = params.len() + 1;
            conditions.push(format!(
                "{} IN ({})",
                quote_ident(&sequence_config.event_field),
                placeholders(start, events.len())
            ));
            params.extend(events.iter().cloned().map(SqlParam::Text));
        }
        let sql = format!(
            "SELECT {selector} FROM {table} WHERE {} ORDER BY {timestamp} DESC",
            conditions.join(" AND ")
        );
        Some((sql, params))
    }
}

#[async_trait]
impl FeatureViewDao for FeatureViewHologresDao {
    async fn get_features(
        &self,
        keys: &[FeatureValue],
        select_fields: &[String],
    ) -> Result<Vec<Row>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let Some((sql, params)) =
            self.build_features_query(keys, select_fields, Utc::now().timestamp())
        else {
            return Ok(Vec::new());
        };
        let rows = self.query(sql, params).await?;
        Ok(rows.iter().map(to_row).collect())
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
        let now = Utc::now().timestamp();
        let play_time_map = make_play_time_map(&sequence_config.play_time_filter);
        let fetch = |user_id: &FeatureValue, online: bool| {
            let query = self.build_behavior_query(
                user_id,
                events,
                select_fields,
                sequence_config,
                online,
                now,
            );
            let play_time_map = &play_time_map;
            async move {
                let Some((sql, params)) = query else {
                    return Ok::<_, crate::error::FeatureStoreError>(Vec::new());
                };
                let rows = self.query(sql, params).await?;
                Ok::<_, crate::error::FeatureStoreError>(
                    rows.iter()
                        .map(to_row)
                        .filter(|row| behavior_row_kept(row, sequence_config, play_time_map))
                        .collect::<Vec<_>>(),
                )
            }
        };
        let per_user = join_all(user_ids.iter().map(|user_id| {
            let fetch = &fetch;
            async move {
                match futures::join!(fetch(user_id, false), fetch(user_id, true)) {
                    (Ok(offline), Ok(online)) => combine_behavior_features(
                        offline,
                        online,
                        &sequence_config.timestamp_field,
                    ),
                    (Err(e), _) | (_, Err(e)) => {
                        error!("get user behavior feature for {user_id} failed: {e}");
                        Vec::new()
                    }
                }
            }
        }))
        .await;
        Ok(per_user.into_iter().flatten().collect())
    }
}

#[async_trait]
impl SequenceSource for FeatureViewHologresDao {
    async fn fetch_events(
        &self,
        key: &FeatureValue,
        user_id_field: &str,
        seq_config: &SeqConfig,
        sequence_config: &SequenceConfig,
        online: bool,
    ) -> Result<Vec<SequenceInfo>> {
        let Some((sql, params)) = self.build_sequence_query(
            key,
            user_id_field,
            seq_config,
            sequence_config,
            online,
            Utc::now().timestamp(),
        ) else {
            return Ok(Vec::new());
        };
        let rows = self.query(sql, params).await?;
        Ok(rows
            .iter()
            .map(|row| {
                let row = to_row(row);
                let get = |field: &str| row.get(field);
                SequenceInfo {
                    item_id: get(&sequence_config.item_id_field)
                        .map(|v| v.to_string())
                        .unwrap_or_default(),
                    event: get(&sequence_config.event_field)
                        .map(|v| v.to_string())
                        .unwrap_or_default(),
                    play_time: get(&sequence_config.play_time_field)
                        .and_then(FeatureValue::as_f64)
                        .unwrap_or_default(),
                    timestamp: get(&sequence_config.timestamp_field)
                        .and_then(FeatureValue::as_i64)
                        .unwrap_or_default(),
                }
            })
            .collect())
    }
}
