//! Assembly of per-user event sequences shared by every backend that serves
//! sequence feature views.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use futures::future::join_all;
use log::error;

use crate::{
    error::Result,
    feature::{DeduplicationMethod, SeqConfig, SequenceConfig},
    FeatureValue, Row,
};

/// Online sequence tables only hold the last five days of events.
pub const ONLINE_SEQUENCE_WINDOW_SECS: i64 = 86400 * 5;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SequenceInfo {
    pub item_id: String,
    pub event: String,
    pub play_time: f64,
    /// Unix seconds.
    pub timestamp: i64,
}

impl SequenceInfo {
    pub fn new(item_id: &str, event: &str, play_time: f64, timestamp: i64) -> Self {
        Self {
            item_id: item_id.to_string(),
            event: event.to_string(),
            play_time,
            timestamp,
        }
    }

    fn is_kept(&self, play_time_map: &HashMap<String, f64>) -> bool {
        if self.event.is_empty() || self.item_id.is_empty() {
            return false;
        }
        match play_time_map.get(&self.event) {
            Some(threshold) => self.play_time > *threshold,
            None => true,
        }
    }
}

/// Parses `"click:10;play:5.5"` into per-event minimum play times. Malformed
/// entries are ignored.
pub fn make_play_time_map(filter: &str) -> HashMap<String, f64> {
    filter
        .split(';')
        .filter_map(|entry| {
            let (event, threshold) = entry.split_once(':')?;
            let threshold = threshold.trim().parse::<f64>().ok()?;
            Some((event.trim().to_string(), threshold))
        })
        .collect()
}

/// Drops events without an event name or item id, and events whose play time
/// does not exceed the threshold configured for their event.
pub fn filter_events(
    events: Vec<SequenceInfo>,
    play_time_map: &HashMap<String, f64>,
) -> Vec<SequenceInfo> {
    events
        .into_iter()
        .filter(|e| e.is_kept(play_time_map))
        .collect()
}

/// Whether a behavior row survives the play-time filter.
pub fn behavior_row_kept(
    row: &Row,
    sequence_config: &SequenceConfig,
    play_time_map: &HashMap<String, f64>,
) -> bool {
    let event = row
        .get(&sequence_config.event_field)
        .map(|v| v.to_string())
        .unwrap_or_default();
    match play_time_map.get(&event) {
        Some(threshold) => {
            row.get(&sequence_config.play_time_field)
                .and_then(FeatureValue::as_f64)
                .unwrap_or(0.0)
                > *threshold
        }
        None => true,
    }
}

/// Merges the online and offline events of one sequence feature into its
/// output columns.
///
/// Online events older than the newest offline event are already covered by
/// the offline table and are dropped. The rest is ordered newest first,
/// deduplicated and capped at `seq_len`.
pub fn make_sequence_features(
    offline: Vec<SequenceInfo>,
    online: Vec<SequenceInfo>,
    seq_config: &SeqConfig,
    sequence_config: &SequenceConfig,
    now: i64,
) -> Row {
    let newest_offline = offline.iter().map(|e| e.timestamp).max();
    let mut events: Vec<SequenceInfo> = online
        .into_iter()
        .filter(|e| newest_offline.map_or(true, |newest| e.timestamp >= newest))
        .chain(offline)
        .collect();
    events.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

    let mut seen = HashSet::new();
    let events: Vec<SequenceInfo> = events
        .into_iter()
        .filter(|e| {
            let key = match sequence_config.deduplication {
                DeduplicationMethod::ItemId => e.item_id.clone(),
                DeduplicationMethod::ItemIdTimestamp => format!("{}_{}", e.item_id, e.timestamp),
            };
            seen.insert(key)
        })
        .take(seq_config.seq_len)
        .collect();

    let mut properties = Row::new();
    if events.is_empty() {
        return properties;
    }
    let name = &seq_config.online_seq_name;
    let item_ids = joined(&events, |e| e.item_id.clone());
    properties.insert(
        format!("{name}__{}", sequence_config.item_id_field),
        item_ids.clone(),
    );
    properties.insert(name.clone(), item_ids);
    properties.insert(
        format!("{name}__{}", sequence_config.event_field),
        joined(&events, |e| e.event.clone()),
    );
    properties.insert(
        format!("{name}__{}", sequence_config.timestamp_field),
        joined(&events, |e| e.timestamp.to_string()),
    );
    properties.insert(
        format!("{name}__ts"),
        joined(&events, |e| (now - e.timestamp).to_string()),
    );
    if !sequence_config.play_time_field.is_empty() {
        properties.insert(
            format!("{name}__{}", sequence_config.play_time_field),
            joined(&events, |e| e.play_time.to_string()),
        );
    }
    properties
}

fn joined(events: &[SequenceInfo], f: impl Fn(&SequenceInfo) -> String) -> FeatureValue {
    FeatureValue::String(events.iter().map(f).collect::<Vec<_>>().join(";"))
}

/// Offline rows plus the online rows newer than every offline row, newest
/// first.
pub fn combine_behavior_features(offline: Vec<Row>, online: Vec<Row>, timestamp_field: &str) -> Vec<Row> {
    let ts = |row: &Row| row.get(timestamp_field).and_then(FeatureValue::as_i64);
    let newest_offline = offline.iter().filter_map(ts).max();
    let mut combined: Vec<Row> = online
        .into_iter()
        .filter(|row| match (newest_offline, ts(row)) {
            (Some(newest), Some(t)) => t > newest,
            (None, _) => true,
            (Some(_), None) => false,
        })
        .collect();
    combined.extend(offline);
    combined
}

/// A backend able to list the recent events of one user for one sequence
/// feature, from either its online or its offline table.
#[async_trait]
pub(crate) trait SequenceSource: Send + Sync {
    async fn fetch_events(
        &self,
        key: &FeatureValue,
        user_id_field: &str,
        seq_config: &SeqConfig,
        sequence_config: &SequenceConfig,
        online: bool,
    ) -> Result<Vec<SequenceInfo>>;
}

/// Builds one output row per key. Every sequence feature of a key is fetched
/// concurrently, online and offline side by side; a failed fetch is logged
/// and contributes no events.
pub(crate) async fn collect_user_sequences(
    source: &dyn SequenceSource,
    keys: &[FeatureValue],
    user_id_field: &str,
    sequence_config: &SequenceConfig,
    seq_configs: &[SeqConfig],
) -> Vec<Row> {
    let now = chrono::Utc::now().timestamp();
    let play_time_map = make_play_time_map(&sequence_config.play_time_filter);
    let fetch = |key: &FeatureValue, seq_config: &SeqConfig, online: bool| {
        let play_time_map = &play_time_map;
        let key = key.clone();
        let seq_config = seq_config.clone();
        async move {
            match source
                .fetch_events(&key, user_id_field, &seq_config, sequence_config, online)
                .await
            {
                Ok(events) => filter_events(events, play_time_map),
                Err(e) => {
                    error!(
                        "fetch {} sequence {} for {key} failed: {e}",
                        if online { "online" } else { "offline" },
                        seq_config.online_seq_name
                    );
                    Vec::new()
                }
            }
        }
    };

    join_all(keys.iter().map(|key| {
        let fetch = &fetch;
        async move {
            let per_config = join_all(seq_configs.iter().map(|seq_config| async move {
                let (online, offline) =
                    futures::join!(fetch(key, seq_config, true), fetch(key, seq_config, false));
                make_sequence_features(offline, online, seq_config, sequence_config, now)
            }))
            .await;
            let mut properties = Row::new();
            for sub in per_config {
                properties.extend(sub);
            }
            properties.insert(user_id_field.to_string(), key.clone());
            properties
        }
    }))
    .await
}
