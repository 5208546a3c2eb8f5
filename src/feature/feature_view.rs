use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use super::FeatureViewField;
use crate::error::{FeatureStoreError, Result};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, EnumString, Default)]
pub enum FeatureViewType {
    #[default]
    Batch,
    Stream,
    Sequence,
}

/// Feature view metadata as delivered by the control plane.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct FeatureViewMeta {
    #[serde(default)]
    pub feature_view_id: i64,
    #[serde(default)]
    pub project_id: i64,
    pub name: String,
    pub feature_entity_name: String,
    #[serde(rename = "type", default)]
    pub view_type: FeatureViewType,
    /// Seconds; zero means rows never expire.
    #[serde(default)]
    pub ttl: i64,
    #[serde(default)]
    pub write_to_feature_db: bool,
    /// JSON document with backend or sequence specific settings.
    #[serde(default)]
    pub config: String,
    #[serde(default)]
    pub fields: Vec<FeatureViewField>,
}

impl FeatureViewMeta {
    /// Reads a boolean flag out of the JSON config, `false` when absent or the
    /// config is not valid JSON.
    pub fn config_flag(&self, flag: &str) -> bool {
        if self.config.is_empty() {
            return false;
        }
        serde_json::from_str::<serde_json::Value>(&self.config)
            .ok()
            .and_then(|v| v.get(flag).and_then(|f| f.as_bool()))
            .unwrap_or(false)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationMode {
    #[default]
    FullSequence,
    OnlyBehavior,
}

/// How merged online and offline events are deduplicated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeduplicationMethod {
    /// `["user_id","item_id","event"]`
    #[default]
    ItemId,
    /// `["user_id","item_id","event","timestamp"]`
    ItemIdTimestamp,
}

impl DeduplicationMethod {
    pub fn from_declaration(declared: &[String]) -> Result<Self> {
        const BY_ITEM: [&str; 3] = ["user_id", "item_id", "event"];
        const BY_ITEM_TS: [&str; 4] = ["user_id", "item_id", "event", "timestamp"];
        if declared.iter().map(String::as_str).eq(BY_ITEM) {
            Ok(DeduplicationMethod::ItemId)
        } else if declared.iter().map(String::as_str).eq(BY_ITEM_TS) {
            Ok(DeduplicationMethod::ItemIdTimestamp)
        } else {
            Err(FeatureStoreError::config(format!(
                "deduplication_method invalid: {declared:?}"
            )))
        }
    }
}

/// One sequence feature: which events it tracks and how long it is.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SeqConfig {
    #[serde(default)]
    pub offline_seq_name: String,
    /// Event names separated by `|`.
    pub seq_event: String,
    pub seq_len: usize,
    pub online_seq_name: String,
    #[serde(default)]
    pub online_behavior_table_fields: Vec<String>,
}

impl SeqConfig {
    pub fn events(&self) -> Vec<String> {
        self.seq_event
            .split('|')
            .map(str::trim)
            .filter(|e| !e.is_empty())
            .map(str::to_string)
            .collect()
    }
}

/// The sub-schema of a sequence feature view, parsed from its JSON config.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct SequenceConfig {
    #[serde(default)]
    pub registration_mode: RegistrationMode,
    #[serde(default)]
    pub referenced_feature_view_id: i64,
    #[serde(default)]
    pub referenced_feature_view_name: String,
    pub item_id_field: String,
    pub event_field: String,
    pub timestamp_field: String,
    #[serde(default)]
    pub play_time_field: String,
    #[serde(default)]
    pub play_time_filter: String,
    #[serde(default)]
    pub deduplication_method: Vec<String>,
    #[serde(skip)]
    pub deduplication: DeduplicationMethod,
    #[serde(default)]
    pub offline_seq_table_name: String,
    #[serde(default)]
    pub offline_seq_table_pk_field: String,
    #[serde(default)]
    pub offline_seq_table_event_time_field: String,
    #[serde(default)]
    pub seq_len_online: usize,
    #[serde(default)]
    pub seq_config: Vec<SeqConfig>,
}

impl SequenceConfig {
    /// Parses and validates the config; the deduplication declaration must be
    /// one of the two supported forms.
    pub fn parse(config: &str) -> Result<Self> {
        let mut parsed: SequenceConfig = serde_json::from_str(config).map_err(|e| {
            FeatureStoreError::config(format!("sequence featureview config unmarshal failed: {e}"))
        })?;
        parsed.deduplication = DeduplicationMethod::from_declaration(&parsed.deduplication_method)?;
        Ok(parsed)
    }

    pub fn has_reference(&self) -> bool {
        self.referenced_feature_view_id != 0 || !self.referenced_feature_view_name.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"{
        "item_id_field": "item_id",
        "event_field": "event",
        "timestamp_field": "ts",
        "play_time_field": "play_time",
        "play_time_filter": "play:10",
        "deduplication_method": ["user_id", "item_id", "event", "timestamp"],
        "seq_config": [
            {"offline_seq_name": "click_seq", "seq_event": "click|like", "seq_len": 50, "online_seq_name": "click_seq_50"}
        ]
    }"#;

    #[test]
    fn test_parse_sequence_config() {
        let config = SequenceConfig::parse(CONFIG).unwrap();
        assert_eq!(config.registration_mode, RegistrationMode::FullSequence);
        assert_eq!(config.deduplication, DeduplicationMethod::ItemIdTimestamp);
        assert_eq!(config.seq_config[0].events(), vec!["click", "like"]);
        assert!(!config.has_reference());
    }

    #[test]
    fn test_invalid_deduplication_method() {
        for bad in [
            r#"[]"#,
            r#"["user_id","event","item_id"]"#,
            r#"["user_id","item_id","event","ts"]"#,
        ] {
            let config = CONFIG.replace(
                r#"["user_id", "item_id", "event", "timestamp"]"#,
                bad,
            );
            let err = SequenceConfig::parse(&config).unwrap_err();
            assert!(matches!(err, FeatureStoreError::Config(_)), "{bad}");
        }
    }

    #[test]
    fn test_config_flag() {
        let view = FeatureViewMeta {
            config: r#"{"save_original_field": true}"#.into(),
            ..Default::default()
        };
        assert!(view.config_flag("save_original_field"));
        assert!(!FeatureViewMeta::default().config_flag("save_original_field"));
    }
}
