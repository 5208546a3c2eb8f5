use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use log::debug;

use super::{feature_view::rekey, FeatureView, OnlineStore};
use crate::{
    dao::{new_feature_view_dao, DaoConfig, FeatureViewDao},
    error::{FeatureStoreError, Result},
    feature::{
        DatasourceType, FeatureEntity, FeatureViewField, FeatureViewMeta, ProjectMeta,
        RegistrationMode, SeqConfig, SequenceConfig,
    },
    infra::ConnectionRegistry,
    FeatureValue, Row,
};

/// A feature view over a per-user event log. Served either as capped recent
/// item sequences or as raw behavior rows.
#[derive(Debug)]
pub struct SequenceFeatureView {
    meta: FeatureViewMeta,
    feature_entity: FeatureEntity,
    user_id_field: String,
    sequence_config: SequenceConfig,
    offline_to_online: HashMap<String, String>,
    /// Every non-partition field.
    behavior_fields: Vec<String>,
    dao: Arc<dyn FeatureViewDao>,
}

impl SequenceFeatureView {
    /// `views` holds the views built so far; a view referencing another
    /// sequence view reads that view's tables.
    pub fn new(
        meta: FeatureViewMeta,
        project: &ProjectMeta,
        store: &OnlineStore,
        feature_entity: FeatureEntity,
        registry: &Arc<ConnectionRegistry>,
        views: &HashMap<String, Arc<FeatureView>>,
    ) -> Result<Self> {
        let sequence_config = SequenceConfig::parse(&meta.config)?;
        let config = dao_config(&meta, &sequence_config, project, store, views)?;
        let dao = new_feature_view_dao(config, registry)?;
        Self::build(meta, sequence_config, feature_entity, dao)
    }

    pub(crate) fn with_dao(
        meta: FeatureViewMeta,
        feature_entity: FeatureEntity,
        dao: Arc<dyn FeatureViewDao>,
    ) -> Result<Self> {
        let sequence_config = SequenceConfig::parse(&meta.config)?;
        Self::build(meta, sequence_config, feature_entity, dao)
    }

    fn build(
        meta: FeatureViewMeta,
        mut sequence_config: SequenceConfig,
        feature_entity: FeatureEntity,
        dao: Arc<dyn FeatureViewDao>,
    ) -> Result<Self> {
        let user_id_field = meta
            .fields
            .iter()
            .find(|f| f.is_primary_key)
            .map(|f| f.name.clone())
            .unwrap_or_default();
        let behavior_fields = meta
            .fields
            .iter()
            .filter(|f| !f.is_partition)
            .map(|f| f.name.clone())
            .collect();

        let mut offline_to_online = HashMap::new();
        if sequence_config.registration_mode == RegistrationMode::FullSequence {
            for seq in &sequence_config.seq_config {
                offline_to_online.insert(seq.offline_seq_name.clone(), seq.online_seq_name.clone());
            }
            let mut seen = HashSet::new();
            sequence_config
                .seq_config
                .retain(|seq| seen.insert(seq.online_seq_name.clone()));
        }

        Ok(Self {
            meta,
            feature_entity,
            user_id_field,
            sequence_config,
            offline_to_online,
            behavior_fields,
            dao,
        })
    }

    pub fn meta(&self) -> &FeatureViewMeta {
        &self.meta
    }

    pub fn feature_entity(&self) -> &FeatureEntity {
        &self.feature_entity
    }

    pub fn sequence_config(&self) -> &SequenceConfig {
        &self.sequence_config
    }

    pub fn user_id_field(&self) -> &str {
        &self.user_id_field
    }

    pub fn behavior_fields(&self) -> &[String] {
        &self.behavior_fields
    }

    /// `features` are online sequence names, or `*` for all of them.
    pub async fn get_online_features(
        &self,
        join_ids: &[FeatureValue],
        features: &[String],
        _alias: &HashMap<String, String>,
    ) -> Result<Vec<Row>> {
        if self.sequence_config.registration_mode == RegistrationMode::OnlyBehavior {
            return Err(FeatureStoreError::Unsupported(
                "only full_sequence registration mode supports GetOnlineFeatures, please use GetBehaviorFeatures".into(),
            ));
        }
        let seq_configs = self.select_seq_configs(features)?;
        debug!(
            "Get {} sequences of {} users from feature view {}",
            seq_configs.len(),
            join_ids.len(),
            self.meta.name
        );
        let mut rows = self
            .dao
            .get_user_sequence_feature(
                join_ids,
                &self.user_id_field,
                &self.sequence_config,
                &seq_configs,
            )
            .await?;
        rekey(&mut rows, &self.user_id_field, &self.feature_entity.join_id);
        Ok(rows)
    }

    pub async fn get_behavior_features(
        &self,
        user_ids: &[FeatureValue],
        events: &[String],
        features: &[String],
    ) -> Result<Vec<Row>> {
        let select_fields = self.select_behavior_fields(features)?;
        let mut rows = self
            .dao
            .get_user_behavior_feature(user_ids, events, &select_fields, &self.sequence_config)
            .await?;
        rekey(&mut rows, &self.user_id_field, &self.feature_entity.join_id);
        Ok(rows)
    }

    /// Unknown offline names are returned unchanged so lookups on them fail
    /// with the name the caller used.
    pub fn offline2online(&self, name: &str) -> String {
        if self.sequence_config.registration_mode == RegistrationMode::OnlyBehavior {
            return name.to_string();
        }
        self.offline_to_online
            .get(name)
            .cloned()
            .unwrap_or_else(|| name.to_string())
    }

    fn select_seq_configs(&self, features: &[String]) -> Result<Vec<SeqConfig>> {
        let mut seen = HashSet::new();
        let mut selected = Vec::new();
        for name in features {
            if name == "*" {
                for seq in &self.sequence_config.seq_config {
                    if seen.insert(seq.online_seq_name.as_str()) {
                        selected.push(seq.clone());
                    }
                }
                continue;
            }
            let seq = self
                .sequence_config
                .seq_config
                .iter()
                .find(|seq| &seq.online_seq_name == name)
                .ok_or_else(|| FeatureStoreError::SequenceFeatureNotFound(name.clone()))?;
            if seen.insert(seq.online_seq_name.as_str()) {
                selected.push(seq.clone());
            }
        }
        Ok(selected)
    }

    fn select_behavior_fields(&self, features: &[String]) -> Result<Vec<String>> {
        let mut seen = HashSet::new();
        let mut selected = Vec::new();
        for name in features {
            if name == "*" {
                for field in &self.behavior_fields {
                    if seen.insert(field.as_str()) {
                        selected.push(field.clone());
                    }
                }
            } else if !self.behavior_fields.contains(name) {
                return Err(FeatureStoreError::BehaviorFeatureNotFound(name.clone()));
            } else if seen.insert(name.as_str()) {
                selected.push(name.clone());
            }
        }
        Ok(selected)
    }
}

/// Name of the view whose tables hold this view's events.
fn table_owner<'a>(
    meta: &'a FeatureViewMeta,
    sequence_config: &'a SequenceConfig,
    views: &HashMap<String, Arc<FeatureView>>,
) -> Result<&'a str> {
    if !sequence_config.has_reference() {
        return Ok(&meta.name);
    }
    let name = sequence_config.referenced_feature_view_name.as_str();
    match views.get(name).map(|view| view.as_ref()) {
        Some(FeatureView::Sequence(_)) => Ok(name),
        Some(FeatureView::Base(_)) => Err(FeatureStoreError::config(format!(
            "referenced feature view :{name} is not sequence feature view"
        ))),
        None => Err(FeatureStoreError::config(format!(
            "referenced feature view :{name} not found"
        ))),
    }
}

fn dao_config(
    meta: &FeatureViewMeta,
    sequence_config: &SequenceConfig,
    project: &ProjectMeta,
    store: &OnlineStore,
    views: &HashMap<String, Arc<FeatureView>>,
) -> Result<DaoConfig> {
    let stored: Vec<FeatureViewField> = meta
        .fields
        .iter()
        .filter(|f| !f.is_partition)
        .cloned()
        .collect();
    let user_id_field = meta
        .fields
        .iter()
        .find(|f| f.is_primary_key)
        .map(|f| f.name.clone())
        .unwrap_or_default();

    if meta.write_to_feature_db || store.datasource_type() == DatasourceType::FeatureDB {
        let mut config = DaoConfig::new(DatasourceType::FeatureDB, "").with_fields(&stored);
        config.primary_key_field = user_id_field;
        config.table_name = if sequence_config.has_reference() {
            sequence_config.referenced_feature_view_name.clone()
        } else {
            meta.name.clone()
        };
        config.feature_db_database = project.instance_id.clone();
        config.feature_db_schema = project.project_name.clone();
        return Ok(config);
    }

    let owner = table_owner(meta, sequence_config, views)?;
    let mut config =
        DaoConfig::new(store.datasource_type(), store.datasource_name()).with_fields(&stored);
    config.primary_key_field = user_id_field;
    config.table_name = store.table_name(&meta.name);
    config.online_seq_table = store.seq_online_table_name(owner);
    config.offline_seq_table = store.seq_offline_table_name(owner);
    if store.datasource_type() == DatasourceType::IGraph {
        config.save_original_field = true;
        config.group_name = project.project_name.clone();
        config.field_map = stored
            .iter()
            .map(|f| (f.name.clone(), f.name.clone()))
            .collect();
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::BaseFeatureView,
        entity, fields,
        testing::{project_meta, MockDao},
        FieldType,
    };

    const CONFIG: &str = r#"{
        "item_id_field": "item_id",
        "event_field": "event",
        "timestamp_field": "ts",
        "deduplication_method": ["user_id", "item_id", "event"],
        "seq_config": [
            {"offline_seq_name": "click_seq", "seq_event": "click", "seq_len": 10, "online_seq_name": "click_50"},
            {"offline_seq_name": "click_seq_v2", "seq_event": "click", "seq_len": 10, "online_seq_name": "click_50"},
            {"offline_seq_name": "buy_seq", "seq_event": "buy", "seq_len": 5, "online_seq_name": "buy_5"}
        ]
    }"#;

    fn meta(config: &str) -> FeatureViewMeta {
        FeatureViewMeta {
            name: "user_seq".into(),
            feature_entity_name: "user".into(),
            view_type: crate::feature::FeatureViewType::Sequence,
            config: config.into(),
            fields: fields![
                ("uid", FieldType::String, is_primary_key),
                ("item_id", FieldType::String),
                ("event", FieldType::String),
                ("ts", FieldType::Int64),
                ("ds", FieldType::String, is_partition),
            ],
            ..Default::default()
        }
    }

    fn view(config: &str, dao: Arc<MockDao>) -> SequenceFeatureView {
        SequenceFeatureView::with_dao(meta(config), entity!("user", "user_id"), dao).unwrap()
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_seq_configs_deduplicated() {
        let view = view(CONFIG, Arc::new(MockDao::default()));
        let online: Vec<&str> = view
            .sequence_config()
            .seq_config
            .iter()
            .map(|s| s.online_seq_name.as_str())
            .collect();
        assert_eq!(online, vec!["click_50", "buy_5"]);
        assert_eq!(view.offline2online("click_seq_v2"), "click_50");
        assert_eq!(view.offline2online("unknown"), "unknown");
        assert_eq!(view.behavior_fields(), names(&["uid", "item_id", "event", "ts"]));
    }

    #[test]
    fn test_invalid_deduplication_rejected() {
        let config = CONFIG.replace(r#"["user_id", "item_id", "event"]"#, r#"["item_id"]"#);
        let err = SequenceFeatureView::with_dao(
            meta(&config),
            entity!("user", "user_id"),
            Arc::new(MockDao::default()),
        )
        .unwrap_err();
        assert!(matches!(err, FeatureStoreError::Config(_)));
    }

    #[test]
    fn test_select_seq_configs() {
        let view = view(CONFIG, Arc::new(MockDao::default()));
        let all = view.select_seq_configs(&names(&["*", "buy_5"])).unwrap();
        assert_eq!(all.len(), 2);
        let err = view.select_seq_configs(&names(&["view_3"])).unwrap_err();
        assert!(matches!(err, FeatureStoreError::SequenceFeatureNotFound(name) if name == "view_3"));
    }

    #[tokio::test]
    async fn test_get_online_features_rekeys_user_id() {
        let dao = Arc::new(MockDao::with_rows(vec![Row::from([
            ("uid".to_string(), FeatureValue::from("u1")),
            ("buy_5".to_string(), FeatureValue::from("i1;i2")),
        ])]));
        let view = view(CONFIG, dao.clone());
        let rows = view
            .get_online_features(&[FeatureValue::from("u1")], &names(&["buy_5"]), &HashMap::new())
            .await
            .unwrap();
        assert_eq!(rows[0]["user_id"], FeatureValue::from("u1"));
        assert!(!rows[0].contains_key("uid"));
        assert_eq!(dao.sequence_calls(), 1);
    }

    #[tokio::test]
    async fn test_only_behavior_mode() {
        let config = CONFIG.replacen('{', r#"{"registration_mode": "only_behavior","#, 1);
        let dao = Arc::new(MockDao::with_rows(vec![Row::from([
            ("uid".to_string(), FeatureValue::from("u1")),
            ("item_id".to_string(), FeatureValue::from("i1")),
        ])]));
        let view = view(&config, dao.clone());
        assert_eq!(view.offline2online("click_seq"), "click_seq");
        let keys = [FeatureValue::from("u1")];

        let err = view
            .get_online_features(&keys, &names(&["*"]), &HashMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, FeatureStoreError::Unsupported(_)));

        let rows = view
            .get_behavior_features(&keys, &names(&["click"]), &names(&["item_id", "*"]))
            .await
            .unwrap();
        assert_eq!(rows[0]["user_id"], FeatureValue::from("u1"));
        assert_eq!(
            dao.selected_fields(),
            vec![names(&["item_id", "uid", "event", "ts"])]
        );

        let err = view
            .get_behavior_features(&keys, &[], &names(&["ds"]))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "behavior feature name :ds not found in feature view config"
        );
    }

    #[test]
    fn test_dao_config_with_reference() {
        let project = project_meta(DatasourceType::Hologres);
        let store = OnlineStore::new(&project).unwrap();
        let mut views = HashMap::new();

        let plain = meta(CONFIG);
        let sequence_config = SequenceConfig::parse(&plain.config).unwrap();
        let config = dao_config(&plain, &sequence_config, &project, &store, &views).unwrap();
        assert_eq!(config.online_seq_table, "fs_user_seq_seq");
        assert_eq!(config.offline_seq_table, "fs_user_seq_seq_offline");
        assert_eq!(config.primary_key_field, "uid");

        let referencing = CONFIG.replacen('{', r#"{"referenced_feature_view_name": "shared_seq","#, 1);
        let referencing = meta(&referencing);
        let sequence_config = SequenceConfig::parse(&referencing.config).unwrap();
        let err = dao_config(&referencing, &sequence_config, &project, &store, &views).unwrap_err();
        assert_eq!(err.to_string(), "referenced feature view :shared_seq not found");

        let base = BaseFeatureView::with_dao(
            FeatureViewMeta {
                name: "shared_seq".into(),
                fields: fields![("uid", FieldType::String, is_primary_key)],
                ..Default::default()
            },
            entity!("user", "user_id"),
            Arc::new(MockDao::default()),
        )
        .unwrap();
        views.insert("shared_seq".to_string(), Arc::new(FeatureView::Base(base)));
        let err = dao_config(&referencing, &sequence_config, &project, &store, &views).unwrap_err();
        assert!(err.to_string().contains("is not sequence feature view"));

        let mut shared = meta(CONFIG);
        shared.name = "shared_seq".into();
        let shared = SequenceFeatureView::with_dao(
            shared,
            entity!("user", "user_id"),
            Arc::new(MockDao::default()),
        )
        .unwrap();
        views.insert("shared_seq".to_string(), Arc::new(FeatureView::Sequence(shared)));
        let config = dao_config(&referencing, &sequence_config, &project, &store, &views).unwrap();
        assert_eq!(config.online_seq_table, "fs_shared_seq_seq");
        assert_eq!(config.offline_seq_table, "fs_shared_seq_seq_offline");
    }

    #[test]
    fn test_dao_config_feature_db() {
        let project = project_meta(DatasourceType::FeatureDB);
        let store = OnlineStore::new(&project).unwrap();
        let meta = meta(CONFIG);
        let sequence_config = SequenceConfig::parse(&meta.config).unwrap();
        let config = dao_config(&meta, &sequence_config, &project, &store, &HashMap::new()).unwrap();
        assert_eq!(config.datasource_type, DatasourceType::FeatureDB);
        assert_eq!(config.table_name, "user_seq");
        assert_eq!(config.fields.len(), 4);
    }
}
