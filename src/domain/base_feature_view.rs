use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use log::debug;

use super::{
    feature_view::{apply_alias, rekey},
    OnlineStore,
};
use crate::{
    dao::{new_feature_view_dao, DaoConfig, FeatureViewDao},
    error::{FeatureStoreError, Result},
    feature::{DatasourceType, FeatureEntity, FeatureViewField, FeatureViewMeta, ProjectMeta},
    infra::ConnectionRegistry,
    FeatureValue, Row,
};

/// A batch or stream feature view: one row of typed fields per key.
#[derive(Debug)]
pub struct BaseFeatureView {
    meta: FeatureViewMeta,
    feature_entity: FeatureEntity,
    primary_key_field: FeatureViewField,
    event_time_field: Option<FeatureViewField>,
    /// Every non-partition, non-primary-key field in schema order.
    feature_fields: Vec<String>,
    dao: Arc<dyn FeatureViewDao>,
}

impl BaseFeatureView {
    pub fn new(
        meta: FeatureViewMeta,
        project: &ProjectMeta,
        store: &OnlineStore,
        feature_entity: FeatureEntity,
        registry: &Arc<ConnectionRegistry>,
    ) -> Result<Self> {
        let dao = new_feature_view_dao(dao_config(&meta, project, store)?, registry)?;
        Self::with_dao(meta, feature_entity, dao)
    }

    pub(crate) fn with_dao(
        meta: FeatureViewMeta,
        feature_entity: FeatureEntity,
        dao: Arc<dyn FeatureViewDao>,
    ) -> Result<Self> {
        let primary_key_field = primary_key(&meta)?.clone();
        let event_time_field = meta.fields.iter().find(|f| f.is_event_time).cloned();
        let feature_fields = meta
            .fields
            .iter()
            .filter(|f| !f.is_partition && !f.is_primary_key)
            .map(|f| f.name.clone())
            .collect();
        Ok(Self {
            meta,
            feature_entity,
            primary_key_field,
            event_time_field,
            feature_fields,
            dao,
        })
    }

    pub fn meta(&self) -> &FeatureViewMeta {
        &self.meta
    }

    pub fn feature_entity(&self) -> &FeatureEntity {
        &self.feature_entity
    }

    pub fn primary_key_field(&self) -> &FeatureViewField {
        &self.primary_key_field
    }

    pub fn event_time_field(&self) -> Option<&FeatureViewField> {
        self.event_time_field.as_ref()
    }

    pub fn feature_fields(&self) -> &[String] {
        &self.feature_fields
    }

    pub async fn get_online_features(
        &self,
        join_ids: &[FeatureValue],
        features: &[String],
        alias: &HashMap<String, String>,
    ) -> Result<Vec<Row>> {
        self.get_online_features_with_count(join_ids, features, alias, 1)
            .await
    }

    pub async fn get_online_features_with_count(
        &self,
        join_ids: &[FeatureValue],
        features: &[String],
        alias: &HashMap<String, String>,
        count: usize,
    ) -> Result<Vec<Row>> {
        let select_fields = self.select_fields(features, alias)?;
        debug!(
            "Get {} fields of {} keys from feature view {}",
            select_fields.len(),
            join_ids.len(),
            self.meta.name
        );
        let mut rows = self
            .dao
            .get_features_with_count(join_ids, &select_fields, count)
            .await?;
        rekey(
            &mut rows,
            &self.primary_key_field.name,
            &self.feature_entity.join_id,
        );
        apply_alias(&mut rows, alias);
        Ok(rows)
    }

    pub async fn get_behavior_features(
        &self,
        _user_ids: &[FeatureValue],
        _events: &[String],
        _features: &[String],
    ) -> Result<Vec<Row>> {
        Err(FeatureStoreError::Unsupported(
            "only sequence feature view supports GetBehaviorFeatures".into(),
        ))
    }

    /// Primary key first, then the requested features without duplicates.
    fn select_fields(
        &self,
        features: &[String],
        alias: &HashMap<String, String>,
    ) -> Result<Vec<String>> {
        let known: HashSet<&str> = self.feature_fields.iter().map(String::as_str).collect();
        let mut seen: HashSet<&str> = HashSet::from([self.primary_key_field.name.as_str()]);
        let mut selected = vec![self.primary_key_field.name.clone()];
        for name in features {
            if name == "*" {
                for field in &self.feature_fields {
                    if seen.insert(field) {
                        selected.push(field.clone());
                    }
                }
            } else if !known.contains(name.as_str()) {
                return Err(FeatureStoreError::FeatureNotFound(name.clone()));
            } else if seen.insert(name) {
                selected.push(name.clone());
            }
        }
        if let Some(name) = alias.keys().find(|name| !known.contains(name.as_str())) {
            return Err(FeatureStoreError::FeatureNotFound(name.clone()));
        }
        Ok(selected)
    }
}

fn primary_key(meta: &FeatureViewMeta) -> Result<&FeatureViewField> {
    meta.fields.iter().find(|f| f.is_primary_key).ok_or_else(|| {
        FeatureStoreError::config(format!(
            "feature view {} has no primary key field",
            meta.name
        ))
    })
}

fn dao_config(
    meta: &FeatureViewMeta,
    project: &ProjectMeta,
    store: &OnlineStore,
) -> Result<DaoConfig> {
    let primary_key_field = primary_key(meta)?.name.clone();
    let stored: Vec<FeatureViewField> = meta
        .fields
        .iter()
        .filter(|f| !f.is_partition)
        .cloned()
        .collect();

    if meta.write_to_feature_db || store.datasource_type() == DatasourceType::FeatureDB {
        let mut config = DaoConfig::new(DatasourceType::FeatureDB, "").with_fields(&stored);
        config.fields.retain(|f| !f.is_primary_key);
        config.primary_key_field = primary_key_field;
        config.table_name = meta.name.clone();
        config.feature_db_database = project.instance_id.clone();
        config.feature_db_schema = project.project_name.clone();
        return Ok(config);
    }

    let mut config =
        DaoConfig::new(store.datasource_type(), store.datasource_name()).with_fields(&stored);
    config.primary_key_field = primary_key_field;
    config.table_name = store.table_name(&meta.name);
    config.ttl = meta.ttl;
    if let Some(event_time) = meta.fields.iter().find(|f| f.is_event_time) {
        config.event_time_field = event_time.name.clone();
    }
    match store.datasource_type() {
        DatasourceType::IGraph => {
            config.group_name = project.project_name.clone();
            config.label_name = meta.name.clone();
            let save_original_field = meta.config_flag("save_original_field");
            config.save_original_field = save_original_field;
            config.field_map = stored
                .iter()
                .map(|f| {
                    let graph_name = if f.is_primary_key || save_original_field {
                        f.name.clone()
                    } else {
                        format!("f{}", f.position)
                    };
                    (graph_name, f.name.clone())
                })
                .collect();
        }
        DatasourceType::Redis => {
            config.redis_key_prefix = store.redis_key_prefix(&meta.name);
        }
        _ => {}
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        entity, fields,
        testing::{project_meta, MockDao},
        FieldType,
    };

    fn meta() -> FeatureViewMeta {
        FeatureViewMeta {
            name: "user_fea".into(),
            feature_entity_name: "user".into(),
            ttl: 3600,
            fields: fields![
                ("uid", FieldType::String, is_primary_key),
                ("age", FieldType::Int64),
                ("city", FieldType::String),
                ("event_time", FieldType::Timestamp, is_event_time),
                ("ds", FieldType::String, is_partition),
            ],
            ..Default::default()
        }
    }

    fn view(dao: Arc<MockDao>) -> BaseFeatureView {
        BaseFeatureView::with_dao(meta(), entity!("user", "user_id"), dao).unwrap()
    }

    fn names(names: &[&str]) -> Vec<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[test]
    fn test_select_fields() {
        let view = view(Arc::new(MockDao::default()));
        assert_eq!(view.feature_fields(), names(&["age", "city", "event_time"]));
        let no_alias = HashMap::new();

        let selected = view.select_fields(&names(&["city", "age", "city"]), &no_alias).unwrap();
        assert_eq!(selected, names(&["uid", "city", "age"]));

        let all = view.select_fields(&names(&["*"]), &no_alias).unwrap();
        let explicit = view
            .select_fields(&names(&["age", "city", "event_time"]), &no_alias)
            .unwrap();
        assert_eq!(all, explicit);

        let err = view.select_fields(&names(&["ds"]), &no_alias).unwrap_err();
        assert_eq!(
            err.to_string(),
            "feature name :ds not found in the featureview fields"
        );

        let alias = HashMap::from([("height".to_string(), "h".to_string())]);
        assert!(matches!(
            view.select_fields(&names(&["age"]), &alias),
            Err(FeatureStoreError::FeatureNotFound(name)) if name == "height"
        ));
    }

    #[tokio::test]
    async fn test_get_online_features_rekeys_and_aliases() {
        let dao = Arc::new(MockDao::with_rows(vec![Row::from([
            ("uid".to_string(), FeatureValue::from("u1")),
            ("age".to_string(), FeatureValue::Int64(30)),
        ])]));
        let view = view(dao.clone());
        let alias = HashMap::from([("age".to_string(), "user_age".to_string())]);
        let rows = view
            .get_online_features(&[FeatureValue::from("u1")], &names(&["age"]), &alias)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["user_id"], FeatureValue::from("u1"));
        assert_eq!(rows[0]["user_age"], FeatureValue::Int64(30));
        assert!(!rows[0].contains_key("uid"));
        assert!(!rows[0].contains_key("age"));
        assert_eq!(dao.selected_fields(), vec![names(&["uid", "age"])]);
    }

    #[tokio::test]
    async fn test_behavior_features_unsupported() {
        let view = view(Arc::new(MockDao::default()));
        let err = view
            .get_behavior_features(&[FeatureValue::from("u1")], &[], &[])
            .await
            .unwrap_err();
        assert!(matches!(err, FeatureStoreError::Unsupported(_)));
    }

    #[test]
    fn test_dao_config_per_store() {
        let mut project = project_meta(DatasourceType::IGraph);
        let store = OnlineStore::new(&project).unwrap();
        let mut meta = meta();
        for (position, field) in meta.fields.iter_mut().enumerate() {
            field.position = position as i32 + 1;
        }
        let config = dao_config(&meta, &project, &store).unwrap();
        assert_eq!(config.group_name, "fs");
        assert_eq!(config.label_name, "user_fea");
        assert_eq!(config.field_map["uid"], "uid");
        assert_eq!(config.field_map["f2"], "age");
        assert!(!config.field_map.contains_key("f5"));

        meta.config = r#"{"save_original_field": true}"#.into();
        let config = dao_config(&meta, &project, &store).unwrap();
        assert_eq!(config.field_map["age"], "age");

        project.online_datasource_type = DatasourceType::Hologres;
        let store = OnlineStore::new(&project).unwrap();
        let config = dao_config(&meta, &project, &store).unwrap();
        assert_eq!(config.table_name, "fs_user_fea_online");
        assert_eq!(config.datasource_name, "online");
        assert_eq!(config.event_time_field, "event_time");
        assert_eq!(config.ttl, 3600);

        meta.write_to_feature_db = true;
        let config = dao_config(&meta, &project, &store).unwrap();
        assert_eq!(config.datasource_type, DatasourceType::FeatureDB);
        assert_eq!(config.table_name, "user_fea");
        assert_eq!(config.feature_db_database, "instance");
        assert_eq!(config.feature_db_schema, "fs");
        let stored: Vec<&str> = config.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(stored, vec!["age", "city", "event_time"]);
        assert_eq!(config.field_type("uid"), Some(FieldType::String));
    }

    #[test]
    fn test_missing_primary_key() {
        let mut meta = meta();
        meta.fields.retain(|f| !f.is_primary_key);
        let err = BaseFeatureView::with_dao(
            meta,
            entity!("user", "user_id"),
            Arc::new(MockDao::default()),
        )
        .unwrap_err();
        assert!(matches!(err, FeatureStoreError::Config(_)));
    }
}
