use crate::{
    dao::redis::redis_key_prefix,
    error::{FeatureStoreError, Result},
    feature::{DatasourceType, ProjectMeta},
};

/// Naming rules of the project's online datasource.
#[derive(Debug, Clone)]
pub struct OnlineStore {
    datasource_type: DatasourceType,
    datasource_name: String,
    project_name: String,
}

impl OnlineStore {
    pub fn new(project: &ProjectMeta) -> Result<Self> {
        match project.online_datasource_type {
            DatasourceType::Hologres
            | DatasourceType::Redis
            | DatasourceType::IGraph
            | DatasourceType::TableStore
            | DatasourceType::Ots
            | DatasourceType::FeatureDB => Ok(Self {
                datasource_type: project.online_datasource_type,
                datasource_name: project.online_datasource_name.clone(),
                project_name: project.project_name.clone(),
            }),
            other => Err(FeatureStoreError::config(format!(
                "not support onlinestore type {other}"
            ))),
        }
    }

    pub fn datasource_type(&self) -> DatasourceType {
        self.datasource_type
    }

    pub fn datasource_name(&self) -> &str {
        &self.datasource_name
    }

    pub fn table_name(&self, feature_view: &str) -> String {
        match self.datasource_type {
            DatasourceType::IGraph | DatasourceType::FeatureDB => feature_view.to_string(),
            _ => format!("{}_{feature_view}_online", self.project_name),
        }
    }

    pub fn seq_online_table_name(&self, feature_view: &str) -> String {
        format!("{}_{feature_view}_seq", self.project_name)
    }

    pub fn seq_offline_table_name(&self, feature_view: &str) -> String {
        format!("{}_{feature_view}_seq_offline", self.project_name)
    }

    pub fn redis_key_prefix(&self, feature_view: &str) -> String {
        redis_key_prefix(&self.project_name, feature_view)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn project(datasource_type: DatasourceType) -> ProjectMeta {
        ProjectMeta {
            project_id: 1,
            project_name: "fs".into(),
            instance_id: String::new(),
            online_datasource_id: 0,
            online_datasource_type: datasource_type,
            online_datasource_name: "online".into(),
            offline_datasource_id: 0,
            feature_db_address: String::new(),
            feature_db_token: String::new(),
            feature_db_vpc_address: String::new(),
        }
    }

    #[test]
    fn test_table_names() {
        let holo = OnlineStore::new(&project(DatasourceType::Hologres)).unwrap();
        assert_eq!(holo.table_name("user_fea"), "fs_user_fea_online");
        assert_eq!(holo.seq_online_table_name("seq"), "fs_seq_seq");
        assert_eq!(holo.seq_offline_table_name("seq"), "fs_seq_seq_offline");
        assert_eq!(holo.datasource_name(), "online");

        let graph = OnlineStore::new(&project(DatasourceType::IGraph)).unwrap();
        assert_eq!(graph.table_name("user_fea"), "user_fea");
        let fdb = OnlineStore::new(&project(DatasourceType::FeatureDB)).unwrap();
        assert_eq!(fdb.table_name("user_fea"), "user_fea");
        let ots = OnlineStore::new(&project(DatasourceType::Ots)).unwrap();
        assert_eq!(ots.table_name("user_fea"), "fs_user_fea_online");

        let redis = OnlineStore::new(&project(DatasourceType::Redis)).unwrap();
        assert_eq!(redis.redis_key_prefix("user_fea"), redis_key_prefix("fs", "user_fea"));
    }

    #[test]
    fn test_unsupported_store() {
        let err = OnlineStore::new(&project(DatasourceType::Mysql)).unwrap_err();
        assert!(matches!(err, FeatureStoreError::Config(_)));
    }
}
