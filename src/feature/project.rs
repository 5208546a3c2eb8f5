use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Backend families an online datasource can belong to.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DatasourceType {
    Hologres,
    Redis,
    Mysql,
    #[strum(serialize = "igraph")]
    #[serde(rename = "igraph")]
    IGraph,
    TableStore,
    Ots,
    #[strum(serialize = "featuredb")]
    #[serde(rename = "featuredb")]
    FeatureDB,
    MaxCompute,
    Spark,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DatasourceMeta {
    #[serde(default)]
    pub datasource_id: i64,
    pub name: String,
    #[serde(rename = "type")]
    pub datasource_type: DatasourceType,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub database: String,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ProjectMeta {
    #[serde(default)]
    pub project_id: i64,
    pub project_name: String,
    /// FeatureDB database name.
    #[serde(default)]
    pub instance_id: String,
    #[serde(default)]
    pub online_datasource_id: i64,
    pub online_datasource_type: DatasourceType,
    /// Name the online datasource is registered under.
    #[serde(default)]
    pub online_datasource_name: String,
    #[serde(default)]
    pub offline_datasource_id: i64,
    #[serde(default)]
    pub feature_db_address: String,
    #[serde(default)]
    pub feature_db_token: String,
    #[serde(default)]
    pub feature_db_vpc_address: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_datasource_type_names() {
        assert_eq!(DatasourceType::from_str("featuredb").unwrap(), DatasourceType::FeatureDB);
        assert_eq!(DatasourceType::from_str("tablestore").unwrap(), DatasourceType::TableStore);
        assert_eq!(DatasourceType::IGraph.to_string(), "igraph");
        let ty: DatasourceType = serde_json::from_str("\"hologres\"").unwrap();
        assert_eq!(ty, DatasourceType::Hologres);
        let ty: DatasourceType = serde_json::from_str("\"featuredb\"").unwrap();
        assert_eq!(ty, DatasourceType::FeatureDB);
    }
}
