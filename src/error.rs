use thiserror::Error;

#[derive(Error, Debug)]
pub enum FeatureStoreError {
    #[error("{0}")]
    Config(String),
    #[error("feature name :{0} not found in the featureview fields")]
    FeatureNotFound(String),
    #[error("sequence feature name :{0} not found in feature view config")]
    SequenceFeatureNotFound(String),
    #[error("behavior feature name :{0} not found in feature view config")]
    BehaviorFeatureNotFound(String),
    #[error("join id:{0} not found")]
    JoinIdNotFound(String),
    #[error("join id:{0} length not equal")]
    JoinIdLengthNotEqual(String),
    #[error("feature entity name:{0} not found")]
    FeatureEntityNotFound(String),
    #[error("feature view :{0} not found")]
    FeatureViewNotFound(String),
    #[error("model :{0} not found")]
    ModelNotFound(String),
    #[error("project :{0} not found")]
    ProjectNotFound(String),
    #[error("{0}")]
    Unsupported(String),
    #[error("row error: {0}")]
    RowError(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("backend error: {0}")]
    Backend(String),
    #[error(transparent)]
    Postgres(#[from] tokio_postgres::Error),
    #[error(transparent)]
    Pool(#[from] deadpool_postgres::PoolError),
    #[error(transparent)]
    Http(#[from] reqwest::Error),
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}

impl FeatureStoreError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        FeatureStoreError::Config(msg.into())
    }

    pub(crate) fn decode(msg: impl Into<String>) -> Self {
        FeatureStoreError::Decode(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, FeatureStoreError>;
