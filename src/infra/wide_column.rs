//! Request and response shapes of a wide-column store. The store's SDK is
//! plugged in by implementing [WideColumnClient] and registering it under the
//! datasource name.

use std::fmt::Debug;

use async_trait::async_trait;

use crate::{error::Result, FeatureValue};

#[derive(Debug, Clone, PartialEq)]
pub enum PrimaryKeyValue {
    Int64(i64),
    String(String),
    /// Lower bound of a range scan on this column.
    Min,
    /// Upper bound of a range scan on this column.
    Max,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PrimaryKeyColumn {
    pub name: String,
    pub value: PrimaryKeyValue,
}

impl PrimaryKeyColumn {
    pub fn new(name: &str, value: PrimaryKeyValue) -> Self {
        Self {
            name: name.to_string(),
            value,
        }
    }
}

pub type PrimaryKey = Vec<PrimaryKeyColumn>;

#[derive(Debug, Clone, PartialEq)]
pub struct BatchGetRowRequest {
    pub table: String,
    pub rows: Vec<PrimaryKey>,
    pub columns_to_get: Vec<String>,
    pub max_version: i32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowResult {
    pub primary_key: Vec<(String, FeatureValue)>,
    pub columns: Vec<(String, FeatureValue)>,
    /// Set when the store failed to read this row.
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GetRangeRequest {
    pub table: String,
    pub start_primary_key: PrimaryKey,
    pub end_primary_key: PrimaryKey,
    pub columns_to_get: Vec<String>,
    /// Version time range in milliseconds, `[start, end)`.
    pub time_range: Option<(i64, i64)>,
    pub max_version: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GetRangeResponse {
    pub rows: Vec<RowResult>,
    pub next_start_primary_key: Option<PrimaryKey>,
}

#[async_trait]
pub trait WideColumnClient: Send + Sync + Debug {
    async fn batch_get_row(&self, request: BatchGetRowRequest) -> Result<Vec<RowResult>>;

    async fn get_range(&self, request: GetRangeRequest) -> Result<GetRangeResponse>;
}
