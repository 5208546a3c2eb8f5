use std::{collections::HashMap, fmt::Debug, time::Duration};

use async_trait::async_trait;
use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{FeatureStoreError, Result};

#[derive(Serialize, Debug)]
pub struct GraphReadRequest<'a> {
    pub query_string: &'a str,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct GraphReadResponse {
    #[serde(default)]
    pub result: Vec<GraphResultData>,
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct GraphResultData {
    #[serde(default)]
    pub data: Vec<HashMap<String, serde_json::Value>>,
}

/// Executes a textual graph read query and returns the matched records.
#[async_trait]
pub trait GraphClient: Send + Sync + Debug {
    async fn read(&self, query: &str) -> Result<GraphReadResponse>;
}

/// Graph client speaking the JSON read envelope over HTTP.
#[derive(Debug, Clone)]
pub struct HttpGraphClient {
    http: reqwest::Client,
    endpoint: String,
    username: String,
    password: String,
}

impl HttpGraphClient {
    pub fn new(endpoint: &str, username: &str, password: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(3))
            .build()?;
        Ok(Self {
            http,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            username: username.to_string(),
            password: password.to_string(),
        })
    }
}

#[async_trait]
impl GraphClient for HttpGraphClient {
    async fn read(&self, query: &str) -> Result<GraphReadResponse> {
        debug!("graph query: {query}");
        let response = self
            .http
            .post(format!("{}/read", self.endpoint))
            .basic_auth(&self.username, Some(&self.password))
            .json(&GraphReadRequest {
                query_string: query,
            })
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(FeatureStoreError::Backend(format!(
                "graph read failed with status {status}: {body}"
            )));
        }
        Ok(response.json::<GraphReadResponse>().await?)
    }
}
