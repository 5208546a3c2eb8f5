use std::{
    sync::{Arc, RwLock},
    time::Duration,
};

use log::{debug, info};
use tokio::task::JoinHandle;

use crate::error::Result;

const CONNECT_TIMEOUT: Duration = Duration::from_millis(200);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(3);
const TCP_KEEPALIVE: Duration = Duration::from_secs(30);
const MAX_IDLE_PER_HOST: usize = 1000;
pub const VPC_CHECK_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, PartialEq)]
struct AddressState {
    current: String,
    use_vpc: bool,
}

/// HTTP client of the feature database service.
///
/// When a VPC address is configured it is preferred as long as its health
/// endpoint answers; otherwise requests go to the public address.
#[derive(Debug)]
pub struct FeatureDbClient {
    http: reqwest::Client,
    address: String,
    token: String,
    vpc_address: Option<String>,
    state: RwLock<AddressState>,
}

impl FeatureDbClient {
    pub fn new(address: &str, token: &str, vpc_address: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .tcp_keepalive(TCP_KEEPALIVE)
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .build()?;
        let vpc_address = if vpc_address.is_empty() {
            None
        } else if vpc_address.starts_with("http://") || vpc_address.starts_with("https://") {
            Some(vpc_address.to_string())
        } else {
            Some(format!("http://{vpc_address}"))
        };
        Ok(Self {
            http,
            address: address.to_string(),
            token: token.to_string(),
            vpc_address,
            state: RwLock::new(AddressState {
                current: address.to_string(),
                use_vpc: false,
            }),
        })
    }

    /// Builds the client, probes the VPC address once and keeps probing it in
    /// the background. The returned handle stops the probing when aborted.
    pub async fn connect(
        address: &str,
        token: &str,
        vpc_address: &str,
    ) -> Result<(Arc<Self>, Option<JoinHandle<()>>)> {
        let client = Arc::new(Self::new(address, token, vpc_address)?);
        if client.vpc_address.is_none() {
            return Ok((client, None));
        }
        client.check_vpc_address(1).await;
        let background = client.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(VPC_CHECK_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                background.check_vpc_address(1).await;
            }
        });
        Ok((client, Some(handle)))
    }

    pub fn http(&self) -> &reqwest::Client {
        &self.http
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Address requests should currently be sent to. `fallback` forces the
    /// public address, used when a request to the current one failed.
    pub fn current_address(&self, fallback: bool) -> String {
        if fallback {
            return self.address.clone();
        }
        match self.state.read() {
            Ok(state) => state.current.clone(),
            Err(poisoned) => poisoned.into_inner().current.clone(),
        }
    }

    pub fn use_vpc_address(&self) -> bool {
        match self.state.read() {
            Ok(state) => state.use_vpc,
            Err(poisoned) => poisoned.into_inner().use_vpc,
        }
    }

    pub async fn check_vpc_address(&self, max_try_count: usize) {
        let Some(vpc_address) = &self.vpc_address else {
            return;
        };
        let mut healthy = false;
        for _ in 0..max_try_count {
            match self
                .http
                .get(format!("{vpc_address}/health"))
                .header("Content-Type", "application/json")
                .send()
                .await
            {
                Ok(resp) if resp.status() == reqwest::StatusCode::OK => {
                    healthy = true;
                    break;
                }
                Ok(resp) => debug!("FeatureDB vpc health check returned {}", resp.status()),
                Err(e) => debug!("FeatureDB vpc health check failed: {e}"),
            }
        }
        let next = if healthy {
            AddressState {
                current: vpc_address.clone(),
                use_vpc: true,
            }
        } else {
            AddressState {
                current: self.address.clone(),
                use_vpc: false,
            }
        };
        let mut state = match self.state.write() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        };
        if *state != next {
            info!("FeatureDB address switched to {}", next.current);
            *state = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_address_without_vpc() {
        let client = FeatureDbClient::new("http://public:80", "t", "").unwrap();
        assert_eq!(client.current_address(false), "http://public:80");
        assert_eq!(client.current_address(true), "http://public:80");
        assert!(!client.use_vpc_address());
    }

    #[tokio::test]
    async fn test_unreachable_vpc_falls_back_to_public() {
        let client = FeatureDbClient::new("http://public:80", "t", "127.0.0.1:1").unwrap();
        client.check_vpc_address(1).await;
        assert!(!client.use_vpc_address());
        assert_eq!(client.current_address(false), "http://public:80");
    }
}
