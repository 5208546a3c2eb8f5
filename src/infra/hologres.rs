use std::{cell::Cell, time::Duration};

use deadpool_postgres::{
    Hook, HookError, Manager, ManagerConfig, Object, Pool, RecyclingMethod, Runtime,
};
use log::{debug, info};
use tokio_postgres::NoTls;

use crate::error::{FeatureStoreError, Result};

/// Applied once to every new connection.
pub const STATEMENT_TIMEOUT_MS: u64 = 500;
pub const MAX_OPEN_CONNECTIONS: usize = 100;
pub const MAX_IDLE_CONNECTIONS: usize = 50;
pub const MAX_CONNECTION_LIFETIME: Duration = Duration::from_secs(60 * 60);
const POOL_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Pooled connections to a columnar-SQL (PostgreSQL wire protocol) datasource.
#[derive(Clone)]
pub struct HologresConnector {
    name: String,
    pool: Pool,
}

impl std::fmt::Debug for HologresConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HologresConnector")
            .field("name", &self.name)
            .field("status", &self.pool.status())
            .finish()
    }
}

impl HologresConnector {
    pub fn new(name: &str, dsn: &str) -> Result<Self> {
        let mut pg_config: tokio_postgres::Config = dsn.parse()?;
        pg_config.options(&format!("-c statement_timeout={STATEMENT_TIMEOUT_MS}"));
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(MAX_OPEN_CONNECTIONS)
            .runtime(Runtime::Tokio1)
            .wait_timeout(Some(POOL_WAIT_TIMEOUT))
            .pre_recycle(Hook::sync_fn(|_, metrics| {
                if metrics.age() > MAX_CONNECTION_LIFETIME {
                    return Err(HookError::Message(
                        "connection reached its maximum lifetime".into(),
                    ));
                }
                Ok(())
            }))
            .build()
            .map_err(|e| {
                FeatureStoreError::config(format!("create hologres pool {name} failed: {e}"))
            })?;
        info!("Registered hologres datasource {name}");
        Ok(Self {
            name: name.to_string(),
            pool,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn get(&self) -> Result<Object> {
        self.trim_idle();
        Ok(self.pool.get().await?)
    }

    /// Closes idle connections beyond [MAX_IDLE_CONNECTIONS].
    fn trim_idle(&self) {
        let available = usize::try_from(self.pool.status().available).unwrap_or_default();
        let surplus = idle_surplus(available);
        if surplus == 0 {
            return;
        }
        let closed = Cell::new(0usize);
        let _ = self.pool.retain(|_, _| {
            if closed.get() < surplus {
                closed.set(closed.get() + 1);
                return false;
            }
            true
        });
        debug!("Closed {} idle connections of {}", closed.get(), self.name);
    }
}

fn idle_surplus(available: usize) -> usize {
    available.saturating_sub(MAX_IDLE_CONNECTIONS)
}

#[cfg(test)]
#[test]
fn test_idle_surplus() {
    assert_eq!(idle_surplus(0), 0);
    assert_eq!(idle_surplus(MAX_IDLE_CONNECTIONS), 0);
    assert_eq!(idle_surplus(MAX_IDLE_CONNECTIONS + 7), 7);
}

#[cfg(test)]
#[tokio::test]
async fn test_idle_connections_bounded() {
    if let Ok(dsn) = std::env::var("HOLOGRES_DSN") {
        let connector = HologresConnector::new("test", &dsn).unwrap();
        let clients = futures::future::try_join_all(
            (0..MAX_IDLE_CONNECTIONS + 5).map(|_| connector.pool.get()),
        )
        .await
        .unwrap();
        drop(clients);
        let _client = connector.get().await.unwrap();
        let available = usize::try_from(connector.pool.status().available).unwrap();
        assert!(available < MAX_IDLE_CONNECTIONS);
    }
}

#[cfg(test)]
#[tokio::test]
async fn test_hologres_connect() {
    if let Ok(dsn) = std::env::var("HOLOGRES_DSN") {
        let connector = HologresConnector::new("test", &dsn).unwrap();
        let client = connector.get().await.unwrap();
        let row = client.query_one("SHOW statement_timeout", &[]).await.unwrap();
        let timeout: String = row.get(0);
        assert_eq!(timeout, "500ms");
    }
}
