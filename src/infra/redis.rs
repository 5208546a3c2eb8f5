use redis::aio::MultiplexedConnection;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct RedisConnector {
    client: redis::Client,
}

impl RedisConnector {
    pub fn new(uri: impl redis::IntoConnectionInfo) -> Result<Self> {
        Ok(Self {
            client: redis::Client::open(uri)?,
        })
    }

    pub async fn get_connection(&self) -> Result<MultiplexedConnection> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[cfg(test)]
#[tokio::test]
async fn test_redis() {
    use redis::AsyncCommands;
    let redis_uri = std::env::var("REDIS_URI");
    if let Ok(uri) = redis_uri {
        let connector = RedisConnector::new(uri).unwrap();
        let mut conn = connector.get_connection().await.unwrap();
        let pong: String = redis::cmd("PING").query_async(&mut conn).await.unwrap();
        assert_eq!(pong, "PONG");
        let _: () = conn.set("fs_test_key", "456").await.unwrap();
        let val: String = conn.get("fs_test_key").await.unwrap();
        assert_eq!(val, "456");
        let _: () = conn.del("fs_test_key").await.unwrap();
    }
}
