use std::sync::Arc;
use std::time::Duration;

use apc_domain::ports::BoxFuture;
use apc_domain::ports::db::{DbAdapter, DbError};
use surrealdb::Surreal;
use surrealdb::engine::remote::ws::{Client, Ws};
use surrealdb::opt::auth::Root;
use tokio::net::TcpStream;
use tokio::time::timeout;
use url::Url;

use crate::config::AppConfig;

#[derive(Debug, Clone)]
pub struct DbConfig {
    pub endpoint: String,
    pub namespace: String,
    pub database: String,
    pub username: String,
    pub password: String,
}

impl DbConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            endpoint: config.surreal_endpoint.clone(),
            namespace: config.surreal_ns.clone(),
            database: config.surreal_db.clone(),
            username: config.surreal_user.clone(),
            password: config.surreal_pass.clone(),
        }
    }

    /// Opens one signed-in client scoped to the configured namespace and database.
    pub async fn connect(&self) -> anyhow::Result<Arc<Surreal<Client>>> {
        let db = Surreal::<Client>::init();
        db.connect::<Ws>(&self.endpoint).await?;
        db.signin(Root {
            username: self.username.clone(),
            password: self.password.clone(),
        })
        .await?;
        db.use_ns(&self.namespace).use_db(&self.database).await?;
        Ok(Arc::new(db))
    }
}

#[derive(Debug, Clone)]
pub struct SurrealAdapter {
    config: DbConfig,
}

impl SurrealAdapter {
    pub fn new(config: DbConfig) -> Self {
        Self { config }
    }
}

impl DbAdapter for SurrealAdapter {
    fn name(&self) -> &'static str {
        "surrealdb"
    }

    fn health_check(&self) -> BoxFuture<'_, Result<(), DbError>> {
        Box::pin(async move {
            let endpoint = self.config.endpoint.as_str();
            let address = parse_socket_address(endpoint)?;
            timeout(Duration::from_secs(2), TcpStream::connect(address))
                .await
                .map_err(|_| DbError::Unavailable("surreal endpoint connect timed out".to_string()))?
                .map_err(|err| {
                    DbError::Unavailable(format!("surreal endpoint connect failed: {err}"))
                })?;
            tracing::debug!(
                endpoint,
                namespace = %self.config.namespace,
                database = %self.config.database,
                "surreal health check succeeded"
            );
            Ok(())
        })
    }
}

/// Health adapter for the in-memory backend; always reachable.
#[derive(Debug, Clone, Copy, Default)]
pub struct MemoryAdapter;

impl DbAdapter for MemoryAdapter {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn health_check(&self) -> BoxFuture<'_, Result<(), DbError>> {
        Box::pin(async { Ok(()) })
    }
}

fn parse_socket_address(endpoint: &str) -> Result<String, DbError> {
    let normalized = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("ws://{endpoint}")
    };
    let parsed = Url::parse(&normalized).map_err(|err| {
        DbError::Unavailable(format!("invalid surreal endpoint '{endpoint}': {err}"))
    })?;
    let host = parsed.host_str().ok_or_else(|| {
        DbError::Unavailable(format!("missing surreal host in endpoint '{endpoint}'"))
    })?;
    let port = parsed.port().unwrap_or(match parsed.scheme() {
        "wss" | "https" => 443,
        _ => 8000,
    });
    Ok(format!("{host}:{port}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socket_address_defaults_follow_scheme() {
        assert_eq!(
            parse_socket_address("ws://db.local").expect("address"),
            "db.local:8000"
        );
        assert_eq!(
            parse_socket_address("wss://db.local").expect("address"),
            "db.local:443"
        );
        assert_eq!(
            parse_socket_address("127.0.0.1:8123").expect("address"),
            "127.0.0.1:8123"
        );
    }
}
