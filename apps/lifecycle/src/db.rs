use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};

const SCHEMA_SQL: &str = include_str!("../migrations/0001_lifecycle.sql");

/// Single shared Postgres connection used by the lifecycle repository.
///
/// Every repository method takes the lock for its whole transaction, so two
/// ledger mutations for the same user can never interleave inside this process.
#[derive(Clone)]
pub struct LifecycleDb {
    client: Arc<Mutex<Client>>,
}

impl LifecycleDb {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(database_url, NoTls)
            .await
            .context("connect to postgres")?;

        tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::error!(reason = %error, "lifecycle postgres connection error");
            }
        });

        Ok(Self {
            client: Arc::new(Mutex::new(client)),
        })
    }

    pub fn client(&self) -> Arc<Mutex<Client>> {
        self.client.clone()
    }

    pub async fn migrate(&self) -> Result<()> {
        let client = self.client.lock().await;
        client
            .batch_execute(SCHEMA_SQL)
            .await
            .context("apply lifecycle schema")?;
        tracing::info!("lifecycle schema applied");
        Ok(())
    }
}
