use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_postgres::NoTls;
use tracing::{error, info};
use uuid::Uuid;

/// Table name → ordered column list, as introspected from a tenant's
/// external database.
pub type ExternalSchema = BTreeMap<String, Vec<String>>;

/// A tenant's external relational database. Sessions are read-only; the
/// guard validates statements before they ever reach `run_select`.
#[async_trait]
pub trait ExternalDatabase: Send + Sync + 'static {
    async fn schema(&self) -> Result<ExternalSchema>;

    /// Executes a validated SELECT and returns rows as JSON objects.
    async fn run_select(&self, sql: &str) -> Result<Vec<serde_json::Value>>;
}

/// Looks up the external database registered for a tenant, if any.
#[async_trait]
pub trait ExternalDbRegistry: Send + Sync + 'static {
    async fn database_for(&self, tenant_id: Uuid) -> Result<Option<Arc<dyn ExternalDatabase>>>;
}

pub struct PgExternalDatabase {
    client: tokio_postgres::Client,
}

impl PgExternalDatabase {
    /// Connects and pins the session read-only. The connection driver task
    /// lives for as long as the client; dropping the client ends it.
    pub async fn connect(url: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(url, NoTls)
            .await
            .context("failed to connect to external database")?;

        tokio::spawn(async move {
            if let Err(err) = connection.await {
                error!(error = %err, "external database connection closed");
            }
        });

        client
            .execute("SET default_transaction_read_only = on", &[])
            .await
            .context("failed to set external session read-only")?;

        Ok(Self { client })
    }
}

#[async_trait]
impl ExternalDatabase for PgExternalDatabase {
    async fn schema(&self) -> Result<ExternalSchema> {
        let rows = self
            .client
            .query(
                "SELECT table_name, column_name \
                 FROM information_schema.columns \
                 WHERE table_schema = 'public' \
                 ORDER BY table_name, ordinal_position",
                &[],
            )
            .await
            .context("failed to introspect external schema")?;

        let mut schema = ExternalSchema::new();
        for row in rows {
            let table: String = row.get(0);
            let column: String = row.get(1);
            schema.entry(table).or_default().push(column);
        }
        Ok(schema)
    }

    async fn run_select(&self, sql: &str) -> Result<Vec<serde_json::Value>> {
        // Let Postgres do the row-to-JSON conversion so aggregates with
        // exotic types (numeric, intervals) survive intact. `sql` has
        // already passed statement validation.
        let wrapped = format!(
            "SELECT COALESCE(json_agg(row_to_json(t)), '[]'::json) FROM ({sql}) AS t"
        );
        let row = self
            .client
            .query_one(&wrapped, &[])
            .await
            .context("external query execution failed")?;
        let value: serde_json::Value = row.get(0);
        match value {
            serde_json::Value::Array(rows) => Ok(rows),
            other => Err(anyhow!("unexpected external query result shape: {other}")),
        }
    }
}

/// Lazily connects to each tenant's external database and caches the
/// connection for reuse across turns.
pub struct ConnectionManager {
    urls: RwLock<HashMap<Uuid, String>>,
    connected: RwLock<HashMap<Uuid, Arc<dyn ExternalDatabase>>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self {
            urls: RwLock::new(HashMap::new()),
            connected: RwLock::new(HashMap::new()),
        }
    }

    pub async fn register(&self, tenant_id: Uuid, url: String) {
        self.urls.write().await.insert(tenant_id, url);
        self.connected.write().await.remove(&tenant_id);
    }

    pub async fn deregister(&self, tenant_id: Uuid) {
        self.urls.write().await.remove(&tenant_id);
        self.connected.write().await.remove(&tenant_id);
    }
}

impl Default for ConnectionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExternalDbRegistry for ConnectionManager {
    async fn database_for(&self, tenant_id: Uuid) -> Result<Option<Arc<dyn ExternalDatabase>>> {
        if let Some(db) = self.connected.read().await.get(&tenant_id) {
            return Ok(Some(db.clone()));
        }

        let url = match self.urls.read().await.get(&tenant_id) {
            Some(url) => url.clone(),
            None => return Ok(None),
        };

        let db: Arc<dyn ExternalDatabase> = Arc::new(PgExternalDatabase::connect(&url).await?);
        self.connected.write().await.insert(tenant_id, db.clone());
        info!(%tenant_id, "connected to external tenant database");
        Ok(Some(db))
    }
}

/// Introspected schemas are fetched once per tenant and reused; a tenant
/// changing their external schema picks it up after `invalidate`.
pub struct SchemaCache {
    cached: RwLock<HashMap<Uuid, Arc<ExternalSchema>>>,
}

impl SchemaCache {
    pub fn new() -> Self {
        Self {
            cached: RwLock::new(HashMap::new()),
        }
    }

    pub async fn schema_for(
        &self,
        tenant_id: Uuid,
        database: &dyn ExternalDatabase,
    ) -> Result<Arc<ExternalSchema>> {
        if let Some(schema) = self.cached.read().await.get(&tenant_id) {
            return Ok(schema.clone());
        }

        let schema = Arc::new(database.schema().await?);
        self.cached
            .write()
            .await
            .insert(tenant_id, schema.clone());
        Ok(schema)
    }

    pub async fn invalidate(&self, tenant_id: Uuid) {
        self.cached.write().await.remove(&tenant_id);
    }
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new()
    }
}
