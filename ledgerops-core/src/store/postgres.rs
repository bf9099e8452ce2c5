//! PostgreSQL-backed lease store.
//!
//! One row per `(namespace, name)`. Writes after a read are guarded by
//! `resource_version`. Timestamps are stamped with the database clock and
//! [`LeaseStore::observe`] returns the database `NOW()` with the row, so every
//! invocation judges expiry against the same time source whatever its local clock.

use std::str::FromStr;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use native_tls::TlsConnector;
use postgres_native_tls::MakeTlsConnector;
use tokio_postgres::{Client, NoTls, Row};
use tracing::{debug, info, warn};

use super::{LeaseRecord, LeaseStore};
use crate::config::{is_plain_identifier, LeaseConfig};
use crate::error::StoreError;

const RECORD_COLUMNS: &str = "namespace, name, holder_identity, duration_seconds, \
     acquire_time, renew_time, transitions, resource_version";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PgSslMode {
    Disable,
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl FromStr for PgSslMode {
    type Err = std::convert::Infallible;

    /// Unknown values fall back to `Disable`, as libpq-style tooling does for empty input.
    fn from_str(value: &str) -> std::result::Result<Self, Self::Err> {
        Ok(match value.trim().to_lowercase().as_str() {
            "prefer" => Self::Prefer,
            "require" => Self::Require,
            "verify-ca" => Self::VerifyCa,
            "verify-full" => Self::VerifyFull,
            _ => Self::Disable,
        })
    }
}

impl PgSslMode {
    fn connector(self) -> Result<Option<MakeTlsConnector>> {
        let mut builder = TlsConnector::builder();
        match self {
            Self::Disable => return Ok(None),
            Self::Prefer | Self::Require => {
                builder
                    .danger_accept_invalid_certs(true)
                    .danger_accept_invalid_hostnames(true);
            }
            Self::VerifyCa => {
                builder.danger_accept_invalid_hostnames(true);
            }
            Self::VerifyFull => {}
        }
        let connector = builder
            .build()
            .with_context(|| format!("failed to build TLS connector for ssl mode {self:?}"))?;
        Ok(Some(MakeTlsConnector::new(connector)))
    }
}

/// Connection string built from `PG*` environment variables.
fn connection_string_from_env() -> String {
    let var = |key: &str, default: &str| std::env::var(key).unwrap_or_else(|_| default.to_string());
    let mut conn = format!(
        "host={} port={} user={} dbname={}",
        var("PGHOST", "localhost"),
        var("PGPORT", "5432"),
        var("PGUSER", "postgres"),
        var("PGDATABASE", "postgres"),
    );
    if let Ok(password) = std::env::var("PGPASSWORD") {
        conn.push_str(&format!(" password={password}"));
    }
    conn
}

fn ssl_mode_from(config: &LeaseConfig) -> PgSslMode {
    config
        .store_ssl_mode
        .clone()
        .or_else(|| std::env::var("PGSSLMODE").ok())
        .map(|mode| PgSslMode::from_str(&mode).unwrap_or(PgSslMode::Disable))
        .unwrap_or(PgSslMode::Disable)
}

fn spawn_connection<T>(connection: T)
where
    T: std::future::Future<Output = std::result::Result<(), tokio_postgres::Error>>
        + Send
        + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(error = %e, "lease store connection error");
        }
    });
}

async fn connect(connection_string: &str, ssl_mode: PgSslMode) -> Result<Client> {
    let Some(connector) = ssl_mode.connector()? else {
        debug!("connecting to lease store without TLS");
        let (client, connection) = tokio_postgres::connect(connection_string, NoTls).await?;
        spawn_connection(connection);
        return Ok(client);
    };

    debug!(?ssl_mode, "connecting to lease store with TLS");
    match tokio_postgres::connect(connection_string, connector).await {
        Ok((client, connection)) => {
            spawn_connection(connection);
            Ok(client)
        }
        Err(err) if ssl_mode == PgSslMode::Prefer => {
            warn!(error = %err, "TLS connection failed in ssl mode prefer, retrying without TLS");
            let (client, connection) = tokio_postgres::connect(connection_string, NoTls).await?;
            spawn_connection(connection);
            Ok(client)
        }
        Err(err) => Err(err.into()),
    }
}

fn to_i64(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value).with_context(|| format!("{field} {value} does not fit in BIGINT"))
}

fn row_to_record(row: &Row) -> Result<LeaseRecord> {
    let duration: i64 = row.try_get("duration_seconds")?;
    let transitions: i64 = row.try_get("transitions")?;
    let version: i64 = row.try_get("resource_version")?;
    Ok(LeaseRecord {
        namespace: row.try_get("namespace")?,
        name: row.try_get("name")?,
        holder_identity: row.try_get("holder_identity")?,
        duration_seconds: u64::try_from(duration).context("negative duration_seconds")?,
        acquire_time: row.try_get::<_, DateTime<Utc>>("acquire_time")?,
        renew_time: row.try_get::<_, Option<DateTime<Utc>>>("renew_time")?,
        transitions: u64::try_from(transitions).context("negative transitions")?,
        resource_version: u64::try_from(version).context("negative resource_version")?,
    })
}

/// Lease store over a single PostgreSQL connection.
pub struct PostgresLeaseStore {
    client: Client,
    table: String,
}

impl PostgresLeaseStore {
    /// Connect using `store_url` (or the `PG*` environment) and the configured table.
    pub async fn connect(config: &LeaseConfig) -> Result<Self> {
        let table = config.store_table.clone();
        if !is_plain_identifier(&table) {
            bail!("invalid lease table name {table:?}");
        }
        let connection_string = config
            .store_url
            .clone()
            .unwrap_or_else(connection_string_from_env);
        let client = connect(&connection_string, ssl_mode_from(config))
            .await
            .context("failed to connect to lease store")?;
        Ok(Self { client, table })
    }

    /// Create the lease table if it does not exist.
    pub async fn ensure_schema(&self) -> Result<()> {
        self.client
            .batch_execute(&format!(
                "CREATE TABLE IF NOT EXISTS {} (\
                     namespace TEXT NOT NULL,\
                     name TEXT NOT NULL,\
                     holder_identity TEXT NOT NULL,\
                     duration_seconds BIGINT NOT NULL CHECK (duration_seconds > 0),\
                     acquire_time TIMESTAMPTZ NOT NULL,\
                     renew_time TIMESTAMPTZ,\
                     transitions BIGINT NOT NULL DEFAULT 0,\
                     resource_version BIGINT NOT NULL DEFAULT 1,\
                     PRIMARY KEY (namespace, name)\
                 )",
                self.table
            ))
            .await
            .with_context(|| format!("creating lease table {}", self.table))?;
        info!(table = %self.table, "lease table ready");
        Ok(())
    }

    async fn query_record(
        &self,
        sql: &str,
        params: &[&(dyn tokio_postgres::types::ToSql + Sync)],
        what: &str,
    ) -> Result<Option<LeaseRecord>> {
        let row = self
            .client
            .query_opt(sql, params)
            .await
            .with_context(|| format!("{what} lease record"))?;
        row.as_ref().map(row_to_record).transpose()
    }
}

#[async_trait]
impl LeaseStore for PostgresLeaseStore {
    async fn read(&self, namespace: &str, name: &str) -> Result<Option<LeaseRecord>, StoreError> {
        let sql = format!(
            "SELECT {RECORD_COLUMNS} FROM {} WHERE namespace = $1 AND name = $2",
            self.table
        );
        Ok(self
            .query_record(&sql, &[&namespace, &name], "reading")
            .await?)
    }

    async fn observe(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(Option<LeaseRecord>, DateTime<Utc>), StoreError> {
        // One row always comes back; the record columns are NULL when absent.
        let sql = format!(
            "SELECT NOW() AS observed_at, {RECORD_COLUMNS} \
             FROM (SELECT 1) AS clock \
             LEFT JOIN {} ON namespace = $1 AND name = $2",
            self.table
        );
        let row = self
            .client
            .query_one(sql.as_str(), &[&namespace, &name])
            .await
            .context("observing lease record")?;
        let observed_at: DateTime<Utc> = row
            .try_get("observed_at")
            .context("reading database clock")?;
        let present: Option<String> = row
            .try_get("namespace")
            .context("reading lease namespace")?;
        let record = match present {
            Some(_) => Some(row_to_record(&row)?),
            None => None,
        };
        Ok((record, observed_at))
    }

    async fn create(
        &self,
        namespace: &str,
        name: &str,
        holder_identity: &str,
        duration_seconds: u64,
    ) -> Result<LeaseRecord, StoreError> {
        let duration = to_i64(duration_seconds, "duration_seconds")?;
        let sql = format!(
            "INSERT INTO {} (namespace, name, holder_identity, duration_seconds, \
                 acquire_time, renew_time, transitions, resource_version) \
             VALUES ($1, $2, $3, $4, NOW(), NULL, 0, 1) \
             ON CONFLICT (namespace, name) DO NOTHING \
             RETURNING {RECORD_COLUMNS}",
            self.table
        );
        self.query_record(
            &sql,
            &[&namespace, &name, &holder_identity, &duration],
            "creating",
        )
        .await?
        .ok_or_else(|| StoreError::conflict(namespace, name))
    }

    async fn renew(&self, record: &LeaseRecord) -> Result<LeaseRecord, StoreError> {
        let version = to_i64(record.resource_version, "resource_version")?;
        let sql = format!(
            "UPDATE {} SET renew_time = NOW(), resource_version = resource_version + 1 \
             WHERE namespace = $1 AND name = $2 AND resource_version = $3 \
             RETURNING {RECORD_COLUMNS}",
            self.table
        );
        self.query_record(
            &sql,
            &[&record.namespace, &record.name, &version],
            "renewing",
        )
        .await?
        .ok_or_else(|| StoreError::conflict(&record.namespace, &record.name))
    }

    async fn transfer(
        &self,
        record: &LeaseRecord,
        holder_identity: &str,
    ) -> Result<LeaseRecord, StoreError> {
        let version = to_i64(record.resource_version, "resource_version")?;
        let sql = format!(
            "UPDATE {} SET holder_identity = $4, renew_time = NOW(), \
                 transitions = transitions + 1, resource_version = resource_version + 1 \
             WHERE namespace = $1 AND name = $2 AND resource_version = $3 \
             RETURNING {RECORD_COLUMNS}",
            self.table
        );
        self.query_record(
            &sql,
            &[&record.namespace, &record.name, &version, &holder_identity],
            "transferring",
        )
        .await?
        .ok_or_else(|| StoreError::conflict(&record.namespace, &record.name))
    }

    async fn delete(&self, record: &LeaseRecord) -> Result<(), StoreError> {
        let version = to_i64(record.resource_version, "resource_version")?;
        let sql = format!(
            "DELETE FROM {} WHERE namespace = $1 AND name = $2 AND resource_version = $3",
            self.table
        );
        let deleted = self
            .client
            .execute(sql.as_str(), &[&record.namespace, &record.name, &version])
            .await
            .context("deleting lease record")?;
        if deleted == 0
            && self
                .read(&record.namespace, &record.name)
                .await?
                .is_some()
        {
            return Err(StoreError::conflict(&record.namespace, &record.name));
        }
        Ok(())
    }
}
