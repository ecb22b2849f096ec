//! Mirrors terminal message status back into the source of truth.
//!
//! Every write is an idempotent "set terminal status" keyed by message id;
//! the stream entry that produced it doubles as the idempotency key, so a
//! replayed batch re-submits identical records.

use async_trait::async_trait;
use parley_events::StreamEntryId;
use reqwest::Client;
use serde::Serialize;
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{OpenOptions, create_dir_all};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tokio_postgres::NoTls;
use tracing::info;

const INIT_SQL: &str = include_str!("../migrations/001_message_status.sql");

// read wins over delivered; delivered never overwrites read
const UPSERT_SQL: &str = "INSERT INTO message_status (message_id, status, status_at_ms, entry_id) \
     VALUES ($1, $2, $3, $4) \
     ON CONFLICT (message_id) DO UPDATE SET \
     status = EXCLUDED.status, status_at_ms = EXCLUDED.status_at_ms, \
     entry_id = EXCLUDED.entry_id, updated_at = now() \
     WHERE message_status.status = 'delivered' AND EXCLUDED.status = 'read'";

#[derive(Debug)]
pub enum MirrorError {
    Io,
    Serialization,
    Http(String),
    Database(String),
    Config(String),
}

impl Display for MirrorError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io => write!(f, "mirror io failure"),
            Self::Serialization => write!(f, "mirror serialization failure"),
            Self::Http(reason) => write!(f, "mirror http failure: {}", reason),
            Self::Database(reason) => write!(f, "mirror database failure: {}", reason),
            Self::Config(reason) => write!(f, "mirror misconfigured: {}", reason),
        }
    }
}

impl Error for MirrorError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalStatus {
    Delivered,
    Read,
}

impl TerminalStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminalStatus::Delivered => "delivered",
            TerminalStatus::Read => "read",
        }
    }
}

impl Display for TerminalStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MirrorRecord {
    pub message_id: String,
    pub status: TerminalStatus,
    /// Millisecond timestamp carried by the acknowledgement that reached the status.
    pub status_at: i64,
    pub entry_id: StreamEntryId,
}

impl MirrorRecord {
    /// Stable across replays of the same stream entry.
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}:{}", self.entry_id, self.message_id, self.status)
    }
}

/// Persists terminal statuses upstream.
#[async_trait]
pub trait StatusMirror: Send + Sync {
    async fn submit(&self, record: &MirrorRecord) -> Result<(), MirrorError>;
}

pub struct NullMirror;

#[async_trait]
impl StatusMirror for NullMirror {
    async fn submit(&self, _record: &MirrorRecord) -> Result<(), MirrorError> {
        Ok(())
    }
}

pub struct DebugMirror;

#[async_trait]
impl StatusMirror for DebugMirror {
    async fn submit(&self, record: &MirrorRecord) -> Result<(), MirrorError> {
        info!(
            target: "parley::mirror",
            message_id = %record.message_id,
            status = %record.status,
            entry = %record.entry_id,
            "status mirror debug submission"
        );
        Ok(())
    }
}

/// Appends records as newline-delimited JSON.
pub struct FileMirror {
    path: PathBuf,
    // appends from concurrent submits must not interleave
    guard: Mutex<()>,
}

impl FileMirror {
    pub async fn new(path: PathBuf) -> Result<Self, MirrorError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            create_dir_all(parent).await.map_err(|_| MirrorError::Io)?;
        }
        Ok(Self {
            path,
            guard: Mutex::new(()),
        })
    }
}

#[async_trait]
impl StatusMirror for FileMirror {
    async fn submit(&self, record: &MirrorRecord) -> Result<(), MirrorError> {
        let mut line = serde_json::to_vec(record).map_err(|_| MirrorError::Serialization)?;
        line.push(b'\n');
        let _guard = self.guard.lock().await;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|_| MirrorError::Io)?;
        file.write_all(&line).await.map_err(|_| MirrorError::Io)?;
        file.flush().await.map_err(|_| MirrorError::Io)
    }
}

/// POSTs each record as JSON with an `Idempotency-Key` header.
pub struct HttpMirror {
    client: Client,
    endpoint: String,
}

impl HttpMirror {
    pub fn new(endpoint: &str) -> Result<Self, MirrorError> {
        let client = Client::builder()
            .user_agent("parley-mirror/1.0")
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| MirrorError::Http(err.to_string()))?;
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
        })
    }
}

#[async_trait]
impl StatusMirror for HttpMirror {
    async fn submit(&self, record: &MirrorRecord) -> Result<(), MirrorError> {
        let response = self
            .client
            .post(&self.endpoint)
            .header("content-type", "application/json")
            .header("idempotency-key", record.idempotency_key())
            .json(record)
            .send()
            .await
            .map_err(|err| MirrorError::Http(err.to_string()))?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = match response.text().await {
            Ok(text) => text,
            Err(err) => format!("<body read failed: {err}>"),
        };
        let mut reason = format!("http {} {}", status.as_u16(), body.trim());
        if reason.len() > 200 {
            reason.truncate(200);
        }
        Err(MirrorError::Http(reason))
    }
}

/// Upserts into `message_status`, never moving a message from read back to delivered.
pub struct PostgresMirror {
    client: tokio_postgres::Client,
    _connection: tokio::task::JoinHandle<()>,
}

impl PostgresMirror {
    pub async fn connect(dsn: &str) -> Result<Self, MirrorError> {
        let (client, connection) = tokio_postgres::connect(dsn, NoTls)
            .await
            .map_err(|err| MirrorError::Database(err.to_string()))?;
        let task = tokio::spawn(async move {
            if let Err(error) = connection.await {
                tracing::error!("postgres connection stopped: {}", error);
            }
        });
        Ok(Self {
            client,
            _connection: task,
        })
    }

    /// Applies the bundled migration.
    pub async fn migrate(&self) -> Result<(), MirrorError> {
        self.client
            .batch_execute(INIT_SQL)
            .await
            .map_err(|err| MirrorError::Database(err.to_string()))
    }
}

#[async_trait]
impl StatusMirror for PostgresMirror {
    async fn submit(&self, record: &MirrorRecord) -> Result<(), MirrorError> {
        let entry_id = record.entry_id.to_string();
        self.client
            .execute(
                UPSERT_SQL,
                &[
                    &record.message_id,
                    &record.status.as_str(),
                    &record.status_at,
                    &entry_id,
                ],
            )
            .await
            .map_err(|err| MirrorError::Database(err.to_string()))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MirrorMode {
    Null,
    Debug,
    File,
    Http,
    Postgres,
}

impl FromStr for MirrorMode {
    type Err = MirrorError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "" | "null" | "none" => Ok(MirrorMode::Null),
            "debug" => Ok(MirrorMode::Debug),
            "file" => Ok(MirrorMode::File),
            "http" => Ok(MirrorMode::Http),
            "postgres" => Ok(MirrorMode::Postgres),
            other => Err(MirrorError::Config(format!("unknown mirror mode {}", other))),
        }
    }
}

/// Builds the adapter for `mode`; file, http and postgres need a target.
pub async fn build(
    mode: MirrorMode,
    target: Option<&str>,
) -> Result<Arc<dyn StatusMirror>, MirrorError> {
    let require_target = || {
        target
            .filter(|value| !value.trim().is_empty())
            .ok_or_else(|| MirrorError::Config("mirror.target is required".to_string()))
    };
    let mirror: Arc<dyn StatusMirror> = match mode {
        MirrorMode::Null => Arc::new(NullMirror),
        MirrorMode::Debug => Arc::new(DebugMirror),
        MirrorMode::File => Arc::new(FileMirror::new(PathBuf::from(require_target()?)).await?),
        MirrorMode::Http => Arc::new(HttpMirror::new(require_target()?)?),
        MirrorMode::Postgres => {
            let mirror = PostgresMirror::connect(require_target()?).await?;
            mirror.migrate().await?;
            Arc::new(mirror)
        }
    };
    Ok(mirror)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(status: TerminalStatus) -> MirrorRecord {
        MirrorRecord {
            message_id: "m1".to_string(),
            status,
            status_at: 1_700_000,
            entry_id: StreamEntryId::new(1700, 3),
        }
    }

    #[test]
    fn idempotency_key_tracks_entry() {
        assert_eq!(
            record(TerminalStatus::Read).idempotency_key(),
            "1700-3:m1:read"
        );
        assert!(TerminalStatus::Read > TerminalStatus::Delivered);
    }

    #[test]
    fn modes_parse() {
        assert_eq!("".parse::<MirrorMode>().unwrap(), MirrorMode::Null);
        assert_eq!("Postgres".parse::<MirrorMode>().unwrap(), MirrorMode::Postgres);
        assert!("kafka".parse::<MirrorMode>().is_err());
    }

    #[tokio::test]
    async fn file_mirror_appends_ndjson() {
        let dir = std::env::temp_dir().join(format!(
            "parley-mirror-{}",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let path = dir.join("status.ndjson");
        let mirror = FileMirror::new(path.clone()).await.unwrap();
        mirror.submit(&record(TerminalStatus::Delivered)).await.unwrap();
        mirror.submit(&record(TerminalStatus::Read)).await.unwrap();
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let lines = contents.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        let last: serde_json::Value = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(last["status"], "read");
        assert_eq!(last["entry_id"], "1700-3");
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }

    #[tokio::test]
    async fn build_requires_target() {
        assert!(build(MirrorMode::File, None).await.is_err());
        assert!(build(MirrorMode::Debug, None).await.is_ok());
    }

    #[tokio::test]
    async fn postgres_upsert_never_regresses() -> Result<(), Box<dyn std::error::Error>> {
        let dsn = match std::env::var("PARLEY_TEST_PG_DSN") {
            Ok(value) => value,
            Err(_) => {
                eprintln!("skipping postgres_upsert_never_regresses: PARLEY_TEST_PG_DSN not set");
                return Ok(());
            }
        };
        let mirror = PostgresMirror::connect(&dsn).await?;
        mirror.migrate().await?;
        let message_id = format!(
            "m-{}",
            chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default()
        );
        let mut read = record(TerminalStatus::Read);
        read.message_id = message_id.clone();
        let mut delivered = record(TerminalStatus::Delivered);
        delivered.message_id = message_id.clone();
        mirror.submit(&read).await?;
        mirror.submit(&delivered).await?;
        let row = mirror
            .client
            .query_one(
                "SELECT status FROM message_status WHERE message_id = $1",
                &[&message_id],
            )
            .await?;
        let status: String = row.get(0);
        assert_eq!(status, "read");
        Ok(())
    }
}
