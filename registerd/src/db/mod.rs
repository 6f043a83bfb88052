//! Database connector and the stores behind it.
//!
//! A [`Database`] owns at most one live connection (the [`Store`]) and is
//! shared by reference between the lifecycle, the registry client and the
//! request handlers. Only the lifecycle opens or closes it.

pub mod mongo;
pub mod sqlite;
pub mod url;
pub mod worker;

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use async_trait::async_trait;
use shared::types::{ServiceRecord, ServiceStatus, UserAccount};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::db::mongo::MongoStore;
use crate::db::worker::SqliteHandle;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unsupported database scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("database is not connected")]
    NotConnected,

    #[error("a connection attempt is already in progress")]
    ConnectInProgress,

    #[error("record already exists: {0}")]
    Duplicate(String),

    #[error("{0} is already taken")]
    UserTaken(UserKey),

    #[error("record not found: {0}")]
    NotFound(String),

    #[error("sqlite worker is not running")]
    WorkerGone,

    #[error(transparent)]
    Mongo(#[from] mongodb::error::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Unique fields of a user account
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserKey {
    Uuid,
    Username,
    Email,
}

impl UserKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserKey::Uuid => "uuid",
            UserKey::Username => "username",
            UserKey::Email => "email",
        }
    }
}

impl fmt::Display for UserKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options applied when opening a connection
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Reported to the server where the backend supports it
    pub app_name: String,
    pub timeout: Duration,
    /// Location of embedded databases; `None` keeps them in memory
    pub data_dir: Option<PathBuf>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            app_name: env!("CARGO_PKG_NAME").to_string(),
            timeout: Duration::from_secs(10),
            data_dir: None,
        }
    }
}

/// Opens and closes a connection. The orchestrator only talks to databases
/// through this trait, retry policy stays with the caller.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, url: &str, options: &ConnectOptions) -> Result<(), DbError>;
    async fn close(&self) -> Result<(), DbError>;
}

/// A live connection to one of the supported backends
#[derive(Clone)]
pub enum Store {
    Mongo(MongoStore),
    Sqlite(SqliteHandle),
}

/// Connection handle holding exactly one live store or none
pub struct Database {
    label: &'static str,
    handle: RwLock<Option<Store>>,
    connecting: Mutex<()>,
}

impl Database {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            handle: RwLock::new(None),
            connecting: Mutex::new(()),
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.handle.read().await.is_some()
    }

    /// Current store, or `NotConnected`. The returned value is a cheap clone
    /// and does not own the connection.
    pub async fn store(&self) -> Result<Store, DbError> {
        self.handle.read().await.clone().ok_or(DbError::NotConnected)
    }

    async fn open(url: &str, options: &ConnectOptions) -> Result<Store, DbError> {
        let parsed = ::url::Url::parse(url)
            .map_err(|e| DbError::Config(format!("invalid database url: {}", e)))?;

        match parsed.scheme() {
            "mongodb" | "mongodb+srv" => Ok(Store::Mongo(MongoStore::connect(url, options).await?)),
            "sqlite" => {
                let name = parsed.path().trim_start_matches('/');
                if name.is_empty() {
                    return Err(DbError::Config("sqlite url has no database name".to_string()));
                }
                let path = match &options.data_dir {
                    Some(dir) => dir.join(format!("{}.sqlite3", name)),
                    None => PathBuf::from(":memory:"),
                };
                Ok(Store::Sqlite(SqliteHandle::spawn(path).await?))
            }
            other => Err(DbError::UnsupportedScheme(other.to_string())),
        }
    }
}

#[async_trait]
impl Connector for Database {
    async fn connect(&self, url: &str, options: &ConnectOptions) -> Result<(), DbError> {
        if url.trim().is_empty() {
            return Err(DbError::Config("database url is empty".to_string()));
        }

        let _attempt = self
            .connecting
            .try_lock()
            .map_err(|_| DbError::ConnectInProgress)?;

        if self.is_connected().await {
            tracing::debug!("{} database already connected", self.label);
            return Ok(());
        }

        let store = Self::open(url, options).await?;
        *self.handle.write().await = Some(store);

        tracing::info!("Connected to {} database", self.label);
        Ok(())
    }

    async fn close(&self) -> Result<(), DbError> {
        let store = self.handle.write().await.take();

        match store {
            Some(Store::Sqlite(handle)) => handle.shutdown().await?,
            Some(Store::Mongo(_)) => {}
            None => return Ok(()),
        }

        tracing::info!("Closed {} database", self.label);
        Ok(())
    }
}

impl Store {
    /// Insert a new service record; `Duplicate` if the identifier is taken
    pub async fn insert_service(&self, record: &ServiceRecord) -> Result<(), DbError> {
        match self {
            Store::Mongo(store) => store.insert_service(record).await,
            Store::Sqlite(handle) => handle.insert_service(record.clone()).await,
        }
    }

    pub async fn find_service(&self, uuid: &str) -> Result<Option<ServiceRecord>, DbError> {
        match self {
            Store::Mongo(store) => store.find_service(uuid).await,
            Store::Sqlite(handle) => handle.find_service(uuid.to_string()).await,
        }
    }

    /// Update status (and heartbeat timestamp); `NotFound` if the record is gone
    pub async fn update_service_status(&self, uuid: &str, status: ServiceStatus) -> Result<(), DbError> {
        match self {
            Store::Mongo(store) => store.update_service_status(uuid, status).await,
            Store::Sqlite(handle) => handle.update_service_status(uuid.to_string(), status).await,
        }
    }

    pub async fn set_service_command(&self, uuid: &str, command: Option<&str>) -> Result<(), DbError> {
        match self {
            Store::Mongo(store) => store.set_service_command(uuid, command).await,
            Store::Sqlite(handle) => {
                handle
                    .set_service_command(uuid.to_string(), command.map(str::to_string))
                    .await
            }
        }
    }

    /// Delete a service record. Returns whether a record existed.
    pub async fn delete_service(&self, uuid: &str) -> Result<bool, DbError> {
        match self {
            Store::Mongo(store) => store.delete_service(uuid).await,
            Store::Sqlite(handle) => handle.delete_service(uuid.to_string()).await,
        }
    }

    pub async fn find_user_by_username(&self, username: &str) -> Result<Option<UserAccount>, DbError> {
        match self {
            Store::Mongo(store) => store.find_user("username", username).await,
            Store::Sqlite(handle) => handle.find_user_by_username(username.to_string()).await,
        }
    }

    pub async fn find_user_by_email(&self, email: &str) -> Result<Option<UserAccount>, DbError> {
        match self {
            Store::Mongo(store) => store.find_user("email", email).await,
            Store::Sqlite(handle) => handle.find_user_by_email(email.to_string()).await,
        }
    }

    pub async fn find_user(&self, uuid: &str) -> Result<Option<UserAccount>, DbError> {
        match self {
            Store::Mongo(store) => store.find_user("uuid", uuid).await,
            Store::Sqlite(handle) => handle.find_user(uuid.to_string()).await,
        }
    }

    /// Insert a new account; `UserTaken` names the unique field that collided
    pub async fn insert_user(&self, user: &UserAccount) -> Result<(), DbError> {
        match self {
            Store::Mongo(store) => store.insert_user(user).await,
            Store::Sqlite(handle) => handle.insert_user(user.clone()).await,
        }
    }
}
