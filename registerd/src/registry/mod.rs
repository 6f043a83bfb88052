//! Registry client: represents this process in the shared service directory.
//!
//! The record moves through `Unregistered -> Active -> AwaitRemoval -> Removed`
//! as seen from this process. All writes go through one async mutex so that a
//! heartbeat can never overwrite a removal that raced with it.

pub mod heartbeat;
pub mod listener;

use std::fmt;
use std::sync::Arc;
use shared::types::{ServiceDescriptor, ServiceRecord, ServiceStatus};
use thiserror::Error;
use tokio::sync::Mutex;
use crate::db::{Database, DbError};

/// Local view of the service record's lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Unregistered,
    Active,
    AwaitRemoval,
    Removed,
}

impl fmt::Display for RecordState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RecordState::Unregistered => "unregistered",
            RecordState::Active => "active",
            RecordState::AwaitRemoval => "await_removal",
            RecordState::Removed => "removed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("service {0} is already registered")]
    Duplicate(String),

    #[error("service record {0} not found")]
    NotFound(String),

    #[error("cannot {operation} while record is {state}")]
    InvalidState {
        operation: &'static str,
        state: RecordState,
    },

    #[error(transparent)]
    Store(DbError),
}

impl From<DbError> for RegistryError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::Duplicate(id) => RegistryError::Duplicate(id),
            DbError::NotFound(id) => RegistryError::NotFound(id),
            other => RegistryError::Store(other),
        }
    }
}

/// Where this instance can be reached, stored alongside the descriptor
#[derive(Debug, Clone)]
pub struct Endpoint {
    pub hostname: String,
    pub port: u16,
}

pub struct Registry {
    directory: Arc<Database>,
    descriptor: Arc<ServiceDescriptor>,
    endpoint: Endpoint,
    state: Mutex<RecordState>,
}

impl Registry {
    pub fn new(directory: Arc<Database>, descriptor: Arc<ServiceDescriptor>, endpoint: Endpoint) -> Self {
        Self {
            directory,
            descriptor,
            endpoint,
            state: Mutex::new(RecordState::Unregistered),
        }
    }

    pub fn service_id(&self) -> &str {
        &self.descriptor.uuid
    }

    pub async fn state(&self) -> RecordState {
        *self.state.lock().await
    }

    /// Create the service record. An existing record with the same identifier
    /// is a duplicate registration and leaves the stored record untouched.
    pub async fn register(&self) -> Result<(), RegistryError> {
        let mut state = self.state.lock().await;
        if *state != RecordState::Unregistered {
            return Err(RegistryError::InvalidState {
                operation: "register",
                state: *state,
            });
        }

        let store = self.directory.store().await?;
        if store.find_service(self.service_id()).await?.is_some() {
            return Err(RegistryError::Duplicate(self.service_id().to_string()));
        }

        let record = ServiceRecord::new(&self.descriptor, &self.endpoint.hostname, self.endpoint.port);
        store.insert_service(&record).await?;
        *state = RecordState::Active;

        tracing::info!(
            id = %self.descriptor.uuid,
            name = %self.descriptor.name,
            "Registered {} on {}:{}",
            self.descriptor.service_type,
            self.endpoint.hostname,
            self.endpoint.port
        );
        Ok(())
    }

    /// Refresh the record's status. Only valid while the record is active.
    pub async fn set_service_status(&self, status: ServiceStatus) -> Result<(), RegistryError> {
        let state = self.state.lock().await;
        if *state != RecordState::Active {
            return Err(RegistryError::InvalidState {
                operation: "set status",
                state: *state,
            });
        }

        self.directory
            .store()
            .await?
            .update_service_status(self.service_id(), status)
            .await?;

        tracing::trace!(id = %self.descriptor.uuid, %status, "Service status updated");
        Ok(())
    }

    /// Command currently pending on the record, if any
    pub async fn pending_command(&self) -> Result<Option<String>, RegistryError> {
        let record = self
            .directory
            .store()
            .await?
            .find_service(self.service_id())
            .await?
            .ok_or_else(|| RegistryError::NotFound(self.service_id().to_string()))?;

        Ok(record.command)
    }

    /// Move `Active -> AwaitRemoval`, persisting the status and the command
    /// that caused the removal. The local state advances even if the write
    /// fails so that no further heartbeats are sent.
    pub async fn begin_removal(&self, command: &str) -> Result<(), RegistryError> {
        let mut state = self.state.lock().await;
        if *state != RecordState::Active {
            return Err(RegistryError::InvalidState {
                operation: "begin removal",
                state: *state,
            });
        }
        *state = RecordState::AwaitRemoval;

        let store = self.directory.store().await?;
        store
            .update_service_status(self.service_id(), ServiceStatus::AwaitRemoval)
            .await?;
        store.set_service_command(self.service_id(), Some(command)).await?;

        tracing::info!(id = %self.descriptor.uuid, "Service status updated to 'await_removal'");
        Ok(())
    }

    /// Remove the service record. Removing an absent record, or calling this
    /// again after a successful removal, succeeds without touching the store.
    pub async fn unregister(&self) -> Result<(), RegistryError> {
        let mut state = self.state.lock().await;
        match *state {
            RecordState::Unregistered | RecordState::Removed => return Ok(()),
            RecordState::Active | RecordState::AwaitRemoval => {}
        }

        let existed = self
            .directory
            .store()
            .await?
            .delete_service(self.service_id())
            .await?;
        *state = RecordState::Removed;

        if existed {
            tracing::info!(id = %self.descriptor.uuid, "Unregistered service");
        } else {
            tracing::warn!(id = %self.descriptor.uuid, "Service record was already gone");
        }
        Ok(())
    }
}
