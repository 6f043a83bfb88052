use std::path::PathBuf;
use std::thread;
use shared::types::{ServiceRecord, ServiceStatus, UserAccount};
use tokio::sync::{mpsc, oneshot};
use crate::db::{DbError, UserKey};
use crate::db::sqlite::SqliteDb;

type Reply<T> = oneshot::Sender<Result<T, DbError>>;

/// Commands sent to the sqlite thread
enum StoreCommand {
    InsertService(ServiceRecord, Reply<()>),
    FindService(String, Reply<Option<ServiceRecord>>),
    UpdateStatus {
        uuid: String,
        status: ServiceStatus,
        reply: Reply<()>,
    },
    SetCommand {
        uuid: String,
        command: Option<String>,
        reply: Reply<()>,
    },
    DeleteService(String, Reply<bool>),
    InsertUser(UserAccount, Reply<()>),
    FindUser(UserKey, String, Reply<Option<UserAccount>>),
    Shutdown,
}

/// Handle to the thread owning the sqlite connection
#[derive(Clone)]
pub struct SqliteHandle {
    tx: mpsc::Sender<StoreCommand>,
}

impl SqliteHandle {
    /// Spawn the store thread and open the database on it.
    /// Resolves once the database is open or failed to open.
    pub async fn spawn(path: PathBuf) -> Result<Self, DbError> {
        let (tx, mut rx) = mpsc::channel::<StoreCommand>(256);
        let (ready_tx, ready_rx) = oneshot::channel();

        thread::Builder::new()
            .name("sqlite-store".into())
            .spawn(move || {
                let db = match SqliteDb::open(&path) {
                    Ok(db) => {
                        let _ = ready_tx.send(Ok(()));
                        db
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };

                while let Some(cmd) = rx.blocking_recv() {
                    match cmd {
                        StoreCommand::InsertService(record, reply) => {
                            let _ = reply.send(db.insert_service(&record));
                        }
                        StoreCommand::FindService(uuid, reply) => {
                            let _ = reply.send(db.find_service(&uuid));
                        }
                        StoreCommand::UpdateStatus { uuid, status, reply } => {
                            let _ = reply.send(db.update_service_status(&uuid, status));
                        }
                        StoreCommand::SetCommand { uuid, command, reply } => {
                            let _ = reply.send(db.set_service_command(&uuid, command.as_deref()));
                        }
                        StoreCommand::DeleteService(uuid, reply) => {
                            let _ = reply.send(db.delete_service(&uuid));
                        }
                        StoreCommand::InsertUser(user, reply) => {
                            let _ = reply.send(db.insert_user(&user));
                        }
                        StoreCommand::FindUser(key, value, reply) => {
                            let _ = reply.send(db.find_user_by(key, &value));
                        }
                        StoreCommand::Shutdown => {
                            tracing::debug!("sqlite store thread shutting down");
                            break;
                        }
                    }
                }
            })?;

        ready_rx.await.map_err(|_| DbError::WorkerGone)??;

        Ok(Self { tx })
    }

    async fn request<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> StoreCommand,
    ) -> Result<T, DbError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| DbError::WorkerGone)?;
        rx.await.map_err(|_| DbError::WorkerGone)?
    }

    pub async fn insert_service(&self, record: ServiceRecord) -> Result<(), DbError> {
        self.request(|reply| StoreCommand::InsertService(record, reply)).await
    }

    pub async fn find_service(&self, uuid: String) -> Result<Option<ServiceRecord>, DbError> {
        self.request(|reply| StoreCommand::FindService(uuid, reply)).await
    }

    pub async fn update_service_status(&self, uuid: String, status: ServiceStatus) -> Result<(), DbError> {
        self.request(|reply| StoreCommand::UpdateStatus { uuid, status, reply }).await
    }

    pub async fn set_service_command(&self, uuid: String, command: Option<String>) -> Result<(), DbError> {
        self.request(|reply| StoreCommand::SetCommand { uuid, command, reply }).await
    }

    pub async fn delete_service(&self, uuid: String) -> Result<bool, DbError> {
        self.request(|reply| StoreCommand::DeleteService(uuid, reply)).await
    }

    pub async fn insert_user(&self, user: UserAccount) -> Result<(), DbError> {
        self.request(|reply| StoreCommand::InsertUser(user, reply)).await
    }

    pub async fn find_user(&self, uuid: String) -> Result<Option<UserAccount>, DbError> {
        self.request(|reply| StoreCommand::FindUser(UserKey::Uuid, uuid, reply)).await
    }

    pub async fn find_user_by_username(&self, username: String) -> Result<Option<UserAccount>, DbError> {
        self.request(|reply| StoreCommand::FindUser(UserKey::Username, username, reply)).await
    }

    pub async fn find_user_by_email(&self, email: String) -> Result<Option<UserAccount>, DbError> {
        self.request(|reply| StoreCommand::FindUser(UserKey::Email, email, reply)).await
    }

    /// Stop the store thread. Pending commands queued before this one still run.
    pub async fn shutdown(&self) -> Result<(), DbError> {
        self.tx
            .send(StoreCommand::Shutdown)
            .await
            .map_err(|_| DbError::WorkerGone)
    }
}
