use chrono::Utc;
use mongodb::bson::{doc, Document};
use mongodb::error::{ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, IndexOptions};
use mongodb::{Client, Collection, Database, IndexModel};
use shared::protocol::{SERVICE_COLLECTION, USER_COLLECTION};
use shared::types::{ServiceRecord, ServiceStatus, UserAccount};
use crate::db::{ConnectOptions, DbError, UserKey};

const DUPLICATE_KEY: i32 = 11000;

/// MongoDB backed store. Cloning is cheap, the driver shares its pool.
#[derive(Clone)]
pub struct MongoStore {
    database: Database,
}

impl MongoStore {
    /// Connect, confirm the server answers and make sure the indexes exist
    pub async fn connect(url: &str, options: &ConnectOptions) -> Result<Self, DbError> {
        let mut client_options = ClientOptions::parse(url).await.map_err(invalid_url_or)?;
        client_options.app_name = Some(options.app_name.clone());
        client_options.connect_timeout = Some(options.timeout);
        client_options.server_selection_timeout = Some(options.timeout);

        let name = client_options
            .default_database
            .clone()
            .ok_or_else(|| DbError::Config("mongodb url has no database name".to_string()))?;

        let client = Client::with_options(client_options)?;
        let database = client.database(&name);

        database.run_command(doc! { "ping": 1 }, None).await?;

        let store = Self { database };
        store.ensure_indexes().await?;

        tracing::debug!(database = %name, "MongoDB connection confirmed");
        Ok(store)
    }

    async fn ensure_indexes(&self) -> Result<(), DbError> {
        let unique = || IndexOptions::builder().unique(true).build();

        self.services()
            .create_index(
                IndexModel::builder().keys(doc! { "uuid": 1 }).options(unique()).build(),
                None,
            )
            .await?;

        self.users()
            .create_index(
                IndexModel::builder().keys(doc! { "username": 1 }).options(unique()).build(),
                None,
            )
            .await?;

        self.users()
            .create_index(
                IndexModel::builder().keys(doc! { "email": 1 }).options(unique()).build(),
                None,
            )
            .await?;

        Ok(())
    }

    fn services(&self) -> Collection<ServiceRecord> {
        self.database.collection(SERVICE_COLLECTION)
    }

    fn users(&self) -> Collection<UserAccount> {
        self.database.collection(USER_COLLECTION)
    }

    pub async fn insert_service(&self, record: &ServiceRecord) -> Result<(), DbError> {
        self.services()
            .insert_one(record, None)
            .await
            .map_err(|e| duplicate_or(e, &record.uuid))?;
        Ok(())
    }

    pub async fn find_service(&self, uuid: &str) -> Result<Option<ServiceRecord>, DbError> {
        Ok(self.services().find_one(doc! { "uuid": uuid }, None).await?)
    }

    pub async fn update_service_status(&self, uuid: &str, status: ServiceStatus) -> Result<(), DbError> {
        let update = doc! {
            "$set": {
                "status": status.as_str(),
                "lastHeartbeat": Utc::now().to_rfc3339(),
            }
        };

        let result = self
            .services()
            .update_one(doc! { "uuid": uuid }, update, None)
            .await?;

        if result.matched_count == 0 {
            return Err(DbError::NotFound(uuid.to_string()));
        }
        Ok(())
    }

    pub async fn set_service_command(&self, uuid: &str, command: Option<&str>) -> Result<(), DbError> {
        let result = self
            .services()
            .update_one(doc! { "uuid": uuid }, doc! { "$set": { "command": command } }, None)
            .await?;

        if result.matched_count == 0 {
            return Err(DbError::NotFound(uuid.to_string()));
        }
        Ok(())
    }

    pub async fn delete_service(&self, uuid: &str) -> Result<bool, DbError> {
        let result = self.services().delete_one(doc! { "uuid": uuid }, None).await?;
        Ok(result.deleted_count > 0)
    }

    pub async fn insert_user(&self, user: &UserAccount) -> Result<(), DbError> {
        self.users()
            .insert_one(user, None)
            .await
            .map_err(user_conflict)?;
        Ok(())
    }

    /// Look up a user by a single top level field
    pub async fn find_user(&self, field: &str, value: &str) -> Result<Option<UserAccount>, DbError> {
        let mut filter = Document::new();
        filter.insert(field, value);

        Ok(self.users().find_one(filter, None).await?)
    }
}

/// A URL the driver rejects outright will not parse on retry either
fn invalid_url_or(err: mongodb::error::Error) -> DbError {
    if let ErrorKind::InvalidArgument { message, .. } = err.kind.as_ref() {
        return DbError::Config(format!("invalid mongodb url: {}", message));
    }
    DbError::Mongo(err)
}

fn duplicate_or(err: mongodb::error::Error, key: &str) -> DbError {
    if let ErrorKind::Write(WriteFailure::WriteError(write_error)) = err.kind.as_ref() {
        if write_error.code == DUPLICATE_KEY {
            return DbError::Duplicate(key.to_string());
        }
    }
    DbError::Mongo(err)
}

/// Duplicate key messages name the violated index, e.g. `index: email_1 dup key: ...`
fn user_conflict(err: mongodb::error::Error) -> DbError {
    if let ErrorKind::Write(WriteFailure::WriteError(write_error)) = err.kind.as_ref() {
        if write_error.code == DUPLICATE_KEY {
            let key = if write_error.message.contains("index: email_1") {
                UserKey::Email
            } else if write_error.message.contains("index: username_1") {
                UserKey::Username
            } else {
                UserKey::Uuid
            };
            return DbError::UserTaken(key);
        }
    }
    DbError::Mongo(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_rejected_url_is_config_error() {
        let result = MongoStore::connect(
            "mongodb+srv://localhost:27017/usersdb",
            &ConnectOptions::default(),
        )
        .await;

        assert!(matches!(result, Err(DbError::Config(_))));
    }
}
