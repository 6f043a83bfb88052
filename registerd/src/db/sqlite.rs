use std::path::Path;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, ErrorCode, OptionalExtension, params};
use shared::types::{ServiceRecord, ServiceStatus, UserAccount};
use crate::db::{DbError, UserKey};

const SERVICE_COLUMNS: &str = "uuid, service_type, name, version, description, hostname, port,
                               status, command, registered_at, last_heartbeat";

const USER_COLUMNS: &str = "uuid, username, email, password_hash, status, creation_date, last_login";

/// Embedded store holding the service directory and user accounts
pub struct SqliteDb {
    conn: Connection,
}

impl SqliteDb {
    /// Open or create the database with WAL mode enabled
    pub fn open(path: impl AsRef<Path>) -> Result<Self, DbError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch("PRAGMA journal_mode=WAL;")?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS services (
                uuid           TEXT PRIMARY KEY,
                service_type   TEXT NOT NULL,
                name           TEXT NOT NULL,
                version        TEXT NOT NULL,
                description    TEXT NOT NULL,
                hostname       TEXT NOT NULL,
                port           INTEGER NOT NULL,
                status         TEXT NOT NULL,
                command        TEXT,
                registered_at  TEXT NOT NULL,
                last_heartbeat TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS users (
                uuid          TEXT PRIMARY KEY,
                username      TEXT NOT NULL UNIQUE,
                email         TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                status        TEXT NOT NULL DEFAULT 'active',
                creation_date TEXT NOT NULL,
                last_login    TEXT
            );

            DROP INDEX IF EXISTS idx_users_email;
            CREATE UNIQUE INDEX IF NOT EXISTS idx_users_email_unique ON users(email);
            "#,
        )?;

        Ok(Self { conn })
    }

    pub fn insert_service(&self, record: &ServiceRecord) -> Result<(), DbError> {
        self.conn
            .execute(
                &format!(
                    "INSERT INTO services ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                    SERVICE_COLUMNS
                ),
                params![
                    &record.uuid,
                    &record.service_type,
                    &record.name,
                    &record.version,
                    &record.description,
                    &record.hostname,
                    record.port,
                    record.status.as_str(),
                    &record.command,
                    record.registered_at.to_rfc3339(),
                    record.last_heartbeat.to_rfc3339(),
                ],
            )
            .map_err(|e| duplicate_or(e, &record.uuid))?;

        Ok(())
    }

    pub fn find_service(&self, uuid: &str) -> Result<Option<ServiceRecord>, DbError> {
        let record = self
            .conn
            .query_row(
                &format!("SELECT {} FROM services WHERE uuid = ?1", SERVICE_COLUMNS),
                params![uuid],
                Self::row_to_service,
            )
            .optional()?;

        Ok(record)
    }

    pub fn update_service_status(&self, uuid: &str, status: ServiceStatus) -> Result<(), DbError> {
        let count = self.conn.execute(
            "UPDATE services SET status = ?1, last_heartbeat = ?2 WHERE uuid = ?3",
            params![status.as_str(), Utc::now().to_rfc3339(), uuid],
        )?;

        if count == 0 {
            return Err(DbError::NotFound(uuid.to_string()));
        }
        Ok(())
    }

    pub fn set_service_command(&self, uuid: &str, command: Option<&str>) -> Result<(), DbError> {
        let count = self.conn.execute(
            "UPDATE services SET command = ?1 WHERE uuid = ?2",
            params![command, uuid],
        )?;

        if count == 0 {
            return Err(DbError::NotFound(uuid.to_string()));
        }
        Ok(())
    }

    pub fn delete_service(&self, uuid: &str) -> Result<bool, DbError> {
        let count = self
            .conn
            .execute("DELETE FROM services WHERE uuid = ?1", params![uuid])?;
        Ok(count > 0)
    }

    pub fn insert_user(&self, user: &UserAccount) -> Result<(), DbError> {
        self.conn
            .execute(
                &format!("INSERT INTO users ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)", USER_COLUMNS),
                params![
                    &user.uuid,
                    &user.username,
                    &user.email,
                    &user.password_hash,
                    &user.status,
                    user.creation_date.to_rfc3339(),
                    user.last_login.map(|t| t.to_rfc3339()),
                ],
            )
            .map_err(user_conflict)?;

        Ok(())
    }

    pub fn find_user_by(&self, column: UserKey, value: &str) -> Result<Option<UserAccount>, DbError> {
        let user = self
            .conn
            .query_row(
                &format!("SELECT {} FROM users WHERE {} = ?1", USER_COLUMNS, column.as_str()),
                params![value],
                Self::row_to_user,
            )
            .optional()?;

        Ok(user)
    }

    fn row_to_service(row: &rusqlite::Row) -> Result<ServiceRecord, rusqlite::Error> {
        let status: String = row.get(7)?;
        let registered_at: String = row.get(9)?;
        let last_heartbeat: String = row.get(10)?;

        let status = status
            .parse::<ServiceStatus>()
            .map_err(|e| conversion_error(7, e))?;

        Ok(ServiceRecord {
            uuid: row.get(0)?,
            service_type: row.get(1)?,
            name: row.get(2)?,
            version: row.get(3)?,
            description: row.get(4)?,
            hostname: row.get(5)?,
            port: row.get::<_, u16>(6)?,
            status,
            command: row.get(8)?,
            registered_at: parse_timestamp(9, &registered_at)?,
            last_heartbeat: parse_timestamp(10, &last_heartbeat)?,
        })
    }

    fn row_to_user(row: &rusqlite::Row) -> Result<UserAccount, rusqlite::Error> {
        let creation_date: String = row.get(5)?;
        let last_login: Option<String> = row.get(6)?;

        Ok(UserAccount {
            uuid: row.get(0)?,
            username: row.get(1)?,
            email: row.get(2)?,
            password_hash: row.get(3)?,
            status: row.get(4)?,
            creation_date: parse_timestamp(5, &creation_date)?,
            last_login: last_login
                .map(|s| parse_timestamp(6, &s))
                .transpose()?,
        })
    }
}

fn duplicate_or(err: rusqlite::Error, key: &str) -> DbError {
    if let rusqlite::Error::SqliteFailure(e, _) = &err {
        if e.code == ErrorCode::ConstraintViolation {
            return DbError::Duplicate(key.to_string());
        }
    }
    DbError::Sqlite(err)
}

/// Constraint failures name the column, e.g. `UNIQUE constraint failed: users.email`
fn user_conflict(err: rusqlite::Error) -> DbError {
    if let rusqlite::Error::SqliteFailure(e, Some(message)) = &err {
        if e.code == ErrorCode::ConstraintViolation {
            let key = if message.contains("users.email") {
                UserKey::Email
            } else if message.contains("users.username") {
                UserKey::Username
            } else {
                UserKey::Uuid
            };
            return DbError::UserTaken(key);
        }
    }
    DbError::Sqlite(err)
}

fn parse_timestamp(idx: usize, value: &str) -> Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn conversion_error<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(err))
}
