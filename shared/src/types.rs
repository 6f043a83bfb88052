use std::fmt;
use std::str::FromStr;
use chrono::{DateTime, Utc};
use serde::{Serialize, Deserialize};

/// Static identity of a running instance, created once at process start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    /// Category name, e.g. "api"
    #[serde(rename = "type")]
    pub service_type: String,

    /// Human readable service name
    pub name: String,

    /// 128-bit random identifier, hex encoded
    pub uuid: String,

    /// Semantic version of the running binary
    pub version: String,

    pub description: String,
}

/// Liveness status of a service record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    Active,
    AwaitRemoval,
    Removed,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Active => "active",
            ServiceStatus::AwaitRemoval => "await_removal",
            ServiceStatus::Removed => "removed",
        }
    }
}

impl fmt::Display for ServiceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownStatus(pub String);

impl fmt::Display for UnknownStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown service status '{}'", self.0)
    }
}

impl std::error::Error for UnknownStatus {}

impl FromStr for ServiceStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ServiceStatus::Active),
            "await_removal" => Ok(ServiceStatus::AwaitRemoval),
            "removed" => Ok(ServiceStatus::Removed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// The directory's persisted view of a descriptor plus its mutable fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceRecord {
    #[serde(rename = "type")]
    pub service_type: String,
    pub name: String,
    pub uuid: String,
    pub version: String,
    pub description: String,

    /// Host the instance is running on
    pub hostname: String,

    /// Port of the HTTP listener
    pub port: u16,

    pub status: ServiceStatus,

    /// Pending out-of-band command, e.g. a shutdown request
    pub command: Option<String>,

    pub registered_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

impl ServiceRecord {
    /// Fresh `active` record for a descriptor
    pub fn new(descriptor: &ServiceDescriptor, hostname: &str, port: u16) -> Self {
        let now = Utc::now();

        Self {
            service_type: descriptor.service_type.clone(),
            name: descriptor.name.clone(),
            uuid: descriptor.uuid.clone(),
            version: descriptor.version.clone(),
            description: descriptor.description.clone(),
            hostname: hostname.to_string(),
            port,
            status: ServiceStatus::Active,
            command: None,
            registered_at: now,
            last_heartbeat: now,
        }
    }
}

/// A registered user account as persisted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserAccount {
    pub uuid: String,
    pub username: String,
    pub email: String,
    pub password_hash: String,
    pub status: String,
    pub creation_date: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
}

/// Body of `POST /register`. Every field is optional so that missing
/// fields can be reported instead of rejected by the extractor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub username: Option<String>,
    pub email: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub message: String,
    pub username: String,
    pub uuid: String,
}

/// Structured error body returned by the HTTP routes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub uuid: String,
    pub username: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub service: String,
    pub healthy: bool,
    pub uptime: f64,
}
