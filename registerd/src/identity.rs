use shared::types::ServiceDescriptor;
use crate::config::ServiceConfig;

/// Build this instance's descriptor with a fresh 128-bit identifier
pub fn describe(config: &ServiceConfig) -> ServiceDescriptor {
    ServiceDescriptor {
        service_type: config.service_type.clone(),
        name: config.name.clone(),
        uuid: generate_id(),
        version: config.version.clone(),
        description: config.description.clone(),
    }
}

/// 16 random bytes, hex encoded
pub fn generate_id() -> String {
    hex::encode(rand::random::<[u8; 16]>())
}

/// Hostname advertised in the service record
pub fn local_hostname() -> String {
    hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|e| {
            tracing::warn!("Failed to get system hostname: {}", e);
            "unknown".to_string()
        })
}
