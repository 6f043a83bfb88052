/// Command written into a service record to ask the instance to shut itself down
pub const SHUTDOWN_COMMAND: &str = "user_init_shutdown";

/// Collection (or table) holding the service directory
pub const SERVICE_COLLECTION: &str = "services";

/// Collection (or table) holding registered user accounts
pub const USER_COLLECTION: &str = "users";

/// Header identifying the calling application
pub const APPLICATION_ID_HEADER: &str = "application-id";

/// Service name reported by the health endpoint
pub const HEALTH_SERVICE_NAME: &str = "register";
