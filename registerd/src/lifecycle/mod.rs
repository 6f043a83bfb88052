//! Startup and shutdown sequencing.
//!
//! Startup: connect the user database and the service directory (retrying
//! forever at a fixed delay), register, start heartbeat and command listener,
//! then open the HTTP listener. Shutdown runs at most once no matter how many
//! triggers fire: stop HTTP, stop background tasks, close the user database,
//! unregister, close the directory.

pub mod shutdown;

use std::net::SocketAddr;
use std::sync::Arc;
use shared::protocol::SHUTDOWN_COMMAND;
use shared::types::ServiceDescriptor;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, OnceCell};
use tokio::task::JoinHandle;
use crate::api::routes::{router, AppState};
use crate::config::{Config, ConnectionConfig};
use crate::db::{ConnectOptions, Connector, Database, DbError};
use crate::identity;
use crate::registry::{heartbeat, listener, Endpoint, RecordState, Registry, RegistryError};
use self::shutdown::{Shutdown, ShutdownReason};

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("invalid {target} database configuration: {source}")]
    Config {
        target: &'static str,
        #[source]
        source: DbError,
    },

    #[error("startup interrupted by shutdown request")]
    Interrupted,

    #[error("service registration failed: {0}")]
    Registration(#[from] RegistryError),

    #[error("failed to bind HTTP listener on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Outcome of the shutdown sequence
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    pub reason: ShutdownReason,
    /// Whether the service record was removed (or never existed)
    pub deregistered: bool,
}

pub struct Lifecycle {
    config: Arc<Config>,
    descriptor: Arc<ServiceDescriptor>,
    database: Arc<Database>,
    directory: Arc<Database>,
    database_connector: Arc<dyn Connector>,
    directory_connector: Arc<dyn Connector>,
    registry: Arc<Registry>,
    shutdown: Shutdown,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    server: Mutex<Option<JoinHandle<()>>>,
    teardown: OnceCell<ShutdownReport>,
}

impl Lifecycle {
    pub fn new(config: Config, descriptor: ServiceDescriptor) -> Self {
        let config = Arc::new(config);
        let descriptor = Arc::new(descriptor);
        let database = Arc::new(Database::new("user"));
        let directory = Arc::new(Database::new("directory"));

        let endpoint = Endpoint {
            hostname: identity::local_hostname(),
            port: config.api.port(),
        };
        let registry = Arc::new(Registry::new(directory.clone(), descriptor.clone(), endpoint));

        Self {
            config,
            descriptor,
            database_connector: database.clone(),
            directory_connector: directory.clone(),
            database,
            directory,
            registry,
            shutdown: Shutdown::new(),
            tasks: Mutex::new(Vec::new()),
            server: Mutex::new(None),
            teardown: OnceCell::new(),
        }
    }

    /// Boot, serve until a shutdown trigger fires, then tear down.
    /// Startup errors other than an interruption are returned after cleanup.
    pub async fn run(self) -> Result<ShutdownReport, LifecycleError> {
        let signals = tokio::spawn(shutdown::watch_signals(self.shutdown.clone()));

        let started = match self.boot().await {
            Ok(()) => self.serve().await.map(|_| ()),
            Err(e) => Err(e),
        };

        let result = match started {
            Ok(()) => {
                let reason = self.shutdown.triggered().await;
                Ok(self.teardown(reason).await)
            }
            Err(LifecycleError::Interrupted) => {
                tracing::info!("Startup interrupted");
                let reason = self.shutdown.reason().unwrap_or(ShutdownReason::Signal);
                Ok(self.teardown(reason).await)
            }
            Err(e) => {
                tracing::error!("Startup failed: {}", e);
                self.teardown(ShutdownReason::StartupFailure).await;
                Err(e)
            }
        };

        signals.abort();
        result
    }

    /// Startup steps 2 to 4: connect, register, start background tasks
    pub async fn boot(&self) -> Result<(), LifecycleError> {
        self.connect_with_retry(self.database_connector.as_ref(), &self.config.database, "user")
            .await?;
        self.connect_with_retry(self.directory_connector.as_ref(), self.config.registry(), "directory")
            .await?;

        self.registry.register().await?;

        let token = self.shutdown.token();
        let heartbeat = tokio::spawn(heartbeat::run(
            self.registry.clone(),
            self.config.service.heartbeat_interval(),
            token.clone(),
        ));
        let listener = tokio::spawn(listener::run(
            self.registry.clone(),
            self.config.service.command_poll_interval(),
            self.shutdown.clone(),
            token,
        ));
        self.tasks.lock().await.extend([heartbeat, listener]);

        Ok(())
    }

    /// Connect, retrying at a fixed delay until it works or shutdown is requested.
    /// Returns the number of attempts it took.
    async fn connect_with_retry(
        &self,
        connector: &dyn Connector,
        settings: &ConnectionConfig,
        target: &'static str,
    ) -> Result<u32, LifecycleError> {
        let url = settings
            .url()
            .map_err(|source| LifecycleError::Config { target, source })?;
        let options = ConnectOptions {
            app_name: self.descriptor.name.clone(),
            timeout: settings.connect_timeout(),
            data_dir: settings.data_dir.clone(),
        };
        let delay = settings.retry_delay();
        let cancelled = self.shutdown.token();
        let mut attempts = 0;

        loop {
            attempts += 1;

            let result = tokio::select! {
                result = connector.connect(&url, &options) => result,
                _ = cancelled.cancelled() => return Err(LifecycleError::Interrupted),
            };

            match result {
                Ok(()) => {
                    tracing::info!(
                        attempts,
                        "Connected to {} database at {}",
                        target,
                        settings.redacted_url()
                    );
                    return Ok(attempts);
                }
                Err(source @ (DbError::Config(_) | DbError::UnsupportedScheme(_))) => {
                    return Err(LifecycleError::Config { target, source });
                }
                Err(e) => {
                    tracing::warn!(
                        "Failed to connect to {} database (attempt {}): {}. Retrying in {:?}",
                        target,
                        attempts,
                        e,
                        delay
                    );
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = cancelled.cancelled() => return Err(LifecycleError::Interrupted),
            }
        }
    }

    /// Startup step 5: accept inbound connections until shutdown is triggered
    pub async fn serve(&self) -> Result<SocketAddr, LifecycleError> {
        let addr = &self.config.api.listen;
        let bind_error = |source| LifecycleError::Bind {
            addr: addr.clone(),
            source,
        };

        let listener = TcpListener::bind(addr).await.map_err(bind_error)?;
        let local = listener.local_addr().map_err(bind_error)?;

        let state = AppState::new(self.database.clone(), &self.config.api);
        let app = router(state, &self.config.api);

        let token = self.shutdown.token();
        let handle = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await
            {
                tracing::error!("Server error: {}", e);
            }
        });
        *self.server.lock().await = Some(handle);

        tracing::info!("API listening on {}", local);
        Ok(local)
    }

    /// Run the shutdown sequence. Concurrent and repeated calls share the
    /// single execution and receive the same report.
    pub async fn teardown(&self, reason: ShutdownReason) -> ShutdownReport {
        self.teardown
            .get_or_init(|| self.run_teardown(reason))
            .await
            .clone()
    }

    async fn run_teardown(&self, reason: ShutdownReason) -> ShutdownReport {
        // Make sure every task sees the shutdown, whoever started it
        self.shutdown.trigger(reason);
        let reason = self.shutdown.reason().unwrap_or(reason);

        tracing::info!("Gracefully shutting down the service ({})", reason);

        if let Some(mut server) = self.server.lock().await.take() {
            let grace = self.config.api.shutdown_grace();
            if tokio::time::timeout(grace, &mut server).await.is_err() {
                tracing::warn!("In-flight requests did not finish within {:?}, aborting", grace);
                server.abort();
            }
        }

        for task in self.tasks.lock().await.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!("Background task ended abnormally: {}", e);
            }
        }

        if self.registry.state().await == RecordState::Active {
            if let Err(e) = self.registry.begin_removal(SHUTDOWN_COMMAND).await {
                tracing::warn!("Failed to mark service for removal: {}", e);
            }
        }

        if let Err(e) = self.database_connector.close().await {
            tracing::warn!("Failed to close user database: {}", e);
        }

        let deregistered = match self.registry.unregister().await {
            Ok(()) => true,
            Err(e) => {
                tracing::error!("Failed to unregister service: {}", e);
                false
            }
        };

        if let Err(e) = self.directory_connector.close().await {
            tracing::warn!("Failed to close directory connection: {}", e);
        }

        tracing::info!(deregistered, "Shutdown complete");
        ShutdownReport {
            reason,
            deregistered,
        }
    }
}

#[cfg(test)]
impl Lifecycle {
    /// Replace the connector used for the user database
    fn with_database_connector<F>(mut self, wrap: F) -> Self
    where
        F: FnOnce(Arc<Database>) -> Arc<dyn Connector>,
    {
        self.database_connector = wrap(self.database.clone());
        self
    }

    /// Replace the connector used for the service directory
    fn with_directory_connector<F>(mut self, wrap: F) -> Self
    where
        F: FnOnce(Arc<Database>) -> Arc<dyn Connector>,
    {
        self.directory_connector = wrap(self.directory.clone());
        self
    }

    fn registry(&self) -> Arc<Registry> {
        self.registry.clone()
    }

    fn directory(&self) -> Arc<Database> {
        self.directory.clone()
    }

    fn shutdown(&self) -> Shutdown {
        self.shutdown.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;
    use async_trait::async_trait;
    use tokio::time::Instant;

    const RETRY_DELAY: Duration = Duration::from_millis(5_000);

    /// Fails a fixed number of times before handing over to a real database
    struct FlakyConnector {
        inner: Arc<Database>,
        failures_left: AtomicU32,
        attempts: std::sync::Mutex<Vec<Instant>>,
    }

    impl FlakyConnector {
        fn new(inner: Arc<Database>, failures: u32) -> Self {
            Self {
                inner,
                failures_left: AtomicU32::new(failures),
                attempts: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn attempts(&self) -> Vec<Instant> {
            self.attempts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connector for FlakyConnector {
        async fn connect(&self, url: &str, options: &ConnectOptions) -> Result<(), DbError> {
            self.attempts.lock().unwrap().push(Instant::now());

            let remaining = self.failures_left.load(Ordering::SeqCst);
            if remaining > 0 {
                self.failures_left.store(remaining - 1, Ordering::SeqCst);
                return Err(DbError::NotConnected);
            }
            self.inner.connect(url, options).await
        }

        async fn close(&self) -> Result<(), DbError> {
            self.inner.close().await
        }
    }

    /// Records, for every close, whether this service's record was already gone
    struct CountingConnector {
        inner: Arc<Database>,
        service_id: String,
        closes: std::sync::Mutex<Vec<bool>>,
    }

    impl CountingConnector {
        fn new(inner: Arc<Database>, service_id: String) -> Self {
            Self {
                inner,
                service_id,
                closes: std::sync::Mutex::new(Vec::new()),
            }
        }

        fn deleted_before_close(&self) -> Vec<bool> {
            self.closes.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Connector for CountingConnector {
        async fn connect(&self, url: &str, options: &ConnectOptions) -> Result<(), DbError> {
            self.inner.connect(url, options).await
        }

        async fn close(&self) -> Result<(), DbError> {
            let deleted = self
                .inner
                .store()
                .await?
                .find_service(&self.service_id)
                .await?
                .is_none();
            self.closes.lock().unwrap().push(deleted);
            self.inner.close().await
        }
    }

    /// Connects to a fixed URL whatever the configuration says
    struct FixedUrlConnector {
        inner: Arc<Database>,
        url: &'static str,
    }

    #[async_trait]
    impl Connector for FixedUrlConnector {
        async fn connect(&self, _url: &str, options: &ConnectOptions) -> Result<(), DbError> {
            self.inner.connect(self.url, options).await
        }

        async fn close(&self) -> Result<(), DbError> {
            self.inner.close().await
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.database.scheme = "sqlite".to_string();
        config.database.retry_delay_ms = RETRY_DELAY.as_millis() as u64;
        config.service.heartbeat_interval_ms = 20;
        config.service.command_poll_interval_ms = 20;
        config.api.listen = "127.0.0.1:0".to_string();
        config.api.shutdown_grace_ms = 500;
        config
    }

    fn descriptor() -> ServiceDescriptor {
        identity::describe(&test_config().service)
    }

    async fn wait_for_state(registry: &Registry, expected: RecordState) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while registry.state().await != expected {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("registry never reached the expected state");
    }

    #[tokio::test(start_paused = true)]
    async fn test_database_retry_uses_fixed_delay() {
        let mut flaky = None;
        let lifecycle = Arc::new(Lifecycle::new(test_config(), descriptor()).with_database_connector(
            |database| {
                let connector = Arc::new(FlakyConnector::new(database, 3));
                flaky = Some(connector.clone());
                connector
            },
        ));
        let flaky = flaky.unwrap();

        let boot = tokio::spawn({
            let lifecycle = lifecycle.clone();
            async move { lifecycle.boot().await }
        });

        // Between the second and third attempt nothing has been registered yet
        tokio::time::sleep(RETRY_DELAY + RETRY_DELAY / 2).await;
        assert_eq!(flaky.attempts().len(), 2);
        assert_eq!(lifecycle.registry().state().await, RecordState::Unregistered);

        boot.await.unwrap().unwrap();

        let attempts = flaky.attempts();
        assert_eq!(attempts.len(), 4);
        for pair in attempts.windows(2) {
            assert_eq!(pair[1] - pair[0], RETRY_DELAY);
        }
        assert_eq!(lifecycle.registry().state().await, RecordState::Active);

        lifecycle.teardown(ShutdownReason::Signal).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_retry_loop() {
        let lifecycle = Arc::new(
            Lifecycle::new(test_config(), descriptor())
                .with_database_connector(|database| Arc::new(FlakyConnector::new(database, u32::MAX))),
        );

        let boot = tokio::spawn({
            let lifecycle = lifecycle.clone();
            async move { lifecycle.boot().await }
        });

        tokio::time::sleep(RETRY_DELAY * 3).await;
        lifecycle.shutdown().trigger(ShutdownReason::Signal);

        let result = boot.await.unwrap();
        assert!(matches!(result, Err(LifecycleError::Interrupted)));
        assert_eq!(lifecycle.registry().state().await, RecordState::Unregistered);
    }

    #[tokio::test]
    async fn test_invalid_connection_config_is_fatal() {
        let mut config = test_config();
        config.database.scheme = "redis".to_string();
        let lifecycle = Lifecycle::new(config, descriptor());

        let err = lifecycle.boot().await.unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::Config { target: "user", source: DbError::UnsupportedScheme(_) }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_registration_is_fatal() {
        let dir = std::env::temp_dir().join(format!("registerd-test-{}", uuid::Uuid::new_v4()));
        let mut config = test_config();
        config.registry = Some(ConnectionConfig {
            data_dir: Some(dir.clone()),
            ..config.database.clone()
        });
        let descriptor = descriptor();

        let first = Lifecycle::new(config.clone(), descriptor.clone());
        first.boot().await.unwrap();

        let second = Lifecycle::new(config, descriptor);
        let err = second.boot().await.unwrap_err();
        assert!(matches!(err, LifecycleError::Registration(RegistryError::Duplicate(_))));

        first.teardown(ShutdownReason::Signal).await;
        second.teardown(ShutdownReason::StartupFailure).await;
        let _ = std::fs::remove_dir_all(dir);
    }

    #[tokio::test]
    async fn test_concurrent_shutdown_runs_once() {
        let descriptor = descriptor();
        let service_id = descriptor.uuid.clone();
        let mut closes = None;
        let lifecycle = Arc::new(Lifecycle::new(test_config(), descriptor).with_directory_connector(
            |directory| {
                let connector = Arc::new(CountingConnector::new(directory, service_id));
                closes = Some(connector.clone());
                connector
            },
        ));
        let closes = closes.unwrap();
        lifecycle.boot().await.unwrap();
        let registry = lifecycle.registry();

        // Let the command listener pick up the remote command first
        lifecycle
            .directory()
            .store()
            .await
            .unwrap()
            .set_service_command(registry.service_id(), Some(SHUTDOWN_COMMAND))
            .await
            .unwrap();
        let shutdown = lifecycle.shutdown();
        let observed = tokio::time::timeout(Duration::from_secs(5), shutdown.triggered())
            .await
            .expect("listener should observe the shutdown command");
        assert_eq!(observed, ShutdownReason::RemoteCommand);

        // Then a local signal and several teardown callers race it
        let (signal, a, b, c) = tokio::join!(
            async { shutdown.trigger(ShutdownReason::Signal) },
            lifecycle.teardown(ShutdownReason::Signal),
            lifecycle.teardown(ShutdownReason::RemoteCommand),
            lifecycle.teardown(ShutdownReason::Signal),
        );

        assert!(!signal);
        assert_eq!(a.reason, ShutdownReason::RemoteCommand);
        assert!(a.deregistered);
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(registry.state().await, RecordState::Removed);

        // The sequence ran once: one record deletion, one directory close
        assert_eq!(closes.deleted_before_close(), vec![true]);
        assert!(!lifecycle.directory().is_connected().await);

        assert_eq!(lifecycle.teardown(ShutdownReason::Signal).await, a);
        assert_eq!(closes.deleted_before_close().len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_mongodb_url_is_fatal() {
        let lifecycle = Lifecycle::new(test_config(), descriptor()).with_database_connector(|database| {
            Arc::new(FixedUrlConnector {
                inner: database,
                url: "mongodb+srv://localhost:27017/usersdb",
            })
        });

        let result = tokio::time::timeout(Duration::from_secs(5), lifecycle.boot())
            .await
            .expect("configuration errors must not be retried");

        assert!(matches!(
            result,
            Err(LifecycleError::Config { target: "user", source: DbError::Config(_) })
        ));
    }

    #[tokio::test]
    async fn test_failed_unregistration_is_reported() {
        let lifecycle = Lifecycle::new(test_config(), descriptor());
        lifecycle.boot().await.unwrap();

        lifecycle.directory().close().await.unwrap();

        let report = lifecycle.teardown(ShutdownReason::Signal).await;
        assert!(!report.deregistered);
    }

    #[tokio::test]
    async fn test_remote_command_stops_running_service() {
        let lifecycle = Lifecycle::new(test_config(), descriptor());
        let registry = lifecycle.registry();
        let directory = lifecycle.directory();

        let run = tokio::spawn(lifecycle.run());
        wait_for_state(&registry, RecordState::Active).await;

        directory
            .store()
            .await
            .unwrap()
            .set_service_command(registry.service_id(), Some(SHUTDOWN_COMMAND))
            .await
            .unwrap();

        let report = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .expect("service should stop after the remote command")
            .unwrap()
            .unwrap();

        assert_eq!(report.reason, ShutdownReason::RemoteCommand);
        assert!(report.deregistered);
        assert_eq!(registry.state().await, RecordState::Removed);
    }
}
