use log::{error, info, warn};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

use crate::auth::{Authenticator, CredentialTable, StaticAuthenticator};
use crate::config::{ServerConfig, SharedRuntimeConfig};
use crate::error::ServerError;
use crate::protocol::responses::{NOT_LOGGED_IN, format_reply};
use crate::session::{SessionRegistry, SessionServices, handle_session};
use crate::storage::{FileSystem, LocalFileSystem};
use crate::transfer::socket_opts;

pub struct Server {
    listener: TcpListener,
    services: Arc<SessionServices>,
}

impl Server {
    /// Binds the control port, serving `server_root` to the users listed in
    /// the configuration.
    pub async fn bind(config: ServerConfig) -> Result<Self, ServerError> {
        config.validate()?;
        let storage = Arc::new(LocalFileSystem::new(config.startup.server_root_path()));
        let auth = Arc::new(StaticAuthenticator::new(CredentialTable::from_entries(
            &config.startup.users,
        )));
        Self::with_backends(config, storage, auth).await
    }

    /// Binds the control port with caller-provided storage and
    /// authentication.
    pub async fn with_backends(
        config: ServerConfig,
        storage: Arc<dyn FileSystem>,
        auth: Arc<dyn Authenticator>,
    ) -> Result<Self, ServerError> {
        let (startup, runtime) = config.split();

        let address = startup.control_socket();
        let listener = TcpListener::bind(&address)
            .await
            .map_err(|e| ServerError::Bind(address.clone(), e))?;
        info!("Server bound to {}", listener.local_addr()?);

        if let Err(e) = tokio::fs::create_dir_all(&startup.server_root).await {
            warn!("Failed to create server root directory: {}", e);
        } else {
            info!("Server root directory: {}", startup.server_root);
        }

        let services = Arc::new(SessionServices {
            config: Arc::new(startup),
            runtime,
            storage,
            auth,
            registry: SessionRegistry::new(),
        });
        Ok(Self { listener, services })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Arc<SessionRegistry> {
        Arc::clone(&self.services.registry)
    }

    /// Runtime settings; changes apply to the next connection or transfer.
    pub fn runtime_config(&self) -> SharedRuntimeConfig {
        Arc::clone(&self.services.runtime)
    }

    /// Accepts control connections until the task is dropped.
    pub async fn start(self) {
        let max_clients = self.services.runtime.read().await.max_clients;
        info!(
            "Starting dissftp server on {} (max {} clients)",
            self.services.config.control_socket(),
            max_clients
        );

        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let services = Arc::clone(&self.services);

                    // Spawn a task for each client so accept loop doesn't block
                    tokio::spawn(async move {
                        if let Err(e) = handle_new_client(stream, addr, services).await {
                            warn!("Failed to handle client {}: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Error accepting connection: {}", e);
                }
            }
        }
    }
}

/// Admits a new client against the connection limit and runs its session.
async fn handle_new_client(
    mut stream: TcpStream,
    client_addr: SocketAddr,
    services: Arc<SessionServices>,
) -> Result<(), io::Error> {
    socket_opts::apply_to_stream(&stream, &services.config.socket);
    let local_addr = stream.local_addr()?;

    let limit = services.runtime.read().await.max_clients;
    let Some(guard) = services.registry.try_acquire(limit) else {
        warn!(
            "Refusing client {}: {} connections already open",
            client_addr, limit
        );
        let reply = format_reply(
            NOT_LOGGED_IN,
            &format!("The maximum number of connections have been reached ({limit})"),
        );
        stream.write_all(reply.as_bytes()).await?;
        stream.shutdown().await?;
        return Ok(());
    };

    info!(
        "Accepted client {} ({}/{} clients)",
        client_addr,
        services.registry.active(),
        limit
    );
    handle_session(stream, client_addr, local_addr, services, guard).await;
    Ok(())
}
