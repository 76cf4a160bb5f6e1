use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::signal;
use tracing::{info, warn};

use crate::{
    api,
    auth::{jwt::JwtAuthorizer, Authorizer},
    config::Config,
    database::Database,
    error::Result,
    federation::{FederationDriver, HttpPeerProxy, PeerProxy, StaticFederation},
    ratelimit::{NoRateLimiter, RateLimiter},
    replication::Replicator,
    storage::{FilesystemDriver, StorageDriver},
};

/// Shared state behind every request handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub database: Arc<Database>,
    pub storage: Arc<dyn StorageDriver>,
    pub authorizer: Arc<dyn Authorizer>,
    pub federation: Arc<dyn FederationDriver>,
    pub peer_proxy: Arc<dyn PeerProxy>,
    pub ratelimit: Arc<dyn RateLimiter>,
    pub replicator: Arc<Replicator>,
}

pub struct Server {
    state: AppState,
}

impl Server {
    pub async fn new(config_path: PathBuf) -> Result<Self> {
        let config = if config_path.exists() {
            Config::load(&config_path)?
        } else {
            warn!("config file not found, using default configuration");
            Config::default()
        };

        let database = Arc::new(Database::new(&config.database).await?);
        database.migrate().await?;

        let storage = Arc::new(FilesystemDriver::new(&config.storage.path));
        let authorizer = Arc::new(JwtAuthorizer::new(
            config.auth.jwt_secret.clone(),
            config.auth.issuer.clone(),
            config.auth.enable_anonymous_pull,
        ));
        let peer_proxy = Arc::new(HttpPeerProxy::new(config.api.public_hostname.clone()));

        let state = AppState {
            config,
            database,
            storage,
            authorizer,
            federation: Arc::new(StaticFederation::empty()),
            peer_proxy,
            ratelimit: Arc::new(NoRateLimiter),
            replicator: Arc::new(Replicator::new()),
        };

        Ok(Self { state })
    }

    pub fn with_state(state: AppState) -> Self {
        Self { state }
    }

    pub async fn run(self) -> Result<()> {
        let app = api::registry_router(self.state.clone());

        let addr: SocketAddr = format!(
            "{}:{}",
            self.state.config.server.bind, self.state.config.server.port
        )
        .parse()
        .map_err(|e| anyhow::anyhow!("invalid server address: {e}"))?;

        info!("starting registry API on {addr}");
        let listener = tokio::net::TcpListener::bind(&addr).await?;

        tokio::select! {
            result = axum::serve(listener, app) => {
                if let Err(err) = result {
                    tracing::error!("registry server error: {err}");
                }
            }
            _ = signal::ctrl_c() => {
                info!("shutdown signal received");
            }
        }

        info!("registry shutting down");
        Ok(())
    }
}
