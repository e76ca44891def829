#![forbid(unsafe_code)]
#![forbid(clippy::unwrap_used)]
#![deny(clippy::pedantic)]
#![deny(clippy::get_unwrap)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

mod acl_templates;
pub mod backends;
pub mod bus;
mod config;
mod error;
pub mod expiry;
mod migrations;
pub mod repos;
mod token_manager;

pub use acl_templates::{
    ContextGroup, ContextTenant, ContextUser, LazyTemplateRenderer, TemplateContext,
};
pub use config::{Config, ServiceAccount};
pub use error::{Error, ErrorType};
pub use migrations::MigrationError;
pub use token_manager::{NewTokenParams, TokenManager};

use std::sync::Arc;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::task::JoinHandle;
use tracing::info;

use crate::backends::{build_registry, BackendRegistry};
use crate::bus::EventPublisher;
use crate::expiry::clock::SystemClock;
use crate::expiry::ExpiredTokenRemover;
use crate::repos::Repos;

pub async fn shutdown_signal() {
    // Wait for the CTRL+C signal
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install CTRL+C signal handler");
}

/// The assembled core: one database handle, the repositories, the
/// authentication backends and the background expiry task. The HTTP
/// surface plugs in on top of this.
pub struct AuthCore {
    pub repos: Repos,
    pub registry: Arc<BackendRegistry>,
    pub token_manager: Arc<TokenManager>,
    expired_token_remover: Arc<ExpiredTokenRemover>,
    remover_handle: JoinHandle<()>,
    pool: SqlitePool,
}

/// Bind the process-wide database engine, run the migrations and start
/// the expired token remover.
pub async fn bootstrap(
    config: Config,
    publisher: Arc<dyn EventPublisher>,
) -> anyhow::Result<AuthCore> {
    config.sanitize()?;

    let mut pool_options = SqlitePoolOptions::new();
    if config.using_inmemory_storage() {
        pool_options = pool_options.min_connections(1).max_connections(1);
    }
    let pool = pool_options
        .connect_with(
            SqliteConnectOptions::new()
                .create_if_missing(true)
                .foreign_keys(true)
                .filename(&config.db_path),
        )
        .await?;

    migrations::migrate(&pool).await?;

    let repos = Repos::new(pool.clone());
    let registry = Arc::new(build_registry(&config, &repos));
    let token_manager = Arc::new(TokenManager::new(
        &config,
        repos.clone(),
        Arc::clone(&registry),
    ));

    let expired_token_remover = Arc::new(ExpiredTokenRemover::new(
        repos.token.clone(),
        publisher,
        config.token_cleanup_interval,
        SystemClock,
    ));
    let remover = Arc::clone(&expired_token_remover);
    let remover_handle = tokio::spawn(async move { remover.start().await });

    info!(db_path = config.db_path.as_str(), "warden core ready");

    Ok(AuthCore {
        repos,
        registry,
        token_manager,
        expired_token_remover,
        remover_handle,
        pool,
    })
}

impl AuthCore {
    /// Stop the background task and release the pooled connections.
    pub async fn stop(self) {
        self.expired_token_remover.stop().await;
        let _ = self.remover_handle.await;
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use crate::backends::{hash_password, random_salt};
    use crate::bus::LogPublisher;
    use crate::repos::NewUser;

    use super::*;

    #[tokio::test]
    async fn bootstrap_mints_a_token_and_stops() {
        let core = bootstrap(Config::default(), Arc::new(LogPublisher))
            .await
            .unwrap();

        let salt = random_salt();
        core.repos
            .user
            .create(&NewUser {
                username: "foo".to_string(),
                email_address: "foo@example.com".to_string(),
                password_hash: Some(hash_password("bar", &salt)),
                password_salt: Some(salt),
                uuid: None,
                email_confirmed: false,
            })
            .await
            .unwrap();

        let token = core
            .token_manager
            .new_token(
                "native",
                NewTokenParams {
                    login: "foo".to_string(),
                    password: "bar".to_string(),
                    ..NewTokenParams::default()
                },
            )
            .await
            .unwrap();
        assert!(core.token_manager.is_valid(token.uuid, None).await.unwrap());

        core.stop().await;
    }
}
