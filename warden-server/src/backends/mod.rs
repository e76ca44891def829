mod native;
mod service;

pub use native::{hash_password, random_salt, NativeBackend};
pub use service::ServiceBackend;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::error::{Error, ErrorType};
use crate::repos::Repos;

/// The capability set every authentication backend implements.
///
/// A backend is selected by name at token mint time and is responsible
/// for checking the credentials and resolving the stable identity pair
/// stamped on the token.
#[async_trait]
pub trait AuthenticationBackend: Send + Sync {
    /// Pure credential check. No side effects.
    async fn verify_password(&self, login: &str, password: &str) -> Result<bool, Error>;

    /// The identifier pair stamped on the token. The user uuid may be
    /// `None` for non-user identities such as service accounts.
    async fn get_ids(
        &self,
        login: &str,
        args: &Map<String, Value>,
    ) -> Result<(String, Option<Uuid>), Error>;

    /// Base ACLs granted to the login regardless of policy-derived ACLs.
    async fn get_acls(&self, login: &str, args: &Map<String, Value>)
        -> Result<Vec<String>, Error>;
}

/// Named authentication backends in registration order.
#[derive(Default)]
pub struct BackendRegistry {
    backends: Vec<(String, Arc<dyn AuthenticationBackend>)>,
}

impl BackendRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, backend: Arc<dyn AuthenticationBackend>) {
        self.backends.push((name.into(), backend));
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn AuthenticationBackend>, Error> {
        self.backends
            .iter()
            .find(|(known, _)| known == name)
            .map(|(_, backend)| Arc::clone(backend))
            .ok_or_else(|| ErrorType::UnauthorizedBackend(name.to_string()).into())
    }

    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.backends.iter().map(|(name, _)| name.as_str()).collect()
    }
}

/// Build the registry from the configured backend list. A backend that
/// fails to load is skipped so the others stay usable.
#[must_use]
pub fn build_registry(config: &Config, repos: &Repos) -> BackendRegistry {
    let mut registry = BackendRegistry::new();

    for name in &config.enabled_backends {
        match load_backend(name, config, repos) {
            Ok(backend) => {
                info!(backend = name.as_str(), "loaded authentication backend");
                registry.register(name.clone(), backend);
            }
            Err(error) => {
                error!(backend = name.as_str(), %error, "failed to load authentication backend");
            }
        }
    }

    registry
}

fn load_backend(
    name: &str,
    config: &Config,
    repos: &Repos,
) -> Result<Arc<dyn AuthenticationBackend>, Error> {
    match name {
        "native" => Ok(Arc::new(NativeBackend::new(repos.user.clone()))),
        "service" => Ok(Arc::new(ServiceBackend::new(config.services.clone()))),
        _ => Err(ErrorType::BadRequest(format!("unknown backend `{name}`")).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullBackend;

    #[async_trait]
    impl AuthenticationBackend for NullBackend {
        async fn verify_password(&self, _login: &str, _password: &str) -> Result<bool, Error> {
            Ok(false)
        }

        async fn get_ids(
            &self,
            login: &str,
            _args: &Map<String, Value>,
        ) -> Result<(String, Option<Uuid>), Error> {
            Ok((login.to_string(), None))
        }

        async fn get_acls(
            &self,
            _login: &str,
            _args: &Map<String, Value>,
        ) -> Result<Vec<String>, Error> {
            Ok(Vec::new())
        }
    }

    #[test]
    fn unknown_backend_names_are_unauthorized() {
        let mut registry = BackendRegistry::new();
        registry.register("null", Arc::new(NullBackend));

        assert!(registry.get("null").is_ok());
        assert_eq!(registry.names(), vec!["null"]);

        let err = registry.get("ldap").unwrap_err();
        assert!(matches!(err.variant, ErrorType::UnauthorizedBackend(_)));
    }

    #[tokio::test]
    async fn a_broken_backend_does_not_prevent_the_others_from_loading() {
        let pool = crate::repos::tests::pool().await;
        let repos = Repos::new(pool);
        let config = Config {
            enabled_backends: vec![
                "native".to_string(),
                "does-not-exist".to_string(),
                "service".to_string(),
            ],
            ..Config::default()
        };

        let registry = build_registry(&config, &repos);
        assert_eq!(registry.names(), vec!["native", "service"]);
    }
}
