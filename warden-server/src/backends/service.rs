use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{Map, Value};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::config::ServiceAccount;
use crate::error::Error;

use super::AuthenticationBackend;

/// Authenticates configuration-declared service accounts. Their ACLs are
/// static and come straight from the configuration.
pub struct ServiceBackend {
    services: HashMap<String, ServiceAccount>,
}

impl ServiceBackend {
    #[must_use]
    pub fn new(services: HashMap<String, ServiceAccount>) -> Self {
        Self { services }
    }

    /// A service token can be minted on behalf of a user by passing
    /// `user_uuid` in the backend arguments.
    fn user_uuid(args: &Map<String, Value>) -> Option<Uuid> {
        args.get("user_uuid")
            .and_then(Value::as_str)
            .and_then(|raw| raw.parse().ok())
    }
}

#[async_trait]
impl AuthenticationBackend for ServiceBackend {
    #[tracing::instrument(skip_all, fields(login = login))]
    async fn verify_password(&self, login: &str, password: &str) -> Result<bool, Error> {
        let service = match self.services.get(login) {
            Some(service) => service,
            None => return Ok(false),
        };
        Ok(service
            .secret
            .as_bytes()
            .ct_eq(password.as_bytes())
            .into())
    }

    async fn get_ids(
        &self,
        login: &str,
        args: &Map<String, Value>,
    ) -> Result<(String, Option<Uuid>), Error> {
        let user_uuid = Self::user_uuid(args);
        let auth_id = user_uuid.map_or_else(|| login.to_string(), |uuid| uuid.to_string());
        Ok((auth_id, user_uuid))
    }

    async fn get_acls(
        &self,
        login: &str,
        _args: &Map<String, Value>,
    ) -> Result<Vec<String>, Error> {
        Ok(self
            .services
            .get(login)
            .map(|service| service.acls.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn services() -> HashMap<String, ServiceAccount> {
        HashMap::from([(
            "provisioning".to_string(),
            ServiceAccount {
                secret: "opensesame".to_string(),
                acls: vec!["confd.#".to_string()],
            },
        )])
    }

    #[tokio::test]
    async fn verifies_the_configured_secret() {
        let backend = ServiceBackend::new(services());

        assert!(backend
            .verify_password("provisioning", "opensesame")
            .await
            .unwrap());
        assert!(!backend.verify_password("provisioning", "nope").await.unwrap());
        assert!(!backend.verify_password("unknown", "opensesame").await.unwrap());
    }

    #[tokio::test]
    async fn identity_comes_from_the_backend_args() {
        let backend = ServiceBackend::new(services());

        let (auth_id, user_uuid) = backend.get_ids("provisioning", &Map::new()).await.unwrap();
        assert_eq!(auth_id, "provisioning");
        assert_eq!(user_uuid, None);

        let target = Uuid::new_v4();
        let mut args = Map::new();
        args.insert("user_uuid".to_string(), Value::String(target.to_string()));
        let (auth_id, user_uuid) = backend.get_ids("provisioning", &args).await.unwrap();
        assert_eq!(auth_id, target.to_string());
        assert_eq!(user_uuid, Some(target));
    }

    #[tokio::test]
    async fn acls_are_static() {
        let backend = ServiceBackend::new(services());
        assert_eq!(
            backend.get_acls("provisioning", &Map::new()).await.unwrap(),
            vec!["confd.#".to_string()]
        );
        assert!(backend.get_acls("unknown", &Map::new()).await.unwrap().is_empty());
    }
}
