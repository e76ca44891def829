use async_trait::async_trait;
use rand::RngCore;
use serde_json::{Map, Value};
use sha2::{Digest, Sha512};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::{Error, ErrorType};
use crate::repos::{UserListParams, UserRepo};

use super::AuthenticationBackend;

const SALT_LENGTH: usize = 16;

/// Authenticates against the users of the identity graph itself.
pub struct NativeBackend {
    users: UserRepo,
}

impl NativeBackend {
    #[must_use]
    pub fn new(users: UserRepo) -> Self {
        Self { users }
    }

    async fn user_uuid(&self, login: &str) -> Result<Uuid, Error> {
        let users = self
            .users
            .list(&UserListParams {
                username: Some(login.to_string()),
                ..UserListParams::default()
            })
            .await?;
        users
            .first()
            .map(|user| user.uuid)
            .ok_or_else(|| ErrorType::UnknownUsername(login.to_string()).into())
    }
}

#[async_trait]
impl AuthenticationBackend for NativeBackend {
    #[tracing::instrument(skip_all, fields(login = login))]
    async fn verify_password(&self, login: &str, password: &str) -> Result<bool, Error> {
        let credentials = match self.users.get_credentials(login).await {
            Ok(credentials) => credentials,
            Err(err) if matches!(err.variant, ErrorType::UnknownUsername(_)) => return Ok(false),
            Err(err) => return Err(err),
        };

        let (hash, salt) = match (credentials.password_hash, credentials.password_salt) {
            (Some(hash), Some(salt)) => (hash, salt),
            _ => return Ok(false),
        };

        let computed = hash_password(password, &salt);
        Ok(computed.as_bytes().ct_eq(hash.as_bytes()).into())
    }

    async fn get_ids(
        &self,
        login: &str,
        _args: &Map<String, Value>,
    ) -> Result<(String, Option<Uuid>), Error> {
        let user_uuid = self.user_uuid(login).await?;
        Ok((user_uuid.to_string(), Some(user_uuid)))
    }

    async fn get_acls(
        &self,
        _login: &str,
        _args: &Map<String, Value>,
    ) -> Result<Vec<String>, Error> {
        Ok(Vec::new())
    }
}

/// Salted password digest stored in the user table.
#[must_use]
pub fn hash_password(password: &str, salt: &[u8]) -> String {
    let mut hasher = Sha512::new();
    hasher.update(salt);
    hasher.update(password.as_bytes());
    hex::encode(hasher.finalize())
}

#[must_use]
pub fn random_salt() -> Vec<u8> {
    let mut salt = vec![0u8; SALT_LENGTH];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

#[cfg(test)]
mod tests {
    use crate::repos::tests::pool;
    use crate::repos::{NewUser, Repos};

    use super::*;

    async fn seed_user(repos: &Repos, username: &str, password: &str) -> Uuid {
        let salt = random_salt();
        let user = repos
            .user
            .create(&NewUser {
                username: username.to_string(),
                email_address: format!("{username}@example.com"),
                password_hash: Some(hash_password(password, &salt)),
                password_salt: Some(salt),
                uuid: None,
                email_confirmed: false,
            })
            .await
            .unwrap();
        user.uuid
    }

    #[tokio::test]
    async fn verifies_the_stored_credentials() {
        let repos = Repos::new(pool().await);
        let backend = NativeBackend::new(repos.user.clone());
        let user_uuid = seed_user(&repos, "foo", "s3cr3t").await;

        assert!(backend.verify_password("foo", "s3cr3t").await.unwrap());
        assert!(!backend.verify_password("foo", "wrong").await.unwrap());
        assert!(!backend.verify_password("nobody", "s3cr3t").await.unwrap());

        let (auth_id, resolved) = backend.get_ids("foo", &Map::new()).await.unwrap();
        assert_eq!(auth_id, user_uuid.to_string());
        assert_eq!(resolved, Some(user_uuid));

        assert!(backend.get_acls("foo", &Map::new()).await.unwrap().is_empty());
    }

    #[test]
    fn salts_make_equal_passwords_differ() {
        let first = random_salt();
        let second = random_salt();
        assert_ne!(first, second);
        assert_ne!(hash_password("secret", &first), hash_password("secret", &second));
        assert_eq!(hash_password("secret", &first), hash_password("secret", &first));
    }
}
