use serde_json::{Map, Value};
use sqlx::SqlitePool;
use uuid::Uuid;
use warden_types::token::Token;

use crate::error::{Error, ErrorType};

use super::user::parse_uuid;

/// Summary of a deleted or expiring token, enough to build the session
/// lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSummary {
    pub uuid: Uuid,
    pub auth_id: String,
    pub session_uuid: Uuid,
    pub metadata: Map<String, Value>,
}

impl TokenSummary {
    #[must_use]
    pub fn tenant_uuid(&self) -> Option<String> {
        self.metadata
            .get("tenant_uuid")
            .and_then(Value::as_str)
            .map(ToString::to_string)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub uuid: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct TokenRaw {
    uuid: String,
    auth_id: String,
    user_uuid: Option<String>,
    instance_uuid: Option<String>,
    issued_t: i64,
    expire_t: i64,
    session_uuid: String,
    user_agent: Option<String>,
    remote_addr: Option<String>,
    metadata: String,
    refresh_token: Option<String>,
}

impl TryFrom<TokenRaw> for Token {
    type Error = Error;

    fn try_from(raw: TokenRaw) -> Result<Token, Error> {
        let metadata = serde_json::from_str(&raw.metadata).map_err(|_| {
            ErrorType::BadData(format!("Unable to parse token metadata `{}`", raw.metadata))
        })?;

        Ok(Token {
            uuid: parse_uuid(&raw.uuid)?,
            auth_id: raw.auth_id,
            user_uuid: raw.user_uuid.as_deref().map(parse_uuid).transpose()?,
            instance_uuid: raw.instance_uuid.as_deref().map(parse_uuid).transpose()?,
            issued_t: raw.issued_t,
            expire_t: raw.expire_t,
            acls: Vec::new(),
            metadata,
            session_uuid: parse_uuid(&raw.session_uuid)?,
            user_agent: raw.user_agent,
            remote_addr: raw.remote_addr,
            refresh_token: raw.refresh_token,
        })
    }
}

#[derive(Clone)]
pub struct TokenRepo {
    pool: SqlitePool,
}

impl TokenRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Persist a token, its ACL rows and its session in one unit of work.
    /// The session row is shared by every token minted with the same
    /// session uuid.
    #[tracing::instrument(skip_all, fields(token = %token.uuid))]
    pub async fn create(&self, token: &Token) -> Result<Uuid, Error> {
        let metadata = serde_json::to_string(&token.metadata)
            .map_err(|_| ErrorType::BadData("Unable to serialize token metadata".to_string()))?;

        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT OR IGNORE INTO auth_session (uuid) VALUES (?)")
            .bind(token.session_uuid.to_string())
            .execute(&mut tx)
            .await?;

        sqlx::query(
            "INSERT INTO auth_token (
                uuid, auth_id, user_uuid, instance_uuid, issued_t, expire_t,
                session_uuid, user_agent, remote_addr, metadata, refresh_token
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(token.uuid.to_string())
        .bind(&token.auth_id)
        .bind(token.user_uuid.map(|uuid| uuid.to_string()))
        .bind(token.instance_uuid.map(|uuid| uuid.to_string()))
        .bind(token.issued_t)
        .bind(token.expire_t)
        .bind(token.session_uuid.to_string())
        .bind(&token.user_agent)
        .bind(&token.remote_addr)
        .bind(metadata)
        .bind(&token.refresh_token)
        .execute(&mut tx)
        .await?;

        for acl in &token.acls {
            sqlx::query("INSERT INTO auth_acl (value, token_uuid) VALUES (?, ?)")
                .bind(acl)
                .bind(token.uuid.to_string())
                .execute(&mut tx)
                .await?;
        }

        tx.commit().await?;

        Ok(token.uuid)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get(&self, token_uuid: Uuid) -> Result<Token, Error> {
        let raw: Option<TokenRaw> = sqlx::query_as("SELECT * FROM auth_token WHERE uuid = ?")
            .bind(token_uuid.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let mut token: Token = raw.ok_or(ErrorType::UnknownToken)?.try_into()?;

        token.acls =
            sqlx::query_scalar("SELECT value FROM auth_acl WHERE token_uuid = ? ORDER BY id ASC")
                .bind(token_uuid.to_string())
                .fetch_all(&self.pool)
                .await?;

        Ok(token)
    }

    /// Delete a token. Deleting a token that does not exist is a no-op.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, token_uuid: Uuid) -> Result<(), Error> {
        sqlx::query("DELETE FROM auth_token WHERE uuid = ?")
            .bind(token_uuid.to_string())
            .execute(&self.pool)
            .await
            .map_err(Into::into)
            .map(|_| ())
    }

    /// Delete every token past its expiry and the sessions left without
    /// any token, in one unit of work. Returns the summaries of the
    /// deleted rows.
    #[tracing::instrument(skip(self))]
    pub async fn delete_expired_tokens_and_sessions(
        &self,
        now: i64,
    ) -> Result<(Vec<TokenSummary>, Vec<SessionSummary>), Error> {
        let mut tx = self.pool.begin().await?;

        let tokens: Vec<(String, String, String, String)> = sqlx::query_as(
            "SELECT uuid, auth_id, session_uuid, metadata FROM auth_token WHERE expire_t < ?",
        )
        .bind(now)
        .fetch_all(&mut tx)
        .await?;

        sqlx::query("DELETE FROM auth_token WHERE expire_t < ?")
            .bind(now)
            .execute(&mut tx)
            .await?;

        let sessions: Vec<(String,)> = sqlx::query_as(
            "SELECT uuid FROM auth_session WHERE NOT EXISTS
                (SELECT 1 FROM auth_token T WHERE T.session_uuid = auth_session.uuid)",
        )
        .fetch_all(&mut tx)
        .await?;

        sqlx::query(
            "DELETE FROM auth_session WHERE NOT EXISTS
                (SELECT 1 FROM auth_token T WHERE T.session_uuid = auth_session.uuid)",
        )
        .execute(&mut tx)
        .await?;

        tx.commit().await?;

        Ok((
            tokens
                .into_iter()
                .map(token_summary)
                .collect::<Result<_, Error>>()?,
            sessions
                .into_iter()
                .map(|(uuid,)| {
                    Ok(SessionSummary {
                        uuid: parse_uuid(&uuid)?,
                    })
                })
                .collect::<Result<_, Error>>()?,
        ))
    }

    /// Tokens whose expiry falls within `(now, now + window_seconds]` and
    /// the sessions holding them.
    #[tracing::instrument(skip(self))]
    pub async fn expiring_soon(
        &self,
        now: i64,
        window_seconds: i64,
    ) -> Result<(Vec<TokenSummary>, Vec<SessionSummary>), Error> {
        let tokens: Vec<(String, String, String, String)> = sqlx::query_as(
            "SELECT uuid, auth_id, session_uuid, metadata FROM auth_token
            WHERE expire_t > ? AND expire_t <= ?",
        )
        .bind(now)
        .bind(now + window_seconds)
        .fetch_all(&self.pool)
        .await?;

        let sessions: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT session_uuid FROM auth_token
            WHERE expire_t > ? AND expire_t <= ?",
        )
        .bind(now)
        .bind(now + window_seconds)
        .fetch_all(&self.pool)
        .await?;

        Ok((
            tokens
                .into_iter()
                .map(token_summary)
                .collect::<Result<_, Error>>()?,
            sessions
                .into_iter()
                .map(|(uuid,)| {
                    Ok(SessionSummary {
                        uuid: parse_uuid(&uuid)?,
                    })
                })
                .collect::<Result<_, Error>>()?,
        ))
    }
}

fn token_summary(
    (uuid, auth_id, session_uuid, metadata): (String, String, String, String),
) -> Result<TokenSummary, Error> {
    let metadata = serde_json::from_str(&metadata)
        .map_err(|_| ErrorType::BadData(format!("Unable to parse token metadata `{metadata}`")))?;
    Ok(TokenSummary {
        uuid: parse_uuid(&uuid)?,
        auth_id,
        session_uuid: parse_uuid(&session_uuid)?,
        metadata,
    })
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use crate::repos::tests::pool;

    use super::*;

    fn token(expire_t: i64, session_uuid: Uuid) -> Token {
        Token {
            uuid: Uuid::new_v4(),
            auth_id: "the-auth-id".to_string(),
            user_uuid: Some(Uuid::new_v4()),
            instance_uuid: None,
            issued_t: Utc::now().timestamp(),
            expire_t,
            acls: vec!["confd.#".to_string(), "!confd.users.#".to_string()],
            metadata: Map::new(),
            session_uuid,
            user_agent: Some("test-agent".to_string()),
            remote_addr: Some("127.0.0.1".to_string()),
            refresh_token: None,
        }
    }

    #[tokio::test]
    async fn create_get_delete() {
        let store = TokenRepo::new(pool().await);
        let now = Utc::now().timestamp();

        let mut minted = token(now + 3600, Uuid::new_v4());
        minted
            .metadata
            .insert("tenant_uuid".to_string(), Value::String("t-1".to_string()));

        store.create(&minted).await.unwrap();
        let fetched = store.get(minted.uuid).await.unwrap();
        assert_eq!(fetched, minted);

        store.delete(minted.uuid).await.unwrap();
        assert!(matches!(
            store.get(minted.uuid).await.unwrap_err().variant,
            ErrorType::UnknownToken
        ));
        // Deleting again is a no-op
        store.delete(minted.uuid).await.unwrap();
    }

    #[tokio::test]
    async fn expired_tokens_and_orphan_sessions_are_deleted_together() {
        let store = TokenRepo::new(pool().await);
        let now = Utc::now().timestamp();

        let shared_session = Uuid::new_v4();
        let expired = token(now - 1, Uuid::new_v4());
        let expired_shared = token(now - 10, shared_session);
        let valid_shared = token(now + 3600, shared_session);

        for t in [&expired, &expired_shared, &valid_shared] {
            store.create(t).await.unwrap();
        }

        let (tokens, sessions) = store.delete_expired_tokens_and_sessions(now).await.unwrap();

        let mut deleted = tokens.iter().map(|t| t.uuid).collect::<Vec<_>>();
        deleted.sort();
        let mut expected = vec![expired.uuid, expired_shared.uuid];
        expected.sort();
        assert_eq!(deleted, expected);

        // The shared session still holds a live token and must survive
        assert_eq!(
            sessions,
            vec![SessionSummary {
                uuid: expired.session_uuid
            }]
        );
        assert_eq!(store.get(valid_shared.uuid).await.unwrap(), valid_shared);

        // A second pass finds nothing left to remove
        let (tokens, sessions) = store.delete_expired_tokens_and_sessions(now).await.unwrap();
        assert!(tokens.is_empty());
        assert!(sessions.is_empty());
    }

    #[tokio::test]
    async fn expiring_soon_only_covers_the_window() {
        let store = TokenRepo::new(pool().await);
        let now = Utc::now().timestamp();

        let soon = token(now + 30, Uuid::new_v4());
        let later = token(now + 3600, Uuid::new_v4());
        let expired = token(now - 1, Uuid::new_v4());
        for t in [&soon, &later, &expired] {
            store.create(t).await.unwrap();
        }

        let (tokens, sessions) = store.expiring_soon(now, 60).await.unwrap();
        assert_eq!(tokens.len(), 1);
        assert_eq!(tokens[0].uuid, soon.uuid);
        assert_eq!(tokens[0].session_uuid, soon.session_uuid);
        assert_eq!(
            sessions,
            vec![SessionSummary {
                uuid: soon.session_uuid
            }]
        );
    }
}
