use std::sync::Arc;

use chrono::Utc;
use futures::future::try_join_all;
use serde_json::{Map, Value};
use uuid::Uuid;
use warden_types::token::Token;

use crate::acl_templates::{
    ContextGroup, ContextTenant, ContextUser, LazyTemplateRenderer, TemplateContext,
};
use crate::backends::BackendRegistry;
use crate::config::Config;
use crate::error::{Error, ErrorType};
use crate::repos::Repos;

#[derive(Debug, Default, Clone)]
pub struct NewTokenParams {
    pub login: String,
    pub password: String,
    /// Requested lifetime in seconds, clamped to the configured range.
    pub expiration: Option<i64>,
    /// Session to attach the token to; a new session is opened otherwise.
    pub session_uuid: Option<Uuid>,
    pub user_agent: Option<String>,
    pub remote_addr: Option<String>,
    pub metadata: Map<String, Value>,
    pub backend_args: Map<String, Value>,
}

pub struct TokenManager {
    repos: Repos,
    registry: Arc<BackendRegistry>,
    instance_uuid: Option<Uuid>,
    default_expiration: i64,
    min_expiration: i64,
    max_expiration: i64,
}

impl TokenManager {
    #[must_use]
    #[allow(clippy::cast_possible_wrap)]
    pub fn new(config: &Config, repos: Repos, registry: Arc<BackendRegistry>) -> Self {
        Self {
            repos,
            registry,
            instance_uuid: config.instance_uuid,
            default_expiration: config.default_token_expiration.as_secs() as i64,
            min_expiration: config.min_token_expiration.as_secs() as i64,
            max_expiration: config.max_token_expiration.as_secs() as i64,
        }
    }

    /// Mint a token: check the credentials against the named backend,
    /// resolve the identity, expand the effective policies into ACLs and
    /// persist the result. A store failure aborts the mint and nothing is
    /// persisted.
    #[tracing::instrument(skip_all, fields(backend = backend_name, login = params.login))]
    pub async fn new_token(
        &self,
        backend_name: &str,
        params: NewTokenParams,
    ) -> Result<Token, Error> {
        let backend = self.registry.get(backend_name)?;

        if !backend
            .verify_password(&params.login, &params.password)
            .await?
        {
            return Err(ErrorType::InvalidCredentials.into());
        }

        let (auth_id, user_uuid) = backend.get_ids(&params.login, &params.backend_args).await?;

        // Backend ACLs come first, then the policy expansion in policy
        // name order then template order.
        let mut acls = backend.get_acls(&params.login, &params.backend_args).await?;
        if let Some(user_uuid) = user_uuid {
            acls.extend(self.expand_user_acls(user_uuid).await?);
        }

        let now = Utc::now().timestamp();
        let expiration = params
            .expiration
            .unwrap_or(self.default_expiration)
            .clamp(self.min_expiration, self.max_expiration);

        let token = Token {
            uuid: Uuid::new_v4(),
            auth_id,
            user_uuid,
            instance_uuid: self.instance_uuid,
            issued_t: now,
            expire_t: now + expiration,
            acls,
            metadata: params.metadata,
            session_uuid: params.session_uuid.unwrap_or_else(Uuid::new_v4),
            user_agent: params.user_agent,
            remote_addr: params.remote_addr,
            refresh_token: None,
        };

        self.repos.token.create(&token).await?;

        Ok(token)
    }

    async fn expand_user_acls(&self, user_uuid: Uuid) -> Result<Vec<String>, Error> {
        let policies = self.repos.policy.list_effective_for_user(user_uuid).await?;

        // Template strings are globally unique, keep the first occurrence.
        let mut acl_templates: Vec<String> = Vec::new();
        for policy in policies {
            for template in policy.acl_templates {
                if !acl_templates.contains(&template) {
                    acl_templates.push(template);
                }
            }
        }

        let repos = self.repos.clone();
        LazyTemplateRenderer::new(acl_templates)
            .render(move || async move { fetch_template_context(&repos, user_uuid).await })
            .await
    }

    /// Delete a token unconditionally.
    #[tracing::instrument(skip(self))]
    pub async fn remove_token(&self, token_uuid: Uuid) -> Result<(), Error> {
        self.repos.token.delete(token_uuid).await
    }

    /// Fetch a token without extending its lifetime.
    #[tracing::instrument(skip(self))]
    pub async fn get_token(&self, token_uuid: Uuid) -> Result<Token, Error> {
        self.repos.token.get(token_uuid).await
    }

    /// Whether the token exists, has not expired and carries the required
    /// ACL.
    #[tracing::instrument(skip(self))]
    pub async fn is_valid(
        &self,
        token_uuid: Uuid,
        required_acl: Option<&str>,
    ) -> Result<bool, Error> {
        let token = self.repos.token.get(token_uuid).await?;
        Ok(!token.is_expired() && token.matches_required_acl(required_acl))
    }
}

/// Snapshot of the identity graph around one user, fetched on demand by
/// the template renderer.
async fn fetch_template_context(repos: &Repos, user_uuid: Uuid) -> Result<TemplateContext, Error> {
    let user = repos.user.get(user_uuid).await?;

    let groups = repos.group.groups_of_user(user_uuid).await?;
    let groups = try_join_all(groups.into_iter().map(|group| async move {
        let users = repos.group.users_of_group(group.uuid).await?;
        Ok::<_, Error>(ContextGroup {
            uuid: group.uuid,
            name: group.name,
            users: users
                .into_iter()
                .map(|member| ContextUser {
                    uuid: member.uuid,
                    username: member.username,
                })
                .collect(),
        })
    }))
    .await?;

    let tenants = repos
        .tenant
        .tenants_of_user(user_uuid)
        .await?
        .into_iter()
        .map(|tenant| ContextTenant {
            uuid: tenant.uuid,
            name: tenant.name,
        })
        .collect();

    Ok(TemplateContext {
        user: ContextUser {
            uuid: user.uuid,
            username: user.username,
        },
        groups,
        tenants,
    })
}
