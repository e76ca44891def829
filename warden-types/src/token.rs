use chrono::{Local, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::acl;

/// A minted bearer token.
///
/// Tokens are value objects: holders may keep them around but the store
/// remains authoritative for revocation and expiry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Token {
    pub uuid: Uuid,
    pub auth_id: String,
    pub user_uuid: Option<Uuid>,
    pub instance_uuid: Option<Uuid>,
    pub issued_t: i64,
    pub expire_t: i64,
    pub acls: Vec<String>,
    pub metadata: Map<String, Value>,
    pub session_uuid: Uuid,
    pub user_agent: Option<String>,
    pub remote_addr: Option<String>,
    pub refresh_token: Option<String>,
}

impl Token {
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expire_t != 0 && Utc::now().timestamp() > self.expire_t
    }

    #[must_use]
    pub fn matches_required_acl(&self, required_acl: Option<&str>) -> bool {
        acl::matches_required_acl(&self.acls, &self.auth_id, required_acl)
    }

    /// The tenant recorded in the token metadata, if any.
    #[must_use]
    pub fn tenant_uuid(&self) -> Option<String> {
        self.metadata
            .get("tenant_uuid")
            .and_then(Value::as_str)
            .map(ToString::to_string)
    }

    #[must_use]
    pub fn to_payload(&self) -> TokenPayload {
        TokenPayload {
            token: self.uuid,
            auth_id: self.auth_id.clone(),
            user_uuid: self.user_uuid,
            instance_uuid: self.instance_uuid,
            issued_at: format_local_time(self.issued_t),
            expires_at: format_local_time(self.expire_t),
            utc_issued_at: format_utc_time(self.issued_t),
            utc_expires_at: format_utc_time(self.expire_t),
            acls: self.acls.clone(),
            metadata: self.metadata.clone(),
            session_uuid: self.session_uuid,
            remote_addr: self.remote_addr.clone(),
            user_agent: self.user_agent.clone(),
            refresh_token: self.refresh_token.clone(),
        }
    }
}

/// The representation of a token handed back to clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenPayload {
    pub token: Uuid,
    pub auth_id: String,
    pub user_uuid: Option<Uuid>,
    pub instance_uuid: Option<Uuid>,
    pub issued_at: Option<String>,
    pub expires_at: Option<String>,
    pub utc_issued_at: Option<String>,
    pub utc_expires_at: Option<String>,
    pub acls: Vec<String>,
    pub metadata: Map<String, Value>,
    pub session_uuid: Uuid,
    pub remote_addr: Option<String>,
    pub user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

const ISO_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

fn format_local_time(t: i64) -> Option<String> {
    if t == 0 {
        return None;
    }
    Local
        .timestamp_opt(t, 0)
        .single()
        .map(|dt| dt.format(ISO_FORMAT).to_string())
}

fn format_utc_time(t: i64) -> Option<String> {
    if t == 0 {
        return None;
    }
    Utc.timestamp_opt(t, 0)
        .single()
        .map(|dt| dt.format(ISO_FORMAT).to_string())
}
