use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Published when the last token of a session is removed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDeleted {
    pub uuid: Uuid,
    pub user_uuid: Option<String>,
    pub tenant_uuid: Option<String>,
}

impl SessionDeleted {
    pub const NAME: &'static str = "auth_session_deleted";
}

/// Published when a session holds a token that will expire within the
/// next sweeper cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionExpireSoon {
    pub uuid: Uuid,
    pub user_uuid: Option<String>,
    pub tenant_uuid: Option<String>,
}

impl SessionExpireSoon {
    pub const NAME: &'static str = "auth_session_expire_soon";
}
