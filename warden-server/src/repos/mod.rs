mod group;
mod policy;
pub mod search;
mod tenant;
mod token;
mod user;

pub use group::{Group, GroupListParams, GroupMember, GroupRepo};
pub use policy::{Policy, PolicyListParams, PolicyRepo};
pub use tenant::{Tenant, TenantListParams, TenantRepo};
pub use token::{SessionSummary, TokenRepo, TokenSummary};
pub use user::{Credentials, Email, EmailUpdate, NewUser, User, UserListParams, UserRepo};

use sqlx::SqlitePool;

/// The repositories sharing the process-wide connection pool. Every
/// operation acquires its own connection or transaction from the pool.
#[derive(Clone)]
pub struct Repos {
    pub user: UserRepo,
    pub policy: PolicyRepo,
    pub group: GroupRepo,
    pub tenant: TenantRepo,
    pub token: TokenRepo,
}

impl Repos {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            user: UserRepo::new(pool.clone()),
            policy: PolicyRepo::new(pool.clone()),
            group: GroupRepo::new(pool.clone()),
            tenant: TenantRepo::new(pool.clone()),
            token: TokenRepo::new(pool),
        }
    }
}
