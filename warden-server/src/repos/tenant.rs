use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{Error, ErrorType};

use super::search::{ListPage, Pagination, Paginator, SearchFilter, StrictFilter};
use super::user::parse_uuid;

const SEARCH_FILTER: SearchFilter = SearchFilter::new(&["T.name"]);
const PAGINATOR: Paginator = Paginator::new(&[("name", "T.name"), ("uuid", "T.uuid")]);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Tenant {
    pub uuid: Uuid,
    pub name: Option<String>,
}

#[derive(Debug, Default, Clone)]
pub struct TenantListParams {
    pub search: Option<String>,
    pub uuid: Option<Uuid>,
    pub name: Option<String>,
    pub user_uuid: Option<Uuid>,
    pub pagination: Pagination,
}

#[derive(Clone)]
pub struct TenantRepo {
    pool: SqlitePool,
}

impl TenantRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self))]
    pub async fn create(&self, name: Option<&str>) -> Result<Uuid, Error> {
        let tenant_uuid = Uuid::new_v4();
        sqlx::query("INSERT INTO auth_tenant (uuid, name) VALUES (?, ?)")
            .bind(tenant_uuid.to_string())
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(tenant_uuid)
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, tenant_uuid: Uuid) -> Result<(), Error> {
        let res = sqlx::query("DELETE FROM auth_tenant WHERE uuid = ?")
            .bind(tenant_uuid.to_string())
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(ErrorType::UnknownTenant(tenant_uuid).into());
        }
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    pub async fn list(&self, params: &TenantListParams) -> Result<Vec<Tenant>, Error> {
        let (filter_sql, filter_binds) = Self::filter(params);
        let page_sql = PAGINATOR.to_sql(&params.pagination)?;

        let sql = format!(
            "SELECT DISTINCT T.uuid, T.name {FROM_TENANTS} WHERE {filter_sql}{page_sql}"
        );
        let mut query = sqlx::query_as::<_, (String, Option<String>)>(&sql);
        for bind in filter_binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(&self.pool).await?;

        rows.into_iter()
            .map(|(uuid, name)| {
                Ok(Tenant {
                    uuid: parse_uuid(&uuid)?,
                    name,
                })
            })
            .collect()
    }

    #[tracing::instrument(skip_all)]
    pub async fn count(&self, params: &TenantListParams, filtered: bool) -> Result<i64, Error> {
        let (filter_sql, filter_binds) = if filtered {
            Self::filter(params)
        } else {
            ("true".to_string(), Vec::new())
        };

        let sql = format!("SELECT COUNT(DISTINCT T.uuid) {FROM_TENANTS} WHERE {filter_sql}");
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for bind in filter_binds {
            query = query.bind(bind);
        }
        query.fetch_one(&self.pool).await.map_err(Into::into)
    }

    pub async fn list_page(&self, params: &TenantListParams) -> Result<ListPage<Tenant>, Error> {
        Ok(ListPage {
            total: self.count(params, false).await?,
            filtered: self.count(params, true).await?,
            items: self.list(params).await?,
        })
    }

    /// Add a user to the tenant. Re-adding an existing member succeeds
    /// without a second row.
    #[tracing::instrument(skip(self))]
    pub async fn add_user(&self, tenant_uuid: Uuid, user_uuid: Uuid) -> Result<(), Error> {
        let res = sqlx::query("INSERT INTO auth_tenant_user (tenant_uuid, user_uuid) VALUES (?, ?)")
            .bind(tenant_uuid.to_string())
            .bind(user_uuid.to_string())
            .execute(&self.pool)
            .await;

        match res.map_err(Error::from) {
            Ok(_) => Ok(()),
            Err(err) if err.unique_constraint_message().is_some() => Ok(()),
            Err(err) if err.is_foreign_key_violation() => {
                if self.exists(tenant_uuid).await? {
                    Err(ErrorType::UnknownUser(user_uuid).into())
                } else {
                    Err(ErrorType::UnknownTenant(tenant_uuid).into())
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Remove a user from the tenant. Removing a membership that does not
    /// exist succeeds as long as both endpoints do.
    #[tracing::instrument(skip(self))]
    pub async fn remove_user(&self, tenant_uuid: Uuid, user_uuid: Uuid) -> Result<(), Error> {
        let res =
            sqlx::query("DELETE FROM auth_tenant_user WHERE tenant_uuid = ? AND user_uuid = ?")
                .bind(tenant_uuid.to_string())
                .bind(user_uuid.to_string())
                .execute(&self.pool)
                .await?;
        if res.rows_affected() == 0 {
            if !self.exists(tenant_uuid).await? {
                return Err(ErrorType::UnknownTenant(tenant_uuid).into());
            }
            let users: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM auth_user WHERE uuid = ?")
                .bind(user_uuid.to_string())
                .fetch_one(&self.pool)
                .await?;
            if users == 0 {
                return Err(ErrorType::UnknownUser(user_uuid).into());
            }
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn tenants_of_user(&self, user_uuid: Uuid) -> Result<Vec<Tenant>, Error> {
        let rows: Vec<(String, Option<String>)> = sqlx::query_as(
            "SELECT T.uuid, T.name
            FROM auth_tenant T
            JOIN auth_tenant_user TU ON TU.tenant_uuid = T.uuid
            WHERE TU.user_uuid = ?
            ORDER BY T.name ASC",
        )
        .bind(user_uuid.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(uuid, name)| {
                Ok(Tenant {
                    uuid: parse_uuid(&uuid)?,
                    name,
                })
            })
            .collect()
    }

    pub async fn exists(&self, tenant_uuid: Uuid) -> Result<bool, Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM auth_tenant WHERE uuid = ?")
            .bind(tenant_uuid.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    fn filter(params: &TenantListParams) -> (String, Vec<String>) {
        let uuid = params.uuid.map(|uuid| uuid.to_string());
        let user_uuid = params.user_uuid.map(|uuid| uuid.to_string());

        let (strict_sql, strict_binds) = StrictFilter::new()
            .equals("T.uuid", uuid.as_deref())
            .equals("T.name", params.name.as_deref())
            .equals("TU.user_uuid", user_uuid.as_deref())
            .to_sql();
        let (search_sql, search_binds) = SEARCH_FILTER.to_sql(params.search.as_deref());

        let mut binds = strict_binds;
        binds.extend(search_binds);
        (format!("{strict_sql} AND {search_sql}"), binds)
    }
}

const FROM_TENANTS: &str = "FROM auth_tenant T
    LEFT JOIN auth_tenant_user TU ON TU.tenant_uuid = T.uuid";

#[cfg(test)]
mod tests {
    use crate::repos::tests::pool;
    use crate::repos::{NewUser, UserRepo};

    use super::*;

    #[tokio::test]
    async fn crud_and_membership() {
        let pool = pool().await;
        let store = TenantRepo::new(pool.clone());
        let users = UserRepo::new(pool);

        let tenant = store.create(Some("acme")).await.unwrap();
        let user = users
            .create(&NewUser {
                username: "foo".to_string(),
                email_address: "foo@example.com".to_string(),
                password_hash: None,
                password_salt: None,
                uuid: None,
                email_confirmed: false,
            })
            .await
            .unwrap();

        store.add_user(tenant, user.uuid).await.unwrap();
        store.add_user(tenant, user.uuid).await.unwrap();

        assert_eq!(
            store.tenants_of_user(user.uuid).await.unwrap(),
            vec![Tenant {
                uuid: tenant,
                name: Some("acme".to_string())
            }]
        );

        assert!(matches!(
            store.add_user(tenant, Uuid::new_v4()).await.unwrap_err().variant,
            ErrorType::UnknownUser(_)
        ));
        assert!(matches!(
            store.add_user(Uuid::new_v4(), user.uuid).await.unwrap_err().variant,
            ErrorType::UnknownTenant(_)
        ));

        store.remove_user(tenant, user.uuid).await.unwrap();
        store.remove_user(tenant, user.uuid).await.unwrap();
        assert!(matches!(
            store
                .remove_user(Uuid::new_v4(), user.uuid)
                .await
                .unwrap_err()
                .variant,
            ErrorType::UnknownTenant(_)
        ));
        assert!(store.tenants_of_user(user.uuid).await.unwrap().is_empty());

        let page = store.list_page(&TenantListParams::default()).await.unwrap();
        assert_eq!(page.total, 1);

        store.delete(tenant).await.unwrap();
        assert!(matches!(
            store.delete(tenant).await.unwrap_err().variant,
            ErrorType::UnknownTenant(_)
        ));
    }
}
