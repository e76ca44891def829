use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{Error, ErrorType};

use super::search::{ListPage, Pagination, Paginator, SearchFilter, StrictFilter};
use super::user::parse_uuid;

const SEARCH_FILTER: SearchFilter = SearchFilter::new(&["G.name"]);
const PAGINATOR: Paginator = Paginator::new(&[("name", "G.name"), ("uuid", "G.uuid")]);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Group {
    pub uuid: Uuid,
    pub name: String,
}

/// A user seen through its group membership.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GroupMember {
    pub uuid: Uuid,
    pub username: String,
}

#[derive(Debug, Default, Clone)]
pub struct GroupListParams {
    pub search: Option<String>,
    pub uuid: Option<Uuid>,
    pub name: Option<String>,
    pub user_uuid: Option<Uuid>,
    pub pagination: Pagination,
}

#[derive(Clone)]
pub struct GroupRepo {
    pool: SqlitePool,
}

impl GroupRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self))]
    pub async fn create(&self, name: &str) -> Result<Uuid, Error> {
        let group_uuid = Uuid::new_v4();
        sqlx::query("INSERT INTO auth_group (uuid, name) VALUES (?, ?)")
            .bind(group_uuid.to_string())
            .bind(name)
            .execute(&self.pool)
            .await
            .map_err(|err| Self::translate_name_conflict(err.into(), name))?;
        Ok(group_uuid)
    }

    #[tracing::instrument(skip(self))]
    pub async fn update(&self, group_uuid: Uuid, name: &str) -> Result<Group, Error> {
        let res = sqlx::query("UPDATE auth_group SET name = ? WHERE uuid = ?")
            .bind(name)
            .bind(group_uuid.to_string())
            .execute(&self.pool)
            .await
            .map_err(|err| Self::translate_name_conflict(err.into(), name))?;
        if res.rows_affected() == 0 {
            return Err(ErrorType::UnknownGroup(group_uuid).into());
        }
        Ok(Group {
            uuid: group_uuid,
            name: name.to_string(),
        })
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, group_uuid: Uuid) -> Result<(), Error> {
        let res = sqlx::query("DELETE FROM auth_group WHERE uuid = ?")
            .bind(group_uuid.to_string())
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(ErrorType::UnknownGroup(group_uuid).into());
        }
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    pub async fn list(&self, params: &GroupListParams) -> Result<Vec<Group>, Error> {
        let (filter_sql, filter_binds) = Self::filter(params);
        let page_sql = PAGINATOR.to_sql(&params.pagination)?;

        let sql = format!(
            "SELECT DISTINCT G.uuid, G.name {FROM_GROUPS} WHERE {filter_sql}{page_sql}"
        );
        let mut query = sqlx::query_as::<_, (String, String)>(&sql);
        for bind in filter_binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(&self.pool).await?;

        rows.into_iter()
            .map(|(uuid, name)| {
                Ok(Group {
                    uuid: parse_uuid(&uuid)?,
                    name,
                })
            })
            .collect()
    }

    #[tracing::instrument(skip_all)]
    pub async fn count(&self, params: &GroupListParams, filtered: bool) -> Result<i64, Error> {
        let (filter_sql, filter_binds) = if filtered {
            Self::filter(params)
        } else {
            ("true".to_string(), Vec::new())
        };

        let sql = format!("SELECT COUNT(DISTINCT G.uuid) {FROM_GROUPS} WHERE {filter_sql}");
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for bind in filter_binds {
            query = query.bind(bind);
        }
        query.fetch_one(&self.pool).await.map_err(Into::into)
    }

    pub async fn list_page(&self, params: &GroupListParams) -> Result<ListPage<Group>, Error> {
        Ok(ListPage {
            total: self.count(params, false).await?,
            filtered: self.count(params, true).await?,
            items: self.list(params).await?,
        })
    }

    /// Add a user to the group. Re-adding an existing member succeeds
    /// without a second row.
    #[tracing::instrument(skip(self))]
    pub async fn add_user(&self, group_uuid: Uuid, user_uuid: Uuid) -> Result<(), Error> {
        let res = sqlx::query("INSERT INTO auth_user_group (user_uuid, group_uuid) VALUES (?, ?)")
            .bind(user_uuid.to_string())
            .bind(group_uuid.to_string())
            .execute(&self.pool)
            .await;

        match res.map_err(Error::from) {
            Ok(_) => Ok(()),
            Err(err) if err.unique_constraint_message().is_some() => Ok(()),
            Err(err) if err.is_foreign_key_violation() => {
                Err(self
                    .missing_group_or(group_uuid, ErrorType::UnknownUser(user_uuid))
                    .await)
            }
            Err(err) => Err(err),
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn remove_user(&self, group_uuid: Uuid, user_uuid: Uuid) -> Result<(), Error> {
        let res = sqlx::query("DELETE FROM auth_user_group WHERE user_uuid = ? AND group_uuid = ?")
            .bind(user_uuid.to_string())
            .bind(group_uuid.to_string())
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            self.check_group_and_user(group_uuid, user_uuid).await?;
        }
        Ok(())
    }

    /// Attach a policy to the group. Re-adding an existing association
    /// succeeds without a second row.
    #[tracing::instrument(skip(self))]
    pub async fn add_policy(&self, group_uuid: Uuid, policy_uuid: Uuid) -> Result<(), Error> {
        let res = sqlx::query("INSERT INTO auth_group_policy (group_uuid, policy_uuid) VALUES (?, ?)")
            .bind(group_uuid.to_string())
            .bind(policy_uuid.to_string())
            .execute(&self.pool)
            .await;

        match res.map_err(Error::from) {
            Ok(_) => Ok(()),
            Err(err) if err.unique_constraint_message().is_some() => Ok(()),
            Err(err) if err.is_foreign_key_violation() => Err(self
                .missing_group_or(group_uuid, ErrorType::UnknownPolicy(policy_uuid))
                .await),
            Err(err) => Err(err),
        }
    }

    /// Detach a policy from the group. Removing an association that does
    /// not exist succeeds as long as both endpoints do.
    #[tracing::instrument(skip(self))]
    pub async fn remove_policy(&self, group_uuid: Uuid, policy_uuid: Uuid) -> Result<(), Error> {
        let res =
            sqlx::query("DELETE FROM auth_group_policy WHERE group_uuid = ? AND policy_uuid = ?")
                .bind(group_uuid.to_string())
                .bind(policy_uuid.to_string())
                .execute(&self.pool)
                .await?;
        if res.rows_affected() == 0 {
            self.check_group_and_policy(group_uuid, policy_uuid).await?;
        }
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    pub async fn users_of_group(&self, group_uuid: Uuid) -> Result<Vec<GroupMember>, Error> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT U.uuid, U.username
            FROM auth_user U
            JOIN auth_user_group UG ON UG.user_uuid = U.uuid
            WHERE UG.group_uuid = ?
            ORDER BY U.username ASC",
        )
        .bind(group_uuid.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(uuid, username)| {
                Ok(GroupMember {
                    uuid: parse_uuid(&uuid)?,
                    username,
                })
            })
            .collect()
    }

    #[tracing::instrument(skip(self))]
    pub async fn groups_of_user(&self, user_uuid: Uuid) -> Result<Vec<Group>, Error> {
        let rows: Vec<(String, String)> = sqlx::query_as(
            "SELECT G.uuid, G.name
            FROM auth_group G
            JOIN auth_user_group UG ON UG.group_uuid = G.uuid
            WHERE UG.user_uuid = ?
            ORDER BY G.name ASC",
        )
        .bind(user_uuid.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(uuid, name)| {
                Ok(Group {
                    uuid: parse_uuid(&uuid)?,
                    name,
                })
            })
            .collect()
    }

    pub async fn exists(&self, group_uuid: Uuid) -> Result<bool, Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM auth_group WHERE uuid = ?")
            .bind(group_uuid.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    async fn missing_group_or(&self, group_uuid: Uuid, other_endpoint: ErrorType) -> Error {
        match self.exists(group_uuid).await {
            Ok(true) => other_endpoint.into(),
            Ok(false) => ErrorType::UnknownGroup(group_uuid).into(),
            Err(err) => err,
        }
    }

    async fn check_group_and_user(&self, group_uuid: Uuid, user_uuid: Uuid) -> Result<(), Error> {
        if !self.exists(group_uuid).await? {
            return Err(ErrorType::UnknownGroup(group_uuid).into());
        }
        let users: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM auth_user WHERE uuid = ?")
            .bind(user_uuid.to_string())
            .fetch_one(&self.pool)
            .await?;
        if users == 0 {
            return Err(ErrorType::UnknownUser(user_uuid).into());
        }
        Ok(())
    }

    async fn check_group_and_policy(
        &self,
        group_uuid: Uuid,
        policy_uuid: Uuid,
    ) -> Result<(), Error> {
        if !self.exists(group_uuid).await? {
            return Err(ErrorType::UnknownGroup(group_uuid).into());
        }
        let policies: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM auth_policy WHERE uuid = ?")
            .bind(policy_uuid.to_string())
            .fetch_one(&self.pool)
            .await?;
        if policies == 0 {
            return Err(ErrorType::UnknownPolicy(policy_uuid).into());
        }
        Ok(())
    }

    fn translate_name_conflict(err: Error, name: &str) -> Error {
        match err.unique_constraint_message() {
            Some(msg) if msg.contains("auth_group.name") => ErrorType::Conflict {
                resource: "groups",
                column: "name",
                value: name.to_string(),
            }
            .into(),
            _ => err,
        }
    }
}

const FROM_GROUPS: &str = "FROM auth_group G
    LEFT JOIN auth_user_group UG ON UG.group_uuid = G.uuid";

#[cfg(test)]
mod tests {
    use crate::repos::tests::pool;
    use crate::repos::{NewUser, PolicyRepo, UserRepo};

    use super::*;

    async fn user(users: &UserRepo, username: &str) -> Uuid {
        users
            .create(&NewUser {
                username: username.to_string(),
                email_address: format!("{username}@example.com"),
                password_hash: None,
                password_salt: None,
                uuid: None,
                email_confirmed: false,
            })
            .await
            .unwrap()
            .uuid
    }

    #[tokio::test]
    async fn crud() {
        let store = GroupRepo::new(pool().await);

        let uuid = store.create("one").await.unwrap();
        let err = store.create("one").await.unwrap_err();
        assert!(matches!(
            err.variant,
            ErrorType::Conflict { column: "name", .. }
        ));

        let updated = store.update(uuid, "renamed").await.unwrap();
        assert_eq!(updated.name, "renamed");
        assert!(matches!(
            store.update(Uuid::new_v4(), "nope").await.unwrap_err().variant,
            ErrorType::UnknownGroup(_)
        ));

        let page = store.list_page(&GroupListParams::default()).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items, vec![Group { uuid, name: "renamed".to_string() }]);

        store.delete(uuid).await.unwrap();
        assert!(matches!(
            store.delete(uuid).await.unwrap_err().variant,
            ErrorType::UnknownGroup(_)
        ));
    }

    #[tokio::test]
    async fn membership() {
        let pool = pool().await;
        let store = GroupRepo::new(pool.clone());
        let users = UserRepo::new(pool);

        let group = store.create("one").await.unwrap();
        let foo = user(&users, "foo").await;
        let bar = user(&users, "bar").await;

        store.add_user(group, foo).await.unwrap();
        store.add_user(group, foo).await.unwrap();
        store.add_user(group, bar).await.unwrap();

        let members = store.users_of_group(group).await.unwrap();
        assert_eq!(members.len(), 2);
        assert_eq!(members[0].username, "bar");

        assert_eq!(
            store.groups_of_user(foo).await.unwrap(),
            vec![Group { uuid: group, name: "one".to_string() }]
        );

        assert!(matches!(
            store.add_user(group, Uuid::new_v4()).await.unwrap_err().variant,
            ErrorType::UnknownUser(_)
        ));
        assert!(matches!(
            store.add_user(Uuid::new_v4(), foo).await.unwrap_err().variant,
            ErrorType::UnknownGroup(_)
        ));

        store.remove_user(group, foo).await.unwrap();
        // Removing again still succeeds since both endpoints exist
        store.remove_user(group, foo).await.unwrap();
        assert!(matches!(
            store.remove_user(group, Uuid::new_v4()).await.unwrap_err().variant,
            ErrorType::UnknownUser(_)
        ));
        assert_eq!(store.users_of_group(group).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn policy_association_is_idempotent() {
        let pool = pool().await;
        let store = GroupRepo::new(pool.clone());
        let policies = PolicyRepo::new(pool);

        let group = store.create("one").await.unwrap();
        let policy = policies.create("main", None, &[]).await.unwrap();

        assert!(matches!(
            store.add_policy(Uuid::new_v4(), policy).await.unwrap_err().variant,
            ErrorType::UnknownGroup(_)
        ));
        assert!(matches!(
            store.add_policy(group, Uuid::new_v4()).await.unwrap_err().variant,
            ErrorType::UnknownPolicy(_)
        ));

        store.add_policy(group, policy).await.unwrap();
        store.add_policy(group, policy).await.unwrap();

        let params = crate::repos::PolicyListParams {
            group_uuid: Some(group),
            ..Default::default()
        };
        assert_eq!(policies.list(&params).await.unwrap().len(), 1);

        store.remove_policy(group, policy).await.unwrap();
        store.remove_policy(group, policy).await.unwrap();
        assert!(matches!(
            store.remove_policy(Uuid::new_v4(), policy).await.unwrap_err().variant,
            ErrorType::UnknownGroup(_)
        ));
        assert!(matches!(
            store.remove_policy(group, Uuid::new_v4()).await.unwrap_err().variant,
            ErrorType::UnknownPolicy(_)
        ));

        assert!(policies.list(&params).await.unwrap().is_empty());
    }
}
