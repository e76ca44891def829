use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use sqlx::{Sqlite, SqlitePool, Transaction};
use uuid::Uuid;

use crate::error::{Error, ErrorType};

use super::search::{ListPage, Pagination, Paginator, SearchFilter, StrictFilter};
use super::user::parse_uuid;

const SEARCH_FILTER: SearchFilter = SearchFilter::new(&["P.name", "P.description"]);
const PAGINATOR: Paginator = Paginator::new(&[
    ("name", "P.name"),
    ("description", "P.description"),
    ("uuid", "P.uuid"),
]);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Policy {
    pub uuid: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub acl_templates: Vec<String>,
}

#[derive(Debug, Default, Clone)]
pub struct PolicyListParams {
    pub search: Option<String>,
    pub uuid: Option<Uuid>,
    pub name: Option<String>,
    pub user_uuid: Option<Uuid>,
    pub group_uuid: Option<Uuid>,
    pub pagination: Pagination,
}

#[derive(Clone)]
pub struct PolicyRepo {
    pool: SqlitePool,
}

impl PolicyRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip(self, acl_templates))]
    pub async fn create(
        &self,
        name: &str,
        description: Option<&str>,
        acl_templates: &[String],
    ) -> Result<Uuid, Error> {
        let policy_uuid = Uuid::new_v4();

        let mut tx = self.pool.begin().await?;
        sqlx::query("INSERT INTO auth_policy (uuid, name, description) VALUES (?, ?, ?)")
            .bind(policy_uuid.to_string())
            .bind(name)
            .bind(description)
            .execute(&mut tx)
            .await
            .map_err(|err| Self::translate_name_conflict(err.into(), name))?;

        Self::associate_all(&mut tx, policy_uuid, acl_templates).await?;
        tx.commit().await?;

        Ok(policy_uuid)
    }

    #[tracing::instrument(skip(self, acl_templates))]
    pub async fn update(
        &self,
        policy_uuid: Uuid,
        name: &str,
        description: Option<&str>,
        acl_templates: &[String],
    ) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;

        let res = sqlx::query("UPDATE auth_policy SET name = ?, description = ? WHERE uuid = ?")
            .bind(name)
            .bind(description)
            .bind(policy_uuid.to_string())
            .execute(&mut tx)
            .await
            .map_err(|err| Self::translate_name_conflict(err.into(), name))?;
        if res.rows_affected() == 0 {
            return Err(ErrorType::UnknownPolicy(policy_uuid).into());
        }

        sqlx::query("DELETE FROM auth_policy_template WHERE policy_uuid = ?")
            .bind(policy_uuid.to_string())
            .execute(&mut tx)
            .await?;
        Self::associate_all(&mut tx, policy_uuid, acl_templates).await?;

        tx.commit().await.map_err(Into::into)
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, policy_uuid: Uuid) -> Result<(), Error> {
        let res = sqlx::query("DELETE FROM auth_policy WHERE uuid = ?")
            .bind(policy_uuid.to_string())
            .execute(&self.pool)
            .await?;
        if res.rows_affected() == 0 {
            return Err(ErrorType::UnknownPolicy(policy_uuid).into());
        }
        Ok(())
    }

    #[tracing::instrument(skip_all)]
    pub async fn list(&self, params: &PolicyListParams) -> Result<Vec<Policy>, Error> {
        let (filter_sql, filter_binds) = Self::filter(params);
        let page_sql = PAGINATOR.to_sql(&params.pagination)?;

        let sql = format!(
            "SELECT DISTINCT P.uuid, P.name, P.description
            {FROM_POLICIES}
            WHERE {filter_sql}{page_sql}",
        );
        let mut query = sqlx::query_as::<_, (String, String, Option<String>)>(&sql);
        for bind in filter_binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let uuids = rows.iter().map(|(uuid, _, _)| uuid.clone()).collect::<Vec<_>>();
        let mut templates = self.templates_for(&uuids).await?;

        rows.into_iter()
            .map(|(uuid, name, description)| {
                Ok(Policy {
                    uuid: parse_uuid(&uuid)?,
                    name,
                    description,
                    acl_templates: templates.remove(&uuid).unwrap_or_default(),
                })
            })
            .collect()
    }

    #[tracing::instrument(skip_all)]
    pub async fn count(&self, params: &PolicyListParams, filtered: bool) -> Result<i64, Error> {
        let (filter_sql, filter_binds) = if filtered {
            Self::filter(params)
        } else {
            ("true".to_string(), Vec::new())
        };

        let sql = format!("SELECT COUNT(DISTINCT P.uuid) {FROM_POLICIES} WHERE {filter_sql}");
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for bind in filter_binds {
            query = query.bind(bind);
        }
        query.fetch_one(&self.pool).await.map_err(Into::into)
    }

    pub async fn list_page(&self, params: &PolicyListParams) -> Result<ListPage<Policy>, Error> {
        Ok(ListPage {
            total: self.count(params, false).await?,
            filtered: self.count(params, true).await?,
            items: self.list(params).await?,
        })
    }

    /// Every policy effective for the user: the ones attached directly and
    /// the ones attached to any group the user belongs to, deduplicated,
    /// in policy name order.
    #[tracing::instrument(skip(self))]
    pub async fn list_effective_for_user(&self, user_uuid: Uuid) -> Result<Vec<Policy>, Error> {
        let rows: Vec<(String, String, Option<String>)> = sqlx::query_as(
            "SELECT DISTINCT P.uuid, P.name, P.description
            FROM auth_policy P
            LEFT JOIN auth_user_policy UP ON UP.policy_uuid = P.uuid
            LEFT JOIN auth_group_policy GP ON GP.policy_uuid = P.uuid
            LEFT JOIN auth_user_group UG ON UG.group_uuid = GP.group_uuid
            WHERE UP.user_uuid = ? OR UG.user_uuid = ?
            ORDER BY P.name ASC",
        )
        .bind(user_uuid.to_string())
        .bind(user_uuid.to_string())
        .fetch_all(&self.pool)
        .await?;

        let uuids = rows.iter().map(|(uuid, _, _)| uuid.clone()).collect::<Vec<_>>();
        let mut templates = self.templates_for(&uuids).await?;

        rows.into_iter()
            .map(|(uuid, name, description)| {
                Ok(Policy {
                    uuid: parse_uuid(&uuid)?,
                    name,
                    description,
                    acl_templates: templates.remove(&uuid).unwrap_or_default(),
                })
            })
            .collect()
    }

    /// Associate one template to the policy, reusing the globally unique
    /// template row when the same text is already known.
    #[tracing::instrument(skip(self))]
    pub async fn associate_template(&self, policy_uuid: Uuid, template: &str) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;

        let template_id = Self::find_or_create_template(&mut tx, template).await?;
        sqlx::query("INSERT INTO auth_policy_template (policy_uuid, template_id) VALUES (?, ?)")
            .bind(policy_uuid.to_string())
            .bind(template_id)
            .execute(&mut tx)
            .await
            .map_err(|err| {
                let err = Error::from(err);
                if err.unique_constraint_message().is_some() {
                    ErrorType::DuplicateTemplate(template.to_string()).into()
                } else if err.is_foreign_key_violation() {
                    ErrorType::UnknownPolicy(policy_uuid).into()
                } else {
                    err
                }
            })?;

        tx.commit().await.map_err(Into::into)
    }

    /// Remove one template from the policy. Removing a template that is not
    /// associated succeeds as long as the policy exists.
    #[tracing::instrument(skip(self))]
    pub async fn dissociate_template(
        &self,
        policy_uuid: Uuid,
        template: &str,
    ) -> Result<(), Error> {
        if !self.exists(policy_uuid).await? {
            return Err(ErrorType::UnknownPolicy(policy_uuid).into());
        }

        sqlx::query(
            "DELETE FROM auth_policy_template WHERE policy_uuid = ? AND template_id IN
                (SELECT id FROM auth_acl_template WHERE template = ?)",
        )
        .bind(policy_uuid.to_string())
        .bind(template)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn exists(&self, policy_uuid: Uuid) -> Result<bool, Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM auth_policy WHERE uuid = ?")
            .bind(policy_uuid.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }

    fn filter(params: &PolicyListParams) -> (String, Vec<String>) {
        let uuid = params.uuid.map(|uuid| uuid.to_string());
        let user_uuid = params.user_uuid.map(|uuid| uuid.to_string());
        let group_uuid = params.group_uuid.map(|uuid| uuid.to_string());

        let (strict_sql, strict_binds) = StrictFilter::new()
            .equals("P.uuid", uuid.as_deref())
            .equals("P.name", params.name.as_deref())
            .equals("UP.user_uuid", user_uuid.as_deref())
            .equals("GP.group_uuid", group_uuid.as_deref())
            .to_sql();
        let (search_sql, search_binds) = SEARCH_FILTER.to_sql(params.search.as_deref());

        let mut binds = strict_binds;
        binds.extend(search_binds);
        (format!("{strict_sql} AND {search_sql}"), binds)
    }

    async fn templates_for(
        &self,
        policy_uuids: &[String],
    ) -> Result<HashMap<String, Vec<String>>, Error> {
        if policy_uuids.is_empty() {
            return Ok(HashMap::new());
        }

        let placeholders = policy_uuids.iter().map(|_| "?").collect::<Vec<_>>().join(", ");
        let sql = format!(
            "SELECT PT.policy_uuid, T.template
            FROM auth_policy_template PT
            JOIN auth_acl_template T ON T.id = PT.template_id
            WHERE PT.policy_uuid IN ({placeholders})
            ORDER BY T.id ASC",
        );
        let mut query = sqlx::query_as::<_, (String, String)>(&sql);
        for uuid in policy_uuids {
            query = query.bind(uuid);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut templates: HashMap<String, Vec<String>> = HashMap::new();
        for (policy_uuid, template) in rows {
            templates.entry(policy_uuid).or_default().push(template);
        }
        Ok(templates)
    }

    async fn associate_all(
        tx: &mut Transaction<'_, Sqlite>,
        policy_uuid: Uuid,
        acl_templates: &[String],
    ) -> Result<(), Error> {
        let mut seen = Vec::with_capacity(acl_templates.len());
        for template in acl_templates {
            if seen.contains(&template) {
                continue;
            }
            seen.push(template);

            let template_id = Self::find_or_create_template(tx, template).await?;
            sqlx::query("INSERT INTO auth_policy_template (policy_uuid, template_id) VALUES (?, ?)")
                .bind(policy_uuid.to_string())
                .bind(template_id)
                .execute(&mut *tx)
                .await?;
        }
        Ok(())
    }

    async fn find_or_create_template(
        tx: &mut Transaction<'_, Sqlite>,
        template: &str,
    ) -> Result<i64, Error> {
        let existing: Option<(i64,)> =
            sqlx::query_as("SELECT id FROM auth_acl_template WHERE template = ?")
                .bind(template)
                .fetch_optional(&mut *tx)
                .await?;
        if let Some((id,)) = existing {
            return Ok(id);
        }

        let res = sqlx::query("INSERT INTO auth_acl_template (template) VALUES (?)")
            .bind(template)
            .execute(&mut *tx)
            .await?;
        Ok(res.last_insert_rowid())
    }

    fn translate_name_conflict(err: Error, name: &str) -> Error {
        if err.unique_constraint_message().is_some() {
            ErrorType::DuplicatePolicy(name.to_string()).into()
        } else {
            err
        }
    }
}

const FROM_POLICIES: &str = "FROM auth_policy P
    LEFT JOIN auth_user_policy UP ON UP.policy_uuid = P.uuid
    LEFT JOIN auth_group_policy GP ON GP.policy_uuid = P.uuid";

#[cfg(test)]
mod tests {
    use crate::repos::tests::pool;
    use crate::repos::{GroupRepo, NewUser, UserRepo};

    use super::*;

    fn templates(values: &[&str]) -> Vec<String> {
        values.iter().map(ToString::to_string).collect()
    }

    #[tokio::test]
    async fn crud() {
        let store = PolicyRepo::new(pool().await);

        let uuid = store
            .create("main", Some("the main policy"), &templates(&["acl.one", "acl.two"]))
            .await
            .unwrap();

        let policies = store.list(&PolicyListParams::default()).await.unwrap();
        assert_eq!(policies.len(), 1);
        assert_eq!(policies[0].uuid, uuid);
        assert_eq!(policies[0].acl_templates, templates(&["acl.one", "acl.two"]));

        // Policy names are unique
        let err = store.create("main", None, &[]).await.unwrap_err();
        assert!(matches!(err.variant, ErrorType::DuplicatePolicy(_)));

        store
            .update(uuid, "renamed", None, &templates(&["acl.three"]))
            .await
            .unwrap();
        let policies = store.list(&PolicyListParams::default()).await.unwrap();
        assert_eq!(policies[0].name, "renamed");
        assert_eq!(policies[0].description, None);
        assert_eq!(policies[0].acl_templates, templates(&["acl.three"]));

        assert!(matches!(
            store
                .update(Uuid::new_v4(), "nope", None, &[])
                .await
                .unwrap_err()
                .variant,
            ErrorType::UnknownPolicy(_)
        ));

        store.delete(uuid).await.unwrap();
        assert!(matches!(
            store.delete(uuid).await.unwrap_err().variant,
            ErrorType::UnknownPolicy(_)
        ));
    }

    #[tokio::test]
    async fn a_policy_without_templates_lists_an_empty_set() {
        let store = PolicyRepo::new(pool().await);
        store.create("empty", None, &[]).await.unwrap();

        let policies = store.list(&PolicyListParams::default()).await.unwrap();
        assert_eq!(policies[0].acl_templates, Vec::<String>::new());
    }

    #[tokio::test]
    async fn template_association() {
        let store = PolicyRepo::new(pool().await);
        let one = store.create("one", None, &templates(&["shared.acl"])).await.unwrap();
        let two = store.create("two", None, &[]).await.unwrap();

        // The template text is shared globally by exact content
        store.associate_template(two, "shared.acl").await.unwrap();
        let err = store.associate_template(two, "shared.acl").await.unwrap_err();
        assert!(matches!(err.variant, ErrorType::DuplicateTemplate(_)));

        assert!(matches!(
            store
                .associate_template(Uuid::new_v4(), "other.acl")
                .await
                .unwrap_err()
                .variant,
            ErrorType::UnknownPolicy(_)
        ));

        // Dissociating from one policy does not affect the other
        store.dissociate_template(one, "shared.acl").await.unwrap();
        // A second dissociation is not an error
        store.dissociate_template(one, "shared.acl").await.unwrap();
        assert!(matches!(
            store
                .dissociate_template(Uuid::new_v4(), "shared.acl")
                .await
                .unwrap_err()
                .variant,
            ErrorType::UnknownPolicy(_)
        ));

        let params = PolicyListParams {
            uuid: Some(two),
            ..PolicyListParams::default()
        };
        assert_eq!(
            store.list(&params).await.unwrap()[0].acl_templates,
            templates(&["shared.acl"])
        );
    }

    #[tokio::test]
    async fn list_with_filters_and_pagination() {
        let store = PolicyRepo::new(pool().await);
        for name in ["foo", "bar", "baz"] {
            store.create(name, None, &[]).await.unwrap();
        }

        let params = PolicyListParams {
            search: Some("ba".to_string()),
            ..PolicyListParams::default()
        };
        let page = store.list_page(&params).await.unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.filtered, 2);

        let params = PolicyListParams {
            name: Some("foo".to_string()),
            ..PolicyListParams::default()
        };
        assert_eq!(store.list(&params).await.unwrap().len(), 1);

        let params = PolicyListParams {
            pagination: Pagination {
                order: Some("name".to_string()),
                direction: Some("desc".to_string()),
                limit: Some("2".to_string()),
                offset: None,
            },
            ..PolicyListParams::default()
        };
        let names = store
            .list(&params)
            .await
            .unwrap()
            .into_iter()
            .map(|policy| policy.name)
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["foo".to_string(), "baz".to_string()]);
    }

    #[tokio::test]
    async fn effective_policies_for_a_user() {
        let pool = pool().await;
        let store = PolicyRepo::new(pool.clone());
        let users = UserRepo::new(pool.clone());
        let groups = GroupRepo::new(pool);

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

        let direct = store.create("direct", None, &templates(&["a.b"])).await.unwrap();
        let via_group = store.create("via-group", None, &templates(&["c.d"])).await.unwrap();
        let both = store.create("both", None, &[]).await.unwrap();

        users.add_policy(user.uuid, direct).await.unwrap();
        users.add_policy(user.uuid, both).await.unwrap();

        let group = groups.create("one").await.unwrap();
        groups.add_user(group, user.uuid).await.unwrap();
        groups.add_policy(group, via_group).await.unwrap();
        groups.add_policy(group, both).await.unwrap();

        let effective = store.list_effective_for_user(user.uuid).await.unwrap();
        let names = effective.iter().map(|policy| policy.name.as_str()).collect::<Vec<_>>();
        // Deduplicated, in name order
        assert_eq!(names, vec!["both", "direct", "via-group"]);
        assert_eq!(effective[1].acl_templates, templates(&["a.b"]));
    }
}
