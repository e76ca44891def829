use std::collections::HashSet;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{Error, ErrorType};

use super::search::{ListPage, Pagination, Paginator, SearchFilter, StrictFilter};

const SEARCH_FILTER: SearchFilter = SearchFilter::new(&["U.username", "E.address"]);
const PAGINATOR: Paginator = Paginator::new(&[("username", "U.username")]);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub uuid: Uuid,
    pub username: String,
    pub emails: Vec<Email>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Email {
    pub uuid: Uuid,
    pub address: String,
    pub main: bool,
    pub confirmed: bool,
}

/// One entry of the desired state handed to `update_emails`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailUpdate {
    pub address: String,
    pub main: bool,
    pub confirmed: bool,
}

#[derive(Debug, Clone)]
pub struct NewUser {
    pub username: String,
    pub email_address: String,
    pub password_hash: Option<String>,
    pub password_salt: Option<Vec<u8>>,
    pub uuid: Option<Uuid>,
    pub email_confirmed: bool,
}

#[derive(Debug, Clone, sqlx::FromRow, PartialEq, Eq)]
pub struct Credentials {
    pub password_hash: Option<String>,
    pub password_salt: Option<Vec<u8>>,
}

#[derive(Debug, Default, Clone)]
pub struct UserListParams {
    pub search: Option<String>,
    pub uuid: Option<Uuid>,
    pub username: Option<String>,
    pub email_address: Option<String>,
    pub tenant_uuid: Option<Uuid>,
    pub group_uuid: Option<Uuid>,
    pub pagination: Pagination,
}

#[derive(Debug, sqlx::FromRow)]
struct UserEmailRow {
    uuid: String,
    username: String,
    main: bool,
    email_uuid: String,
    address: String,
    confirmed: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct EmailRow {
    uuid: String,
    address: String,
    confirmed: bool,
}

#[derive(Clone)]
pub struct UserRepo {
    pool: SqlitePool,
}

impl UserRepo {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    #[tracing::instrument(skip_all, fields(username = new.username))]
    pub async fn create(&self, new: &NewUser) -> Result<User, Error> {
        let user_uuid = new.uuid.unwrap_or_else(Uuid::new_v4);
        let email_uuid = Uuid::new_v4();

        let mut tx = self.pool.begin().await?;

        sqlx::query("INSERT INTO auth_email (uuid, address, confirmed) VALUES (?, ?, ?)")
            .bind(email_uuid.to_string())
            .bind(&new.email_address)
            .bind(new.email_confirmed)
            .execute(&mut tx)
            .await
            .map_err(|err| Self::translate_create_conflict(err.into(), new))?;

        sqlx::query(
            "INSERT INTO auth_user (uuid, username, password_hash, password_salt)
            VALUES (?, ?, ?, ?)",
        )
        .bind(user_uuid.to_string())
        .bind(&new.username)
        .bind(&new.password_hash)
        .bind(&new.password_salt)
        .execute(&mut tx)
        .await
        .map_err(|err| Self::translate_create_conflict(err.into(), new))?;

        sqlx::query("INSERT INTO auth_user_email (user_uuid, email_uuid, main) VALUES (?, ?, TRUE)")
            .bind(user_uuid.to_string())
            .bind(email_uuid.to_string())
            .execute(&mut tx)
            .await?;

        tx.commit().await?;

        Ok(User {
            uuid: user_uuid,
            username: new.username.clone(),
            emails: vec![Email {
                uuid: email_uuid,
                address: new.email_address.clone(),
                main: true,
                confirmed: new.email_confirmed,
            }],
        })
    }

    fn translate_create_conflict(err: Error, new: &NewUser) -> Error {
        match err.unique_constraint_message() {
            Some(msg) if msg.contains("auth_user.username") => ErrorType::Conflict {
                resource: "users",
                column: "username",
                value: new.username.clone(),
            }
            .into(),
            Some(msg) if msg.contains("auth_email.address") => ErrorType::Conflict {
                resource: "users",
                column: "email_address",
                value: new.email_address.clone(),
            }
            .into(),
            Some(msg) if msg.contains("auth_user.uuid") => ErrorType::Conflict {
                resource: "users",
                column: "uuid",
                value: new.uuid.map(|uuid| uuid.to_string()).unwrap_or_default(),
            }
            .into(),
            _ => err,
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn get(&self, user_uuid: Uuid) -> Result<User, Error> {
        let row: Option<(String,)> = sqlx::query_as("SELECT username FROM auth_user WHERE uuid = ?")
            .bind(user_uuid.to_string())
            .fetch_optional(&self.pool)
            .await?;
        let username = row
            .map(|(username,)| username)
            .ok_or(ErrorType::UnknownUser(user_uuid))?;

        let emails: Vec<(String, String, bool, bool)> = sqlx::query_as(
            "SELECT E.uuid, E.address, UE.main, E.confirmed
            FROM auth_user_email UE
            JOIN auth_email E ON E.uuid = UE.email_uuid
            WHERE UE.user_uuid = ?
            ORDER BY UE.main DESC, E.address ASC",
        )
        .bind(user_uuid.to_string())
        .fetch_all(&self.pool)
        .await?;

        Ok(User {
            uuid: user_uuid,
            username,
            emails: emails
                .into_iter()
                .map(|(uuid, address, main, confirmed)| {
                    Ok(Email {
                        uuid: parse_uuid(&uuid)?,
                        address,
                        main,
                        confirmed,
                    })
                })
                .collect::<Result<_, Error>>()?,
        })
    }

    /// Delete a user, its owned emails and every membership in one unit of
    /// work.
    #[tracing::instrument(skip(self))]
    pub async fn delete(&self, user_uuid: Uuid) -> Result<(), Error> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "DELETE FROM auth_email WHERE uuid IN
                (SELECT email_uuid FROM auth_user_email WHERE user_uuid = ?)",
        )
        .bind(user_uuid.to_string())
        .execute(&mut tx)
        .await?;

        let res = sqlx::query("DELETE FROM auth_user WHERE uuid = ?")
            .bind(user_uuid.to_string())
            .execute(&mut tx)
            .await?;
        if res.rows_affected() == 0 {
            return Err(ErrorType::UnknownUser(user_uuid).into());
        }

        tx.commit().await.map_err(Into::into)
    }

    /// Reconcile the user's email addresses with the desired set, honouring
    /// the `confirmed` flags of the input.
    pub async fn update_emails_as_admin(
        &self,
        user_uuid: Uuid,
        desired: &[EmailUpdate],
    ) -> Result<Vec<Email>, Error> {
        self.reconcile_emails(user_uuid, desired, true).await
    }

    /// Same reconcile, on behalf of the owning user: the `confirmed` input
    /// is ignored. New addresses start unconfirmed and retained addresses
    /// keep their stored confirmation state.
    pub async fn update_emails_as_owner(
        &self,
        user_uuid: Uuid,
        desired: &[EmailUpdate],
    ) -> Result<Vec<Email>, Error> {
        self.reconcile_emails(user_uuid, desired, false).await
    }

    #[tracing::instrument(skip_all, fields(user_uuid = %user_uuid))]
    async fn reconcile_emails(
        &self,
        user_uuid: Uuid,
        desired: &[EmailUpdate],
        honor_confirmed: bool,
    ) -> Result<Vec<Email>, Error> {
        let mut addresses = HashSet::new();
        for email in desired {
            if !addresses.insert(email.address.as_str()) {
                return Err(
                    ErrorType::BadRequest(format!("Duplicate email address `{}`", email.address))
                        .into(),
                );
            }
        }
        if !desired.is_empty() && desired.iter().filter(|email| email.main).count() != 1 {
            return Err(
                ErrorType::BadRequest("Exactly one email address must be main".to_string()).into(),
            );
        }

        let mut tx = self.pool.begin().await?;

        let known: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM auth_user WHERE uuid = ?")
            .bind(user_uuid.to_string())
            .fetch_one(&mut tx)
            .await?;
        if known == 0 {
            return Err(ErrorType::UnknownUser(user_uuid).into());
        }

        let existing: Vec<EmailRow> = sqlx::query_as(
            "SELECT E.uuid, E.address, E.confirmed
            FROM auth_user_email UE
            JOIN auth_email E ON E.uuid = UE.email_uuid
            WHERE UE.user_uuid = ?",
        )
        .bind(user_uuid.to_string())
        .fetch_all(&mut tx)
        .await?;

        for row in &existing {
            if desired.iter().any(|email| email.address == row.address) {
                continue;
            }
            sqlx::query("DELETE FROM auth_email WHERE uuid = ?")
                .bind(&row.uuid)
                .execute(&mut tx)
                .await?;
        }

        // Drop every main flag before reassigning it so the reconcile never
        // trips the one-main-per-user index halfway through.
        sqlx::query("UPDATE auth_user_email SET main = FALSE WHERE user_uuid = ?")
            .bind(user_uuid.to_string())
            .execute(&mut tx)
            .await?;

        let mut result = Vec::with_capacity(desired.len());
        for email in desired {
            let row = existing.iter().find(|row| row.address == email.address);
            match row {
                Some(row) => {
                    let confirmed = if honor_confirmed {
                        email.confirmed
                    } else {
                        row.confirmed
                    };
                    sqlx::query("UPDATE auth_email SET confirmed = ? WHERE uuid = ?")
                        .bind(confirmed)
                        .bind(&row.uuid)
                        .execute(&mut tx)
                        .await?;
                    sqlx::query(
                        "UPDATE auth_user_email SET main = ? WHERE user_uuid = ? AND email_uuid = ?",
                    )
                    .bind(email.main)
                    .bind(user_uuid.to_string())
                    .bind(&row.uuid)
                    .execute(&mut tx)
                    .await?;

                    result.push(Email {
                        uuid: parse_uuid(&row.uuid)?,
                        address: email.address.clone(),
                        main: email.main,
                        confirmed,
                    });
                }
                None => {
                    let confirmed = honor_confirmed && email.confirmed;
                    let email_uuid = Uuid::new_v4();
                    sqlx::query("INSERT INTO auth_email (uuid, address, confirmed) VALUES (?, ?, ?)")
                        .bind(email_uuid.to_string())
                        .bind(&email.address)
                        .bind(confirmed)
                        .execute(&mut tx)
                        .await
                        .map_err(|err| Self::translate_email_conflict(err.into(), &email.address))?;
                    sqlx::query(
                        "INSERT INTO auth_user_email (user_uuid, email_uuid, main) VALUES (?, ?, ?)",
                    )
                    .bind(user_uuid.to_string())
                    .bind(email_uuid.to_string())
                    .bind(email.main)
                    .execute(&mut tx)
                    .await?;

                    result.push(Email {
                        uuid: email_uuid,
                        address: email.address.clone(),
                        main: email.main,
                        confirmed,
                    });
                }
            }
        }

        tx.commit().await?;

        Ok(result)
    }

    fn translate_email_conflict(err: Error, address: &str) -> Error {
        match err.unique_constraint_message() {
            Some(msg) if msg.contains("auth_email.address") => ErrorType::Conflict {
                resource: "users",
                column: "email_address",
                value: address.to_string(),
            }
            .into(),
            _ => err,
        }
    }

    #[tracing::instrument(skip_all)]
    pub async fn list(&self, params: &UserListParams) -> Result<Vec<User>, Error> {
        let (filter_sql, filter_binds) = Self::filter(params);
        let page_sql = PAGINATOR.to_sql(&params.pagination)?;

        let sql = format!(
            "SELECT DISTINCT U.uuid, U.username, UE.main, E.uuid AS email_uuid, E.address, E.confirmed
            {FROM_USERS}
            WHERE {filter_sql}{page_sql}",
        );
        let mut query = sqlx::query_as::<_, UserEmailRow>(&sql);
        for bind in filter_binds {
            query = query.bind(bind);
        }
        let rows = query.fetch_all(&self.pool).await?;

        let mut users: Vec<User> = Vec::new();
        for row in rows {
            let uuid = parse_uuid(&row.uuid)?;
            let email = Email {
                uuid: parse_uuid(&row.email_uuid)?,
                address: row.address,
                main: row.main,
                confirmed: row.confirmed,
            };
            match users.iter_mut().find(|user| user.uuid == uuid) {
                Some(user) => {
                    if !user.emails.iter().any(|known| known.uuid == email.uuid) {
                        user.emails.push(email);
                    }
                }
                None => users.push(User {
                    uuid,
                    username: row.username,
                    emails: vec![email],
                }),
            }
        }

        Ok(users)
    }

    #[tracing::instrument(skip_all)]
    pub async fn count(&self, params: &UserListParams, filtered: bool) -> Result<i64, Error> {
        let (filter_sql, filter_binds) = if filtered {
            Self::filter(params)
        } else {
            ("true".to_string(), Vec::new())
        };

        let sql = format!("SELECT COUNT(DISTINCT U.uuid) {FROM_USERS} WHERE {filter_sql}");
        let mut query = sqlx::query_scalar::<_, i64>(&sql);
        for bind in filter_binds {
            query = query.bind(bind);
        }
        query.fetch_one(&self.pool).await.map_err(Into::into)
    }

    pub async fn list_page(&self, params: &UserListParams) -> Result<ListPage<User>, Error> {
        Ok(ListPage {
            total: self.count(params, false).await?,
            filtered: self.count(params, true).await?,
            items: self.list(params).await?,
        })
    }

    fn filter(params: &UserListParams) -> (String, Vec<String>) {
        let uuid = params.uuid.map(|uuid| uuid.to_string());
        let tenant_uuid = params.tenant_uuid.map(|uuid| uuid.to_string());
        let group_uuid = params.group_uuid.map(|uuid| uuid.to_string());

        let (strict_sql, strict_binds) = StrictFilter::new()
            .equals("U.uuid", uuid.as_deref())
            .equals("U.username", params.username.as_deref())
            .equals("E.address", params.email_address.as_deref())
            .equals("TU.tenant_uuid", tenant_uuid.as_deref())
            .equals("UG.group_uuid", group_uuid.as_deref())
            .to_sql();
        let (search_sql, search_binds) = SEARCH_FILTER.to_sql(params.search.as_deref());

        let mut binds = strict_binds;
        binds.extend(search_binds);
        (format!("{strict_sql} AND {search_sql}"), binds)
    }

    #[tracing::instrument(skip(self))]
    pub async fn get_credentials(&self, username: &str) -> Result<Credentials, Error> {
        sqlx::query_as("SELECT password_hash, password_salt FROM auth_user WHERE username = ?")
            .bind(username)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| ErrorType::UnknownUsername(username.to_string()).into())
    }

    #[tracing::instrument(skip_all, fields(user_uuid = %user_uuid))]
    pub async fn change_password(
        &self,
        user_uuid: Uuid,
        salt: &[u8],
        hash: &str,
    ) -> Result<(), Error> {
        let res =
            sqlx::query("UPDATE auth_user SET password_hash = ?, password_salt = ? WHERE uuid = ?")
                .bind(hash)
                .bind(salt)
                .bind(user_uuid.to_string())
                .execute(&self.pool)
                .await?;
        if res.rows_affected() == 0 {
            return Err(ErrorType::UnknownUser(user_uuid).into());
        }
        Ok(())
    }

    /// Associate a policy directly to the user. Re-adding an existing
    /// association succeeds without a second row.
    #[tracing::instrument(skip(self))]
    pub async fn add_policy(&self, user_uuid: Uuid, policy_uuid: Uuid) -> Result<(), Error> {
        let res = sqlx::query("INSERT INTO auth_user_policy (user_uuid, policy_uuid) VALUES (?, ?)")
            .bind(user_uuid.to_string())
            .bind(policy_uuid.to_string())
            .execute(&self.pool)
            .await;

        match res.map_err(Error::from) {
            Ok(_) => Ok(()),
            Err(err) if err.unique_constraint_message().is_some() => Ok(()),
            Err(err) if err.is_foreign_key_violation() => {
                if self.exists(user_uuid).await? {
                    Err(ErrorType::UnknownPolicy(policy_uuid).into())
                } else {
                    Err(ErrorType::UnknownUser(user_uuid).into())
                }
            }
            Err(err) => Err(err),
        }
    }

    #[tracing::instrument(skip(self))]
    pub async fn remove_policy(&self, user_uuid: Uuid, policy_uuid: Uuid) -> Result<(), Error> {
        let res =
            sqlx::query("DELETE FROM auth_user_policy WHERE user_uuid = ? AND policy_uuid = ?")
                .bind(user_uuid.to_string())
                .bind(policy_uuid.to_string())
                .execute(&self.pool)
                .await?;
        if res.rows_affected() == 0 {
            return Err(ErrorType::UnknownUserPolicy {
                user_uuid,
                policy_uuid,
            }
            .into());
        }
        Ok(())
    }

    pub async fn exists(&self, user_uuid: Uuid) -> Result<bool, Error> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM auth_user WHERE uuid = ?")
            .bind(user_uuid.to_string())
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }
}

const FROM_USERS: &str = "FROM auth_user U
    JOIN auth_user_email UE ON UE.user_uuid = U.uuid
    JOIN auth_email E ON E.uuid = UE.email_uuid
    LEFT JOIN auth_tenant_user TU ON TU.user_uuid = U.uuid
    LEFT JOIN auth_user_group UG ON UG.user_uuid = U.uuid";

pub(crate) fn parse_uuid(value: &str) -> Result<Uuid, Error> {
    Uuid::from_str(value)
        .map_err(|_| ErrorType::BadData(format!("`{value}` is not a valid uuid")).into())
}
