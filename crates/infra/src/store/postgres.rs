//! Postgres-backed authorization store.
//!
//! ## Schema
//!
//! ```sql
//! CREATE TABLE auth_users (
//!     id            UUID PRIMARY KEY,
//!     display_name  TEXT NOT NULL UNIQUE,
//!     created_at    TIMESTAMPTZ NOT NULL,
//!     email         TEXT UNIQUE,
//!     friendly_name TEXT,
//!     source        TEXT NOT NULL DEFAULT 'internal'
//! );
//! CREATE TABLE auth_groups (
//!     id           BIGSERIAL PRIMARY KEY,
//!     display_name TEXT NOT NULL UNIQUE,
//!     created_at   TIMESTAMPTZ NOT NULL
//! );
//! CREATE TABLE auth_policies (
//!     id           BIGSERIAL PRIMARY KEY,
//!     display_name TEXT NOT NULL UNIQUE,
//!     created_at   TIMESTAMPTZ NOT NULL,
//!     statement    JSONB NOT NULL
//! );
//! CREATE TABLE auth_user_groups (
//!     user_id  UUID   NOT NULL REFERENCES auth_users (id) ON DELETE CASCADE,
//!     group_id BIGINT NOT NULL REFERENCES auth_groups (id) ON DELETE CASCADE,
//!     PRIMARY KEY (user_id, group_id)
//! );
//! CREATE TABLE auth_user_policies (
//!     user_id   UUID   NOT NULL REFERENCES auth_users (id) ON DELETE CASCADE,
//!     policy_id BIGINT NOT NULL REFERENCES auth_policies (id) ON DELETE CASCADE,
//!     PRIMARY KEY (user_id, policy_id)
//! );
//! CREATE TABLE auth_group_policies (
//!     group_id  BIGINT NOT NULL REFERENCES auth_groups (id) ON DELETE CASCADE,
//!     policy_id BIGINT NOT NULL REFERENCES auth_policies (id) ON DELETE CASCADE,
//!     PRIMARY KEY (group_id, policy_id)
//! );
//! CREATE TABLE auth_credentials (
//!     access_key_id     TEXT PRIMARY KEY,
//!     secret_access_key BYTEA NOT NULL,
//!     issued_date       TIMESTAMPTZ NOT NULL,
//!     user_id           UUID NOT NULL REFERENCES auth_users (id) ON DELETE CASCADE
//! );
//! CREATE TABLE auth_expired_tokens (
//!     token_id         TEXT PRIMARY KEY,
//!     token_expires_at TIMESTAMPTZ NOT NULL
//! );
//! ```
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `UniqueViolation` |
//! | Database (canceled, serialization, deadlock) | `57014`, `40001`, `40P01` | `Transient` |
//! | Database (connection exception) | `08xxx` | `Transient` |
//! | Database (other) | Any other | `Database` |
//! | PoolTimedOut / Io | N/A | `Transient` |
//! | ColumnDecode / Decode | N/A | `Decode` |
//! | PoolClosed | N/A | `PoolClosed` |
//! | Other | N/A | `Database` |
//!
//! ## Ordering
//!
//! Cursor comparisons and ordering use `COLLATE "C"` so keys sort bytewise,
//! the same order the paginator's tokens assume.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Postgres, Row, Transaction};
use tracing::{Span, instrument};

use latchkey_auth::{Credential, CredentialRecord, Group, Policy, Statement, User};
use latchkey_core::{KeysetQuery, UserId};

use super::{Database, StoreError, StoreResult, Tx, TxMode};

const USER_COLUMNS: &str = "u.id, u.display_name, u.created_at, u.email, u.friendly_name, u.source";
const GROUP_COLUMNS: &str = "g.display_name, g.created_at";
const POLICY_COLUMNS: &str = "p.display_name, p.created_at, p.statement";
const CREDENTIAL_COLUMNS: &str = "c.access_key_id, c.secret_access_key, c.issued_date, c.user_id";

/// Postgres-backed transactional store.
///
/// `PostgresAuthStore` is `Send + Sync`; every transaction checks a connection
/// out of the SQLx pool for its lifetime.
#[derive(Debug, Clone)]
pub struct PostgresAuthStore {
    pool: Arc<PgPool>,
}

impl PostgresAuthStore {
    /// Create a new PostgresAuthStore with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }
}

#[async_trait]
impl Database for PostgresAuthStore {
    #[instrument(skip(self), err)]
    async fn begin(&self, mode: TxMode) -> StoreResult<Box<dyn Tx>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;
        if mode == TxMode::ReadOnly {
            sqlx::query("SET TRANSACTION READ ONLY")
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("set_read_only", e))?;
        }
        Ok(Box::new(PgTx { tx }))
    }
}

struct PgTx {
    tx: Transaction<'static, Postgres>,
}

/// `AND <col> > $n AND <col> LIKE $n+1 ORDER BY <col> LIMIT $n+2` for a
/// cursor column under `alias`.
fn keyset_clause(query: &KeysetQuery, alias: &str, first_param: usize) -> String {
    let column = format!(r#"{alias}.{} COLLATE "C""#, query.cursor_column);
    format!(
        r#"AND {column} > ${a} AND {column} LIKE ${b} ESCAPE '\' ORDER BY {column} LIMIT ${c}"#,
        a = first_param,
        b = first_param + 1,
        c = first_param + 2,
    )
}

/// Escape a literal prefix for use in a `LIKE` pattern.
fn like_prefix(prefix: &str) -> String {
    let mut pattern = String::with_capacity(prefix.len() + 1);
    for ch in prefix.chars() {
        if matches!(ch, '\\' | '%' | '_') {
            pattern.push('\\');
        }
        pattern.push(ch);
    }
    pattern.push('%');
    pattern
}

fn limit(query: &KeysetQuery) -> i64 {
    i64::try_from(query.limit).unwrap_or(i64::MAX)
}

fn decode<T>(operation: &'static str, rows: Vec<PgRow>) -> StoreResult<Vec<T>>
where
    T: for<'r> FromRow<'r, PgRow>,
{
    rows.iter()
        .map(|row| T::from_row(row).map_err(|e| map_sqlx_error(operation, e)))
        .collect()
}

#[async_trait]
impl Tx for PgTx {
    #[instrument(skip(self, user), fields(username = %user.username), err)]
    async fn insert_user(&mut self, user: &User) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO auth_users (id, display_name, created_at, email, friendly_name, source)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(user.id.as_uuid())
        .bind(&user.username)
        .bind(user.created_at)
        .bind(&user.email)
        .bind(&user.friendly_name)
        .bind(&user.source)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_user", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get_user_by_name(&mut self, username: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query(&format!(
            "SELECT {USER_COLUMNS} FROM auth_users u WHERE u.display_name = $1"
        ))
        .bind(username)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("get_user_by_name", e))?;
        row.map(|r| UserRow::from_row(&r).map(Into::into))
            .transpose()
            .map_err(|e| map_sqlx_error("get_user_by_name", e))
    }

    #[instrument(skip(self, id), fields(user_id = %id), err)]
    async fn get_user_by_id(&mut self, id: UserId) -> StoreResult<Option<User>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM auth_users u WHERE u.id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("get_user_by_id", e))?;
        row.map(|r| UserRow::from_row(&r).map(Into::into))
            .transpose()
            .map_err(|e| map_sqlx_error("get_user_by_id", e))
    }

    #[instrument(skip(self, email), err)]
    async fn get_user_by_email(&mut self, email: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query(&format!("SELECT {USER_COLUMNS} FROM auth_users u WHERE u.email = $1"))
            .bind(email)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("get_user_by_email", e))?;
        row.map(|r| UserRow::from_row(&r).map(Into::into))
            .transpose()
            .map_err(|e| map_sqlx_error("get_user_by_email", e))
    }

    #[instrument(skip(self, query), fields(after = %query.after, limit = query.limit, returned = tracing::field::Empty), err)]
    async fn list_users(&mut self, query: &KeysetQuery) -> StoreResult<Vec<User>> {
        let sql = format!(
            "SELECT {USER_COLUMNS} FROM auth_users u WHERE TRUE {}",
            keyset_clause(query, "u", 1)
        );
        let rows = sqlx::query(&sql)
            .bind(&query.after)
            .bind(like_prefix(&query.prefix))
            .bind(limit(query))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("list_users", e))?;
        Span::current().record("returned", rows.len());
        Ok(decode::<UserRow>("list_users", rows)?.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self), err)]
    async fn delete_user(&mut self, username: &str) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM auth_users WHERE display_name = $1")
            .bind(username)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_user", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, group), fields(group = %group.display_name), err)]
    async fn insert_group(&mut self, group: &Group) -> StoreResult<()> {
        sqlx::query("INSERT INTO auth_groups (display_name, created_at) VALUES ($1, $2)")
            .bind(&group.display_name)
            .bind(group.created_at)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_group", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get_group(&mut self, name: &str) -> StoreResult<Option<Group>> {
        let row = sqlx::query(&format!(
            "SELECT {GROUP_COLUMNS} FROM auth_groups g WHERE g.display_name = $1"
        ))
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("get_group", e))?;
        row.map(|r| GroupRow::from_row(&r).map(Into::into))
            .transpose()
            .map_err(|e| map_sqlx_error("get_group", e))
    }

    #[instrument(skip(self, query), fields(after = %query.after, limit = query.limit), err)]
    async fn list_groups(&mut self, query: &KeysetQuery) -> StoreResult<Vec<Group>> {
        let sql = format!(
            "SELECT {GROUP_COLUMNS} FROM auth_groups g WHERE TRUE {}",
            keyset_clause(query, "g", 1)
        );
        let rows = sqlx::query(&sql)
            .bind(&query.after)
            .bind(like_prefix(&query.prefix))
            .bind(limit(query))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("list_groups", e))?;
        Ok(decode::<GroupRow>("list_groups", rows)?.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self), err)]
    async fn delete_group(&mut self, name: &str) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM auth_groups WHERE display_name = $1")
            .bind(name)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_group", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, policy), fields(policy = %policy.display_name), err)]
    async fn upsert_policy(&mut self, policy: &Policy) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO auth_policies (display_name, created_at, statement)
            VALUES ($1, $2, $3)
            ON CONFLICT (display_name) DO UPDATE SET statement = EXCLUDED.statement
            "#,
        )
        .bind(&policy.display_name)
        .bind(policy.created_at)
        .bind(Json(&policy.statements))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("upsert_policy", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get_policy(&mut self, name: &str) -> StoreResult<Option<Policy>> {
        let row = sqlx::query(&format!(
            "SELECT {POLICY_COLUMNS} FROM auth_policies p WHERE p.display_name = $1"
        ))
        .bind(name)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("get_policy", e))?;
        row.map(|r| PolicyRow::from_row(&r).map(Into::into))
            .transpose()
            .map_err(|e| map_sqlx_error("get_policy", e))
    }

    #[instrument(skip(self, query), fields(after = %query.after, limit = query.limit), err)]
    async fn list_policies(&mut self, query: &KeysetQuery) -> StoreResult<Vec<Policy>> {
        let sql = format!(
            "SELECT {POLICY_COLUMNS} FROM auth_policies p WHERE TRUE {}",
            keyset_clause(query, "p", 1)
        );
        let rows = sqlx::query(&sql)
            .bind(&query.after)
            .bind(like_prefix(&query.prefix))
            .bind(limit(query))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("list_policies", e))?;
        Ok(decode::<PolicyRow>("list_policies", rows)?.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self), err)]
    async fn delete_policy(&mut self, name: &str) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM auth_policies WHERE display_name = $1")
            .bind(name)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_policy", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn insert_user_group(&mut self, username: &str, group: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO auth_user_groups (user_id, group_id)
            SELECT u.id, g.id FROM auth_users u, auth_groups g
            WHERE u.display_name = $1 AND g.display_name = $2
            "#,
        )
        .bind(username)
        .bind(group)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_user_group", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete_user_group(&mut self, username: &str, group: &str) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM auth_user_groups ug
            USING auth_users u, auth_groups g
            WHERE ug.user_id = u.id AND ug.group_id = g.id
              AND u.display_name = $1 AND g.display_name = $2
            "#,
        )
        .bind(username)
        .bind(group)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("delete_user_group", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, query), fields(after = %query.after, limit = query.limit), err)]
    async fn list_user_groups(&mut self, username: &str, query: &KeysetQuery) -> StoreResult<Vec<Group>> {
        let sql = format!(
            r#"
            SELECT {GROUP_COLUMNS} FROM auth_groups g
            JOIN auth_user_groups ug ON ug.group_id = g.id
            JOIN auth_users u ON u.id = ug.user_id
            WHERE u.display_name = $1 {}
            "#,
            keyset_clause(query, "g", 2)
        );
        let rows = sqlx::query(&sql)
            .bind(username)
            .bind(&query.after)
            .bind(like_prefix(&query.prefix))
            .bind(limit(query))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("list_user_groups", e))?;
        Ok(decode::<GroupRow>("list_user_groups", rows)?.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self, query), fields(after = %query.after, limit = query.limit), err)]
    async fn list_group_users(&mut self, group: &str, query: &KeysetQuery) -> StoreResult<Vec<User>> {
        let sql = format!(
            r#"
            SELECT {USER_COLUMNS} FROM auth_users u
            JOIN auth_user_groups ug ON ug.user_id = u.id
            JOIN auth_groups g ON g.id = ug.group_id
            WHERE g.display_name = $1 {}
            "#,
            keyset_clause(query, "u", 2)
        );
        let rows = sqlx::query(&sql)
            .bind(group)
            .bind(&query.after)
            .bind(like_prefix(&query.prefix))
            .bind(limit(query))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("list_group_users", e))?;
        Ok(decode::<UserRow>("list_group_users", rows)?.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self), err)]
    async fn insert_user_policy(&mut self, username: &str, policy: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO auth_user_policies (user_id, policy_id)
            SELECT u.id, p.id FROM auth_users u, auth_policies p
            WHERE u.display_name = $1 AND p.display_name = $2
            "#,
        )
        .bind(username)
        .bind(policy)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_user_policy", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete_user_policy(&mut self, username: &str, policy: &str) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM auth_user_policies up
            USING auth_users u, auth_policies p
            WHERE up.user_id = u.id AND up.policy_id = p.id
              AND u.display_name = $1 AND p.display_name = $2
            "#,
        )
        .bind(username)
        .bind(policy)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("delete_user_policy", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, query), fields(after = %query.after, limit = query.limit), err)]
    async fn list_user_policies(&mut self, username: &str, query: &KeysetQuery) -> StoreResult<Vec<Policy>> {
        let sql = format!(
            r#"
            SELECT {POLICY_COLUMNS} FROM auth_policies p
            JOIN auth_user_policies up ON up.policy_id = p.id
            JOIN auth_users u ON u.id = up.user_id
            WHERE u.display_name = $1 {}
            "#,
            keyset_clause(query, "p", 2)
        );
        let rows = sqlx::query(&sql)
            .bind(username)
            .bind(&query.after)
            .bind(like_prefix(&query.prefix))
            .bind(limit(query))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("list_user_policies", e))?;
        Ok(decode::<PolicyRow>("list_user_policies", rows)?.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self), err)]
    async fn insert_group_policy(&mut self, group: &str, policy: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO auth_group_policies (group_id, policy_id)
            SELECT g.id, p.id FROM auth_groups g, auth_policies p
            WHERE g.display_name = $1 AND p.display_name = $2
            "#,
        )
        .bind(group)
        .bind(policy)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_group_policy", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn delete_group_policy(&mut self, group: &str, policy: &str) -> StoreResult<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM auth_group_policies gp
            USING auth_groups g, auth_policies p
            WHERE gp.group_id = g.id AND gp.policy_id = p.id
              AND g.display_name = $1 AND p.display_name = $2
            "#,
        )
        .bind(group)
        .bind(policy)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("delete_group_policy", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self, query), fields(after = %query.after, limit = query.limit), err)]
    async fn list_group_policies(&mut self, group: &str, query: &KeysetQuery) -> StoreResult<Vec<Policy>> {
        let sql = format!(
            r#"
            SELECT {POLICY_COLUMNS} FROM auth_policies p
            JOIN auth_group_policies gp ON gp.policy_id = p.id
            JOIN auth_groups g ON g.id = gp.group_id
            WHERE g.display_name = $1 {}
            "#,
            keyset_clause(query, "p", 2)
        );
        let rows = sqlx::query(&sql)
            .bind(group)
            .bind(&query.after)
            .bind(like_prefix(&query.prefix))
            .bind(limit(query))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("list_group_policies", e))?;
        Ok(decode::<PolicyRow>("list_group_policies", rows)?.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self, query), fields(after = %query.after, limit = query.limit, returned = tracing::field::Empty), err)]
    async fn list_effective_policies(&mut self, username: &str, query: &KeysetQuery) -> StoreResult<Vec<Policy>> {
        // Selecting by id keeps one row per policy whichever paths reach it.
        let sql = format!(
            r#"
            SELECT {POLICY_COLUMNS} FROM auth_policies p
            WHERE p.id IN (
                SELECT up.policy_id FROM auth_user_policies up
                JOIN auth_users u ON u.id = up.user_id
                WHERE u.display_name = $1
                UNION
                SELECT gp.policy_id FROM auth_group_policies gp
                JOIN auth_user_groups ug ON ug.group_id = gp.group_id
                JOIN auth_users u ON u.id = ug.user_id
                WHERE u.display_name = $1
            ) {}
            "#,
            keyset_clause(query, "p", 2)
        );
        let rows = sqlx::query(&sql)
            .bind(username)
            .bind(&query.after)
            .bind(like_prefix(&query.prefix))
            .bind(limit(query))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("list_effective_policies", e))?;
        Span::current().record("returned", rows.len());
        Ok(decode::<PolicyRow>("list_effective_policies", rows)?
            .into_iter()
            .map(Into::into)
            .collect())
    }

    #[instrument(skip(self, record), fields(access_key_id = %record.access_key_id), err)]
    async fn insert_credential(&mut self, record: &CredentialRecord) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO auth_credentials (access_key_id, secret_access_key, issued_date, user_id)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(&record.access_key_id)
        .bind(&record.secret_access_key_encrypted)
        .bind(record.issued_date)
        .bind(record.user_id.as_uuid())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_credential", e))?;
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get_credential(&mut self, access_key_id: &str) -> StoreResult<Option<CredentialRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM auth_credentials c WHERE c.access_key_id = $1"
        ))
        .bind(access_key_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("get_credential", e))?;
        row.map(|r| CredentialRow::from_row(&r).map(Into::into))
            .transpose()
            .map_err(|e| map_sqlx_error("get_credential", e))
    }

    #[instrument(skip(self, user_id, query), fields(user_id = %user_id, after = %query.after, limit = query.limit), err)]
    async fn list_user_credentials(&mut self, user_id: UserId, query: &KeysetQuery) -> StoreResult<Vec<Credential>> {
        let sql = format!(
            "SELECT {CREDENTIAL_COLUMNS} FROM auth_credentials c WHERE c.user_id = $1 {}",
            keyset_clause(query, "c", 2)
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.as_uuid())
            .bind(&query.after)
            .bind(like_prefix(&query.prefix))
            .bind(limit(query))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("list_user_credentials", e))?;
        Ok(decode::<CredentialRow>("list_user_credentials", rows)?
            .into_iter()
            .map(|row| CredentialRecord::from(row).redacted())
            .collect())
    }

    #[instrument(skip(self, user_id), fields(user_id = %user_id), err)]
    async fn delete_credential(&mut self, user_id: UserId, access_key_id: &str) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM auth_credentials WHERE user_id = $1 AND access_key_id = $2")
            .bind(user_id.as_uuid())
            .bind(access_key_id)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_credential", e))?;
        Ok(result.rows_affected())
    }

    #[instrument(skip(self), err)]
    async fn insert_token_if_absent(&mut self, token_id: &str, expires_at: DateTime<Utc>) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO auth_expired_tokens (token_id, token_expires_at)
            VALUES ($1, $2)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(token_id)
        .bind(expires_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_token_if_absent", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self), err)]
    async fn delete_expired_tokens(&mut self, now: DateTime<Utc>) -> StoreResult<u64> {
        let result = sqlx::query("DELETE FROM auth_expired_tokens WHERE token_expires_at < $1")
            .bind(now)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("delete_expired_tokens", e))?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> StoreResult<()> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))
    }
}

/// Map SQLx errors to StoreError.
/// Query canceled, serialization failure, deadlock, and connection loss
/// (class 08).
fn is_transient_code(code: &str) -> bool {
    matches!(code, "57014" | "40001" | "40P01") || code.starts_with("08")
}

fn map_sqlx_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let message = db_err.message().to_string();
            match db_err.code().as_deref() {
                Some("23505") => StoreError::UniqueViolation { operation, message },
                Some(code) if is_transient_code(code) => StoreError::Transient { operation, message },
                _ => StoreError::Database { operation, message },
            }
        }
        sqlx::Error::PoolClosed => StoreError::PoolClosed(operation),
        sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => StoreError::Transient {
            operation,
            message: err.to_string(),
        },
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            StoreError::Decode {
                operation,
                message: err.to_string(),
            }
        }
        _ => StoreError::Database {
            operation,
            message: err.to_string(),
        },
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Row types
// ─────────────────────────────────────────────────────────────────────────────

struct UserRow {
    id: uuid::Uuid,
    display_name: String,
    created_at: DateTime<Utc>,
    email: Option<String>,
    friendly_name: Option<String>,
    source: String,
}

impl<'r> FromRow<'r, PgRow> for UserRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(UserRow {
            id: row.try_get("id")?,
            display_name: row.try_get("display_name")?,
            created_at: row.try_get("created_at")?,
            email: row.try_get("email")?,
            friendly_name: row.try_get("friendly_name")?,
            source: row.try_get("source")?,
        })
    }
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        User {
            id: UserId::from_uuid(row.id),
            username: row.display_name,
            created_at: row.created_at,
            email: row.email,
            friendly_name: row.friendly_name,
            source: row.source,
        }
    }
}

struct GroupRow {
    display_name: String,
    created_at: DateTime<Utc>,
}

impl<'r> FromRow<'r, PgRow> for GroupRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(GroupRow {
            display_name: row.try_get("display_name")?,
            created_at: row.try_get("created_at")?,
        })
    }
}

impl From<GroupRow> for Group {
    fn from(row: GroupRow) -> Self {
        Group {
            display_name: row.display_name,
            created_at: row.created_at,
        }
    }
}

struct PolicyRow {
    display_name: String,
    created_at: DateTime<Utc>,
    statement: Json<Vec<Statement>>,
}

impl<'r> FromRow<'r, PgRow> for PolicyRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(PolicyRow {
            display_name: row.try_get("display_name")?,
            created_at: row.try_get("created_at")?,
            statement: row.try_get("statement")?,
        })
    }
}

impl From<PolicyRow> for Policy {
    fn from(row: PolicyRow) -> Self {
        Policy {
            display_name: row.display_name,
            created_at: row.created_at,
            statements: row.statement.0,
        }
    }
}

struct CredentialRow {
    access_key_id: String,
    secret_access_key: Vec<u8>,
    issued_date: DateTime<Utc>,
    user_id: uuid::Uuid,
}

impl<'r> FromRow<'r, PgRow> for CredentialRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(CredentialRow {
            access_key_id: row.try_get("access_key_id")?,
            secret_access_key: row.try_get("secret_access_key")?,
            issued_date: row.try_get("issued_date")?,
            user_id: row.try_get("user_id")?,
        })
    }
}

impl From<CredentialRow> for CredentialRecord {
    fn from(row: CredentialRow) -> Self {
        CredentialRecord {
            access_key_id: row.access_key_id,
            secret_access_key_encrypted: row.secret_access_key,
            issued_date: row.issued_date,
            user_id: UserId::from_uuid(row.user_id),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use latchkey_auth::model::{POLICIES, USERS};
    use latchkey_core::PaginationParams;

    #[test]
    fn like_prefix_escapes_wildcards() {
        assert_eq!(like_prefix(""), "%");
        assert_eq!(like_prefix("team_a"), r"team\_a%");
        assert_eq!(like_prefix("100%"), r"100\%%");
        assert_eq!(like_prefix(r"a\b"), r"a\\b%");
    }

    #[test]
    fn keyset_clause_numbers_parameters_after_filters() {
        let query = KeysetQuery::plan(&POLICIES, &PaginationParams::first(10)).unwrap();
        let clause = keyset_clause(&query, "p", 2);
        assert_eq!(
            clause,
            r#"AND p.display_name COLLATE "C" > $2 AND p.display_name COLLATE "C" LIKE $3 ESCAPE '\' ORDER BY p.display_name COLLATE "C" LIMIT $4"#
        );
        assert_eq!(limit(&query), 11);
    }

    #[test]
    fn pool_timeouts_and_cancellations_are_transient() {
        assert!(map_sqlx_error("get_user", sqlx::Error::PoolTimedOut).is_retryable());
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        assert!(map_sqlx_error("get_user", sqlx::Error::Io(io)).is_retryable());
        assert!(is_transient_code("57014"));
        assert!(is_transient_code("40001"));
        assert!(is_transient_code("08006"));
        assert!(!is_transient_code("23505"));
        assert!(!map_sqlx_error("get_user", sqlx::Error::PoolClosed).is_retryable());
    }

    #[test]
    fn unbounded_listing_fetches_one_page_plus_boundary() {
        let query = KeysetQuery::plan(&USERS, &PaginationParams::all()).unwrap();
        assert_eq!(limit(&query), latchkey_core::MAX_PAGE_SIZE as i64 + 1);
    }
}
