//! Authorization façade.
//!
//! Every operation opens its own transaction, runs under the configured
//! deadline and either commits or drops the handle. Cacheable reads go through
//! [`ServiceCache`]; mutations invalidate what they can make stale.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, instrument, warn};

use latchkey_auth::model::{CREDENTIALS, GROUPS, POLICIES, USERS};
use latchkey_auth::validate::{validate_entity_id, validate_policy};
use latchkey_auth::{
    AuthorizationRequest, AuthorizationResponse, Credential, CredentialRecord, FernetSecretStore,
    Group, IdentityClaims, Policy, SecretStore, User, check_permissions, generate_access_key_id,
    generate_secret_access_key, validate_credentials,
};
use latchkey_core::{AuthError, AuthResult, KeysetQuery, Page, PaginationParams, UserId, paginate};

use crate::cache::ServiceCache;
use crate::config::AuthConfig;
use crate::store::{Database, StoreError, Tx, TxMode};

/// Turn a unique violation into `AlreadyExists` for `entity`/`key`.
fn conflict(entity: &'static str, key: impl Into<String>) -> impl FnOnce(StoreError) -> AuthError {
    let key = key.into();
    move |err| {
        if err.is_unique_violation() {
            AuthError::already_exists(entity, key)
        } else {
            err.into()
        }
    }
}

fn relation_key(left: &str, right: &str) -> String {
    format!("{left}:{right}")
}

async fn require_user(tx: &mut dyn Tx, username: &str) -> AuthResult<User> {
    tx.get_user_by_name(username)
        .await?
        .ok_or_else(|| AuthError::not_found("user", username))
}

async fn require_group(tx: &mut dyn Tx, name: &str) -> AuthResult<Group> {
    tx.get_group(name)
        .await?
        .ok_or_else(|| AuthError::not_found("group", name))
}

async fn require_policy(tx: &mut dyn Tx, name: &str) -> AuthResult<Policy> {
    tx.get_policy(name)
        .await?
        .ok_or_else(|| AuthError::not_found("policy", name))
}

fn expect_deleted(rows: u64, entity: &'static str, key: impl Into<String>) -> AuthResult<()> {
    if rows == 0 {
        Err(AuthError::not_found(entity, key))
    } else {
        Ok(())
    }
}

/// The authorization service.
#[derive(Clone)]
pub struct AuthService {
    db: Arc<dyn Database>,
    cache: ServiceCache,
    secrets: Arc<dyn SecretStore>,
    tx_timeout: Duration,
}

impl std::fmt::Debug for AuthService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthService")
            .field("cache", &self.cache)
            .field("tx_timeout", &self.tx_timeout)
            .finish_non_exhaustive()
    }
}

impl AuthService {
    /// Build a service with Fernet secret encryption keyed from the config.
    pub fn new(db: Arc<dyn Database>, config: &AuthConfig) -> AuthResult<Self> {
        let secrets = Arc::new(FernetSecretStore::new(config.encryption_secret.as_bytes()));
        Self::with_secret_store(db, secrets, config)
    }

    pub fn with_secret_store(
        db: Arc<dyn Database>,
        secrets: Arc<dyn SecretStore>,
        config: &AuthConfig,
    ) -> AuthResult<Self> {
        config.validate()?;
        info!(
            cache_enabled = config.cache.enabled,
            cache_size = config.cache.size,
            tx_timeout_ms = config.tx_timeout.as_millis() as u64,
            "authorization service configured"
        );
        Ok(Self {
            db,
            cache: ServiceCache::from_config(&config.cache),
            secrets,
            tx_timeout: config.tx_timeout,
        })
    }

    /// Run `work` under the transaction deadline. On expiry the future, and
    /// with it any open transaction, is dropped.
    async fn deadline<T>(&self, operation: &'static str, work: impl Future<Output = AuthResult<T>>) -> AuthResult<T> {
        match tokio::time::timeout(self.tx_timeout, work).await {
            Ok(result) => result,
            Err(_) => {
                warn!(operation, "transaction deadline exceeded");
                Err(AuthError::timeout(operation))
            }
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Users
    // ─────────────────────────────────────────────────────────────────────

    #[instrument(skip(self, user), fields(username = %user.username), err)]
    pub async fn create_user(&self, user: User) -> AuthResult<UserId> {
        validate_entity_id("username", &user.username)?;
        self.deadline("create_user", async {
            let mut tx = self.db.begin(TxMode::ReadWrite).await?;
            tx.insert_user(&user)
                .await
                .map_err(conflict("user", user.username.as_str()))?;
            tx.commit().await?;
            Ok(user.id)
        })
        .await
    }

    async fn load_user(&self, username: &str) -> AuthResult<User> {
        self.deadline("get_user", async {
            let mut tx = self.db.begin(TxMode::ReadOnly).await?;
            require_user(tx.as_mut(), username).await
        })
        .await
    }

    async fn load_user_by_id(&self, id: UserId) -> AuthResult<User> {
        self.deadline("get_user_by_id", async {
            let mut tx = self.db.begin(TxMode::ReadOnly).await?;
            tx.get_user_by_id(id)
                .await?
                .ok_or_else(|| AuthError::not_found("user", id.to_string()))
        })
        .await
    }

    #[instrument(skip(self), err)]
    pub async fn get_user(&self, username: &str) -> AuthResult<User> {
        self.cache
            .get_user(username, || self.load_user(username))
            .await
    }

    #[instrument(skip(self), err)]
    pub async fn get_user_by_id(&self, id: UserId) -> AuthResult<User> {
        self.cache
            .get_user_by_id(id, || self.load_user_by_id(id))
            .await
    }

    #[instrument(skip(self, email), err)]
    pub async fn get_user_by_email(&self, email: &str) -> AuthResult<User> {
        self.deadline("get_user_by_email", async {
            let mut tx = self.db.begin(TxMode::ReadOnly).await?;
            tx.get_user_by_email(email)
                .await?
                .ok_or_else(|| AuthError::not_found("user", email))
        })
        .await
    }

    #[instrument(skip(self), err)]
    pub async fn list_users(&self, params: &PaginationParams) -> AuthResult<Page<User>> {
        let query = KeysetQuery::plan(&USERS, params)?;
        self.deadline("list_users", async {
            let mut tx = self.db.begin(TxMode::ReadOnly).await?;
            let rows = tx.list_users(&query).await?;
            Ok(paginate(&USERS, params, rows))
        })
        .await
    }

    #[instrument(skip(self), err)]
    pub async fn delete_user(&self, username: &str) -> AuthResult<()> {
        let user = self
            .deadline("delete_user", async {
                let mut tx = self.db.begin(TxMode::ReadWrite).await?;
                let user = require_user(tx.as_mut(), username).await?;
                expect_deleted(tx.delete_user(username).await?, "user", username)?;
                tx.commit().await?;
                Ok(user)
            })
            .await?;
        self.cache.invalidate_user(&user).await;
        Ok(())
    }

    /// Resolve a verified external identity to a user, creating it on first
    /// sight with the identity's source.
    #[instrument(skip(self, claims), fields(username = %claims.username, source = %claims.source), err)]
    pub async fn user_from_identity(&self, claims: &IdentityClaims) -> AuthResult<User> {
        match self.get_user(&claims.username).await {
            Ok(user) => return Ok(user),
            Err(err) if err.is_not_found() => {}
            Err(err) => return Err(err),
        }
        let user = claims.to_user()?;
        match self.create_user(user.clone()).await {
            Ok(_) => {
                info!(username = %user.username, "created user from external identity");
                Ok(user)
            }
            // Lost a race with a concurrent first login.
            Err(err) if err.is_already_exists() => self.load_user(&claims.username).await,
            Err(err) => Err(err),
        }
    }

    // ─────────────────────────────────────────────────────────────────────
    // Groups
    // ─────────────────────────────────────────────────────────────────────

    #[instrument(skip(self, group), fields(group = %group.display_name), err)]
    pub async fn create_group(&self, group: Group) -> AuthResult<()> {
        validate_entity_id("group", &group.display_name)?;
        self.deadline("create_group", async {
            let mut tx = self.db.begin(TxMode::ReadWrite).await?;
            tx.insert_group(&group)
                .await
                .map_err(conflict("group", group.display_name.as_str()))?;
            tx.commit().await?;
            Ok(())
        })
        .await
    }

    #[instrument(skip(self), err)]
    pub async fn get_group(&self, name: &str) -> AuthResult<Group> {
        self.deadline("get_group", async {
            let mut tx = self.db.begin(TxMode::ReadOnly).await?;
            require_group(tx.as_mut(), name).await
        })
        .await
    }

    #[instrument(skip(self), err)]
    pub async fn delete_group(&self, name: &str) -> AuthResult<()> {
        self.deadline("delete_group", async {
            let mut tx = self.db.begin(TxMode::ReadWrite).await?;
            expect_deleted(tx.delete_group(name).await?, "group", name)?;
            tx.commit().await?;
            Ok(())
        })
        .await?;
        self.cache.invalidate_all_effective_policies();
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn list_groups(&self, params: &PaginationParams) -> AuthResult<Page<Group>> {
        let query = KeysetQuery::plan(&GROUPS, params)?;
        self.deadline("list_groups", async {
            let mut tx = self.db.begin(TxMode::ReadOnly).await?;
            let rows = tx.list_groups(&query).await?;
            Ok(paginate(&GROUPS, params, rows))
        })
        .await
    }

    #[instrument(skip(self), err)]
    pub async fn add_user_to_group(&self, username: &str, group: &str) -> AuthResult<()> {
        self.deadline("add_user_to_group", async {
            let mut tx = self.db.begin(TxMode::ReadWrite).await?;
            require_user(tx.as_mut(), username).await?;
            require_group(tx.as_mut(), group).await?;
            tx.insert_user_group(username, group)
                .await
                .map_err(conflict("group membership", relation_key(username, group)))?;
            tx.commit().await?;
            Ok(())
        })
        .await?;
        self.cache.invalidate_effective_policies(username).await;
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn remove_user_from_group(&self, username: &str, group: &str) -> AuthResult<()> {
        self.deadline("remove_user_from_group", async {
            let mut tx = self.db.begin(TxMode::ReadWrite).await?;
            require_user(tx.as_mut(), username).await?;
            require_group(tx.as_mut(), group).await?;
            let rows = tx.delete_user_group(username, group).await?;
            expect_deleted(rows, "group membership", relation_key(username, group))?;
            tx.commit().await?;
            Ok(())
        })
        .await?;
        self.cache.invalidate_effective_policies(username).await;
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn list_user_groups(&self, username: &str, params: &PaginationParams) -> AuthResult<Page<Group>> {
        let query = KeysetQuery::plan(&GROUPS, params)?;
        self.deadline("list_user_groups", async {
            let mut tx = self.db.begin(TxMode::ReadOnly).await?;
            require_user(tx.as_mut(), username).await?;
            let rows = tx.list_user_groups(username, &query).await?;
            Ok(paginate(&GROUPS, params, rows))
        })
        .await
    }

    #[instrument(skip(self), err)]
    pub async fn list_group_users(&self, group: &str, params: &PaginationParams) -> AuthResult<Page<User>> {
        let query = KeysetQuery::plan(&USERS, params)?;
        self.deadline("list_group_users", async {
            let mut tx = self.db.begin(TxMode::ReadOnly).await?;
            require_group(tx.as_mut(), group).await?;
            let rows = tx.list_group_users(group, &query).await?;
            Ok(paginate(&USERS, params, rows))
        })
        .await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Policies
    // ─────────────────────────────────────────────────────────────────────

    /// Create a policy, or replace the statements of an existing one.
    #[instrument(skip(self, policy), fields(policy = %policy.display_name, statements = policy.statements.len()), err)]
    pub async fn write_policy(&self, policy: Policy) -> AuthResult<()> {
        validate_policy(&policy)?;
        self.deadline("write_policy", async {
            let mut tx = self.db.begin(TxMode::ReadWrite).await?;
            tx.upsert_policy(&policy).await?;
            tx.commit().await?;
            Ok(())
        })
        .await?;
        self.cache.invalidate_all_effective_policies();
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn get_policy(&self, name: &str) -> AuthResult<Policy> {
        self.deadline("get_policy", async {
            let mut tx = self.db.begin(TxMode::ReadOnly).await?;
            require_policy(tx.as_mut(), name).await
        })
        .await
    }

    #[instrument(skip(self), err)]
    pub async fn delete_policy(&self, name: &str) -> AuthResult<()> {
        self.deadline("delete_policy", async {
            let mut tx = self.db.begin(TxMode::ReadWrite).await?;
            expect_deleted(tx.delete_policy(name).await?, "policy", name)?;
            tx.commit().await?;
            Ok(())
        })
        .await?;
        self.cache.invalidate_all_effective_policies();
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn list_policies(&self, params: &PaginationParams) -> AuthResult<Page<Policy>> {
        let query = KeysetQuery::plan(&POLICIES, params)?;
        self.deadline("list_policies", async {
            let mut tx = self.db.begin(TxMode::ReadOnly).await?;
            let rows = tx.list_policies(&query).await?;
            Ok(paginate(&POLICIES, params, rows))
        })
        .await
    }

    #[instrument(skip(self), err)]
    pub async fn attach_policy_to_user(&self, policy: &str, username: &str) -> AuthResult<()> {
        self.deadline("attach_policy_to_user", async {
            let mut tx = self.db.begin(TxMode::ReadWrite).await?;
            require_policy(tx.as_mut(), policy).await?;
            require_user(tx.as_mut(), username).await?;
            tx.insert_user_policy(username, policy)
                .await
                .map_err(conflict("policy attachment", relation_key(policy, username)))?;
            tx.commit().await?;
            Ok(())
        })
        .await?;
        self.cache.invalidate_effective_policies(username).await;
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn detach_policy_from_user(&self, policy: &str, username: &str) -> AuthResult<()> {
        self.deadline("detach_policy_from_user", async {
            let mut tx = self.db.begin(TxMode::ReadWrite).await?;
            require_policy(tx.as_mut(), policy).await?;
            require_user(tx.as_mut(), username).await?;
            let rows = tx.delete_user_policy(username, policy).await?;
            expect_deleted(rows, "policy attachment", relation_key(policy, username))?;
            tx.commit().await?;
            Ok(())
        })
        .await?;
        self.cache.invalidate_effective_policies(username).await;
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn list_user_policies(&self, username: &str, params: &PaginationParams) -> AuthResult<Page<Policy>> {
        let query = KeysetQuery::plan(&POLICIES, params)?;
        self.deadline("list_user_policies", async {
            let mut tx = self.db.begin(TxMode::ReadOnly).await?;
            require_user(tx.as_mut(), username).await?;
            let rows = tx.list_user_policies(username, &query).await?;
            Ok(paginate(&POLICIES, params, rows))
        })
        .await
    }

    #[instrument(skip(self), err)]
    pub async fn attach_policy_to_group(&self, policy: &str, group: &str) -> AuthResult<()> {
        self.deadline("attach_policy_to_group", async {
            let mut tx = self.db.begin(TxMode::ReadWrite).await?;
            require_policy(tx.as_mut(), policy).await?;
            require_group(tx.as_mut(), group).await?;
            tx.insert_group_policy(group, policy)
                .await
                .map_err(conflict("policy attachment", relation_key(policy, group)))?;
            tx.commit().await?;
            Ok(())
        })
        .await?;
        self.cache.invalidate_all_effective_policies();
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn detach_policy_from_group(&self, policy: &str, group: &str) -> AuthResult<()> {
        self.deadline("detach_policy_from_group", async {
            let mut tx = self.db.begin(TxMode::ReadWrite).await?;
            require_policy(tx.as_mut(), policy).await?;
            require_group(tx.as_mut(), group).await?;
            let rows = tx.delete_group_policy(group, policy).await?;
            expect_deleted(rows, "policy attachment", relation_key(policy, group))?;
            tx.commit().await?;
            Ok(())
        })
        .await?;
        self.cache.invalidate_all_effective_policies();
        Ok(())
    }

    #[instrument(skip(self), err)]
    pub async fn list_group_policies(&self, group: &str, params: &PaginationParams) -> AuthResult<Page<Policy>> {
        let query = KeysetQuery::plan(&POLICIES, params)?;
        self.deadline("list_group_policies", async {
            let mut tx = self.db.begin(TxMode::ReadOnly).await?;
            require_group(tx.as_mut(), group).await?;
            let rows = tx.list_group_policies(group, &query).await?;
            Ok(paginate(&POLICIES, params, rows))
        })
        .await
    }

    // ─────────────────────────────────────────────────────────────────────
    // Effective policies and authorization
    // ─────────────────────────────────────────────────────────────────────

    async fn load_effective_policies(&self, username: &str, params: &PaginationParams) -> AuthResult<Page<Policy>> {
        let query = KeysetQuery::plan(&POLICIES, params)?;
        self.deadline("list_effective_policies", async {
            let mut tx = self.db.begin(TxMode::ReadOnly).await?;
            let rows = tx.list_effective_policies(username, &query).await?;
            Ok(paginate(&POLICIES, params, rows))
        })
        .await
    }

    /// Every effective policy, walking all pages inside one read-only
    /// transaction.
    async fn load_complete_effective_policies(&self, username: &str) -> AuthResult<Vec<Policy>> {
        self.deadline("list_effective_policies", async {
            let mut tx = self.db.begin(TxMode::ReadOnly).await?;
            let mut params = PaginationParams::all();
            let mut policies = Vec::new();
            loop {
                let query = KeysetQuery::plan(&POLICIES, &params)?;
                let rows = tx.list_effective_policies(username, &query).await?;
                let (page, paginator) = paginate(&POLICIES, &params, rows);
                policies.extend(page);
                if !paginator.has_more() {
                    return Ok(policies);
                }
                params = PaginationParams::all().after(paginator.next_page_token);
            }
        })
        .await
    }

    /// The complete effective set, served from cache when possible.
    async fn effective_policy_set(&self, username: &str) -> AuthResult<Arc<[Policy]>> {
        self.cache
            .get_effective_policies(username, || async {
                Ok(Arc::from(self.load_complete_effective_policies(username).await?))
            })
            .await
    }

    /// Policies attached to the user directly or through its groups.
    ///
    /// An unfiltered unbounded request is answered from the cached complete
    /// set, paged the same way a store listing is.
    #[instrument(skip(self), err)]
    pub async fn list_effective_policies(&self, username: &str, params: &PaginationParams) -> AuthResult<Page<Policy>> {
        if params.is_unbounded() && params.after.is_empty() && params.prefix.is_empty() {
            let policies = self.effective_policy_set(username).await?;
            return Ok(paginate(&POLICIES, params, policies.to_vec()));
        }
        self.load_effective_policies(username, params).await
    }

    /// Decide whether the user holds the required permissions.
    ///
    /// A deny is returned as `allowed: false`; only a failure to resolve the
    /// user's policies is an error.
    #[instrument(skip(self, request), fields(username = %request.username, allowed = tracing::field::Empty), err)]
    pub async fn authorize(&self, request: &AuthorizationRequest) -> AuthResult<AuthorizationResponse> {
        let policies = self.effective_policy_set(&request.username).await?;
        let result = check_permissions(&request.required_permissions, &request.username, &policies);
        let response = AuthorizationResponse::from_check(&request.username, result);
        tracing::Span::current().record("allowed", response.allowed);
        debug!(?result, policies = policies.len(), "authorization decided");
        Ok(response)
    }

    // ─────────────────────────────────────────────────────────────────────
    // Credentials
    // ─────────────────────────────────────────────────────────────────────

    /// Issue a freshly generated key pair to the user.
    #[instrument(skip(self), err)]
    pub async fn create_credentials(&self, username: &str) -> AuthResult<Credential> {
        let access_key_id = generate_access_key_id();
        let secret_access_key = generate_secret_access_key();
        self.store_credentials(username, access_key_id, secret_access_key)
            .await
    }

    /// Register an externally chosen key pair for the user.
    #[instrument(skip(self, secret_access_key), err)]
    pub async fn add_credentials(
        &self,
        username: &str,
        access_key_id: &str,
        secret_access_key: &str,
    ) -> AuthResult<Credential> {
        validate_credentials(access_key_id, secret_access_key)?;
        self.store_credentials(username, access_key_id.to_string(), secret_access_key.to_string())
            .await
    }

    async fn store_credentials(
        &self,
        username: &str,
        access_key_id: String,
        secret_access_key: String,
    ) -> AuthResult<Credential> {
        let encrypted = self.secrets.encrypt(secret_access_key.as_bytes())?;
        self.deadline("add_credentials", async {
            let mut tx = self.db.begin(TxMode::ReadWrite).await?;
            let user = require_user(tx.as_mut(), username).await?;
            let record = CredentialRecord {
                access_key_id,
                secret_access_key_encrypted: encrypted,
                issued_date: Utc::now(),
                user_id: user.id,
            };
            tx.insert_credential(&record)
                .await
                .map_err(conflict("credential", record.access_key_id.as_str()))?;
            tx.commit().await?;
            Ok(Credential {
                secret_access_key,
                ..record.redacted()
            })
        })
        .await
    }

    async fn load_credentials(&self, access_key_id: &str) -> AuthResult<Credential> {
        let record = self
            .deadline("get_credentials", async {
                let mut tx = self.db.begin(TxMode::ReadOnly).await?;
                tx.get_credential(access_key_id)
                    .await?
                    .ok_or_else(|| AuthError::not_found("credential", access_key_id))
            })
            .await?;
        let secret = self.secrets.decrypt(&record.secret_access_key_encrypted)?;
        let secret_access_key = String::from_utf8(secret)
            .map_err(|e| AuthError::crypto(format!("secret is not valid UTF-8: {e}")))?;
        Ok(Credential {
            secret_access_key,
            ..record.redacted()
        })
    }

    /// Look up a key pair, with its secret decrypted.
    #[instrument(skip(self), err)]
    pub async fn get_credentials(&self, access_key_id: &str) -> AuthResult<Credential> {
        self.cache
            .get_credential(access_key_id, || self.load_credentials(access_key_id))
            .await
    }

    /// Look up a key pair owned by `username`. The secret is not decrypted.
    #[instrument(skip(self), err)]
    pub async fn get_credentials_for_user(&self, username: &str, access_key_id: &str) -> AuthResult<Credential> {
        self.deadline("get_credentials_for_user", async {
            let mut tx = self.db.begin(TxMode::ReadOnly).await?;
            let user = require_user(tx.as_mut(), username).await?;
            match tx.get_credential(access_key_id).await? {
                Some(record) if record.user_id == user.id => Ok(record.redacted()),
                _ => Err(AuthError::not_found("credential", access_key_id)),
            }
        })
        .await
    }

    #[instrument(skip(self), err)]
    pub async fn list_user_credentials(&self, username: &str, params: &PaginationParams) -> AuthResult<Page<Credential>> {
        let query = KeysetQuery::plan(&CREDENTIALS, params)?;
        self.deadline("list_user_credentials", async {
            let mut tx = self.db.begin(TxMode::ReadOnly).await?;
            let user = require_user(tx.as_mut(), username).await?;
            let rows = tx.list_user_credentials(user.id, &query).await?;
            Ok(paginate(&CREDENTIALS, params, rows))
        })
        .await
    }

    /// Revoke a key pair. Fails with not-found unless `username` owns it.
    #[instrument(skip(self), err)]
    pub async fn delete_credentials(&self, username: &str, access_key_id: &str) -> AuthResult<()> {
        self.deadline("delete_credentials", async {
            let mut tx = self.db.begin(TxMode::ReadWrite).await?;
            let user = require_user(tx.as_mut(), username).await?;
            let rows = tx.delete_credential(user.id, access_key_id).await?;
            expect_deleted(rows, "credential", access_key_id)?;
            tx.commit().await?;
            Ok(())
        })
        .await?;
        self.cache.invalidate_credential(access_key_id).await;
        Ok(())
    }

    // ─────────────────────────────────────────────────────────────────────
    // Token replay guard
    // ─────────────────────────────────────────────────────────────────────

    /// Claim an externally issued token id exactly once.
    ///
    /// Fails with `InvalidToken` when the id was already claimed or the token
    /// has already expired. Expired claims are purged afterwards on a
    /// best-effort basis.
    #[instrument(skip(self), err)]
    pub async fn claim_token_id_once(&self, token_id: &str, expires_at_unix: i64) -> AuthResult<()> {
        let expires_at = DateTime::<Utc>::from_timestamp(expires_at_unix, 0).ok_or_else(|| {
            AuthError::validation("expires_at", expires_at_unix.to_string(), "out of range")
        })?;
        // An already expired claim would be purged right away and could be replayed.
        if expires_at <= Utc::now() {
            return Err(AuthError::InvalidToken {
                token_id: token_id.to_string(),
            });
        }

        let claimed = self
            .deadline("claim_token_id_once", async {
                let mut tx = self.db.begin(TxMode::ReadWrite).await?;
                let inserted = tx.insert_token_if_absent(token_id, expires_at).await?;
                tx.commit().await?;
                Ok(inserted)
            })
            .await;

        if let Err(err) = self.delete_expired_tokens().await {
            error!(error = %err, "failed to delete expired tokens");
        }

        if claimed? {
            Ok(())
        } else {
            Err(AuthError::InvalidToken {
                token_id: token_id.to_string(),
            })
        }
    }

    async fn delete_expired_tokens(&self) -> AuthResult<u64> {
        let deleted = self
            .deadline("delete_expired_tokens", async {
                let mut tx = self.db.begin(TxMode::ReadWrite).await?;
                let deleted = tx.delete_expired_tokens(Utc::now()).await?;
                tx.commit().await?;
                Ok(deleted)
            })
            .await?;
        if deleted > 0 {
            debug!(deleted, "deleted expired tokens");
        }
        Ok(deleted)
    }
}
