//! User directory with read-through caching
//!
//! ## Cache Keys
//!
//! - `user:<id>`: public user view, 1 hour
//! - `users:list:<generation>:<page>:<perPage>:<search>`: listing page, 5 minutes
//! - `users:list:generation`: listing generation sentinel, no expiry
//!
//! Every mutation is written to the backend first; only after the backend
//! acknowledges it are the affected keys dropped.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    BackendError, CacheService, ListQuery, Page, RedisStore, RemoteStore, ServiceError, UserView,
    keys,
    read_through::{ListGeneration, read_through},
};

pub const USER_TTL: Duration = Duration::from_secs(3600); // 1 hour
pub const USER_LIST_TTL: Duration = Duration::from_secs(300); // 5 minutes

/// Row of the `usuarios` table
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: String,
    pub name: String,
    pub email: String,
    pub password_hash: String,
    pub role: String,
    pub status: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_login: Option<DateTime<Utc>>,
    #[serde(default)]
    pub login_count: u32,
}

impl UserRecord {
    pub fn view(&self) -> UserView {
        UserView {
            id: self.id.clone(),
            name: self.name.clone(),
            email: self.email.clone(),
            role: self.role.clone(),
            status: self.status.clone(),
        }
    }
}

/// Fields for a new user. The backend hashes `password` and assigns id and status.
#[derive(Debug, Clone, Deserialize)]
pub struct NewUser {
    pub name: String,
    pub email: String,
    pub role: String,
    pub password: String,
}

/// Partial update; `None` leaves a field untouched
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub role: Option<String>,
    pub password: Option<String>,
    pub status: Option<String>,
}

impl UserUpdate {
    fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.email.is_none()
            && self.role.is_none()
            && self.password.is_none()
            && self.status.is_none()
    }
}

/// Authoritative user storage
#[async_trait]
pub trait UserBackend: Send + Sync + 'static {
    async fn find_by_id(&self, id: &str) -> Result<Option<UserRecord>, BackendError>;

    /// Look up by email, skipping the user `exclude_id` when given
    async fn find_by_email(
        &self,
        email: &str,
        exclude_id: Option<&str>,
    ) -> Result<Option<UserRecord>, BackendError>;

    async fn create(&self, user: NewUser) -> Result<UserRecord, BackendError>;

    /// Returns the updated row, or `None` if the user no longer exists
    async fn update(&self, id: &str, changes: UserUpdate)
    -> Result<Option<UserRecord>, BackendError>;

    /// Returns whether a row was deleted
    async fn delete(&self, id: &str) -> Result<bool, BackendError>;

    /// Stamp `last_login` and bump `login_count`
    async fn record_login(&self, id: &str) -> Result<(), BackendError>;

    async fn list(&self, query: &ListQuery) -> Result<Page<UserRecord>, BackendError>;
}

/// User lookups and mutations backed by `B`, cached through a [`CacheService`]
pub struct UserDirectory<B: UserBackend, S: RemoteStore = RedisStore> {
    backend: std::sync::Arc<B>,
    cache: CacheService<S>,
    lists: ListGeneration<S>,
}

impl<B: UserBackend, S: RemoteStore> Clone for UserDirectory<B, S> {
    fn clone(&self) -> Self {
        Self {
            backend: std::sync::Arc::clone(&self.backend),
            cache: self.cache.clone(),
            lists: self.lists.clone(),
        }
    }
}

impl<B: UserBackend, S: RemoteStore> UserDirectory<B, S> {
    pub fn new(backend: B, cache: CacheService<S>) -> Self {
        Self {
            backend: std::sync::Arc::new(backend),
            lists: ListGeneration::new(
                cache.clone(),
                keys::USER_LIST_GENERATION,
                keys::USER_LIST_PREFIX,
            ),
            cache,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Get a user by id
    pub async fn get(&self, id: &str) -> Result<Option<UserView>, ServiceError> {
        let backend = &self.backend;
        read_through(&self.cache, &keys::user(id), USER_TTL, async move {
            Ok::<_, BackendError>(backend.find_by_id(id).await?.map(|u| u.view()))
        })
        .await
    }

    /// Get one page of users
    pub async fn list(&self, query: &ListQuery) -> Result<Page<UserView>, ServiceError> {
        let query = query.normalized();
        let generation = self.lists.current().await?;
        let backend = &self.backend;
        let q = &query;

        let page = read_through(
            &self.cache,
            &keys::user_list(&generation, &query),
            USER_LIST_TTL,
            async move {
                let page = backend.list(q).await?;
                Ok::<_, BackendError>(Some(Page {
                    data: page.data.iter().map(UserRecord::view).collect(),
                    pagination: page.pagination,
                }))
            },
        )
        .await?;

        // The fetch above always yields a page.
        Ok(page.unwrap_or_else(|| Page {
            data: Vec::new(),
            pagination: crate::Pagination::new(0, query.page, query.per_page),
        }))
    }

    pub async fn create(&self, user: NewUser) -> Result<UserView, ServiceError> {
        for (field, value) in [
            ("name", &user.name),
            ("email", &user.email),
            ("role", &user.role),
            ("password", &user.password),
        ] {
            require_non_blank(field, value)?;
        }

        if self.backend.find_by_email(&user.email, None).await?.is_some() {
            return Err(ServiceError::Conflict(format!(
                "email {} already registered",
                user.email
            )));
        }

        let created = self.backend.create(user).await?;
        debug!("Created user {}", created.id);
        self.invalidate_lists().await;
        Ok(created.view())
    }

    pub async fn update(&self, id: &str, changes: UserUpdate) -> Result<UserView, ServiceError> {
        if changes.is_empty() {
            return Err(ServiceError::InvalidInput(
                "send at least one field to update (name, email, role, password or status)"
                    .to_owned(),
            ));
        }
        for (field, value) in [
            ("name", &changes.name),
            ("email", &changes.email),
            ("role", &changes.role),
            ("password", &changes.password),
        ] {
            if let Some(value) = value {
                require_non_blank(field, value)?;
            }
        }

        // Always check against the backend, never the cache.
        let existing = self
            .backend
            .find_by_id(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("user {}", id)))?;

        if let Some(email) = &changes.email
            && *email != existing.email
            && self.backend.find_by_email(email, Some(id)).await?.is_some()
        {
            return Err(ServiceError::Conflict(format!(
                "email {} already used by another user",
                email
            )));
        }

        let updated = self
            .backend
            .update(id, changes)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("user {}", id)))?;

        self.invalidate_user(id, &existing.email).await;
        Ok(updated.view())
    }

    pub async fn delete(&self, id: &str) -> Result<(), ServiceError> {
        let existing = self
            .backend
            .find_by_id(id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("user {}", id)))?;

        if !self.backend.delete(id).await? {
            return Err(ServiceError::NotFound(format!("user {}", id)));
        }

        self.invalidate_user(id, &existing.email).await;
        Ok(())
    }

    /// Drop every cache entry that could hold this user
    async fn invalidate_user(&self, id: &str, email: &str) {
        for key in [keys::user(id), keys::user(email)] {
            if let Err(e) = self.cache.delete(&key).await {
                warn!("Failed to invalidate {}: {}", key, e);
            }
        }
        self.invalidate_lists().await;
    }

    async fn invalidate_lists(&self) {
        if let Err(e) = self.lists.rotate().await {
            warn!("Failed to invalidate user listings: {}", e);
        }
    }
}

fn require_non_blank(field: &str, value: &str) -> Result<(), ServiceError> {
    if value.trim().is_empty() {
        return Err(ServiceError::InvalidInput(format!(
            "{} must not be empty",
            field
        )));
    }
    Ok(())
}
