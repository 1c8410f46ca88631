//! Room ("sala") catalog with read-through caching
//!
//! Same layout as the user directory: `sala:<id>` for 1 hour, listing pages
//! under `salas:list:<generation>:...` for 5 minutes.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::{
    BackendError, CacheService, ListQuery, Page, Pagination, RedisStore, RemoteStore, Room,
    ServiceError, keys,
    read_through::{ListGeneration, read_through},
};

pub const ROOM_TTL: Duration = Duration::from_secs(3600);
pub const ROOM_LIST_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Deserialize)]
pub struct NewRoom {
    pub title: String,
    pub description: String,
    /// File name assigned by the upload handler
    pub photo: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoomUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub photo: Option<String>,
}

/// Authoritative room storage
#[async_trait]
pub trait RoomBackend: Send + Sync + 'static {
    async fn find_by_id(&self, id: &str) -> Result<Option<Room>, BackendError>;

    async fn find_by_title(
        &self,
        title: &str,
        exclude_id: Option<&str>,
    ) -> Result<Option<Room>, BackendError>;

    async fn create(&self, room: NewRoom) -> Result<Room, BackendError>;

    async fn update(&self, id: &str, changes: RoomUpdate) -> Result<Option<Room>, BackendError>;

    async fn delete(&self, id: &str) -> Result<bool, BackendError>;

    async fn list(&self, query: &ListQuery) -> Result<Page<Room>, BackendError>;
}

pub struct RoomCatalog<B: RoomBackend, S: RemoteStore = RedisStore> {
    backend: Arc<B>,
    cache: CacheService<S>,
    lists: ListGeneration<S>,
}

impl<B: RoomBackend, S: RemoteStore> Clone for RoomCatalog<B, S> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            cache: self.cache.clone(),
            lists: self.lists.clone(),
        }
    }
}

impl<B: RoomBackend, S: RemoteStore> RoomCatalog<B, S> {
    pub fn new(backend: B, cache: CacheService<S>) -> Self {
        Self {
            backend: Arc::new(backend),
            lists: ListGeneration::new(
                cache.clone(),
                keys::ROOM_LIST_GENERATION,
                keys::ROOM_LIST_PREFIX,
            ),
            cache,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub async fn get(&self, id: &str) -> Result<Option<Room>, ServiceError> {
        let backend = &self.backend;
        read_through(&self.cache, &keys::room(id), ROOM_TTL, async move {
            backend.find_by_id(id).await
        })
        .await
    }

    pub async fn list(&self, query: &ListQuery) -> Result<Page<Room>, ServiceError> {
        let query = query.normalized();
        let generation = self.lists.current().await?;
        let backend = &self.backend;
        let q = &query;

        let page = read_through(
            &self.cache,
            &keys::room_list(&generation, &query),
            ROOM_LIST_TTL,
            async move { backend.list(q).await.map(Some) },
        )
        .await?;

        Ok(page.unwrap_or_else(|| Page {
            data: Vec::new(),
            pagination: Pagination::new(0, query.page, query.per_page),
        }))
    }

    pub async fn create(&self, room: NewRoom) -> Result<Room, ServiceError> {
        require_non_blank("title", &room.title)?;
        require_non_blank("description", &room.description)?;

        if self.backend.find_by_title(&room.title, None).await?.is_some() {
            return Err(ServiceError::Conflict(format!(
                "room titled {:?} already exists",
                room.title
            )));
        }

        let created = self.backend.create(room).await?;
        debug!("Created room {}", created.id);
        self.invalidate(None).await;
        Ok(created)
    }

    pub async fn update(&self, id: &str, changes: RoomUpdate) -> Result<Room, ServiceError> {
        if changes.title.is_none() && changes.description.is_none() && changes.photo.is_none() {
            return Err(ServiceError::InvalidInput(
                "send at least one field to update (title, description or photo)".to_owned(),
            ));
        }
        if let Some(title) = &changes.title {
            require_non_blank("title", title)?;
            if self.backend.find_by_title(title, Some(id)).await?.is_some() {
                return Err(ServiceError::Conflict(format!(
                    "room titled {:?} already exists",
                    title
                )));
            }
        }
        if let Some(description) = &changes.description {
            require_non_blank("description", description)?;
        }

        let updated = self
            .backend
            .update(id, changes)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("room {}", id)))?;

        self.invalidate(Some(id)).await;
        Ok(updated)
    }

    pub async fn delete(&self, id: &str) -> Result<(), ServiceError> {
        if !self.backend.delete(id).await? {
            return Err(ServiceError::NotFound(format!("room {}", id)));
        }
        self.invalidate(Some(id)).await;
        Ok(())
    }

    async fn invalidate(&self, id: Option<&str>) {
        if let Some(id) = id {
            let key = keys::room(id);
            if let Err(e) = self.cache.delete(&key).await {
                warn!("Failed to invalidate {}: {}", key, e);
            }
        }
        if let Err(e) = self.lists.rotate().await {
            warn!("Failed to invalidate room listings: {}", e);
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
