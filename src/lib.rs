//! backoffice-cache - Dual-tier cache and session layer for the back-office API
//!
//! This library provides:
//! - A cache service that keeps a Redis store and an in-process shadow map in
//!   step, degrading to the shadow whenever Redis is unreachable
//! - A session store enforcing one active access and refresh token per user
//! - Token issuing, verification, refresh and logout on top of the session store
//! - Read-through user and room services with generation-based listing
//!   invalidation
//!
//! Redis failures never reach callers. Reads and writes keep working against
//! the shadow while a supervisor task reconnects with capped exponential
//! backoff.

pub mod auth;
mod config;
mod error;
mod read_through;
pub mod remote;
pub mod rooms;
mod service;
pub mod session;
mod shadow;
#[cfg(test)]
mod testing;
pub mod users;
mod value;

pub use auth::{
    Authenticator, Claims, IssuedTokens, PasswordVerifier, Principal, bearer_token, require_admin,
};
pub use config::{AuthConfig, CacheConfig};
pub use error::{AuthError, BackendError, CacheError, ServiceError};
pub use remote::{LinkState, LinkStatus, Liveness, RedisStore, RemoteStore};
pub use rooms::{RoomBackend, RoomCatalog};
pub use service::{CacheService, CacheStats, CacheStatus, HealthReport};
pub use session::{SessionStore, TokenKind};
pub use shadow::LocalShadow;
pub use users::{UserBackend, UserDirectory, UserRecord};
pub use value::{CacheValue, Cacheable, ListQuery, Page, Pagination, Room, UserView, keys};

// Re-export async_trait for backend implementors
pub use async_trait::async_trait;
