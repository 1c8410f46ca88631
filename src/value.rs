//! Cached payloads and key layout
//!
//! Every value stored through [`crate::CacheService`] is a [`CacheValue`]. The
//! JSON form carries an explicit `kind` tag so a value written under one
//! namespace can never be silently read back as another.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A value held by either cache tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum CacheValue {
    /// Signed session token (access or refresh)
    Token(String),
    /// Public view of a single user
    User(UserView),
    /// One page of a user listing
    UserPage(Page<UserView>),
    /// A single room
    Room(Room),
    /// One page of a room listing
    RoomPage(Page<Room>),
    /// Current listing generation for a namespace
    Generation(String),
}

impl CacheValue {
    /// Short name of the variant, for logs
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Token(_) => "token",
            Self::User(_) => "user",
            Self::UserPage(_) => "user_page",
            Self::Room(_) => "room",
            Self::RoomPage(_) => "room_page",
            Self::Generation(_) => "generation",
        }
    }
}

/// Types that can be stored as a [`CacheValue`]
pub trait Cacheable: Clone + Send + Sync + 'static {
    fn into_value(self) -> CacheValue;

    /// `None` when the value belongs to another namespace
    fn from_value(value: CacheValue) -> Option<Self>;
}

macro_rules! cacheable {
    ($ty:ty, $variant:ident) => {
        impl Cacheable for $ty {
            fn into_value(self) -> CacheValue {
                CacheValue::$variant(self)
            }

            fn from_value(value: CacheValue) -> Option<Self> {
                match value {
                    CacheValue::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

cacheable!(UserView, User);
cacheable!(Page<UserView>, UserPage);
cacheable!(Room, Room);
cacheable!(Page<Room>, RoomPage);

/// User as exposed to API consumers (no password hash)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserView {
    pub id: String,
    #[serde(rename = "nome")]
    pub name: String,
    pub email: String,
    #[serde(rename = "perfil")]
    pub role: String,
    pub status: String,
}

/// Room ("sala") record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    #[serde(rename = "titulo")]
    pub title: String,
    #[serde(rename = "descricao")]
    pub description: String,
    /// Stored upload file name
    #[serde(rename = "foto", default)]
    pub photo: Option<String>,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Room {
    /// Public URL of the room photo, if one was uploaded
    pub fn image_url(&self) -> Option<String> {
        self.photo.as_ref().map(|p| format!("/uploads/{}", p))
    }
}

/// Listing request parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListQuery {
    pub page: u32,
    pub per_page: u32,
    #[serde(default)]
    pub search: String,
}

impl Default for ListQuery {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 10,
            search: String::new(),
        }
    }
}

impl ListQuery {
    pub fn new(page: u32, per_page: u32, search: impl Into<String>) -> Self {
        Self {
            page,
            per_page,
            search: search.into(),
        }
    }

    /// Zero page or page size is treated as the default.
    pub fn normalized(&self) -> Self {
        let defaults = Self::default();
        Self {
            page: if self.page == 0 { defaults.page } else { self.page },
            per_page: if self.per_page == 0 {
                defaults.per_page
            } else {
                self.per_page
            },
            search: self.search.trim().to_owned(),
        }
    }
}

/// One page of a listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub pagination: Pagination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub total: u64,
    pub page: u32,
    pub per_page: u32,
    pub total_pages: u64,
}

impl Pagination {
    pub fn new(total: u64, page: u32, per_page: u32) -> Self {
        let total_pages = if per_page == 0 {
            0
        } else {
            total.div_ceil(u64::from(per_page))
        };
        Self {
            total,
            page,
            per_page,
            total_pages,
        }
    }
}

/// Key builders for every cache namespace
pub mod keys {
    use crate::value::ListQuery;

    pub const ACCESS_TOKEN_PREFIX: &str = "token:";
    pub const REFRESH_TOKEN_PREFIX: &str = "refresh:";

    pub const USER_LIST_PREFIX: &str = "users:list:";
    pub const ROOM_LIST_PREFIX: &str = "salas:list:";

    pub const USER_LIST_GENERATION: &str = "users:list:generation";
    pub const ROOM_LIST_GENERATION: &str = "salas:list:generation";

    pub fn user(id: &str) -> String {
        format!("user:{}", id)
    }

    pub fn user_list(generation: &str, query: &ListQuery) -> String {
        format!(
            "{}{}:{}:{}:{}",
            USER_LIST_PREFIX, generation, query.page, query.per_page, query.search
        )
    }

    pub fn room(id: &str) -> String {
        format!("sala:{}", id)
    }

    pub fn room_list(generation: &str, query: &ListQuery) -> String {
        format!(
            "{}{}:{}:{}:{}",
            ROOM_LIST_PREFIX, generation, query.page, query.per_page, query.search
        )
    }
}
