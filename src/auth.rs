//! Token issuing and verification
//!
//! A token is accepted only if its signature and expiry check out *and* it is
//! the exact token recorded for its user in the [`SessionStore`]. The first
//! check is local and cheap; the session lookup happens only after it passes.

use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    AuthConfig, AuthError, CacheError, CacheService, RedisStore, RemoteStore, SessionStore, TokenKind,
    users::{UserBackend, UserRecord},
};

pub const ADMIN_ROLE: &str = "Administrador";

/// Access token claims
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// User id
    pub id: String,
    pub email: String,
    #[serde(rename = "perfil")]
    pub role: String,
    pub iat: u64,
    pub exp: u64,
    /// Unique per issued token
    pub jti: String,
}

impl Claims {
    pub fn is_admin(&self) -> bool {
        self.role == ADMIN_ROLE
    }
}

/// Refresh token claims; only identify the user
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshClaims {
    pub id: String,
    pub iat: u64,
    pub exp: u64,
    pub jti: String,
}

/// Identity a token is issued for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub id: String,
    pub email: String,
    pub role: String,
}

impl From<&UserRecord> for Principal {
    fn from(user: &UserRecord) -> Self {
        Self {
            id: user.id.clone(),
            email: user.email.clone(),
            role: user.role.clone(),
        }
    }
}

/// Checks a plaintext password against a stored hash
///
/// The hashing scheme (bcrypt in the existing `usuarios` table) is supplied
/// by the caller.
pub trait PasswordVerifier: Send + Sync {
    fn verify(&self, password: &str, hash: &str) -> bool;
}

/// Tokens handed out on login
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IssuedTokens {
    pub token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds
    pub expires_in: u64,
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
///
/// Cookie and query-string token sources belong to the HTTP layer.
pub fn bearer_token(header: Option<&str>) -> Option<&str> {
    let value = header?.trim();
    let (scheme, token) = value.split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

/// Require the administrator role
pub fn require_admin(claims: &Claims) -> Result<(), AuthError> {
    if claims.is_admin() {
        Ok(())
    } else {
        Err(AuthError::Forbidden)
    }
}

/// Issues, verifies and revokes session tokens
pub struct Authenticator<S: RemoteStore = RedisStore> {
    config: AuthConfig,
    sessions: SessionStore<S>,
}

impl<S: RemoteStore> Clone for Authenticator<S> {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
            sessions: self.sessions.clone(),
        }
    }
}

impl<S: RemoteStore> Authenticator<S> {
    pub fn new(config: AuthConfig, cache: CacheService<S>) -> Self {
        Self {
            config,
            sessions: SessionStore::new(cache),
        }
    }

    pub fn sessions(&self) -> &SessionStore<S> {
        &self.sessions
    }

    /// Sign an access token and record it as the user's only valid one
    pub async fn generate_token(&self, user: &Principal) -> Result<String, AuthError> {
        let (iat, exp) = validity_window(self.config.access_ttl.as_secs());
        let claims = Claims {
            id: user.id.clone(),
            email: user.email.clone(),
            role: user.role.clone(),
            iat,
            exp,
            jti: uuid::Uuid::new_v4().to_string(),
        };
        let token = sign(&claims, &self.config.access_secret)?;

        self.record(&user.id, TokenKind::Access, &token, self.config.access_ttl)
            .await?;
        Ok(token)
    }

    /// Sign a refresh token and record it as the user's only valid one
    pub async fn generate_refresh_token(&self, user_id: &str) -> Result<String, AuthError> {
        let (iat, exp) = validity_window(self.config.refresh_ttl.as_secs());
        let claims = RefreshClaims {
            id: user_id.to_owned(),
            iat,
            exp,
            jti: uuid::Uuid::new_v4().to_string(),
        };
        let token = sign(&claims, &self.config.refresh_secret)?;

        self.record(user_id, TokenKind::Refresh, &token, self.config.refresh_ttl)
            .await?;
        Ok(token)
    }

    /// Check an access token, returning the reason when it is rejected
    pub async fn authenticate(&self, token: &str) -> Result<Claims, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let claims: Claims = self.decode(token, &self.config.access_secret, true)?;

        if !self
            .sessions
            .matches(&claims.id, TokenKind::Access, token)
            .await?
        {
            debug!("Access token for user {} is not the active session", claims.id);
            return Err(AuthError::Revoked);
        }
        Ok(claims)
    }

    /// Claims of a valid, still-active access token
    pub async fn verify_token(&self, token: &str) -> Option<Claims> {
        match self.authenticate(token).await {
            Ok(claims) => Some(claims),
            Err(e) => {
                debug!("Token rejected: {}", e);
                None
            }
        }
    }

    /// Revoke the user's access token before it expires
    pub async fn invalidate_token(&self, user_id: &str) -> Result<(), AuthError> {
        self.sessions
            .invalidate_token(user_id, TokenKind::Access)
            .await?;
        Ok(())
    }

    /// Check credentials and open a session.
    ///
    /// Unknown emails and wrong passwords fail the same way. A successful
    /// login is recorded on the user before tokens are issued.
    pub async fn login<B, V>(
        &self,
        email: &str,
        password: &str,
        users: &B,
        verifier: &V,
    ) -> Result<(UserRecord, IssuedTokens), AuthError>
    where
        B: UserBackend,
        V: PasswordVerifier + ?Sized,
    {
        if email.trim().is_empty() || password.is_empty() {
            return Err(AuthError::InvalidCredentials);
        }

        let user = users
            .find_by_email(email, None)
            .await
            .map_err(AuthError::Backend)?
            .ok_or(AuthError::InvalidCredentials)?;

        if !verifier.verify(password, &user.password_hash) {
            debug!("Wrong password for user {}", user.id);
            return Err(AuthError::InvalidCredentials);
        }

        users
            .record_login(&user.id)
            .await
            .map_err(AuthError::Backend)?;

        let tokens = self.issue_session(&Principal::from(&user)).await?;
        Ok((user, tokens))
    }

    /// Issue an access/refresh pair for an already-authenticated user
    pub async fn issue_session(&self, user: &Principal) -> Result<IssuedTokens, AuthError> {
        let token = self.generate_token(user).await?;
        let refresh_token = self.generate_refresh_token(&user.id).await?;
        debug!("Issued session for user {}", user.id);
        Ok(IssuedTokens {
            token,
            refresh_token,
            expires_in: self.config.access_ttl.as_secs(),
        })
    }

    /// Exchange a refresh token for a new access token.
    ///
    /// The refresh token must verify, be the active refresh session, and name
    /// a user that still exists. The previous access token stops verifying.
    pub async fn refresh<B: UserBackend>(
        &self,
        refresh_token: &str,
        users: &B,
    ) -> Result<String, AuthError> {
        if refresh_token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let claims: RefreshClaims = self.decode(refresh_token, &self.config.refresh_secret, true)?;

        if !self
            .sessions
            .matches(&claims.id, TokenKind::Refresh, refresh_token)
            .await?
        {
            return Err(AuthError::Revoked);
        }

        let user = users
            .find_by_id(&claims.id)
            .await
            .map_err(AuthError::Backend)?
            .ok_or(AuthError::UnknownUser)?;

        self.generate_token(&Principal::from(&user)).await
    }

    /// End the session named by either or both tokens.
    ///
    /// Signatures are checked but expiry is not, so an expired token can still
    /// be used to log out.
    pub async fn logout(
        &self,
        access_token: Option<&str>,
        refresh_token: Option<&str>,
    ) -> Result<(), AuthError> {
        let access_token = access_token.filter(|t| !t.is_empty());
        let refresh_token = refresh_token.filter(|t| !t.is_empty());
        if access_token.is_none() && refresh_token.is_none() {
            return Err(AuthError::MissingToken);
        }

        if let Some(token) = access_token {
            let claims: Claims = self.decode(token, &self.config.access_secret, false)?;
            self.end(&claims.id, TokenKind::Access, token).await?;
        }
        if let Some(token) = refresh_token {
            let claims: RefreshClaims = self.decode(token, &self.config.refresh_secret, false)?;
            self.end(&claims.id, TokenKind::Refresh, token).await?;
        }
        Ok(())
    }

    /// Drop the record only if `token` is still the active one, so a
    /// superseded token cannot end the newer session.
    async fn end(&self, user_id: &str, kind: TokenKind, token: &str) -> Result<(), AuthError> {
        if self.sessions.matches(user_id, kind, token).await? {
            self.sessions.invalidate_token(user_id, kind).await?;
            debug!("{} session of user {} ended", kind, user_id);
        } else {
            debug!("Stale {} token for user {}; session left in place", kind, user_id);
        }
        Ok(())
    }

    /// Write a session record. A write rejected by a live Redis is an error:
    /// Redis would otherwise keep answering with the previous token.
    async fn record(
        &self,
        user_id: &str,
        kind: TokenKind,
        token: &str,
        ttl: std::time::Duration,
    ) -> Result<(), AuthError> {
        if self.sessions.set_token(user_id, kind, token, ttl).await? {
            Ok(())
        } else {
            warn!("Failed to record {} token for user {}", kind, user_id);
            Err(AuthError::Cache(CacheError::Unavailable))
        }
    }

    fn decode<T: for<'de> Deserialize<'de>>(
        &self,
        token: &str,
        secret: &str,
        check_exp: bool,
    ) -> Result<T, AuthError> {
        let mut validation = Validation::default();
        validation.leeway = self.config.leeway.as_secs();
        validation.validate_exp = check_exp;
        let data = decode::<T>(
            token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &validation,
        )?;
        Ok(data.claims)
    }
}

/// `(iat, exp)` for a token issued now
fn validity_window(ttl_secs: u64) -> (u64, u64) {
    let now = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0);
    (now, now.saturating_add(ttl_secs))
}

fn sign<T: Serialize>(claims: &T, secret: &str) -> Result<String, AuthError> {
    encode(
        &Header::default(),
        claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| AuthError::Signing(e.to_string()))
}
