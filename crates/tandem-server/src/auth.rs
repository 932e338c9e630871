//! Session token verification and the authenticated-user extractor.
//!
//! Tokens are issued by the external auth service and checked against its
//! Ed25519 public key. Successful verifications are cached per bearer string
//! until the token expires, so repeat requests skip the signature check.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::{FromRef, FromRequestParts, Query};
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tandem_shared::{SessionToken, TokenError, UserId};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::ServerError;

#[derive(Debug, Clone, Copy)]
struct CachedIdentity {
    user_id: UserId,
    valid_until: DateTime<Utc>,
}

impl CachedIdentity {
    fn is_fresh(&self) -> bool {
        Utc::now() < self.valid_until
    }
}

#[derive(Clone)]
pub struct TokenVerifier {
    issuer_pubkey: [u8; 32],
    cache: Arc<RwLock<HashMap<String, CachedIdentity>>>,
}

impl TokenVerifier {
    pub fn new(issuer_pubkey: [u8; 32]) -> Self {
        Self {
            issuer_pubkey,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Resolve a bearer string to the user it was issued for.
    pub async fn verify(&self, bearer: &str) -> Result<UserId, TokenError> {
        {
            let cache = self.cache.read().await;
            if let Some(entry) = cache.get(bearer) {
                if entry.is_fresh() {
                    return Ok(entry.user_id);
                }
            }
        }

        // The all-zero development key must never authenticate anyone.
        if self.issuer_pubkey == [0u8; 32] {
            return Err(TokenError::InvalidIssuerKey);
        }

        let token = SessionToken::decode(bearer)?;
        token.verify(&self.issuer_pubkey)?;

        let mut cache = self.cache.write().await;
        cache.insert(
            bearer.to_string(),
            CachedIdentity {
                user_id: token.user_id,
                valid_until: token.valid_until,
            },
        );
        debug!(user = %token.user_id.short(), until = %token.valid_until, "session token verified");
        Ok(token.user_id)
    }

    /// Evict cached identities whose token has expired.
    pub async fn purge_expired(&self) {
        let mut cache = self.cache.write().await;
        let before = cache.len();
        cache.retain(|_, entry| entry.is_fresh());
        let removed = before - cache.len();
        if removed > 0 {
            debug!(removed, "purged expired session tokens");
        }
    }
}

/// The authenticated caller of a request.
///
/// Reads `Authorization: Bearer <token>`, falling back to a `token` query
/// parameter for WebSocket upgrades from clients that cannot set headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthUser(pub UserId);

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

fn bearer_from_parts(parts: &Parts) -> Option<String> {
    let header = parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string());
    if header.is_some() {
        return header;
    }

    Query::<TokenQuery>::try_from_uri(&parts.uri)
        .ok()
        .and_then(|Query(q)| q.token)
}

#[axum::async_trait]
impl<S> FromRequestParts<S> for AuthUser
where
    TokenVerifier: FromRef<S>,
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Some(bearer) = bearer_from_parts(parts) else {
            return Err(ServerError::Unauthenticated("missing bearer token".into()));
        };

        let verifier = TokenVerifier::from_ref(state);
        match verifier.verify(&bearer).await {
            Ok(user) => Ok(AuthUser(user)),
            Err(e) => {
                warn!(error = %e, path = %parts.uri.path(), "rejected session token");
                Err(e.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;
    use chrono::Duration;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn issuer() -> (SigningKey, TokenVerifier) {
        let key = SigningKey::generate(&mut OsRng);
        let verifier = TokenVerifier::new(key.verifying_key().to_bytes());
        (key, verifier)
    }

    #[tokio::test]
    async fn test_verify_valid_token() {
        let (key, verifier) = issuer();
        let user = UserId::new();
        let bearer = SessionToken::issue(user, Utc::now() + Duration::hours(1), &key).encode();

        assert_eq!(verifier.verify(&bearer).await, Ok(user));
        // Served from cache the second time.
        assert_eq!(verifier.verify(&bearer).await, Ok(user));
        assert_eq!(verifier.cache.read().await.len(), 1);
    }

    #[tokio::test]
    async fn test_verify_rejects_expired_and_foreign_tokens() {
        let (key, verifier) = issuer();
        let expired =
            SessionToken::issue(UserId::new(), Utc::now() - Duration::minutes(1), &key).encode();
        assert_eq!(verifier.verify(&expired).await, Err(TokenError::Expired));

        let stranger = SigningKey::generate(&mut OsRng);
        let forged =
            SessionToken::issue(UserId::new(), Utc::now() + Duration::hours(1), &stranger).encode();
        assert_eq!(
            verifier.verify(&forged).await,
            Err(TokenError::InvalidSignature)
        );

        assert!(matches!(
            verifier.verify("not a token").await,
            Err(TokenError::Malformed(_))
        ));
    }

    #[tokio::test]
    async fn test_zero_key_rejects_everything() {
        let key = SigningKey::generate(&mut OsRng);
        let bearer =
            SessionToken::issue(UserId::new(), Utc::now() + Duration::hours(1), &key).encode();
        let verifier = TokenVerifier::new([0u8; 32]);
        assert_eq!(
            verifier.verify(&bearer).await,
            Err(TokenError::InvalidIssuerKey)
        );
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (key, verifier) = issuer();
        let bearer =
            SessionToken::issue(UserId::new(), Utc::now() + Duration::hours(1), &key).encode();
        verifier.verify(&bearer).await.unwrap();

        verifier.cache.write().await.values_mut().for_each(|entry| {
            entry.valid_until = Utc::now() - Duration::seconds(1);
        });
        verifier.purge_expired().await;
        assert!(verifier.cache.read().await.is_empty());
    }

    #[test]
    fn test_bearer_from_header_or_query() {
        let (parts, _) = Request::builder()
            .uri("/api/calls/active")
            .header(AUTHORIZATION, "Bearer abc")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(bearer_from_parts(&parts).as_deref(), Some("abc"));

        let (parts, _) = Request::builder()
            .uri("/ws?token=xyz")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(bearer_from_parts(&parts).as_deref(), Some("xyz"));

        let (parts, _) = Request::builder().uri("/ws").body(()).unwrap().into_parts();
        assert_eq!(bearer_from_parts(&parts), None);
    }
}
