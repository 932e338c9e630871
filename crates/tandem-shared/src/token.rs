use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::error::TokenError;
use crate::types::UserId;

// Token signed by the auth service, presented by clients as a bearer token
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionToken {
    pub user_id: UserId,
    pub valid_until: DateTime<Utc>,
    pub signature: Vec<u8>,
}

impl SessionToken {
    /// Sign a token for `user_id` with the issuer key.
    pub fn issue(
        user_id: UserId,
        valid_until: DateTime<Utc>,
        issuer_key: &SigningKey,
    ) -> Self {
        let signature = issuer_key.sign(&signing_payload(&user_id, &valid_until));
        Self {
            user_id,
            valid_until,
            signature: signature.to_bytes().to_vec(),
        }
    }

    /// Check expiry and signature against the issuer public key.
    pub fn verify(&self, issuer_pubkey: &[u8; 32]) -> Result<(), TokenError> {
        if Utc::now() > self.valid_until {
            return Err(TokenError::Expired);
        }

        let verifying_key =
            VerifyingKey::from_bytes(issuer_pubkey).map_err(|_| TokenError::InvalidIssuerKey)?;
        let signature =
            Signature::from_slice(&self.signature).map_err(|_| TokenError::InvalidSignature)?;

        verifying_key
            .verify(&signing_payload(&self.user_id, &self.valid_until), &signature)
            .map_err(|_| TokenError::InvalidSignature)
    }

    /// Bearer form: URL-safe base64 of the JSON token.
    pub fn encode(&self) -> String {
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    pub fn decode(bearer: &str) -> Result<Self, TokenError> {
        let bytes = URL_SAFE_NO_PAD
            .decode(bearer.trim())
            .map_err(|e| TokenError::Malformed(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| TokenError::Malformed(e.to_string()))
    }
}

// payload = user_id (16 bytes) || valid_until (rfc3339)
fn signing_payload(user_id: &UserId, valid_until: &DateTime<Utc>) -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(user_id.0.as_bytes());
    payload.extend_from_slice(valid_until.to_rfc3339().as_bytes());
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use rand::rngs::OsRng;

    #[test]
    fn test_token_valid() {
        let issuer = SigningKey::generate(&mut OsRng);
        let pubkey = issuer.verifying_key().to_bytes();
        let token = SessionToken::issue(UserId::new(), Utc::now() + Duration::hours(1), &issuer);

        let decoded = SessionToken::decode(&token.encode()).unwrap();
        assert_eq!(decoded, token);
        assert!(decoded.verify(&pubkey).is_ok());
    }

    #[test]
    fn test_token_expired() {
        let issuer = SigningKey::generate(&mut OsRng);
        let pubkey = issuer.verifying_key().to_bytes();
        let token = SessionToken::issue(UserId::new(), Utc::now() - Duration::minutes(1), &issuer);

        assert_eq!(token.verify(&pubkey), Err(TokenError::Expired));
    }

    #[test]
    fn test_token_wrong_issuer() {
        let issuer = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let token = SessionToken::issue(UserId::new(), Utc::now() + Duration::hours(1), &issuer);

        assert_eq!(
            token.verify(&other.verifying_key().to_bytes()),
            Err(TokenError::InvalidSignature)
        );
    }

    #[test]
    fn test_token_with_swapped_identity_rejected() {
        let issuer = SigningKey::generate(&mut OsRng);
        let pubkey = issuer.verifying_key().to_bytes();
        let mut token =
            SessionToken::issue(UserId::new(), Utc::now() + Duration::hours(1), &issuer);
        token.user_id = UserId::new();

        assert_eq!(token.verify(&pubkey), Err(TokenError::InvalidSignature));
    }

    #[test]
    fn test_garbage_bearer() {
        assert!(matches!(
            SessionToken::decode("not a token!"),
            Err(TokenError::Malformed(_))
        ));
    }
}
