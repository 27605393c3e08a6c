use chrono::{Duration, Utc};
use jsonwebtoken::{
    decode, encode, Algorithm, DecodingKey, EncodingKey, Header, TokenData, Validation,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::JwtConfig;
use crate::models::{Identity, ParticipantId, RoomId, UserId};
use crate::{Error, Result};

/// JWT claims carried by participant tokens
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Claims {
    /// Absent for anonymous guests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<UserId>,
    /// Set once the holder has joined a room
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub participant_id: Option<ParticipantId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<RoomId>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub display_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub email: String,
    /// "presenter" | "admin" | "anonymous"
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub is_anonymous: bool,
    #[serde(default)]
    pub is_room_owner: bool,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

impl Claims {
    /// Convert into a connection identity.
    ///
    /// Only tokens scoped to a room participant can open a realtime session.
    pub fn into_identity(self) -> Result<Identity> {
        let room_id = self
            .room_id
            .ok_or_else(|| Error::InvalidInput("Token is not scoped to a room".to_string()))?;
        let participant_id = self.participant_id.ok_or_else(|| {
            Error::InvalidInput("Token does not belong to a room participant".to_string())
        })?;

        let display_name = if self.display_name.is_empty() {
            self.username
        } else {
            self.display_name
        };

        Ok(Identity {
            user_id: self.user_id,
            room_id,
            participant_id,
            display_name,
            is_anonymous: self.is_anonymous,
            is_room_owner: self.is_room_owner,
        })
    }
}

/// Turns a raw token into an identity
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Identity>;
}

/// JWT service for signing and verifying HS256 participant tokens
#[derive(Clone)]
pub struct JwtService {
    encoding_key: Arc<EncodingKey>,
    decoding_key: Arc<DecodingKey>,
    token_duration: Duration,
    leeway_seconds: u64,
}

impl std::fmt::Debug for JwtService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtService")
            .field("algorithm", &Algorithm::HS256)
            .field("token_duration", &self.token_duration)
            .finish_non_exhaustive()
    }
}

impl JwtService {
    pub fn new(secret: &[u8]) -> Result<Self> {
        if secret.is_empty() {
            return Err(Error::Internal("JWT secret must not be empty".to_string()));
        }

        Ok(Self {
            encoding_key: Arc::new(EncodingKey::from_secret(secret)),
            decoding_key: Arc::new(DecodingKey::from_secret(secret)),
            token_duration: Duration::hours(24),
            leeway_seconds: 60,
        })
    }

    pub fn from_config(config: &JwtConfig) -> Result<Self> {
        let mut service = Self::new(config.secret.as_bytes())?;
        service.token_duration = Duration::hours(
            i64::try_from(config.token_duration_hours)
                .map_err(|_| Error::InvalidInput("jwt.token_duration_hours is too large".into()))?,
        );
        service.leeway_seconds = config.leeway_seconds;
        Ok(service)
    }

    /// Sign claims as-is
    pub fn sign(&self, claims: &Claims) -> Result<String> {
        encode(&Header::new(Algorithm::HS256), claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("Failed to sign token: {e}")))
    }

    /// Issue a token for a room participant, stamping `iat` and `exp`
    pub fn issue_for(&self, identity: &Identity, role: &str) -> Result<String> {
        let now = Utc::now();
        let claims = Claims {
            user_id: identity.user_id,
            participant_id: Some(identity.participant_id),
            room_id: Some(identity.room_id),
            display_name: identity.display_name.clone(),
            role: role.to_string(),
            is_anonymous: identity.is_anonymous,
            is_room_owner: identity.is_room_owner,
            iat: now.timestamp(),
            exp: (now + self.token_duration).timestamp(),
            ..Claims::default()
        };
        self.sign(&claims)
    }

    /// Verify a token and extract claims
    pub fn verify_token(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_nbf = false;
        validation.leeway = self.leeway_seconds;
        validation.set_required_spec_claims(&["exp"]);

        let token_data: TokenData<Claims> = decode(token, &self.decoding_key, &validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    Error::Authentication("Token expired".to_string())
                }
                jsonwebtoken::errors::ErrorKind::InvalidToken => {
                    Error::Authentication("Invalid token".to_string())
                }
                jsonwebtoken::errors::ErrorKind::InvalidSignature => {
                    Error::Authentication("Invalid token signature".to_string())
                }
                _ => Error::Authentication(format!("Token verification failed: {e}")),
            })?;

        Ok(token_data.claims)
    }
}

impl TokenVerifier for JwtService {
    fn verify(&self, token: &str) -> Result<Identity> {
        self.verify_token(token)?.into_identity()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity {
            user_id: Some(UserId::new(9)),
            room_id: RoomId::new(1),
            participant_id: ParticipantId::new(12),
            display_name: "Dana".to_string(),
            is_anonymous: false,
            is_room_owner: true,
        }
    }

    #[test]
    fn test_issue_and_verify() {
        let service = JwtService::new(b"secret").unwrap();
        let token = service.issue_for(&identity(), "presenter").unwrap();

        let verified = service.verify(&token).unwrap();
        assert_eq!(verified, identity());

        let claims = service.verify_token(&token).unwrap();
        assert_eq!(claims.role, "presenter");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_wrong_secret_is_rejected() {
        let issuer = JwtService::new(b"secret").unwrap();
        let verifier = JwtService::new(b"other").unwrap();
        let token = issuer.issue_for(&identity(), "presenter").unwrap();

        assert!(matches!(verifier.verify(&token), Err(Error::Authentication(_))));
    }

    #[test]
    fn test_expired_token_is_rejected() {
        let service = JwtService::new(b"secret").unwrap();
        let now = Utc::now().timestamp();
        let claims = Claims {
            room_id: Some(RoomId::new(1)),
            participant_id: Some(ParticipantId::new(2)),
            iat: now - 7200,
            exp: now - 3600,
            ..Claims::default()
        };
        let token = service.sign(&claims).unwrap();

        match service.verify(&token) {
            Err(Error::Authentication(msg)) => assert_eq!(msg, "Token expired"),
            other => panic!("expected expiry error, got {other:?}"),
        }
    }

    #[test]
    fn test_token_without_room_scope() {
        let service = JwtService::new(b"secret").unwrap();
        let now = Utc::now().timestamp();
        let claims = Claims {
            user_id: Some(UserId::new(3)),
            username: "presenter".to_string(),
            iat: now,
            exp: now + 60,
            ..Claims::default()
        };
        let token = service.sign(&claims).unwrap();

        assert!(matches!(service.verify(&token), Err(Error::InvalidInput(_))));
    }

    #[test]
    fn test_display_name_falls_back_to_username() {
        let claims = Claims {
            room_id: Some(RoomId::new(1)),
            participant_id: Some(ParticipantId::new(2)),
            username: "alice".to_string(),
            ..Claims::default()
        };
        assert_eq!(claims.into_identity().unwrap().display_name, "alice");
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(JwtService::new(b"").is_err());
    }
}
