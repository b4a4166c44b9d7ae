//! Client token service.
//!
//! Tokens are HS256 JWTs carrying [`UserClaims`]. Two read paths exist:
//!
//! - [`TokenService::decode`] checks the signature but not expiry. The sweep
//!   uses it to look at tokens that are about to lapse (or just have).
//! - [`TokenService::verify`] also enforces `exp`.
//!
//! # Security
//!
//! - Tokens are size-checked before parsing
//! - Error messages are generic; details are logged at debug level

use crate::errors::GatewayError;
use chrono::Utc;
use common::jwt::{check_token_size, TokenUser, UserClaims};
use common::secret::{ExposeSecret, SecretString};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};

const INVALID_TOKEN: &str = "The access token is invalid or expired";

/// Token operations required by the gateway core.
pub trait TokenService: Send + Sync {
    /// Decode a signed token without enforcing expiry.
    fn decode(&self, token: &str) -> Result<UserClaims, GatewayError>;

    /// Decode and fully validate a token, including expiry.
    fn verify(&self, token: &str) -> Result<UserClaims, GatewayError>;

    /// Issue a new token for `user` valid for `ttl_seconds`.
    fn issue(&self, user: &TokenUser, ttl_seconds: i64) -> Result<String, GatewayError>;
}

/// HS256 token service keyed by the gateway signing secret.
pub struct JwtTokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtTokenService {
    pub fn new(signing_secret: &SecretString) -> Self {
        let secret = signing_secret.expose_secret().as_bytes();
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
        }
    }

    fn decode_with(&self, token: &str, validate_exp: bool) -> Result<UserClaims, GatewayError> {
        check_token_size(token).map_err(|_| GatewayError::InvalidToken(INVALID_TOKEN.to_string()))?;

        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = validate_exp;
        validation.leeway = 0;

        let data = decode::<UserClaims>(token, &self.decoding_key, &validation).map_err(|e| {
            tracing::debug!(target: "gw.auth.tokens", error = %e, "Token decode failed");
            GatewayError::InvalidToken(INVALID_TOKEN.to_string())
        })?;

        Ok(data.claims)
    }
}

impl TokenService for JwtTokenService {
    fn decode(&self, token: &str) -> Result<UserClaims, GatewayError> {
        self.decode_with(token, false)
    }

    fn verify(&self, token: &str) -> Result<UserClaims, GatewayError> {
        self.decode_with(token, true)
    }

    fn issue(&self, user: &TokenUser, ttl_seconds: i64) -> Result<String, GatewayError> {
        if ttl_seconds <= 0 {
            return Err(GatewayError::InvalidArgument(
                "token ttl must be positive".to_string(),
            ));
        }
        let claims = UserClaims::for_user(user.clone(), Utc::now(), ttl_seconds);
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key).map_err(|e| {
            tracing::error!(target: "gw.auth.tokens", error = %e, "Token signing failed");
            GatewayError::InvalidToken(format!("token signing failed: {e}"))
        })
    }
}
