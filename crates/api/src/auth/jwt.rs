//! HS256 token generation and validation.
//!
//! Every claim is optional. A token without `exp` never expires; a token
//! whose `exp` lies in the past is rejected.

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Claims carried by an admin token.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct Claims {
    /// Free-form name of whoever the token was minted for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Expiration time (UTC Unix timestamp).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    /// Issued-at time (UTC Unix timestamp).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

/// Configuration for token generation and validation.
#[derive(Debug, Clone)]
pub struct JwtConfig {
    /// HMAC-SHA256 secret used to sign and verify tokens.
    pub secret: String,
    /// Lifetime of minted tokens in minutes (default: 60).
    pub token_expiry_mins: i64,
}

/// Default lifetime of minted tokens in minutes.
const DEFAULT_TOKEN_EXPIRY_MINS: i64 = 60;

/// `JWT_SECRET` is unset or empty.
#[derive(Debug, thiserror::Error)]
#[error("JWT_SECRET must be set to a non-empty value")]
pub struct MissingJwtSecret;

impl JwtConfig {
    /// Load token configuration from environment variables.
    ///
    /// | Env Var              | Required | Default |
    /// |----------------------|----------|---------|
    /// | `JWT_SECRET`         | **yes**  | --      |
    /// | `JWT_EXPIRY_MINS`    | no       | `60`    |
    ///
    /// # Panics
    ///
    /// Panics if `JWT_EXPIRY_MINS` is set but not a valid number.
    pub fn from_env() -> Result<Self, MissingJwtSecret> {
        let secret = std::env::var("JWT_SECRET")
            .ok()
            .filter(|s| !s.is_empty())
            .ok_or(MissingJwtSecret)?;

        let token_expiry_mins: i64 = std::env::var("JWT_EXPIRY_MINS")
            .unwrap_or_else(|_| DEFAULT_TOKEN_EXPIRY_MINS.to_string())
            .parse()
            .expect("JWT_EXPIRY_MINS must be a valid i64");

        Ok(Self {
            secret,
            token_expiry_mins,
        })
    }
}

/// Generate an HS256 token for `user` expiring after the configured lifetime.
pub fn generate_token(
    user: &str,
    config: &JwtConfig,
) -> Result<String, jsonwebtoken::errors::Error> {
    let now = chrono::Utc::now().timestamp();

    let claims = Claims {
        user: Some(user.to_string()),
        exp: Some(now + config.token_expiry_mins * 60),
        iat: Some(now),
    };

    encode_claims(&claims, config)
}

/// Sign arbitrary claims with the configured secret.
pub fn encode_claims(
    claims: &Claims,
    config: &JwtConfig,
) -> Result<String, jsonwebtoken::errors::Error> {
    encode(
        &Header::new(Algorithm::HS256),
        claims,
        &EncodingKey::from_secret(config.secret.as_bytes()),
    )
}

/// Validate a token's signature and, when present, its expiry.
pub fn validate_token(
    token: &str,
    config: &JwtConfig,
) -> Result<Claims, jsonwebtoken::errors::Error> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.required_spec_claims.clear();
    validation.validate_exp = true;

    let token_data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(config.secret.as_bytes()),
        &validation,
    )?;
    Ok(token_data.claims)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> JwtConfig {
        JwtConfig {
            secret: "test-secret-that-is-long-enough-for-hmac".to_string(),
            token_expiry_mins: 60,
        }
    }

    #[test]
    fn test_generate_and_validate_token() {
        let config = test_config();
        let token = generate_token("local", &config).expect("token generation should succeed");

        let claims = validate_token(&token, &config).expect("token validation should succeed");
        assert_eq!(claims.user.as_deref(), Some("local"));
        assert_eq!(claims.exp.unwrap() - claims.iat.unwrap(), 3600);
    }

    #[test]
    fn test_token_without_exp_is_accepted() {
        let config = test_config();
        let claims = Claims {
            user: Some("cron".into()),
            ..Default::default()
        };
        let token = encode_claims(&claims, &config).unwrap();

        assert_eq!(validate_token(&token, &config).unwrap(), claims);
    }

    #[test]
    fn test_empty_claims_are_accepted() {
        let config = test_config();
        let token = encode_claims(&Claims::default(), &config).unwrap();
        assert!(validate_token(&token, &config).is_ok());
    }

    #[test]
    fn test_expired_token_fails() {
        let config = test_config();

        // Well past the default 60-second leeway.
        let now = chrono::Utc::now().timestamp();
        let claims = Claims {
            user: Some("local".into()),
            exp: Some(now - 300),
            iat: Some(now - 600),
        };
        let token = encode_claims(&claims, &config).unwrap();

        let result = validate_token(&token, &config);
        assert!(result.is_err(), "expired token must fail validation");
    }

    #[test]
    fn test_different_secrets_fail() {
        let config = test_config();
        let token = generate_token("local", &config).unwrap();

        let other = JwtConfig {
            secret: "a-completely-different-secret".to_string(),
            ..config
        };
        assert!(validate_token(&token, &other).is_err());
    }

    #[test]
    fn test_malformed_token_fails() {
        assert!(validate_token("not-a-jwt", &test_config()).is_err());
    }
}
