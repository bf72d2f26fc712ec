//! Capability token issuance and validation.

use jsonwebtoken::{DecodingKey, EncodingKey, Header, Validation};

use tether_core::db::unix_timestamp;

use super::claims::CapabilityClaims;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("Failed to issue token: {0}")]
    Issue(String),

    #[error("Invalid token: {0}")]
    Invalid(String),
}

/// Mints and checks time-bounded capabilities.
pub trait TokenIssuer: Send + Sync {
    /// Issue a token for `organization_id` and `scope` that stops working at `expires_at`.
    fn issue(
        &self,
        organization_id: &str,
        scope: &str,
        expires_at: i64,
    ) -> Result<String, TokenError>;

    /// Return the claims of a token that is well-formed, ours, and not expired.
    fn validate(&self, token: &str) -> Result<CapabilityClaims, TokenError>;
}

/// HS256 JWT implementation of [`TokenIssuer`].
#[derive(Clone)]
pub struct JwtTokenIssuer {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtTokenIssuer {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
        }
    }
}

impl TokenIssuer for JwtTokenIssuer {
    fn issue(
        &self,
        organization_id: &str,
        scope: &str,
        expires_at: i64,
    ) -> Result<String, TokenError> {
        let claims = CapabilityClaims {
            jti: uuid::Uuid::new_v4().to_string(),
            sub: organization_id.to_string(),
            scope: scope.to_string(),
            iat: unix_timestamp(),
            exp: expires_at,
        };
        jsonwebtoken::encode(&Header::default(), &claims, &self.encoding_key)
            .map_err(|e| TokenError::Issue(e.to_string()))
    }

    fn validate(&self, token: &str) -> Result<CapabilityClaims, TokenError> {
        let data = jsonwebtoken::decode::<CapabilityClaims>(
            token,
            &self.decoding_key,
            &Validation::default(),
        )
        .map_err(|e| TokenError::Invalid(e.to_string()))?;
        Ok(data.claims)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn issuer() -> JwtTokenIssuer {
        JwtTokenIssuer::new(b"test-secret-key-for-testing")
    }

    #[test]
    fn issue_and_validate() {
        let issuer = issuer();
        let exp = unix_timestamp() + 1800;
        let scope = CapabilityClaims::command_scope("req-1");
        let token = issuer.issue("org-1", &scope, exp).unwrap();

        let claims = issuer.validate(&token).unwrap();
        assert_eq!(claims.sub, "org-1");
        assert_eq!(claims.exp, exp);
        assert!(claims.allows("org-1", "command:req-1"));
        assert!(!claims.allows("org-2", "command:req-1"));
        assert!(!claims.allows("org-1", "script_run:1"));
    }

    #[test]
    fn expired_token_is_rejected() {
        let issuer = issuer();
        let token = issuer
            .issue("org-1", "script_run:4", unix_timestamp() - 3600)
            .unwrap();
        assert!(matches!(issuer.validate(&token), Err(TokenError::Invalid(_))));
    }

    #[test]
    fn foreign_token_is_rejected() {
        let other = JwtTokenIssuer::new(b"different-secret");
        let token = other
            .issue("org-1", "script_run:4", unix_timestamp() + 60)
            .unwrap();
        assert!(issuer().validate(&token).is_err());
        assert!(issuer().validate("not-a-token").is_err());
    }

    #[test]
    fn every_token_gets_its_own_id() {
        let issuer = issuer();
        let exp = unix_timestamp() + 60;
        let a = issuer.validate(&issuer.issue("o", "s", exp).unwrap()).unwrap();
        let b = issuer.validate(&issuer.issue("o", "s", exp).unwrap()).unwrap();
        assert_ne!(a.jti, b.jti);
    }
}
