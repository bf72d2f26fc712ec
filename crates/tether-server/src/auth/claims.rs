//! Claims carried by a capability token.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityClaims {
    /// Token ID (unique per token).
    pub jti: String,
    /// Organization the token was minted for.
    pub sub: String,
    /// What the token may report on, e.g. `command:<request id>` or `script_run:<run id>`.
    pub scope: String,
    /// Issued at (unix timestamp).
    pub iat: i64,
    /// Expiration (unix timestamp).
    pub exp: i64,
}

impl CapabilityClaims {
    pub fn command_scope(request_id: &str) -> String {
        format!("command:{request_id}")
    }

    pub fn script_run_scope(run_id: i64) -> String {
        format!("script_run:{run_id}")
    }

    pub fn allows(&self, organization_id: &str, scope: &str) -> bool {
        self.sub == organization_id && self.scope == scope
    }
}
