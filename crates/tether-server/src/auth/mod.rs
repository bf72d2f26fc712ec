//! Short-lived capability tokens presented by agents when they report results.

pub mod claims;
pub mod token;

pub use claims::CapabilityClaims;
pub use token::{JwtTokenIssuer, TokenError, TokenIssuer};
