//! Identity token contract.

use crate::identity::Identity;
use thiserror::Error;

/// Token errors.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Failed to issue token: {0}")]
    Issue(String),
}

/// Issues and verifies identity tokens used for reconnection.
pub trait TokenIssuer: Send + Sync {
    /// Issue a token for an authenticated identity.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    fn issue(&self, identity: &Identity) -> Result<String, TokenError>;

    /// Recover the identity from a token. `None` if the token is invalid or
    /// expired.
    fn verify(&self, token: &str) -> Option<Identity>;
}
