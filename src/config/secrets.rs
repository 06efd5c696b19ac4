//! Secret handling utilities.
//!
//! Re-exports secrecy types and provides helpers for working with
//! secrets in the siakad-queue context.

pub use secrecy::{ExposeSecret, SecretBox, SecretString};

/// Expose an optional secret as a borrowed `&str`.
pub fn expose_opt(secret: &Option<SecretString>) -> Option<&str> {
    secret.as_ref().map(|s| s.expose_secret())
}
