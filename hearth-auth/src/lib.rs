//! Credential services: slow password hashing, one-shot short codes,
//! compact signed tokens, and the login-attempt throttle.

pub mod code;
pub mod passwords;
pub mod throttle;
pub mod token;

pub use code::{check_code, generate_code};
pub use throttle::{AttemptKind, Throttle};
pub use token::TokenService;

/// Current unix time, seconds.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
