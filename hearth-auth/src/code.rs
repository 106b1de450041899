use crate::unix_now;
use hearth_core::user::Passcode;
use rand::Rng;

const ALPHABET: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Generate a uniformly random short code of `size` characters drawn from
/// the first `base` (≤ 36) alphabet characters, valid for `exp_minutes`.
pub fn generate_code(size: usize, base: usize, exp_minutes: u64) -> Passcode {
    let base = base.clamp(2, ALPHABET.len());
    let mut rng = rand::thread_rng();
    let code: String = (0..size)
        .map(|_| ALPHABET[rng.gen_range(0..base)] as char)
        .collect();
    Passcode { code, iat: unix_now(), exp: exp_minutes * 60 }
}

/// Validate a challenge against a stored passcode: exact string match and
/// not yet expired.
pub fn check_code(challenge: &str, stored: &Passcode) -> bool {
    !stored.code.is_empty() && challenge == stored.code && unix_now() < stored.iat + stored.exp
}
