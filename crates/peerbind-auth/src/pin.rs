//! PIN and auth code generation

use rand::Rng;

/// Smallest PIN handed out
pub const MIN_PIN_CODE: u32 = 100_000;
/// Largest PIN handed out
pub const MAX_PIN_CODE: u32 = 999_999;
/// Length of an imported auth code
pub const AUTH_CODE_LENGTH: usize = 6;

/// Generate a fresh six-digit PIN in `[MIN_PIN_CODE, MAX_PIN_CODE]`
pub fn generate_pincode() -> u32 {
    let mut rng = rand::thread_rng();
    rng.gen_range(MIN_PIN_CODE..=MAX_PIN_CODE)
}

/// Generate a code suitable for `import_auth_code` on another device
pub fn export_auth_code() -> String {
    generate_pincode().to_string()
}

/// Parse an auth code or a typed PIN; both must be exactly six ASCII digits
pub fn parse_auth_code(code: &str) -> Option<u32> {
    if code.len() != AUTH_CODE_LENGTH || !code.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    code.parse().ok()
}
