use std::sync::LazyLock;

use rand::RngCore;
use regex::Regex;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// DNS-1123 label shape required of sandbox ids.
static VALID_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

/// Maximum length of a sandbox id, per DNS-1123.
const MAX_ID_LEN: usize = 63;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Generates a fresh 12-character lowercase hex sandbox id.
pub fn generate_sandbox_id() -> String {
    random_hex(6)
}

/// Generates a fresh 16-character lowercase hex exec id.
pub fn generate_exec_id() -> String {
    random_hex(8)
}

/// Whether `id` is a valid sandbox id (lowercase DNS-1123 label).
pub fn valid_sandbox_id(id: &str) -> bool {
    id.len() <= MAX_ID_LEN && VALID_ID_RE.is_match(id)
}

fn random_hex(bytes: usize) -> String {
    let mut buf = vec![0u8; bytes];
    rand::thread_rng().fill_bytes(&mut buf);
    buf.iter().map(|b| format!("{:02x}", b)).collect()
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_have_expected_shape() {
        let id = generate_sandbox_id();
        assert_eq!(id.len(), 12);
        assert!(valid_sandbox_id(&id));

        let exec_id = generate_exec_id();
        assert_eq!(exec_id.len(), 16);
        assert!(exec_id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_valid_sandbox_id() {
        assert!(valid_sandbox_id("demo"));
        assert!(valid_sandbox_id("sbx-warm-1"));
        assert!(valid_sandbox_id("a"));
        assert!(valid_sandbox_id("a-b-c-123"));

        assert!(!valid_sandbox_id(""));
        assert!(!valid_sandbox_id("-leading"));
        assert!(!valid_sandbox_id("trailing-"));
        assert!(!valid_sandbox_id("UPPER"));
        assert!(!valid_sandbox_id("under_score"));
        assert!(!valid_sandbox_id(&"a".repeat(64)));
    }
}
