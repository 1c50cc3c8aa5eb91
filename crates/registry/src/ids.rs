//! Local id generation.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::RngCore;

/// Generates a random URL-safe local id suffix for a service-created
/// object: 16 bytes from the OS entropy source, base64url-encoded without
/// padding (22 characters).
#[must_use]
pub fn generate_local_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn local_ids_are_url_safe_and_unique() {
        let id = generate_local_id();
        assert_eq!(id.len(), 22);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(generate_local_id(), generate_local_id());
    }
}
