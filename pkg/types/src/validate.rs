use anyhow::{Result, bail};
use pkg_constants::state::{KEY_SEPARATOR, MAX_NAME_LEN};

/// Validate a collection name or lock id before it becomes part of a store key.
/// Rules: non-empty, at most `MAX_NAME_LEN` bytes, no `/`, no whitespace or control chars.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("name must not be empty");
    }
    if name.len() > MAX_NAME_LEN {
        bail!(
            "name '{}' exceeds {} bytes (got {})",
            name,
            MAX_NAME_LEN,
            name.len()
        );
    }
    if name.contains(KEY_SEPARATOR) {
        bail!("name '{}' must not contain '{}'", name, KEY_SEPARATOR);
    }
    if name.chars().any(|c| c.is_whitespace() || c.is_control()) {
        bail!("name '{}' must not contain whitespace or control characters", name);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_names() {
        assert!(validate_name("L").is_ok());
        assert!(validate_name("indexing-keepalive").is_ok());
        assert!(validate_name("distributed-locks").is_ok());
        assert!(validate_name("Job_42.daily").is_ok());
    }

    #[test]
    fn invalid_names() {
        assert!(validate_name("").is_err());
        assert!(validate_name("a/b").is_err());
        assert!(validate_name("has space").is_err());
        assert!(validate_name("tab\there").is_err());
        assert!(validate_name(&"a".repeat(MAX_NAME_LEN + 1)).is_err());
    }
}
