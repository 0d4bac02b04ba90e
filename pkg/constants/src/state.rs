//! State store constants.

/// Key prefix under which lock documents are stored.
/// Full key = `LOCK_KEY_PREFIX + collection + "/" + id`.
pub const LOCK_KEY_PREFIX: &str = "/locks/";

/// Separator between the collection and the lock id inside a store key.
pub const KEY_SEPARATOR: char = '/';

/// Maximum length of a collection name or lock id.
pub const MAX_NAME_LEN: usize = 253;
