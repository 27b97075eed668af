//! File name validation
//!
//! Blob names come straight from clients and end up as file names inside
//! the blob directory, so they are validated before any storage call.

use crate::error::ProtocolError;
use crate::MAX_FILENAME_LEN;

/// Validate a client-supplied file name.
///
/// Rejects:
/// 1. Empty names and the special names `.` and `..`
/// 2. Path separators (`/` and `\`)
/// 3. Null bytes
/// 4. Names longer than `MAX_FILENAME_LEN` bytes
pub fn validate_file_name(name: &str) -> Result<(), ProtocolError> {
    if name.is_empty() {
        return Err(ProtocolError::InvalidName("empty name".into()));
    }

    if name.len() > MAX_FILENAME_LEN {
        return Err(ProtocolError::InvalidName(format!(
            "name too long: {} bytes (max {})",
            name.len(),
            MAX_FILENAME_LEN
        )));
    }

    if name == "." || name == ".." {
        return Err(ProtocolError::InvalidName(name.to_string()));
    }

    if name.contains('\0') {
        return Err(ProtocolError::InvalidName("name contains null byte".into()));
    }

    if name.contains('/') || name.contains('\\') {
        return Err(ProtocolError::InvalidName(format!(
            "name contains path separator: {}",
            name
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_names() {
        assert!(validate_file_name("photo.jpg").is_ok());
        assert!(validate_file_name("relatório final (2).pdf").is_ok());
        assert!(validate_file_name("..hidden").is_ok());
    }

    #[test]
    fn test_rejects_traversal() {
        assert!(validate_file_name("..").is_err());
        assert!(validate_file_name("../etc/passwd").is_err());
        assert!(validate_file_name("a/b").is_err());
        assert!(validate_file_name("a\\b").is_err());
    }

    #[test]
    fn test_rejects_degenerate() {
        assert!(validate_file_name("").is_err());
        assert!(validate_file_name("a\0b").is_err());
        assert!(validate_file_name(&"x".repeat(MAX_FILENAME_LEN + 1)).is_err());
    }
}
