//! Filename validation for upload and export paths.
//!
//! Clients may only address files directly inside their tenant directory.
//! Sub-directory access is forbidden; archives are the supported way to
//! move directory trees.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FilenameError {
    #[error("empty filename")]
    Empty,
    #[error("filename contains a path separator")]
    Separator,
    #[error("filename contains a parent-directory reference")]
    ParentRef,
    #[error("filename starts with a disallowed character: {0}")]
    DisallowedStart(char),
}

/// Validate a URL-unescaped filename candidate.
///
/// Rejects names containing `/` (or `\`), any `..` occurrence, and names
/// beginning with a character from `disallowed_start_chars`. Returns the
/// name unchanged when it is acceptable.
pub fn check_filename<'a>(
    filename: &'a str,
    disallowed_start_chars: &str,
) -> Result<&'a str, FilenameError> {
    if filename.is_empty() {
        return Err(FilenameError::Empty);
    }
    if filename.contains('/') || filename.contains('\\') {
        return Err(FilenameError::Separator);
    }
    if filename.contains("..") {
        return Err(FilenameError::ParentRef);
    }
    let first = filename.chars().next().expect("non-empty");
    if disallowed_start_chars.contains(first) {
        return Err(FilenameError::DisallowedStart(first));
    }
    Ok(filename)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_plain_names() {
        assert_eq!(check_filename("data.csv", ".~"), Ok("data.csv"));
        assert_eq!(check_filename("with spaces.txt", ".~"), Ok("with spaces.txt"));
        assert_eq!(check_filename("archive.tar.gz", ".~"), Ok("archive.tar.gz"));
    }

    #[test]
    fn test_rejects_traversal() {
        assert_eq!(
            check_filename("../etc/passwd", ""),
            Err(FilenameError::Separator)
        );
        assert_eq!(check_filename("a..b", ""), Err(FilenameError::ParentRef));
        assert_eq!(
            check_filename("sub/dir.txt", ""),
            Err(FilenameError::Separator)
        );
        assert_eq!(
            check_filename("win\\style", ""),
            Err(FilenameError::Separator)
        );
    }

    #[test]
    fn test_rejects_disallowed_start_chars() {
        assert_eq!(
            check_filename(".hidden", ".~"),
            Err(FilenameError::DisallowedStart('.'))
        );
        assert_eq!(
            check_filename("~backup", ".~"),
            Err(FilenameError::DisallowedStart('~'))
        );
        // only the first character is restricted
        assert_eq!(check_filename("file.txt", ".~"), Ok("file.txt"));
    }

    #[test]
    fn test_rejects_empty() {
        assert_eq!(check_filename("", ".~"), Err(FilenameError::Empty));
    }
}
