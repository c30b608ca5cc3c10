use crate::{UploadError, UploadResult};

const MAX_SESSION_ID_LEN: usize = 128;

/// Session ids become part of chunk file names and artifact directories, so
/// only `[A-Za-z0-9_.-]` is accepted and a leading `.` is rejected.
pub fn validate_session_id(session: &str) -> UploadResult<()> {
    if session.is_empty() {
        return Err(UploadError::invalid_input("session is required"));
    }
    if session.len() > MAX_SESSION_ID_LEN {
        return Err(UploadError::invalid_input(format!(
            "session cannot exceed {MAX_SESSION_ID_LEN} characters"
        )));
    }
    if session.starts_with('.') {
        return Err(UploadError::invalid_input(format!(
            "session cannot start with '.': {session}"
        )));
    }
    if let Some(c) = session
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return Err(UploadError::invalid_input(format!(
            "session contains invalid character {c:?}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_typical_ids() {
        assert!(validate_session_id("abc123").is_ok());
        assert!(validate_session_id("1700000000000-x9_f.rec").is_ok());
        assert!(validate_session_id("550e8400-e29b-41d4-a716-446655440000").is_ok());
    }

    #[test]
    fn rejects_empty() {
        assert!(validate_session_id("").is_err());
    }

    #[test]
    fn rejects_traversal() {
        assert!(validate_session_id("../etc").is_err());
        assert!(validate_session_id("a/b").is_err());
        assert!(validate_session_id("..").is_err());
        assert!(validate_session_id("a\\b").is_err());
    }

    #[test]
    fn rejects_overlong() {
        assert!(validate_session_id(&"a".repeat(MAX_SESSION_ID_LEN)).is_ok());
        assert!(validate_session_id(&"a".repeat(MAX_SESSION_ID_LEN + 1)).is_err());
    }
}
