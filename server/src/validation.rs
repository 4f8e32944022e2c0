use crate::error::ProtocolError;

/// Validate the text of a user turn before it reaches the pipeline.
pub fn validate_user_text(text: &str, max_len: usize) -> Result<(), ProtocolError> {
    if text.trim().is_empty() {
        return Err(ProtocolError::EmptyText);
    }
    if text.chars().count() > max_len {
        return Err(ProtocolError::MessageTooLong);
    }
    Ok(())
}

/// Sessions with a blank or missing id all share the `default` session.
pub fn normalize_session_id(raw: Option<&str>) -> String {
    match raw {
        Some(id) if !id.trim().is_empty() => id.trim().to_string(),
        _ => "default".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_whitespace_text() {
        assert_eq!(validate_user_text("", 100), Err(ProtocolError::EmptyText));
        assert_eq!(
            validate_user_text("   \n\t", 100),
            Err(ProtocolError::EmptyText)
        );
    }

    #[test]
    fn rejects_text_over_the_limit() {
        let text = "a".repeat(11);
        assert_eq!(
            validate_user_text(&text, 10),
            Err(ProtocolError::MessageTooLong)
        );
        assert!(validate_user_text(&"a".repeat(10), 10).is_ok());
    }

    #[test]
    fn length_limit_counts_characters_not_bytes() {
        // four characters, twelve bytes
        assert!(validate_user_text("日本語だ", 4).is_ok());
    }

    #[test]
    fn blank_session_ids_fall_back_to_default() {
        assert_eq!(normalize_session_id(None), "default");
        assert_eq!(normalize_session_id(Some("")), "default");
        assert_eq!(normalize_session_id(Some("  ")), "default");
        assert_eq!(normalize_session_id(Some(" abc ")), "abc");
    }
}
