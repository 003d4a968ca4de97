use gateway_protocol::GatewayError;

/// Normalizes a loosely-formatted phone number or chat identifier into a
/// canonical chat-network JID.
///
/// - Any string already containing `@` is returned unchanged (covers
///   `…@c.us`, `…@g.us`, and anything else the caller already qualified).
/// - Otherwise strip everything but ASCII digits and a leading `+`, then:
///   - starts with `62` → keep as-is
///   - starts with `0` → replace the leading `0` with `62`
///   - starts with `8` → prefix with `62`
///   - anything else → `Unsupported phone number format`
/// - Append `@c.us`.
///
/// Empty input fails with `Empty JID`.
pub fn normalize_jid(raw: &str) -> Result<String, GatewayError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err(GatewayError::invalid_payload("Empty JID"));
    }

    if raw.contains('@') {
        return Ok(raw.to_string());
    }

    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();

    let normalized = if let Some(rest) = digits.strip_prefix("62") {
        format!("62{rest}")
    } else if let Some(rest) = digits.strip_prefix('0') {
        format!("62{rest}")
    } else if digits.starts_with('8') {
        format!("62{digits}")
    } else {
        return Err(GatewayError::invalid_payload(
            "Unsupported phone number format",
        ));
    };

    Ok(format!("{normalized}@c.us"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_leading_zero_becomes_country_code() {
        assert_eq!(normalize_jid("08123").unwrap(), "628123@c.us");
    }

    #[test]
    fn leading_62_is_kept() {
        assert_eq!(normalize_jid("628123").unwrap(), "628123@c.us");
    }

    #[test]
    fn leading_8_gets_country_code_prefixed() {
        assert_eq!(normalize_jid("8123").unwrap(), "628123@c.us");
    }

    #[test]
    fn already_qualified_jid_passes_through() {
        assert_eq!(normalize_jid("628123@c.us").unwrap(), "628123@c.us");
    }

    #[test]
    fn group_jid_passes_through() {
        assert_eq!(normalize_jid("1234-5678@g.us").unwrap(), "1234-5678@g.us");
    }

    #[test]
    fn strips_punctuation_and_plus() {
        assert_eq!(normalize_jid("+62 812-3456").unwrap(), "628123456@c.us");
    }

    #[test]
    fn empty_input_fails() {
        assert!(normalize_jid("").is_err());
        assert!(normalize_jid("   ").is_err());
    }

    #[test]
    fn unsupported_format_fails() {
        assert!(normalize_jid("9123").is_err());
        assert!(normalize_jid("abc").is_err());
    }
}
