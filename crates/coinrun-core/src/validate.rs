//! Input checks shared by commands. All of them run before anything is staged.

use crate::error::FundingError;

/// Trim `value` and require `min..=max` characters.
pub fn trimmed_len(
    field: &str,
    value: &str,
    min: usize,
    max: usize,
) -> Result<String, FundingError> {
    let trimmed = value.trim();
    let len = trimmed.chars().count();
    if len < min || len > max {
        return Err(FundingError::validation(format!(
            "{field} must be between {min} and {max} characters"
        )));
    }
    Ok(trimmed.to_string())
}

pub fn username(value: &str) -> Result<String, FundingError> {
    let name = trimmed_len("username", value, 2, 30)?;
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(FundingError::validation(
            "username may only contain letters, digits, '_' and '-'",
        ));
    }
    Ok(name)
}

pub fn email(value: &str) -> Result<String, FundingError> {
    let email = value.trim();
    let mut parts = email.split('@');
    let valid = matches!(
        (parts.next(), parts.next(), parts.next()),
        (Some(local), Some(domain), None)
            if !local.is_empty() && !domain.is_empty() && !email.contains(char::is_whitespace)
    );
    if !valid {
        return Err(FundingError::validation("email address is not valid"));
    }
    Ok(email.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usernames() {
        assert_eq!(username("  alice_01 ").unwrap(), "alice_01");
        assert!(username("a").is_err());
        assert!(username("bad name").is_err());
        assert!(username(&"x".repeat(31)).is_err());
    }

    #[test]
    fn emails() {
        assert!(email("alice@example.com").is_ok());
        assert!(email("alice@").is_err());
        assert!(email("a@b@c").is_err());
        assert!(email("no at sign").is_err());
    }

    #[test]
    fn lengths_count_characters_after_trimming() {
        assert_eq!(
            trimmed_len("title", "  Ship it ", 4, 120).unwrap(),
            "Ship it"
        );
        assert!(trimmed_len("title", "  abc  ", 4, 120).is_err());
    }
}
