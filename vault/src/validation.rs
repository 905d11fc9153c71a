use crate::errors::{WalletError, WalletResult};
use once_cell::sync::Lazy;
use regex::Regex;

/// Symbols accepted as the "special character" of a master password.
pub const PASSWORD_SYMBOLS: &str = "!@#$%^&*()_+-=[]{};':\"\\|,.<>/?`~";
pub const MIN_PASSWORD_LENGTH: usize = 8;
const MAX_PASSWORD_LENGTH: usize = 256;
const MAX_WALLET_NAME_LENGTH: usize = 50;

static WALLET_NAME_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[\p{L}\p{N} _\-.#()]+$").expect("static wallet name regex"));
static CHAIN_TAG_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9_\-]{0,31}$").expect("static chain tag regex"));

/// Human-readable description of the master password policy, for the
/// presentation layer.
pub fn password_policy() -> String {
    format!(
        "At least {MIN_PASSWORD_LENGTH} characters, including an uppercase letter, \
         a lowercase letter, a digit and one of {PASSWORD_SYMBOLS}"
    )
}

/// Validate master password strength.
pub fn validate_password(password: &str) -> WalletResult<()> {
    let length = password.chars().count();
    if length < MIN_PASSWORD_LENGTH {
        return Err(WalletError::WeakPassword(format!(
            "Password must be at least {MIN_PASSWORD_LENGTH} characters"
        )));
    }

    if length > MAX_PASSWORD_LENGTH {
        return Err(WalletError::WeakPassword("Password too long".to_string()));
    }

    let has_upper = password.chars().any(|c| c.is_ascii_uppercase());
    let has_lower = password.chars().any(|c| c.is_ascii_lowercase());
    let has_digit = password.chars().any(|c| c.is_ascii_digit());
    let has_symbol = password.chars().any(|c| PASSWORD_SYMBOLS.contains(c));

    if !(has_upper && has_lower && has_digit && has_symbol) {
        return Err(WalletError::WeakPassword(
            "Password must contain uppercase, lowercase, number, and special character"
                .to_string(),
        ));
    }

    Ok(())
}

/// Validate wallet name/label
pub fn validate_wallet_name(name: &str) -> WalletResult<()> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(WalletError::ValidationError(
            "Wallet name cannot be empty".to_string(),
        ));
    }

    if trimmed.chars().count() > MAX_WALLET_NAME_LENGTH {
        return Err(WalletError::ValidationError(
            "Wallet name too long".to_string(),
        ));
    }

    if !WALLET_NAME_PATTERN.is_match(trimmed) {
        return Err(WalletError::ValidationError(
            "Wallet name contains invalid characters".to_string(),
        ));
    }

    Ok(())
}

/// Chain type and network tags end up in record identifiers and metadata,
/// so they are restricted to a lowercase slug.
pub fn validate_chain_tag(kind: &str, value: &str) -> WalletResult<()> {
    if !CHAIN_TAG_PATTERN.is_match(value) {
        return Err(WalletError::ValidationError(format!(
            "Invalid {kind} '{value}': expected a lowercase slug"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_password_meeting_policy() {
        assert!(validate_password("Abcd1234!").is_ok());
        assert!(validate_password("xY9~xxxx").is_ok());
    }

    #[test]
    fn rejects_short_password() {
        let err = validate_password("Ab1!").unwrap_err();
        assert!(matches!(err, WalletError::WeakPassword(msg) if msg.contains("at least 8")));
    }

    #[test]
    fn rejects_password_missing_a_class() {
        for candidate in ["abcd1234!", "ABCD1234!", "Abcdefgh!", "Abcd12345"] {
            assert!(
                matches!(validate_password(candidate), Err(WalletError::WeakPassword(_))),
                "{candidate} should be rejected"
            );
        }
    }

    #[test]
    fn policy_description_mentions_length() {
        assert!(password_policy().contains("8 characters"));
    }

    #[test]
    fn wallet_names() {
        assert!(validate_wallet_name("Savings #2").is_ok());
        assert!(validate_wallet_name("   ").is_err());
        assert!(validate_wallet_name("<script>").is_err());
        assert!(validate_wallet_name(&"x".repeat(51)).is_err());
    }

    #[test]
    fn chain_tags_are_slugs() {
        assert!(validate_chain_tag("chain type", "ed25519").is_ok());
        assert!(validate_chain_tag("network", "devnet-2").is_ok());
        assert!(validate_chain_tag("network", "Main Net").is_err());
        assert!(validate_chain_tag("network", "").is_err());
    }
}
