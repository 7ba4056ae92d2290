use crate::{error::ValidationError, models::request::Channel};

pub fn validate_recipient(channel: Channel, address: &str) -> Result<(), ValidationError> {
    match channel {
        Channel::Email => validate_email_address(address),
        Channel::Sms => validate_phone_number(address),
        Channel::Chat => validate_chat_destination(address),
    }
}

fn invalid(label: &'static str, address: &str, reason: &str) -> ValidationError {
    ValidationError::InvalidAddress {
        label,
        address: address.to_string(),
        reason: reason.to_string(),
    }
}

pub fn validate_email_address(address: &str) -> Result<(), ValidationError> {
    const LABEL: &str = "email address";

    if address.is_empty() {
        return Err(invalid(LABEL, address, "empty"));
    }

    if address.len() > 254 {
        return Err(invalid(LABEL, address, "longer than 254 characters"));
    }

    let Some((local, domain)) = address.split_once('@') else {
        return Err(invalid(LABEL, address, "missing @"));
    };

    if local.is_empty() || local.len() > 64 {
        return Err(invalid(LABEL, address, "invalid local part"));
    }

    if domain.contains('@') || !domain.contains('.') || domain.starts_with('.') || domain.ends_with('.') {
        return Err(invalid(LABEL, address, "invalid domain"));
    }

    if address.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(invalid(LABEL, address, "contains whitespace"));
    }

    Ok(())
}

/// E.164: a leading `+` followed by 8 to 15 digits.
pub fn validate_phone_number(address: &str) -> Result<(), ValidationError> {
    const LABEL: &str = "phone number";

    let Some(digits) = address.strip_prefix('+') else {
        return Err(invalid(LABEL, address, "must start with +"));
    };

    if !digits.chars().all(|c| c.is_ascii_digit()) {
        return Err(invalid(LABEL, address, "contains non-digit characters"));
    }

    if digits.len() < 8 || digits.len() > 15 {
        return Err(invalid(LABEL, address, "must have 8 to 15 digits"));
    }

    Ok(())
}

/// Chat destinations are channel names (`#ops`), user handles (`@jane`) or webhook-scoped ids.
pub fn validate_chat_destination(address: &str) -> Result<(), ValidationError> {
    const LABEL: &str = "chat destination";

    if address.is_empty() {
        return Err(invalid(LABEL, address, "empty"));
    }

    if address.len() > 80 {
        return Err(invalid(LABEL, address, "longer than 80 characters"));
    }

    let valid_chars = address
        .chars()
        .all(|c| c.is_alphanumeric() || matches!(c, '#' | '@' | '_' | '-' | '.'));

    if !valid_chars {
        return Err(invalid(LABEL, address, "contains invalid characters"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_email_addresses() {
        assert!(validate_email_address("a@example.com").is_ok());
        assert!(validate_email_address("first.last+tag@sub.example.org").is_ok());
        assert!(validate_email_address("").is_err());
        assert!(validate_email_address("no-at-sign").is_err());
        assert!(validate_email_address("a@b@example.com").is_err());
        assert!(validate_email_address("a@localhost").is_err());
        assert!(validate_email_address("a b@example.com").is_err());
    }

    #[test]
    fn test_phone_numbers() {
        assert!(validate_phone_number("+14155550100").is_ok());
        assert!(validate_phone_number("14155550100").is_err());
        assert!(validate_phone_number("+1415-555").is_err());
        assert!(validate_phone_number("+123").is_err());
    }

    #[test]
    fn test_chat_destinations() {
        assert!(validate_chat_destination("#ops-alerts").is_ok());
        assert!(validate_chat_destination("@jane.doe").is_ok());
        assert!(validate_chat_destination("has space").is_err());
    }

    #[test]
    fn test_dispatch_by_channel() {
        assert!(validate_recipient(Channel::Email, "+14155550100").is_err());
        assert!(validate_recipient(Channel::Sms, "+14155550100").is_ok());
    }
}
