//! Property tests for the redaction engine

use proptest::prelude::*;
use serde_json::json;

use vigil_core::redaction::{redact_map, redact_str, SENSITIVE_KEY_MASK};

proptest! {
    #[test]
    fn prop_password_values_never_survive(secret in "[0-9][a-z0-9]{7,15}") {
        let line = format!("login failed password={} for user", secret);
        let redacted = redact_str(&line);
        prop_assert!(!redacted.contains(&secret));
        prop_assert!(redacted.contains("password=[REDACTED]"));
    }

    #[test]
    fn prop_token_pair_masked(value in "[^\\s,;\"'&]{1,24}") {
        let expected = "token=[REDACTED]".to_string();
        prop_assert_eq!(redact_str(&format!("token={}", value)), expected);
    }

    #[test]
    fn prop_api_key_pair_masked(value in "[^\\s,;\"'&]{1,24}") {
        let expected = "apiKey: [REDACTED]".to_string();
        prop_assert_eq!(redact_str(&format!("apiKey: {}", value)), expected);
    }

    #[test]
    fn prop_secret_pair_masked(value in "[^\\s,;\"'&]{1,24}") {
        let expected = "secret=[REDACTED]".to_string();
        prop_assert_eq!(redact_str(&format!("secret={}", value)), expected);
    }

    #[test]
    fn prop_sensitive_keys_masked(secret in "[0-9][a-z0-9]{7,15}") {
        let context = json!({ "token": secret.clone(), "nested": { "secret": secret.clone() } });
        let redacted = redact_map(context.as_object().unwrap());
        prop_assert_eq!(&redacted["token"], &json!(SENSITIVE_KEY_MASK));
        prop_assert_eq!(&redacted["nested"]["secret"], &json!(SENSITIVE_KEY_MASK));
    }

    #[test]
    fn prop_card_numbers_never_survive(card in "[0-9]{16}") {
        let redacted = redact_str(&format!("charged card {} ok", card));
        prop_assert!(!redacted.contains(&card));
        prop_assert!(redacted.contains("[CARD_REDACTED]"));
    }

    #[test]
    fn prop_email_local_part_hidden(local in "[a-z]{1,10}", domain in "[a-z]{1,10}") {
        let redacted = redact_str(&format!("invite sent to {}@{}.com", local, domain));
        let leaked = format!("{}@", local);
        let masked = format!("***@{}.com", domain);
        prop_assert!(!redacted.contains(&leaked));
        prop_assert!(redacted.contains(&masked));
    }

    #[test]
    fn prop_jwts_replaced(jwt in "eyJ[A-Za-z_]{8,20}\\.[A-Za-z_]{8,20}\\.[A-Za-z_]{8,20}") {
        let redacted = redact_str(&format!("session {} expired", jwt));
        prop_assert!(!redacted.contains(&jwt));
        prop_assert_eq!(redacted, "session [JWT_REDACTED] expired".to_string());
    }
}
