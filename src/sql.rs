//! Statement rendering for the LISTEN/NOTIFY wire surface.
//!
//! Channel names are always sent as quoted identifiers and payloads as quoted
//! string literals; nothing caller-provided is interpolated unescaped.

use crate::error::{PubSubError, Result};

/// Longest identifier the server keeps without truncation (NAMEDATALEN - 1)
pub const MAX_IDENTIFIER_BYTES: usize = 63;

/// Reserved channel used to announce voluntary lock releases
pub const RELEASE_CHANNEL: &str = "pg_pubsub:release_lock";

/// Statements the engine issues through a [`NotifyClient`](crate::client::NotifyClient)
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// `LISTEN "<channel>"`
    Listen(String),
    /// `UNLISTEN "<channel>"`
    Unlisten(String),
    /// `UNLISTEN *`
    UnlistenAll,
    /// `NOTIFY "<channel>", '<payload>'`
    Notify { channel: String, payload: String },
    /// `SET APPLICATION_NAME TO '<name>'`
    SetApplicationName(String),
}

impl Statement {
    /// Render the statement as SQL text
    pub fn to_sql(&self) -> String {
        match self {
            Statement::Listen(channel) => format!("LISTEN {}", quote_ident(channel)),
            Statement::Unlisten(channel) => format!("UNLISTEN {}", quote_ident(channel)),
            Statement::UnlistenAll => "UNLISTEN *".to_string(),
            Statement::Notify { channel, payload } => format!(
                "NOTIFY {}, {}",
                quote_ident(channel),
                quote_literal(payload)
            ),
            Statement::SetApplicationName(name) => {
                format!("SET APPLICATION_NAME TO {}", quote_literal(name))
            }
        }
    }
}

/// Quote an identifier, doubling embedded double quotes
pub fn quote_ident(value: &str) -> String {
    let escaped = value.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

/// Quote a string literal
///
/// Single quotes are doubled. Values containing a backslash are emitted in the
/// `E'...'` form with backslashes doubled, so the result reads the same under
/// any `standard_conforming_strings` setting.
pub fn quote_literal(value: &str) -> String {
    let mut quoted = String::with_capacity(value.len() + 3);
    let has_backslash = value.contains('\\');

    if has_backslash {
        quoted.push('E');
    }
    quoted.push('\'');
    for c in value.chars() {
        match c {
            '\'' => quoted.push_str("''"),
            '\\' => quoted.push_str("\\\\"),
            _ => quoted.push(c),
        }
    }
    quoted.push('\'');
    quoted
}

/// Check that a caller-supplied channel name can be used as given
pub fn validate_channel(channel: &str) -> Result<()> {
    if channel.is_empty() {
        return Err(PubSubError::invalid_channel(channel, "channel name is empty"));
    }

    if channel.len() > MAX_IDENTIFIER_BYTES {
        return Err(PubSubError::invalid_channel(
            channel,
            format!("channel name exceeds {MAX_IDENTIFIER_BYTES} bytes"),
        ));
    }

    if channel.contains('\0') {
        return Err(PubSubError::invalid_channel(
            channel,
            "channel name contains a NUL byte",
        ));
    }

    if channel == RELEASE_CHANNEL {
        return Err(PubSubError::invalid_channel(
            channel,
            "channel name is reserved for lock release notices",
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_statement_rendering() {
        assert_eq!(
            Statement::Listen("orders".to_string()).to_sql(),
            r#"LISTEN "orders""#
        );
        assert_eq!(
            Statement::Unlisten("Order Events".to_string()).to_sql(),
            r#"UNLISTEN "Order Events""#
        );
        assert_eq!(Statement::UnlistenAll.to_sql(), "UNLISTEN *");
        assert_eq!(
            Statement::Notify {
                channel: "orders".to_string(),
                payload: r#"{"id":1}"#.to_string(),
            }
            .to_sql(),
            r#"NOTIFY "orders", '{"id":1}'"#
        );
        assert_eq!(
            Statement::SetApplicationName("abc".to_string()).to_sql(),
            "SET APPLICATION_NAME TO 'abc'"
        );
    }

    #[test]
    fn test_injection_attempts_stay_quoted() {
        assert_eq!(
            quote_ident(r#"x"; DROP TABLE users; --"#),
            r#""x""; DROP TABLE users; --""#
        );
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(quote_literal(r"a\b"), r"E'a\\b'");
        assert_eq!(quote_literal(r"'\"), r"E'''\\'");
    }

    #[test]
    fn test_validate_channel() {
        assert!(validate_channel("orders").is_ok());
        assert!(validate_channel("orders.created:v2").is_ok());
        assert!(validate_channel(&"c".repeat(63)).is_ok());
        assert!(validate_channel("").is_err());
        assert!(validate_channel(&"c".repeat(64)).is_err());
        assert!(validate_channel("a\0b").is_err());
        assert!(validate_channel(RELEASE_CHANNEL).is_err());
    }

    proptest! {
        #[test]
        fn prop_quote_ident_is_balanced(value in ".*") {
            let quoted = quote_ident(&value);
            prop_assert!(quoted.starts_with('"') && quoted.ends_with('"'));
            let inner = &quoted[1..quoted.len() - 1];
            // every quote inside comes in a doubled pair
            prop_assert_eq!(inner.replace("\"\"", "").matches('"').count(), 0);
            prop_assert_eq!(inner.replace("\"\"", "\""), value);
        }

        #[test]
        fn prop_quote_literal_round_trips(value in ".*") {
            let quoted = quote_literal(&value);
            let body = quoted.trim_start_matches('E');
            let inner = &body[1..body.len() - 1];
            let mut decoded = inner.replace("''", "'");
            if quoted.starts_with('E') {
                decoded = decoded.replace("\\\\", "\\");
            }
            prop_assert_eq!(decoded, value);
        }
    }
}
