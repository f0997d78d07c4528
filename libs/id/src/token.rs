//! Connection tokens.

use crate::IdError;

const TOKEN_BYTES: usize = 24;

/// Secret a client presents to resume an existing connection.
///
/// Tokens are 24 random bytes rendered as lowercase hex. `Debug` redacts the
/// value so tokens never end up in logs.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct ConnToken(String);

impl ConnToken {
    /// Generates a new random token.
    #[must_use]
    pub fn generate() -> Self {
        let bytes: [u8; TOKEN_BYTES] = rand::random();
        Self(hex::encode(bytes))
    }

    /// Parses a token previously produced by [`ConnToken::generate`].
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }
        let valid = s.len() == TOKEN_BYTES * 2
            && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(IdError::InvalidToken);
        }
        Ok(Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Compares against a presented token without short-circuiting on the
    /// first differing byte.
    pub fn matches(&self, presented: &str) -> bool {
        let ours = self.0.as_bytes();
        let theirs = presented.as_bytes();
        if ours.len() != theirs.len() {
            return false;
        }
        ours.iter()
            .zip(theirs)
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl std::fmt::Debug for ConnToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("ConnToken(<redacted>)")
    }
}

impl std::fmt::Display for ConnToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl serde::Serialize for ConnToken {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for ConnToken {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_token_parses() {
        let token = ConnToken::generate();
        assert_eq!(token.as_str().len(), 48);
        let parsed = ConnToken::parse(token.as_str()).unwrap();
        assert_eq!(parsed, token);
    }

    #[test]
    fn test_tokens_are_distinct() {
        assert_ne!(ConnToken::generate(), ConnToken::generate());
    }

    #[test]
    fn test_rejects_wrong_length_and_case() {
        assert_eq!(ConnToken::parse("abc"), Err(IdError::InvalidToken));
        let upper = ConnToken::generate().as_str().to_uppercase();
        if upper.chars().any(|c| c.is_ascii_alphabetic()) {
            assert_eq!(ConnToken::parse(&upper), Err(IdError::InvalidToken));
        }
        assert_eq!(ConnToken::parse(""), Err(IdError::Empty));
    }

    #[test]
    fn test_matches() {
        let token = ConnToken::generate();
        assert!(token.matches(token.as_str()));
        assert!(!token.matches("deadbeef"));
        assert!(!token.matches(ConnToken::generate().as_str()));
    }

    #[test]
    fn test_debug_redacts() {
        let token = ConnToken::generate();
        let rendered = format!("{token:?}");
        assert!(!rendered.contains(token.as_str()));
    }
}
