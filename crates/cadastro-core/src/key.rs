use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::ValidationError;

pub const KEY_DIGITS: usize = 14;

/// Normalized 14-digit company registry key.
///
/// Formatted input such as `11.222.333/0001-81` is accepted; the separators are dropped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RegistryKey(String);

impl RegistryKey {
    /// Parse and normalize a key to its bare digits.
    pub fn parse(input: &str) -> Result<Self, ValidationError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ValidationError::EmptyKey);
        }

        let mut digits = String::with_capacity(KEY_DIGITS);
        for (index, ch) in trimmed.chars().enumerate() {
            match ch {
                '0'..='9' => digits.push(ch),
                '.' | '/' | '-' | ' ' => {}
                _ => return Err(ValidationError::KeyInvalidChar { ch, index }),
            }
        }

        if digits.len() != KEY_DIGITS {
            return Err(ValidationError::KeyWrongLength {
                found: digits.len(),
                expected: KEY_DIGITS,
            });
        }

        Ok(Self(digits))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `NN.NNN.NNN/NNNN-NN` rendering.
    pub fn formatted(&self) -> String {
        let d = &self.0;
        format!(
            "{}.{}.{}/{}-{}",
            &d[0..2],
            &d[2..5],
            &d[5..8],
            &d[8..12],
            &d[12..14]
        )
    }

    /// Stable per-key seed for offline fixtures.
    pub fn seed(&self) -> u64 {
        self.0
            .bytes()
            .fold(17_u64, |acc, byte| acc.wrapping_mul(31).wrapping_add(u64::from(byte)))
    }
}

impl Display for RegistryKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AsRef<str> for RegistryKey {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl TryFrom<String> for RegistryKey {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl TryFrom<&str> for RegistryKey {
    type Error = ValidationError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RegistryKey> for String {
    fn from(value: RegistryKey) -> Self {
        value.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_strips_formatting() {
        let key = RegistryKey::parse(" 11.222.333/0001-81 ").expect("formatted key");
        assert_eq!(key.as_str(), "11222333000181");
        assert_eq!(key.formatted(), "11.222.333/0001-81");
    }

    #[test]
    fn test_parse_rejects_wrong_length() {
        assert_eq!(
            RegistryKey::parse("1122233300018"),
            Err(ValidationError::KeyWrongLength {
                found: 13,
                expected: KEY_DIGITS
            })
        );
    }

    #[test]
    fn test_parse_rejects_letters() {
        assert_eq!(
            RegistryKey::parse("11222333000A81"),
            Err(ValidationError::KeyInvalidChar { ch: 'A', index: 11 })
        );
        assert_eq!(RegistryKey::parse("   "), Err(ValidationError::EmptyKey));
    }

    #[test]
    fn test_serde_uses_normalized_string() {
        let key: RegistryKey = serde_json::from_str("\"11.222.333/0001-81\"").expect("deserialize");
        assert_eq!(
            serde_json::to_string(&key).expect("serialize"),
            "\"11222333000181\""
        );
        assert!(serde_json::from_str::<RegistryKey>("\"123\"").is_err());
    }
}
