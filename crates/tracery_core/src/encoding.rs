//! Lossless byte-to-text payload encoding.
//!
//! Interaction payloads are raw bytes but travel over a JSON wire. They are
//! encoded one codepoint per byte (U+0000..=U+00FF), so arbitrary byte values
//! round-trip through any JSON encoder that handles Unicode correctly.

use crate::error::{CoreError, CoreResult};

/// Encode raw bytes as a latin-1 string, one codepoint per byte.
#[must_use]
pub fn encode_latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| b as char).collect()
}

/// Decode a latin-1 string back into raw bytes.
///
/// # Errors
///
/// Returns `CoreError::InvalidEncoding` if the string contains a codepoint
/// above U+00FF, which cannot have come from `encode_latin1`.
pub fn decode_latin1(s: &str) -> CoreResult<Vec<u8>> {
    s.chars()
        .map(|c| {
            u8::try_from(u32::from(c)).map_err(|_| CoreError::InvalidEncoding {
                reason: format!("codepoint U+{:04X} outside latin-1 range", u32::from(c)),
            })
        })
        .collect()
}

/// Serde adapter for `Option<Vec<u8>>` fields carrying latin-1 payloads.
///
/// `None` serializes as JSON null, meaning "not yet known, blocking".
pub mod latin1_opt {
    use super::{decode_latin1, encode_latin1};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize an optional payload as latin-1 text or null.
    pub fn serialize<S>(data: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match data {
            Some(bytes) => serializer.serialize_str(&encode_latin1(bytes)),
            None => serializer.serialize_none(),
        }
    }

    /// Deserialize an optional latin-1 payload.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text: Option<String> = Option::deserialize(deserializer)?;
        match text {
            Some(s) => decode_latin1(&s)
                .map(Some)
                .map_err(serde::de::Error::custom),
            None => Ok(None),
        }
    }
}

/// Serde adapter for required `Vec<u8>` fields carrying latin-1 payloads.
pub mod latin1 {
    use super::{decode_latin1, encode_latin1};
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serialize a payload as latin-1 text.
    pub fn serialize<S>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&encode_latin1(data))
    }

    /// Deserialize a latin-1 payload.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        decode_latin1(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_ascii() {
        assert_eq!(encode_latin1(b"hi\n"), "hi\n");
    }

    #[test]
    fn test_encode_high_bytes() {
        let bytes = vec![0x00, 0x7f, 0x80, 0xff];
        let text = encode_latin1(&bytes);
        assert_eq!(text.chars().count(), 4);
        assert_eq!(decode_latin1(&text).unwrap(), bytes);
    }

    #[test]
    fn test_decode_rejects_wide_codepoints() {
        assert!(decode_latin1("\u{0100}").is_err());
        assert!(decode_latin1("snowman \u{2603}").is_err());
    }

    #[test]
    fn test_round_trips_through_json() {
        let bytes: Vec<u8> = (0u8..=255).collect();
        let json = serde_json::to_string(&encode_latin1(&bytes)).unwrap();
        let text: String = serde_json::from_str(&json).unwrap();
        assert_eq!(decode_latin1(&text).unwrap(), bytes);
    }

    proptest! {
        #[test]
        fn prop_encode_decode_identity(bytes in proptest::collection::vec(any::<u8>(), 0..512)) {
            let text = encode_latin1(&bytes);
            prop_assert_eq!(decode_latin1(&text).unwrap(), bytes);
        }
    }
}
