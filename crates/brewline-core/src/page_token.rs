//! Opaque pagination cursors.
//!
//! A token is URL-safe base64 over a small JSON object holding the keyset
//! position of the last row served: an optional score, a timestamp and a
//! tiebreak key. Callers treat it as an opaque string.

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Decoded keyset position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageToken {
    /// Ranking score, present only for score-ordered listings.
    #[serde(rename = "s", default, skip_serializing_if = "Option::is_none")]
    pub score: Option<i64>,
    /// Timestamp (µs) of the last row.
    #[serde(rename = "t")]
    pub time_us: i64,
    /// Unique tiebreak of the last row.
    #[serde(rename = "u")]
    pub key: String,
}

impl PageToken {
    #[must_use]
    pub fn new(score: Option<i64>, time_us: i64, key: impl Into<String>) -> Self {
        Self {
            score,
            time_us,
            key: key.into(),
        }
    }

    #[must_use]
    pub fn encode(&self) -> String {
        // Serializing a struct of plain fields cannot fail
        let json = serde_json::to_vec(self).unwrap_or_default();
        URL_SAFE_NO_PAD.encode(json)
    }

    /// Decode a token produced by [`PageToken::encode`].
    ///
    /// `scored` states whether the listing being paged is score-ordered; a
    /// token minted for the other kind of listing is rejected.
    pub fn decode(token: &str, scored: bool) -> Result<Self> {
        let bytes = URL_SAFE_NO_PAD
            .decode(token.trim())
            .map_err(|e| Error::InvalidCursor(format!("not base64: {e}")))?;
        let parsed: Self = serde_json::from_slice(&bytes)
            .map_err(|e| Error::InvalidCursor(format!("malformed: {e}")))?;
        match (scored, parsed.score.is_some()) {
            (true, false) => Err(Error::InvalidCursor(
                "cursor belongs to a chronological listing".into(),
            )),
            (false, true) => Err(Error::InvalidCursor(
                "cursor belongs to a ranked listing".into(),
            )),
            _ => Ok(parsed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_url_safe() {
        let token = PageToken::new(Some(12), 1_700_000_000_000_000, "at://did:plc:a/x/y?>").encode();
        assert!(!token.contains('+'));
        assert!(!token.contains('/'));
        assert!(!token.contains('='));
        let decoded = PageToken::decode(&token, true).unwrap();
        assert_eq!(decoded.score, Some(12));
        assert_eq!(decoded.key, "at://did:plc:a/x/y?>");
    }

    #[test]
    fn sort_mismatch_is_rejected() {
        let chrono = PageToken::new(None, 5, "u").encode();
        let ranked = PageToken::new(Some(1), 5, "u").encode();
        assert!(matches!(PageToken::decode(&chrono, true), Err(Error::InvalidCursor(_))));
        assert!(matches!(PageToken::decode(&ranked, false), Err(Error::InvalidCursor(_))));
        assert!(PageToken::decode(&chrono, false).is_ok());
    }

    #[test]
    fn garbage_is_rejected() {
        for bad in ["", "!!!", "bm90IGpzb24"] {
            assert!(matches!(PageToken::decode(bad, false), Err(Error::InvalidCursor(_))));
        }
    }
}
