//! Deterministic presence colors
//!
//! A participant's caret and selection colors are derived from their identity
//! string, so every replica paints the same participant the same way without
//! coordinating. Collisions between identities are acceptable.

use serde::{Deserialize, Serialize};

const SATURATION: u8 = 70;
const LIGHTNESS: u8 = 50;
const LIGHTNESS_LIGHT: u8 = 85;

/// 31-multiplier string hash over UTF-16 code units, sign dropped
pub fn hash_identity(identity: &str) -> u32 {
    let mut hash: i32 = 0;
    for unit in identity.encode_utf16() {
        hash = (hash << 5).wrapping_sub(hash).wrapping_add(unit as i32);
    }
    hash.unsigned_abs()
}

/// Hue-based color pair for one participant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceColor {
    pub hue: u16,
}

impl PresenceColor {
    pub fn from_identity(identity: &str) -> Self {
        Self {
            hue: (hash_identity(identity) % 360) as u16,
        }
    }

    /// Caret and label color
    pub fn color(&self) -> String {
        format!("hsl({}, {}%, {}%)", self.hue, SATURATION, LIGHTNESS)
    }

    /// Selection background color
    pub fn color_light(&self) -> String {
        format!("hsl({}, {}%, {}%)", self.hue, SATURATION, LIGHTNESS_LIGHT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_identity_same_hue() {
        let first = PresenceColor::from_identity("user-42");
        let second = PresenceColor::from_identity("user-42");
        assert_eq!(first, second);
        assert_eq!(first.color(), second.color());
    }

    #[test]
    fn test_hue_in_range() {
        for id in ["", "a", "user-43", "日本語", "a-very-long-identity-string-with-many-characters"] {
            assert!(PresenceColor::from_identity(id).hue < 360);
        }
    }

    #[test]
    fn test_known_hash_values() {
        assert_eq!(hash_identity(""), 0);
        assert_eq!(hash_identity("a"), 97);
        assert_eq!(hash_identity("ab"), 97 * 31 + 98);
    }

    #[test]
    fn test_color_strings() {
        let color = PresenceColor { hue: 120 };
        assert_eq!(color.color(), "hsl(120, 70%, 50%)");
        assert_eq!(color.color_light(), "hsl(120, 70%, 85%)");
    }
}
