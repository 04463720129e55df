//! Page asset naming and capture ordering.
//!
//! Asset files are named `<pageKey>_<side>.png`. Directory listings come back
//! in arbitrary order, so capture order is recovered from the key itself.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Literal page tags, in the order they sort after numbered pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PageTag {
    Cover,
    Info,
    Toc,
}

impl PageTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cover => "cover",
            Self::Info => "info",
            Self::Toc => "toc",
        }
    }
}

/// Key of a stored page. The derived `Ord` is capture order: numbered pages
/// ascending, then literal tags, then duplicate slots ascending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PageKey {
    Seq(u32),
    Tag(PageTag),
    /// `PT<n>`, allocated when content collides with an existing asset.
    Dup(u32),
}

impl fmt::Display for PageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Seq(n) => write!(f, "{}", n),
            Self::Tag(tag) => f.write_str(tag.as_str()),
            Self::Dup(n) => write!(f, "PT{}", n),
        }
    }
}

impl FromStr for PageKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cover" => return Ok(Self::Tag(PageTag::Cover)),
            "info" => return Ok(Self::Tag(PageTag::Info)),
            "toc" => return Ok(Self::Tag(PageTag::Toc)),
            _ => {}
        }
        if let Some(n) = s.strip_prefix("PT") {
            return parse_digits(n)
                .filter(|n| *n > 0)
                .map(Self::Dup)
                .ok_or_else(|| format!("invalid duplicate tag: {}", s));
        }
        parse_digits(s)
            .map(Self::Seq)
            .ok_or_else(|| format!("invalid page key: {}", s))
    }
}

impl Serialize for PageKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PageKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

fn parse_digits(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Left,
    Right,
    /// Unsplit fallback for images that could not be halved.
    Full,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Left => "left",
            Self::Right => "right",
            Self::Full => "full",
        }
    }

    fn from_suffix(s: &str) -> Option<Self> {
        match s {
            "left" => Some(Self::Left),
            "right" => Some(Self::Right),
            "full" => Some(Self::Full),
            _ => None,
        }
    }
}

/// Reference to one stored page image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageAssetRef {
    #[serde(rename = "pageKey")]
    pub key: PageKey,
    pub side: Side,
}

impl PageAssetRef {
    pub fn new(key: PageKey, side: Side) -> Self {
        Self { key, side }
    }

    pub fn file_name(&self) -> String {
        format!("{}_{}.png", self.key, self.side.as_str())
    }

    /// Parse a canonical asset filename. Anything else yields `None`.
    pub fn parse_file_name(name: &str) -> Option<Self> {
        let stem = name.strip_suffix(".png")?;
        let (key, side) = stem.rsplit_once('_')?;
        Some(Self {
            key: key.parse().ok()?,
            side: Side::from_suffix(side)?,
        })
    }
}

/// Sort asset refs into capture order.
pub fn sort_capture_order(assets: &mut [PageAssetRef]) {
    assets.sort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_round_trips_display() {
        for raw in ["1", "42", "cover", "info", "toc", "PT1", "PT12"] {
            let key: PageKey = raw.parse().unwrap();
            assert_eq!(key.to_string(), raw);
        }
    }

    #[test]
    fn test_rejects_malformed_keys() {
        for raw in ["", "PT", "PT0", "PTx", "-1", "cover2", "1a"] {
            assert!(raw.parse::<PageKey>().is_err(), "{} should not parse", raw);
        }
    }

    #[test]
    fn test_capture_order_ignores_creation_order() {
        let names = [
            "PT2_left.png",
            "toc_left.png",
            "10_right.png",
            "cover_right.png",
            "2_left.png",
            "PT1_left.png",
            "10_left.png",
            "info_left.png",
            "cover_left.png",
            "2_right.png",
        ];
        let mut assets: Vec<_> = names
            .iter()
            .filter_map(|n| PageAssetRef::parse_file_name(n))
            .collect();
        sort_capture_order(&mut assets);

        let ordered: Vec<String> = assets.iter().map(|a| a.file_name()).collect();
        assert_eq!(
            ordered,
            vec![
                "2_left.png",
                "2_right.png",
                "10_left.png",
                "10_right.png",
                "cover_left.png",
                "cover_right.png",
                "info_left.png",
                "toc_left.png",
                "PT1_left.png",
                "PT2_left.png",
            ]
        );
    }

    #[test]
    fn test_non_asset_names_are_ignored() {
        assert!(PageAssetRef::parse_file_name("ocr_results.json").is_none());
        assert!(PageAssetRef::parse_file_name("cover.png").is_none());
        assert!(PageAssetRef::parse_file_name("3_middle.png").is_none());
        assert!(PageAssetRef::parse_file_name("../3_left.png").is_none());
    }
}
