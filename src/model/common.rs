use serde::{Deserialize, Deserializer, Serialize};

pub type ProjectId = i64;
pub type PageId = i64;
pub type ElementId = i64;
pub type UserId = String;

/// Open key/value map used for element styles and attributes
pub type PropertyMap = serde_json::Map<String, serde_json::Value>;

/// Distinguishes "field omitted" (`None`) from "field explicitly null" (`Some(None)`)
/// when deserializing partial updates.
pub fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}

/// Accepts ids sent either as JSON numbers or as numeric strings ("42").
///
/// Agents frequently quote identifiers, so every id arriving from outside the
/// process goes through this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct LenientId(pub i64);

impl<'de> Deserialize<'de> for LenientId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(i64),
            Float(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(LenientId(n)),
            // i64::MAX as f64 is 2^63, so the upper bound is exclusive
            Raw::Float(f)
                if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 =>
            {
                Ok(LenientId(f as i64))
            }
            Raw::Float(f) => Err(serde::de::Error::custom(format!(
                "id must be an integer, got {}",
                f
            ))),
            Raw::Text(s) => s
                .trim()
                .parse::<i64>()
                .map(LenientId)
                .map_err(|_| serde::de::Error::custom(format!("id is not numeric: '{}'", s))),
        }
    }
}

impl From<LenientId> for i64 {
    fn from(id: LenientId) -> Self {
        id.0
    }
}

/// Lowercase, hyphen-separated slug derived from a display name
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut last_dash = true;
    for ch in name.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            slug.push(ch.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            slug.push('-');
            last_dash = true;
        }
    }
    while slug.ends_with('-') {
        slug.pop();
    }
    slug
}

pub fn is_valid_slug(slug: &str) -> bool {
    !slug.is_empty()
        && !slug.starts_with('-')
        && !slug.ends_with('-')
        && slug
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}
