//! JSON decoding with case-insensitive field names.
//!
//! Producers on the database side do not agree on field casing (`authorId`,
//! `AuthorId`, `AUTHORID` all show up), while everything this crate emits is
//! lower camel case. Inbound payloads are therefore decoded by first renaming
//! every top-level key that matches a known field, ignoring ASCII case, to
//! its canonical spelling.

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

/// Canonical wire names of a message's fields.
pub trait WireFields {
    /// Field names exactly as serde expects them.
    const FIELDS: &'static [&'static str];
}

/// Decode a JSON string, matching field names case-insensitively.
pub fn from_str<T>(s: &str) -> Result<T, serde_json::Error>
where
    T: DeserializeOwned + WireFields,
{
    let value: Value = serde_json::from_str(s)?;
    serde_json::from_value(canonicalize(value, T::FIELDS))
}

/// Decode UTF-8 JSON bytes, matching field names case-insensitively.
///
/// Invalid UTF-8 is reported as a regular `serde_json` error.
pub fn from_slice<T>(bytes: &[u8]) -> Result<T, serde_json::Error>
where
    T: DeserializeOwned + WireFields,
{
    let value: Value = serde_json::from_slice(bytes)?;
    serde_json::from_value(canonicalize(value, T::FIELDS))
}

fn canonicalize(value: Value, fields: &[&str]) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    let key = fields
                        .iter()
                        .find(|field| field.eq_ignore_ascii_case(&key))
                        .map(|field| (*field).to_owned())
                        .unwrap_or(key);
                    (key, value)
                })
                .collect::<Map<_, _>>(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, PartialEq)]
    #[serde(rename_all = "camelCase")]
    struct Sample {
        author_id: i64,
        title: String,
    }

    impl WireFields for Sample {
        const FIELDS: &'static [&'static str] = &["authorId", "title"];
    }

    #[test]
    fn matches_any_casing() {
        let expected = Sample {
            author_id: 3,
            title: "x".into(),
        };
        for raw in [
            r#"{"authorId":3,"title":"x"}"#,
            r#"{"AuthorId":3,"Title":"x"}"#,
            r#"{"AUTHORID":3,"TITLE":"x"}"#,
        ] {
            assert_eq!(from_str::<Sample>(raw).unwrap(), expected);
        }
    }

    #[test]
    fn unknown_keys_are_left_alone() {
        let sample: Sample = from_str(r#"{"authorId":1,"title":"t","extra":true}"#).unwrap();
        assert_eq!(sample.author_id, 1);
    }

    #[test]
    fn rejects_non_objects_and_bad_utf8() {
        assert!(from_str::<Sample>("null").is_err());
        assert!(from_str::<Sample>("{not json").is_err());
        assert!(from_slice::<Sample>(&[0x7b, 0xff, 0x7d]).is_err());
    }
}
