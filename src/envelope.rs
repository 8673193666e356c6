/// Routing container read from the source queue.
///
/// An `Envelope` pairs a [`TableTag`] discriminator with an opaque JSON
/// payload. The payload is only decoded by the strategy the tag resolves to,
/// so the envelope itself stays independent of every message schema.
///
/// ## Wire format
///
/// ```json
/// { "table": 1, "data": "{\"id\":7,\"name\":\"Ana\",\"email\":\"ana@example.com\"}" }
/// ```
///
/// The tag is kept as a raw integer: an unknown value still deserializes and
/// is rejected later, at routing time, as an unsupported tag.
///
/// ## Example
///
/// ```rust
/// use queuebridge::{Envelope, envelope::TableTag};
///
/// let envelope: Envelope = serde_json::from_str(r#"{"table":2,"data":"{}"}"#).unwrap();
/// assert_eq!(envelope.tag(), Ok(TableTag::Client));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Envelope {
    /// Raw table tag.
    pub table: i32,
    /// Message payload, itself a JSON document.
    pub data: String,
}

impl Envelope {
    /// Build an envelope for a known tag.
    pub fn new(tag: TableTag, data: impl Into<String>) -> Self {
        Self {
            table: tag as i32,
            data: data.into(),
        }
    }

    /// Resolve the raw tag into a [`TableTag`].
    pub fn tag(&self) -> Result<TableTag, i32> {
        TableTag::try_from(self.table)
    }
}

/// Source table an envelope originates from.
///
/// Each variant maps to exactly one message strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum TableTag {
    /// A newly created author row.
    Author = 1,
    /// A client's favorite-author relation.
    Client = 2,
}

impl TryFrom<i32> for TableTag {
    type Error = i32;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(TableTag::Author),
            2 => Ok(TableTag::Client),
            other => Err(other),
        }
    }
}

impl crate::codec::WireFields for Envelope {
    const FIELDS: &'static [&'static str] = &["table", "data"];
}

impl std::fmt::Display for TableTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableTag::Author => write!(f, "author"),
            TableTag::Client => write!(f, "client"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_tag_still_deserializes() {
        let envelope: Envelope = serde_json::from_str(r#"{"table":99,"data":"{}"}"#).unwrap();
        assert_eq!(envelope.table, 99);
        assert_eq!(envelope.tag(), Err(99));
    }

    #[test]
    fn known_tags_resolve() {
        assert_eq!(TableTag::try_from(1), Ok(TableTag::Author));
        assert_eq!(TableTag::try_from(2), Ok(TableTag::Client));
        assert_eq!(Envelope::new(TableTag::Client, "{}").table, 2);
    }

    #[test]
    fn field_names_are_case_insensitive() {
        let envelope: Envelope =
            crate::codec::from_str(r#"{"Table":1,"DATA":"{}"}"#).unwrap();
        assert_eq!(envelope, Envelope::new(TableTag::Author, "{}"));
    }

    #[test]
    fn missing_data_is_an_error() {
        assert!(serde_json::from_str::<Envelope>(r#"{"table":1}"#).is_err());
    }
}
