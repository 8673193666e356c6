//! Message records carried through the pipeline.
//!
//! All of them serialize with lower camel case field names and decode
//! case-insensitively through [`crate::codec`].

use serde::{Deserialize, Serialize};

use crate::codec::WireFields;

/// A newly created author row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthorMessage {
    pub id: i64,
    pub name: String,
    pub email: String,
}

impl WireFields for AuthorMessage {
    const FIELDS: &'static [&'static str] = &["id", "name", "email"];
}

/// A book to persist, derived from an [`AuthorMessage`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookMessage {
    pub author_id: i64,
    pub title: String,
    pub num_pages: i32,
    pub category: String,
}

impl WireFields for BookMessage {
    const FIELDS: &'static [&'static str] = &["authorId", "title", "numPages", "category"];
}

/// A client's favorite-author relation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FavoriteAuthorMessage {
    pub client_id: i64,
    pub favorite_author_id: i64,
}

impl WireFields for FavoriteAuthorMessage {
    const FIELDS: &'static [&'static str] = &["clientId", "favoriteAuthorId"];
}

/// Book categories assigned to generated books.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Category {
    Romance,
    SelfHelp,
    Scientific,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Romance, Category::SelfHelp, Category::Scientific];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Romance => "ROMANCE",
            Category::SelfHelp => "SELF-HELP",
            Category::Scientific => "SCIENTIFIC",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
