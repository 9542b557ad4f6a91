use serde::{Deserialize, Serialize};
use std::fmt;

/// Virtual groupings that are not backed by a collection row.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomType {
    All,
    Trash,
    Publications,
    Unfiled,
}

/// Key distinguishing a collection from searches and other virtual groupings.
///
/// The tree only ever holds `Collection` identifiers; the other variants exist
/// so consumers can share one key type between the tree and fixed rows such as
/// "All Items" or "Trash".
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectionIdentifier {
    Collection(String),
    Search(String),
    Custom(CustomType),
}

impl CollectionIdentifier {
    pub fn collection(key: impl Into<String>) -> Self {
        Self::Collection(key.into())
    }

    /// Row key for `Collection` and `Search` identifiers.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Collection(key) | Self::Search(key) => Some(key),
            Self::Custom(_) => None,
        }
    }
}

impl fmt::Display for CollectionIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Collection(key) => write!(f, "collection:{key}"),
            Self::Search(key) => write!(f, "search:{key}"),
            Self::Custom(kind) => write!(f, "custom:{kind:?}"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CustomLibraryType {
    MyLibrary,
}

/// Library that scopes item-count queries.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LibraryIdentifier {
    Custom(CustomLibraryType),
    Group(i32),
}

impl Default for LibraryIdentifier {
    fn default() -> Self {
        Self::Custom(CustomLibraryType::MyLibrary)
    }
}

/// One row of a frozen snapshot as reported by the backing store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionRow {
    pub key: String,
    #[serde(default)]
    pub parent_key: Option<String>,
    pub name: String,
    #[serde(default = "default_collapsed")]
    pub collapsed: bool,
}

fn default_collapsed() -> bool {
    true
}

impl CollectionRow {
    pub fn new(key: impl Into<String>, parent_key: Option<&str>, name: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            parent_key: parent_key.map(str::to_string),
            name: name.into(),
            collapsed: true,
        }
    }

    pub fn identifier(&self) -> CollectionIdentifier {
        CollectionIdentifier::collection(self.key.as_str())
    }

    pub fn parent_identifier(&self) -> Option<CollectionIdentifier> {
        self.parent_key.as_deref().map(CollectionIdentifier::collection)
    }
}

/// Current data of a collection. Replaced wholesale on modification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Collection {
    pub identifier: CollectionIdentifier,
    pub name: String,
    pub parent_key: Option<String>,
    pub item_count: Option<usize>,
}

impl Collection {
    pub fn from_row(row: &CollectionRow) -> Self {
        Self {
            identifier: row.identifier(),
            name: row.name.clone(),
            parent_key: row.parent_key.clone(),
            item_count: None,
        }
    }

    /// Whether `row` describes the same data, ignoring collapse state.
    pub(crate) fn matches_row(&self, row: &CollectionRow) -> bool {
        self.name == row.name && self.parent_key == row.parent_key
    }
}

/// Node of an immutable snapshot handed to consumers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct CollectionItemWithChildren {
    pub collection: Collection,
    pub children: Vec<CollectionItemWithChildren>,
}

impl CollectionItemWithChildren {
    /// Depth-first search for `identifier` within this subtree.
    pub fn find(&self, identifier: &CollectionIdentifier) -> Option<&CollectionItemWithChildren> {
        if &self.collection.identifier == identifier {
            return Some(self);
        }
        self.children.iter().find_map(|child| child.find(identifier))
    }
}
