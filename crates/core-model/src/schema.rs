use std::fmt;

use serde::{Deserialize, Serialize};

/// The four record collections the store knows about.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Collection {
    Sessions,
    SiteVisits,
    Milestones,
    Settings,
}

impl Collection {
    pub const ALL: [Collection; 4] = [
        Collection::Sessions,
        Collection::SiteVisits,
        Collection::Milestones,
        Collection::Settings,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Collection::Sessions => "sessions",
            Collection::SiteVisits => "site_visits",
            Collection::Milestones => "milestones",
            Collection::Settings => "settings",
        }
    }

    pub fn schema(&self) -> &'static CollectionSchema {
        match self {
            Collection::Sessions => &SCHEMA[0],
            Collection::SiteVisits => &SCHEMA[1],
            Collection::Milestones => &SCHEMA[2],
            Collection::Settings => &SCHEMA[3],
        }
    }
}

impl fmt::Display for Collection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyKind {
    Integer,
    Text,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexSchema {
    pub name: &'static str,
    /// Field name inside the record body.
    pub field: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CollectionSchema {
    pub collection: Collection,
    pub key_kind: KeyKind,
    pub indexes: &'static [IndexSchema],
}

impl CollectionSchema {
    pub fn index(&self, name: &str) -> Option<&'static IndexSchema> {
        self.indexes.iter().find(|i| i.name == name)
    }
}

pub static SCHEMA: [CollectionSchema; 4] = [
    CollectionSchema {
        collection: Collection::Sessions,
        key_kind: KeyKind::Integer,
        indexes: &[
            IndexSchema {
                name: "date",
                field: "date",
            },
            IndexSchema {
                name: "sessionId",
                field: "sessionId",
            },
        ],
    },
    CollectionSchema {
        collection: Collection::SiteVisits,
        key_kind: KeyKind::Text,
        indexes: &[
            IndexSchema {
                name: "site",
                field: "site",
            },
            IndexSchema {
                name: "sessionId",
                field: "sessionId",
            },
        ],
    },
    CollectionSchema {
        collection: Collection::Milestones,
        key_kind: KeyKind::Text,
        indexes: &[IndexSchema {
            name: "sessionId",
            field: "acknowledgedInSessionId",
        }],
    },
    CollectionSchema {
        collection: Collection::Settings,
        key_kind: KeyKind::Text,
        indexes: &[],
    },
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_lookup_matches_collection() {
        for c in Collection::ALL {
            assert_eq!(c.schema().collection, c);
        }
    }

    #[test]
    fn sessions_are_indexed_by_date() {
        let schema = Collection::Sessions.schema();
        assert_eq!(schema.key_kind, KeyKind::Integer);
        assert_eq!(schema.index("date").map(|i| i.field), Some("date"));
        assert!(schema.index("nope").is_none());
    }
}
