//! Entity collections known to the sync layer.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Name of an entity collection in the remote store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Table {
    Clients,
    Drivers,
    Freights,
    CollectionOrders,
    Quotations,
    Profiles,
}

impl Table {
    pub const ALL: [Table; 6] = [
        Table::Clients,
        Table::Drivers,
        Table::Freights,
        Table::CollectionOrders,
        Table::Quotations,
        Table::Profiles,
    ];

    /// Tables whose changes are pushed to clients in realtime.
    pub const SYNCED: [Table; 5] = [
        Table::Clients,
        Table::Drivers,
        Table::Freights,
        Table::CollectionOrders,
        Table::Profiles,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Table::Clients => "clients",
            Table::Drivers => "drivers",
            Table::Freights => "freights",
            Table::CollectionOrders => "collection_orders",
            Table::Quotations => "quotations",
            Table::Profiles => "profiles",
        }
    }
}

impl FromStr for Table {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Table::ALL
            .into_iter()
            .find(|table| table.as_str() == s)
            .ok_or_else(|| format!("unknown table: {}", s))
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
