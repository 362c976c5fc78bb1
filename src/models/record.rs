//! Tagged union over every entity shape, keyed by table.

use serde_json::Value;

use super::{Client, CollectionOrder, Driver, Freight, Profile, Quotation, Table};
use crate::errors::SyncError;

/// An entity payload whose shape is determined by its table.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityRecord {
    Client(Client),
    Driver(Driver),
    Freight(Freight),
    CollectionOrder(CollectionOrder),
    Quotation(Quotation),
    Profile(Profile),
}

macro_rules! with_entity {
    ($record:expr, $entity:ident => $body:expr) => {
        match $record {
            EntityRecord::Client($entity) => $body,
            EntityRecord::Driver($entity) => $body,
            EntityRecord::Freight($entity) => $body,
            EntityRecord::CollectionOrder($entity) => $body,
            EntityRecord::Quotation($entity) => $body,
            EntityRecord::Profile($entity) => $body,
        }
    };
}

impl EntityRecord {
    pub fn table(&self) -> Table {
        match self {
            EntityRecord::Client(_) => Table::Clients,
            EntityRecord::Driver(_) => Table::Drivers,
            EntityRecord::Freight(_) => Table::Freights,
            EntityRecord::CollectionOrder(_) => Table::CollectionOrders,
            EntityRecord::Quotation(_) => Table::Quotations,
            EntityRecord::Profile(_) => Table::Profiles,
        }
    }

    pub fn id(&self) -> &str {
        with_entity!(self, e => e.id.as_str())
    }

    pub fn set_id(&mut self, id: String) {
        with_entity!(self, e => e.id = id)
    }

    pub fn user_id(&self) -> &str {
        with_entity!(self, e => e.user_id.as_str())
    }

    pub fn set_user_id(&mut self, user_id: String) {
        with_entity!(self, e => e.user_id = user_id)
    }

    pub fn sync_version(&self) -> i64 {
        with_entity!(self, e => e.sync_version)
    }

    pub fn set_sync_version(&mut self, version: i64) {
        with_entity!(self, e => e.sync_version = version)
    }

    /// Serialize the payload without its table tag.
    pub fn to_value(&self) -> Result<Value, SyncError> {
        let value = with_entity!(self, e => serde_json::to_value(e))?;
        Ok(value)
    }

    /// Decode a payload for `table`, rejecting anything that does not fit its shape.
    pub fn from_value(table: Table, value: Value) -> Result<Self, SyncError> {
        if !value.is_object() {
            return Err(SyncError::Validation(format!(
                "{} payload must be an object",
                table
            )));
        }
        let record = match table {
            Table::Clients => EntityRecord::Client(serde_json::from_value(value)?),
            Table::Drivers => EntityRecord::Driver(serde_json::from_value(value)?),
            Table::Freights => EntityRecord::Freight(serde_json::from_value(value)?),
            Table::CollectionOrders => {
                EntityRecord::CollectionOrder(serde_json::from_value(value)?)
            }
            Table::Quotations => EntityRecord::Quotation(serde_json::from_value(value)?),
            Table::Profiles => EntityRecord::Profile(serde_json::from_value(value)?),
        };
        Ok(record)
    }

    /// A record of `table` carrying only its identity, as used for deletes.
    pub fn reference(table: Table, id: &str, user_id: &str) -> Self {
        let mut record = match table {
            Table::Clients => EntityRecord::Client(Client::default()),
            Table::Drivers => EntityRecord::Driver(Driver::default()),
            Table::Freights => EntityRecord::Freight(Freight::default()),
            Table::CollectionOrders => EntityRecord::CollectionOrder(CollectionOrder::default()),
            Table::Quotations => EntityRecord::Quotation(Quotation::default()),
            Table::Profiles => EntityRecord::Profile(Profile::default()),
        };
        record.set_id(id.to_string());
        record.set_user_id(user_id.to_string());
        record
    }
}
