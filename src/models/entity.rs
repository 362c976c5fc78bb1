//! Common behavior of the typed entity records.

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{
    Client, CollectionOrder, Driver, EntityRecord, Freight, Profile, Quotation, Table,
};

/// Where an entity's records live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Mutations go through the sync orchestrator to the remote store.
    Synced,
    /// Plain local storage, never sent to the remote store.
    LocalOnly,
}

/// A typed record owned by a user.
///
/// An empty `id` marks a record that has not been created yet.
pub trait Entity:
    Serialize + DeserializeOwned + Clone + Default + Send + Sync + std::fmt::Debug + 'static
{
    const TABLE: Table;
    const STORAGE: StorageMode;

    fn id(&self) -> &str;
    fn set_id(&mut self, id: String);
    fn user_id(&self) -> &str;
    fn set_user_id(&mut self, user_id: String);
    fn sync_version(&self) -> i64;
    fn into_record(self) -> EntityRecord;
    fn from_record(record: EntityRecord) -> Option<Self>;
}

macro_rules! impl_entity {
    ($ty:ident, $table:expr, $storage:expr) => {
        impl Entity for $ty {
            const TABLE: Table = $table;
            const STORAGE: StorageMode = $storage;

            fn id(&self) -> &str {
                &self.id
            }

            fn set_id(&mut self, id: String) {
                self.id = id;
            }

            fn user_id(&self) -> &str {
                &self.user_id
            }

            fn set_user_id(&mut self, user_id: String) {
                self.user_id = user_id;
            }

            fn sync_version(&self) -> i64 {
                self.sync_version
            }

            fn into_record(self) -> EntityRecord {
                EntityRecord::$ty(self)
            }

            fn from_record(record: EntityRecord) -> Option<Self> {
                match record {
                    EntityRecord::$ty(entity) => Some(entity),
                    _ => None,
                }
            }
        }
    };
}

impl_entity!(Client, Table::Clients, StorageMode::Synced);
impl_entity!(Driver, Table::Drivers, StorageMode::Synced);
impl_entity!(Freight, Table::Freights, StorageMode::Synced);
impl_entity!(CollectionOrder, Table::CollectionOrders, StorageMode::Synced);
impl_entity!(Quotation, Table::Quotations, StorageMode::LocalOnly);
impl_entity!(Profile, Table::Profiles, StorageMode::Synced);
