//! Data models for the freight management sync layer.
//!
//! Field names follow the remote store's snake_case columns so that records
//! travel unchanged between the store, the queue and the UI.

mod change;
mod client;
mod entity;
mod freight;
mod operation;
mod record;
mod sync_state;
mod table;

pub use change::*;
pub use client::*;
pub use entity::*;
pub use freight::*;
pub use operation::*;
pub use record::*;
pub use sync_state::*;
pub use table::*;
