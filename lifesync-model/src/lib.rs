//! Entity model for lifesync.
//!
//! Defines the contract between remote rows and client entities:
//! - [`Entity`]: anything with a stable id that can live in a local view
//! - [`Record`]: a schemaless entity (id plus JSON columns)
//! - [`EntityMapper`]: row ⇄ entity translation, one per collection
//! - [`JsonMapper`] / [`RecordMapper`]: the stock mappers
//! - [`fields`]: serde helpers for the date and timestamp columns the
//!   remote service emits
//!
//! Mappers are the only place field names and column types are translated.
//! Reconciliation never looks inside a row beyond its `id`.

mod entity;
pub mod fields;
mod mapper;

pub use entity::{Entity, Record};
pub use mapper::{EntityMapper, JsonMapper, MappingError, RecordMapper};
