//! The remote row shape.
//!
//! A row is whatever JSON object the remote data service hands back. It is
//! kept distinct from client entities: nothing trusts a row until an entity
//! mapper has validated it.

use crate::{EntityId, Error, Result, UserId};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Column holding the entity id.
pub const ID_COLUMN: &str = "id";

/// Column holding the owning user's id.
pub const OWNER_COLUMN: &str = "user_id";

/// A JSON object row as delivered by the remote service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Row(Map<String, Value>);

impl Row {
    /// Creates an empty row.
    #[must_use]
    pub fn new() -> Self {
        Self(Map::new())
    }

    /// Converts an arbitrary JSON value into a row, rejecting non-objects.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(Error::NotAnObject),
        }
    }

    /// Returns the row as a JSON value.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    /// Consumes the row, returning the underlying JSON map.
    #[must_use]
    pub fn into_inner(self) -> Map<String, Value> {
        self.0
    }

    /// Returns a column value.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    /// Sets a column value, returning the previous one.
    pub fn insert(&mut self, column: impl Into<String>, value: Value) -> Option<Value> {
        self.0.insert(column.into(), value)
    }

    /// Removes a column.
    pub fn remove(&mut self, column: &str) -> Option<Value> {
        self.0.remove(column)
    }

    /// Whether the row has the given column.
    #[must_use]
    pub fn contains(&self, column: &str) -> bool {
        self.0.contains_key(column)
    }

    /// Iterates over `(column, value)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// Copies every column of `patch` over this row.
    pub fn merge(&mut self, patch: &Row) {
        for (column, value) in &patch.0 {
            self.0.insert(column.clone(), value.clone());
        }
    }

    /// Extracts and validates the entity id.
    pub fn entity_id(&self) -> Result<EntityId> {
        match self.0.get(ID_COLUMN) {
            None | Some(Value::Null) => Err(Error::MissingId),
            Some(Value::String(s)) if !s.is_empty() => Ok(EntityId::new(s.as_str())),
            Some(Value::Number(n)) if n.is_i64() || n.is_u64() => Ok(EntityId::new(n.to_string())),
            Some(other) => Err(Error::InvalidId(other.to_string())),
        }
    }

    /// Extracts the owning user, if the row carries one.
    pub fn owner(&self) -> Result<Option<UserId>> {
        match self.0.get(OWNER_COLUMN) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(s)) => Ok(Some(UserId::parse(s)?)),
            Some(other) => Err(Error::InvalidId(other.to_string())),
        }
    }

    /// Stamps the owner column.
    pub fn set_owner(&mut self, user: UserId) {
        self.0
            .insert(OWNER_COLUMN.to_string(), Value::String(user.to_string()));
    }
}

impl From<Map<String, Value>> for Row {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

impl TryFrom<Value> for Row {
    type Error = Error;

    fn try_from(value: Value) -> Result<Self> {
        Self::from_value(value)
    }
}
