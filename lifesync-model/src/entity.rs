use lifesync_types::{EntityId, Row};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// A typed record that can be held in a local view.
///
/// The id must be stable for the lifetime of the entity; everything else is
/// feature-defined.
pub trait Entity: Clone + Send + Sync + 'static {
    fn id(&self) -> &EntityId;
}

/// A schemaless entity: the id plus every other column as JSON.
///
/// Useful for collections that have no dedicated struct yet, and in tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub id: EntityId,
    #[serde(flatten)]
    pub data: Map<String, Value>,
}

impl Record {
    /// Creates a record from an id and a JSON object of columns.
    /// Non-object `data` yields an empty column set.
    pub fn new(id: impl Into<EntityId>, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self { id: id.into(), data }
    }

    /// Extract a column value.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.data.get(column)
    }

    /// Extract a string column.
    pub fn get_str(&self, column: &str) -> Option<&str> {
        self.data.get(column).and_then(|v| v.as_str())
    }

    /// Extract a boolean column.
    pub fn get_bool(&self, column: &str) -> Option<bool> {
        self.data.get(column).and_then(|v| v.as_bool())
    }

    /// Extract a numeric column.
    pub fn get_number(&self, column: &str) -> Option<f64> {
        self.data.get(column).and_then(|v| v.as_f64())
    }

    /// Renders the record back into a row.
    pub fn to_row(&self) -> Row {
        let mut row = Row::from(self.data.clone());
        row.insert(lifesync_types::ID_COLUMN, Value::String(self.id.to_string()));
        row
    }
}

impl Entity for Record {
    fn id(&self) -> &EntityId {
        &self.id
    }
}
