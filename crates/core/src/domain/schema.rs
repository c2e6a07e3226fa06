use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// One field of a table's server-side schema.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDescriptor {
    pub field_id: String,
    pub name: String,
    /// Upstream type tag; opaque to the engine beyond display.
    pub field_type: i64,
}

/// Last-known field schema of a table, keyed by field name.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub fields: BTreeMap<String, FieldDescriptor>,
}

impl TableSchema {
    pub fn from_fields(fields: Vec<FieldDescriptor>) -> Self {
        Self { fields: fields.into_iter().map(|field| (field.name.clone(), field)).collect() }
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn diff(&self, next: &TableSchema) -> SchemaDiff {
        let mut added = Vec::new();
        let mut removed = Vec::new();
        let mut retyped = Vec::new();

        for (name, descriptor) in &next.fields {
            match self.fields.get(name) {
                None => added.push(name.clone()),
                Some(previous) if previous.field_type != descriptor.field_type => {
                    retyped.push(name.clone());
                }
                Some(_) => {}
            }
        }
        for name in self.fields.keys() {
            if !next.fields.contains_key(name) {
                removed.push(name.clone());
            }
        }

        SchemaDiff { added, removed, retyped }
    }
}

/// Field-level difference between two schema observations.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDiff {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub retyped: Vec<String>,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.retyped.is_empty()
    }
}
