//! Elasticsearch index body (settings + mappings).

use serde_json::{json, Map, Value};

use crate::error::{IndexError, Result};

/// Analysis settings embedded at compile time
const INDEX_SETTINGS: &str = include_str!("../../schema/index_settings.json");

/// Build the body for creating one index generation from the field
/// mappings of every mapping type that lives in it.
pub fn index_body<I>(properties: I) -> Result<Value>
where
    I: IntoIterator<Item = Value>,
{
    let settings: Value = serde_json::from_str(INDEX_SETTINGS)?;

    let mut merged = Map::new();
    for fields in properties {
        let Value::Object(fields) = fields else {
            return Err(IndexError::Config(
                "mapping properties must be a JSON object".to_string(),
            ));
        };
        for (name, definition) in fields {
            if let Some(existing) = merged.get(&name) {
                if existing != &definition {
                    return Err(IndexError::Config(format!(
                        "conflicting mapping for field [{}]",
                        name
                    )));
                }
            }
            merged.insert(name, definition);
        }
    }

    Ok(json!({
        "settings": settings,
        "mappings": {
            "dynamic": "strict",
            "properties": merged,
        }
    }))
}
