//! Schema-free documents.
//!
//! Items travel through the engine as ordered key/value maps. The engine only
//! reads the system columns below and passes everything else through untouched.

use serde_json::{Map, Value};

/// An opaque ordered document.
pub type Document = Map<String, Value>;

/// Item identifier column.
pub const ID: &str = "id";
/// Server version token column.
pub const VERSION: &str = "version";
/// Soft delete flag reported by the remote.
pub const DELETED: &str = "deleted";

/// Get the item id of a document.
pub fn document_id(doc: &Document) -> Option<&str> {
    doc.get(ID).and_then(Value::as_str)
}

/// Whether a value is an object carrying a string id.
pub fn is_valid_item(value: &Value) -> bool {
    value.as_object().is_some_and(|obj| document_id(obj).is_some())
}

/// Whether a value is an array made only of valid items.
pub fn is_valid_items(value: &Value) -> bool {
    value
        .as_array()
        .is_some_and(|items| items.iter().all(is_valid_item))
}

/// Return the document if the value is a valid item.
pub fn valid_item_or_none(value: Value) -> Option<Document> {
    match value {
        Value::Object(obj) if document_id(&obj).is_some() => Some(obj),
        _ => None,
    }
}

/// Return the documents if the value is an array of valid items.
pub fn valid_items_or_none(value: Value) -> Option<Vec<Document>> {
    if !is_valid_items(&value) {
        return None;
    }
    match value {
        Value::Array(items) => items.into_iter().map(valid_item_or_none).collect(),
        _ => None,
    }
}

/// Get the server version token of a document.
pub fn server_version(doc: &Document) -> Option<&Value> {
    doc.get(VERSION)
}

/// Stamp a server version token onto a document, clearing it when `None`.
pub fn set_server_version(doc: &mut Document, version: Option<Value>) {
    match version {
        Some(v) => {
            doc.insert(VERSION.to_string(), v);
        }
        None => {
            doc.remove(VERSION);
        }
    }
}

/// Whether the remote marked this document as deleted.
pub fn is_deleted(doc: &Document) -> bool {
    doc.get(DELETED).and_then(Value::as_bool).unwrap_or(false)
}
