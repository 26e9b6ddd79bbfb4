//! Ordered key/value metadata attached to log records and line items.
//!
//! Values are restricted to the JSON value kinds (string, number, boolean,
//! null, nested arrays and objects). Keys keep insertion order, and merging is
//! last-write-wins.

use serde_json::{Map, Value};

/// Insertion-ordered metadata map.
pub type Metadata = Map<String, Value>;

/// Build a [`Metadata`] map from JSON object syntax.
///
/// ```rust
/// use stringcost::metadata;
///
/// let fields = metadata! { "step": "Generate", "quantity": 3 };
/// assert_eq!(fields["quantity"], 3);
/// ```
#[macro_export]
macro_rules! metadata {
    () => {
        $crate::metadata::Metadata::new()
    };
    ($($tt:tt)+) => {
        $crate::metadata::from_value($crate::__private::json!({ $($tt)+ }))
    };
}

/// Convert a JSON value into metadata. Objects are taken as-is; any other
/// value is stored under a single `"value"` key.
#[must_use]
pub fn from_value(value: Value) -> Metadata {
    match value {
        Value::Object(map) => map,
        Value::Null => Metadata::new(),
        other => {
            let mut map = Metadata::new();
            map.insert("value".to_string(), other);
            map
        }
    }
}

/// Merge `other` into `target`; keys from `other` win on collision.
pub fn merge(target: &mut Metadata, other: Metadata) {
    for (key, value) in other {
        target.insert(key, value);
    }
}

/// Return a new map holding `base` overlaid with `overlay`.
#[must_use]
pub fn merged(base: &Metadata, overlay: &Metadata) -> Metadata {
    let mut out = base.clone();
    for (key, value) in overlay {
        out.insert(key.clone(), value.clone());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_is_last_write_wins_and_keeps_order() {
        let mut target = crate::metadata! { "a": 1, "b": 2 };
        merge(&mut target, crate::metadata! { "b": 3, "c": 4 });

        let keys: Vec<_> = target.keys().cloned().collect();
        assert_eq!(keys, vec!["a", "b", "c"]);
        assert_eq!(target["b"], json!(3));
    }

    #[test]
    fn non_object_values_are_wrapped() {
        assert!(from_value(Value::Null).is_empty());
        assert_eq!(from_value(json!(5))["value"], json!(5));
    }
}
