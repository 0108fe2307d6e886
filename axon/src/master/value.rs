//! The structured-value type exchanged with the directory (spec §4.F, §6).
//!
//! Kept as our own small enum instead of re-exporting `serde_xmlrpc::Value` directly so that
//! every other module only ever has to think about the handful of shapes this protocol actually
//! uses (strings, ints, bools, doubles, arrays and string-keyed structs) rather than the full
//! XML-RPC value space (dates, base64 blobs, nil).

use std::collections::BTreeMap;

/// A structured value as passed to or returned from a directory RPC call.
#[derive(Clone, Debug, PartialEq)]
pub enum Value {
    Int(i32),
    Bool(bool),
    Double(f64),
    String(String),
    Array(Vec<Value>),
    Struct(BTreeMap<String, Value>),
}

impl Value {
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(v) => Some(v.as_slice()),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<Value>> {
        match self {
            Value::Array(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Struct(v) => Some(v),
            _ => None,
        }
    }

    /// Interprets this value as a list of publisher/subscriber URIs, as returned by
    /// `registerPublisher`/`registerSubscriber`/`publisherUpdate`.
    pub fn into_uri_list(self) -> Vec<String> {
        self.into_array()
            .unwrap_or_default()
            .into_iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s),
                _ => None,
            })
            .collect()
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::Array(v.into_iter().map(Value::String).collect())
    }
}

impl From<serde_xmlrpc::Value> for Value {
    fn from(v: serde_xmlrpc::Value) -> Self {
        match v {
            serde_xmlrpc::Value::Int(i) => Value::Int(i),
            serde_xmlrpc::Value::Bool(b) => Value::Bool(b),
            serde_xmlrpc::Value::Double(d) => Value::Double(d),
            serde_xmlrpc::Value::String(s) => Value::String(s),
            serde_xmlrpc::Value::Array(arr) => {
                Value::Array(arr.into_iter().map(Value::from).collect())
            }
            serde_xmlrpc::Value::Struct(map) => {
                Value::Struct(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
            // Dates and base64 blobs never appear in this protocol; collapse to an empty string
            // rather than failing the whole response over a field nobody reads.
            _ => Value::String(String::new()),
        }
    }
}

impl From<Value> for serde_xmlrpc::Value {
    fn from(v: Value) -> Self {
        match v {
            Value::Int(i) => serde_xmlrpc::Value::Int(i),
            Value::Bool(b) => serde_xmlrpc::Value::Bool(b),
            Value::Double(d) => serde_xmlrpc::Value::Double(d),
            Value::String(s) => serde_xmlrpc::Value::String(s),
            Value::Array(arr) => {
                serde_xmlrpc::Value::Array(arr.into_iter().map(Into::into).collect())
            }
            Value::Struct(map) => {
                serde_xmlrpc::Value::Struct(map.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_list_extracts_strings_only() {
        let v = Value::Array(vec![
            Value::String("http://a:1".into()),
            Value::String("http://b:2".into()),
        ]);
        assert_eq!(v.into_uri_list(), vec!["http://a:1", "http://b:2"]);
    }
}
