use crate::reference::{Reference, ReferenceError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// An attribute value, as found in a definition or mirrored into state.
///
/// In JSON, strings of the form `res-<name>.<type>[.<attr>]` are references.
/// References only occur in definitions; state always holds resolved values.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "serde_json::Value", into = "serde_json::Value")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    String(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Reference(Reference),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueError {
    #[error("unsupported number {0}: only integers are allowed")]
    NonInteger(String),
    #[error("invalid resource reference `{text}`: {source}")]
    Reference {
        text: String,
        #[source]
        source: ReferenceError,
    },
}

pub(crate) static NULL: Value = Value::Null;

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// The string items of a list, skipping anything that is not a string.
    pub fn string_items(&self) -> Vec<&str> {
        self.as_list()
            .map(|l| l.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default()
    }

    /// Human readable name of the variant, for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "a boolean",
            Value::Int(_) => "an integer",
            Value::String(_) => "a string",
            Value::List(_) => "a list",
            Value::Map(_) => "a map",
            Value::Reference(_) => "a resource reference",
        }
    }

    /// All references contained in this value, in order of appearance.
    pub fn references(&self) -> Vec<&Reference> {
        let mut out = Vec::new();
        self.collect_references(&mut out);
        out
    }

    fn collect_references<'a>(&'a self, out: &mut Vec<&'a Reference>) {
        match self {
            Value::Reference(r) => out.push(r),
            Value::List(items) => items.iter().for_each(|v| v.collect_references(out)),
            Value::Map(m) => m.values().for_each(|v| v.collect_references(out)),
            _ => {}
        }
    }

    /// Replace every reference by the value returned from `resolve`.
    pub fn resolve_references<E>(
        &self,
        resolve: &mut impl FnMut(&Reference) -> Result<Value, E>,
    ) -> Result<Value, E> {
        Ok(match self {
            Value::Reference(r) => resolve(r)?,
            Value::List(items) => Value::List(
                items
                    .iter()
                    .map(|v| v.resolve_references(resolve))
                    .collect::<Result<_, _>>()?,
            ),
            Value::Map(m) => Value::Map(
                m.iter()
                    .map(|(k, v)| Ok((k.clone(), v.resolve_references(resolve)?)))
                    .collect::<Result<_, _>>()?,
            ),
            other => other.clone(),
        })
    }
}

impl TryFrom<serde_json::Value> for Value {
    type Error = ValueError;

    fn try_from(json: serde_json::Value) -> Result<Self, Self::Error> {
        Ok(match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => return Err(ValueError::NonInteger(n.to_string())),
            },
            serde_json::Value::String(s) => {
                if Reference::is_reference(&s) {
                    match s.parse() {
                        Ok(r) => Value::Reference(r),
                        Err(source) => return Err(ValueError::Reference { text: s, source }),
                    }
                } else {
                    Value::String(s)
                }
            }
            serde_json::Value::Array(items) => Value::List(
                items
                    .into_iter()
                    .map(Value::try_from)
                    .collect::<Result<_, _>>()?,
            ),
            serde_json::Value::Object(m) => Value::Map(
                m.into_iter()
                    .map(|(k, v)| Ok((k, Value::try_from(v)?)))
                    .collect::<Result<_, ValueError>>()?,
            ),
        })
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Int(i) => serde_json::Value::from(i),
            Value::String(s) => serde_json::Value::String(s),
            Value::List(items) => {
                serde_json::Value::Array(items.into_iter().map(Into::into).collect())
            }
            Value::Map(m) => {
                serde_json::Value::Object(m.into_iter().map(|(k, v)| (k, v.into())).collect())
            }
            Value::Reference(r) => serde_json::Value::String(r.to_string()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_owned())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Int(i)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<Reference> for Value {
    fn from(r: Reference) -> Self {
        Value::Reference(r)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::List(items.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn from_json_parses_references() {
        let v: Value = serde_json::from_value(json!({
            "vpcId": "res-main.vpc",
            "cidr": "10.0.0.0/16",
            "gateways": ["res-gw.aws-vpn-gateway", "vgw-123"],
        }))
        .unwrap();
        let refs: Vec<String> = v.references().iter().map(|r| r.to_string()).collect();
        assert_eq!(refs, vec!["res-gw.aws-vpn-gateway", "res-main.vpc"]);
    }

    #[test]
    fn from_json_rejects_floats() {
        let r: Result<Value, _> = serde_json::from_value(json!(1.5));
        assert!(r.is_err());
    }

    #[test]
    fn from_json_rejects_bad_reference() {
        let r = Value::try_from(json!("res-nope"));
        assert!(matches!(r, Err(ValueError::Reference { .. })));
    }

    #[test]
    fn json_round_trip_keeps_reference_syntax() {
        let v = Value::List(vec![
            Value::Reference(Reference::new("a", "vpc")),
            Value::Int(3),
            Value::Null,
        ]);
        let json = serde_json::to_value(&v).unwrap();
        assert_eq!(json, json!(["res-a.vpc", 3, null]));
    }

    #[test]
    fn resolve_references_replaces_nested() {
        let v = Value::Map(BTreeMap::from([
            ("a".to_owned(), Value::Reference(Reference::new("x", "vpc"))),
            (
                "b".to_owned(),
                Value::List(vec![Value::Reference(Reference::new("y", "vpc"))]),
            ),
        ]));
        let resolved = v
            .resolve_references(&mut |r| Ok::<_, ()>(Value::from(format!("id-{}", r.name))))
            .unwrap();
        assert_eq!(
            resolved,
            Value::Map(BTreeMap::from([
                ("a".to_owned(), Value::from("id-x")),
                ("b".to_owned(), Value::from(vec!["id-y"])),
            ]))
        );
    }
}
