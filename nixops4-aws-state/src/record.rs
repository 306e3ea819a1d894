use nixops4_aws_core::{Attrs, Lifecycle, Value};
use serde::{Deserialize, Serialize};

/// What is known about one provisioned resource.
///
/// `attributes` mirrors the definition as it was last successfully applied,
/// plus computed attributes reported by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRecord {
    #[serde(rename = "type")]
    pub type_tag: String,
    #[serde(default)]
    pub lifecycle: Lifecycle,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_token: Option<String>,
    #[serde(default)]
    pub attributes: Attrs,
}

static NULL: Value = Value::Null;

impl ResourceRecord {
    pub fn new(type_tag: impl Into<String>) -> Self {
        ResourceRecord {
            type_tag: type_tag.into(),
            ..Default::default()
        }
    }

    pub fn get(&self, attr: &str) -> &Value {
        self.attributes.get(attr).unwrap_or(&NULL)
    }

    /// Forget everything about the cloud resource, keeping only the type.
    pub fn reset(&mut self) {
        self.lifecycle = Lifecycle::Missing;
        self.resource_id = None;
        self.idempotency_token = None;
        self.attributes.clear();
    }

    /// `Up` requires a resource id and `Missing` forbids one. `Starting` and
    /// `Unknown` may be either.
    pub fn check_invariant(&self) -> std::result::Result<(), String> {
        match (self.lifecycle, &self.resource_id) {
            (Lifecycle::Up, None) => Err("lifecycle is up but no resource id is recorded".into()),
            (Lifecycle::Missing, Some(id)) => Err(format!(
                "lifecycle is missing but resource id {} is recorded",
                id
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serializes_camel_case_and_skips_empty_ids() {
        let mut r = ResourceRecord::new("vpc");
        r.lifecycle = Lifecycle::Starting;
        r.idempotency_token = Some("tok".to_owned());
        assert_eq!(
            serde_json::to_value(&r).unwrap(),
            serde_json::json!({
                "type": "vpc",
                "lifecycle": "STARTING",
                "idempotencyToken": "tok",
                "attributes": {},
            })
        );
    }

    #[test]
    fn invariant() {
        let mut r = ResourceRecord::new("vpc");
        r.check_invariant().unwrap();
        r.lifecycle = Lifecycle::Up;
        assert!(r.check_invariant().is_err());
        r.resource_id = Some("vpc-1".to_owned());
        r.check_invariant().unwrap();
        r.lifecycle = Lifecycle::Missing;
        assert!(r.check_invariant().is_err());
    }
}
