//! Resolving cross-resource references against recorded state.
//!
//! A reference resolves only once its target is recorded with an id, which
//! the dependency order guarantees for every resource converged before it.

use crate::error::ReconcileError;
use nixops4_aws_core::{Attrs, Definition, Reference, Value};
use nixops4_aws_state::StateStore;

/// The definition's attributes with every reference replaced by the
/// referenced resource's id, or by the named attribute of its record.
///
/// Fails with [`ReconcileError::ReferenceNotReady`] when the referenced
/// resource has no id yet, or lacks the attribute.
pub fn resolve_definition(
    defn: &Definition,
    store: &dyn StateStore,
) -> Result<Attrs, ReconcileError> {
    let mut resolve = |r: &Reference| -> Result<Value, ReconcileError> {
        let not_ready = || ReconcileError::ReferenceNotReady {
            resource: defn.name.clone(),
            reference: r.to_string(),
        };
        let record = store.get(&r.name)?.ok_or_else(not_ready)?;
        let id = record.resource_id.as_deref().ok_or_else(not_ready)?;
        match &r.attr {
            None => Ok(Value::from(id)),
            Some(attr) => match record.get(attr) {
                Value::Null => Err(not_ready()),
                v => Ok(v.clone()),
            },
        }
    };
    let mut attrs = Attrs::new();
    for (attr, v) in &defn.attributes {
        attrs.insert(attr.clone(), v.resolve_references(&mut resolve)?);
    }
    Ok(attrs)
}
