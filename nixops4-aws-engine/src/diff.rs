//! Which handlers a change makes due, and in which order they run.

use crate::resource::HandlerSpec;
use nixops4_aws_core::{Attrs, Schema, Value};
use std::collections::BTreeSet;

static NULL: Value = Value::Null;

/// Declared attributes whose recorded value differs from the desired one.
/// An attribute that is not set compares equal to [`Value::Null`].
pub fn changed_attributes(
    schema: &Schema,
    current: &Attrs,
    desired: &Attrs,
) -> BTreeSet<&'static str> {
    schema
        .declared()
        .map(|spec| spec.name)
        .filter(|attr| {
            current.get(*attr).unwrap_or(&NULL) != desired.get(*attr).unwrap_or(&NULL)
        })
        .collect()
}

/// The due handlers, ordered so that each runs after the due handlers it
/// names in `after`. Among handlers whose predecessors are done, declaration
/// order wins. When `creating`, the create handler is due and runs first.
///
/// Returns `None` if the `after` edges among the due handlers form a cycle.
pub fn plan<'h>(
    handlers: &'h [HandlerSpec],
    changed: &BTreeSet<&str>,
    creating: bool,
) -> Option<Vec<&'h HandlerSpec>> {
    let is_due = |h: &HandlerSpec| {
        if h.is_create() {
            creating
        } else {
            h.triggers.iter().any(|t| changed.contains(t))
        }
    };

    let mut ordered: Vec<&HandlerSpec> = Vec::new();
    if creating {
        ordered.extend(handlers.iter().filter(|h| h.is_create()));
    }
    let mut pending: Vec<&HandlerSpec> = handlers
        .iter()
        .filter(|h| !h.is_create() && is_due(h))
        .collect();

    while !pending.is_empty() {
        let ready = pending.iter().position(|h| {
            h.after
                .iter()
                .all(|dep| !pending.iter().any(|p| p.name == *dep))
        })?;
        ordered.push(pending.remove(ready));
    }
    Some(ordered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use nixops4_aws_core::{AttrKind, AttrSpec};

    const ATTRS: &[AttrSpec] = &[
        AttrSpec::new("region", AttrKind::String).immutable(),
        AttrSpec::new("groupName", AttrKind::String).immutable(),
        AttrSpec::new("rules", AttrKind::List),
        AttrSpec::new("tags", AttrKind::Map),
        AttrSpec::new("description", AttrKind::String),
        AttrSpec::new("arn", AttrKind::String).computed(),
    ];
    const SCHEMA: Schema = Schema::new(ATTRS);

    const HANDLERS: &[HandlerSpec] = &[
        HandlerSpec::create("create", &["region", "groupName"]),
        HandlerSpec::update("tags", &["tags"]).after(&["rules"]),
        HandlerSpec::update("rules", &["rules"]).after(&["create"]),
        HandlerSpec::update("description", &["description"]),
    ];

    fn attrs(pairs: &[(&str, Value)]) -> Attrs {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn names(plan: Option<Vec<&HandlerSpec>>) -> Vec<&'static str> {
        plan.unwrap().into_iter().map(|h| h.name).collect()
    }

    #[test]
    fn unset_equals_null_and_computed_is_ignored() {
        let current = attrs(&[
            ("region", Value::from("us-east-1")),
            ("tags", Value::Null),
            ("arn", Value::from("arn:1")),
        ]);
        let desired = attrs(&[("region", Value::from("us-east-1"))]);
        assert!(changed_attributes(&SCHEMA, &current, &desired).is_empty());

        let desired = attrs(&[
            ("region", Value::from("us-west-2")),
            ("description", Value::from("db")),
        ]);
        assert_eq!(
            changed_attributes(&SCHEMA, &current, &desired)
                .into_iter()
                .collect::<Vec<_>>(),
            vec!["description", "region"]
        );
    }

    #[test]
    fn only_handlers_with_changed_triggers_are_due() {
        let changed = BTreeSet::from(["description"]);
        assert_eq!(names(plan(HANDLERS, &changed, false)), vec!["description"]);
    }

    #[test]
    fn after_edges_order_due_handlers() {
        let changed = BTreeSet::from(["tags", "rules"]);
        assert_eq!(names(plan(HANDLERS, &changed, false)), vec!["rules", "tags"]);
    }

    #[test]
    fn predecessors_that_are_not_due_are_skipped() {
        let changed = BTreeSet::from(["tags"]);
        assert_eq!(names(plan(HANDLERS, &changed, false)), vec!["tags"]);
    }

    #[test]
    fn create_runs_first() {
        let changed = BTreeSet::from(["region", "groupName", "description", "tags"]);
        assert_eq!(
            names(plan(HANDLERS, &changed, true)),
            vec!["create", "tags", "description"]
        );
        assert_eq!(
            names(plan(HANDLERS, &BTreeSet::new(), true)),
            vec!["create"]
        );
    }

    #[test]
    fn cycles_are_detected() {
        const CYCLIC: &[HandlerSpec] = &[
            HandlerSpec::update("a", &["x"]).after(&["b"]),
            HandlerSpec::update("b", &["y"]).after(&["a"]),
        ];
        assert!(plan(CYCLIC, &BTreeSet::from(["x", "y"]), false).is_none());
        assert_eq!(names(plan(CYCLIC, &BTreeSet::from(["x"]), false)), vec!["a"]);
    }
}
