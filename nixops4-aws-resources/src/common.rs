//! Conventions shared by the resource types.

use nixops4_aws_core::{Attrs, Value};
use nixops4_aws_engine::{HandlerContext, ReconcileError, ResourceContext};
use nixops4_aws_provider::{Output, Params};
use std::collections::{BTreeMap, BTreeSet};

/// Parameters of a call in `region`. Null arguments are left out.
pub(crate) fn call<'a>(region: &Value, args: impl IntoIterator<Item = (&'a str, Value)>) -> Params {
    let mut params = global_call(args);
    params.insert("Region".to_owned(), region.clone());
    params
}

/// Parameters of a call to a service without regions, such as IAM.
pub(crate) fn global_call<'a>(args: impl IntoIterator<Item = (&'a str, Value)>) -> Params {
    args.into_iter()
        .filter(|(_, value)| !value.is_null())
        .map(|(key, value)| (key.to_owned(), value))
        .collect()
}

/// The result of a call, or `None` if the error says the thing is not there.
pub(crate) fn found<T>(result: Result<T, ReconcileError>) -> Result<Option<T>, ReconcileError> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

/// The recorded region, for polls and deletes.
pub(crate) fn recorded_region(ctx: &ResourceContext<'_>) -> Result<Value, ReconcileError> {
    match ctx.current("region") {
        Value::Null => Err(ReconcileError::internal(ctx.name, "no region is recorded")),
        region => Ok(region.clone()),
    }
}

/// The items of the list `key` of a describe result.
pub(crate) fn items<'a>(out: &'a Output, key: &str) -> impl Iterator<Item = &'a Attrs> {
    out.get(key)
        .and_then(Value::as_list)
        .unwrap_or_default()
        .iter()
        .filter_map(Value::as_map)
}

pub(crate) fn first<'a>(out: &'a Output, key: &str) -> Option<&'a Attrs> {
    items(out, key).next()
}

pub(crate) fn field_str<'a>(item: &'a Attrs, key: &str) -> Option<&'a str> {
    item.get(key).and_then(Value::as_str)
}

pub(crate) fn field(item: &Attrs, key: &str) -> Value {
    item.get(key).cloned().unwrap_or_default()
}

/// `key` of a result, which the operation always returns.
pub(crate) fn required_str<'a>(
    resource: &str,
    operation: &str,
    item: &'a Attrs,
    key: &str,
) -> Result<&'a str, ReconcileError> {
    field_str(item, key).ok_or_else(|| {
        ReconcileError::internal(resource, format!("{} returned no {}", operation, key))
    })
}

pub(crate) fn string_set(value: &Value) -> BTreeSet<String> {
    value.string_items().into_iter().map(str::to_owned).collect()
}

pub(crate) fn string_list<'a>(items: impl IntoIterator<Item = &'a str>) -> Value {
    Value::List(items.into_iter().map(Value::from).collect())
}

/// The tag that carries a resource's idempotency token, for creating calls
/// that take no client token or whose result cannot be found by one.
pub(crate) const TOKEN_TAG: &str = "nixops4-aws:idempotency-token";

/// `TagSpecifications` that mark the resource being created with `token`.
pub(crate) fn token_tag_specifications(resource_type: &str, token: &str) -> Value {
    let tag = Value::Map(BTreeMap::from([
        ("Key".to_owned(), Value::from(TOKEN_TAG)),
        ("Value".to_owned(), Value::from(token)),
    ]));
    Value::List(vec![Value::Map(BTreeMap::from([
        ("ResourceType".to_owned(), Value::from(resource_type)),
        ("Tags".to_owned(), Value::List(vec![tag])),
    ]))])
}

/// How a describe call finds an EC2 resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lookup<'a> {
    Id(&'a str),
    /// Not recorded yet: look for the token tag of an interrupted creation.
    Token(&'a str),
}

impl<'a> Lookup<'a> {
    /// By the recorded id, else by the recorded token. `None` if neither is
    /// recorded.
    pub(crate) fn recorded(ctx: &ResourceContext<'a>) -> Option<Self> {
        let record = ctx.record;
        match (
            record.resource_id.as_deref(),
            record.idempotency_token.as_deref(),
        ) {
            (Some(id), _) => Some(Lookup::Id(id)),
            (None, Some(token)) => Some(Lookup::Token(token)),
            (None, None) => None,
        }
    }

    /// The describe parameter: the id list under `ids_key`, or a tag filter.
    pub(crate) fn param(self, ids_key: &'static str) -> (&'static str, Value) {
        match self {
            Lookup::Id(id) => (ids_key, string_list([id])),
            Lookup::Token(token) => (
                "Filters",
                Value::List(vec![Value::Map(BTreeMap::from([
                    ("Name".to_owned(), Value::from(format!("tag:{}", TOKEN_TAG))),
                    ("Values".to_owned(), string_list([token])),
                ]))]),
            ),
        }
    }
}

/// A tag map as the `[{Key, Value}]` list AWS takes.
pub(crate) fn tag_list<'a>(tags: impl IntoIterator<Item = (&'a String, &'a Value)>) -> Value {
    Value::List(
        tags.into_iter()
            .map(|(k, v)| {
                Value::Map(BTreeMap::from([
                    ("Key".to_owned(), Value::from(k.as_str())),
                    ("Value".to_owned(), v.clone()),
                ]))
            })
            .collect(),
    )
}

/// The `Tags` list of a describe result as a tag map, without the token tag;
/// null when there are none.
pub(crate) fn tag_map(item: &Attrs) -> Value {
    let tags: BTreeMap<String, Value> = item
        .get("Tags")
        .and_then(Value::as_list)
        .unwrap_or_default()
        .iter()
        .filter_map(Value::as_map)
        .filter_map(|tag| Some((field_str(tag, "Key")?, field(tag, "Value"))))
        .filter(|(key, _)| *key != TOKEN_TAG)
        .map(|(key, value)| (key.to_owned(), value))
        .collect();
    if tags.is_empty() {
        Value::Null
    } else {
        Value::Map(tags)
    }
}

/// Bring the tags of an EC2 resource to the desired `tags`: removed keys are
/// deleted, new and changed ones created.
pub(crate) async fn apply_ec2_tags(ctx: &mut HandlerContext<'_>) -> Result<(), ReconcileError> {
    let region = ctx.desired("region");
    let id = ctx.resource_id()?.to_owned();
    let empty = BTreeMap::new();
    let desired = ctx.desired("tags").as_map().unwrap_or(&empty);
    let current = ctx.current("tags").as_map().unwrap_or(&empty);

    let removed: Vec<Value> = current
        .keys()
        .filter(|k| !desired.contains_key(*k))
        .map(|k| Value::Map(BTreeMap::from([("Key".to_owned(), Value::from(k.as_str()))])))
        .collect();
    if !removed.is_empty() {
        ctx.invoke(
            "ec2:DeleteTags",
            call(
                region,
                [
                    ("Resources", string_list([id.as_str()])),
                    ("Tags", Value::List(removed)),
                ],
            ),
        )
        .await?;
    }

    let changed: Vec<(&String, &Value)> = desired
        .iter()
        .filter(|(k, v)| current.get(*k) != Some(*v))
        .collect();
    if !changed.is_empty() {
        ctx.invoke(
            "ec2:CreateTags",
            call(
                region,
                [
                    ("Resources", string_list([id.as_str()])),
                    ("Tags", tag_list(changed)),
                ],
            ),
        )
        .await?;
    }
    Ok(())
}
