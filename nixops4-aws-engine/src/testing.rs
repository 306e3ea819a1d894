//! A configurable resource type for exercising the engine against `FakeProvider`.
//!
//! Operations: `test:CreateThing` (returns `id`, optionally `arn`),
//! `test:TagThing`, `test:ResizeThing`, `test:DescribeThing` and
//! `test:DeleteThing`. A describe result without `id` means absent.

use crate::{
    context::{HandlerContext, ResourceContext},
    error::ReconcileError,
    resource::{HandlerSpec, Observed, ObservedStatus, ResourceType},
};
use nixops4_aws_core::{AttrKind, AttrSpec, Attrs, Definition, Schema, Value};
use nixops4_aws_provider::{Output, Params};

const TEST_ATTRS: &[AttrSpec] = &[
    AttrSpec::new("region", AttrKind::String).required().immutable(),
    AttrSpec::new("groupName", AttrKind::String).immutable(),
    AttrSpec::new("parent", AttrKind::String),
    AttrSpec::new("tags", AttrKind::Map),
    AttrSpec::new("size", AttrKind::Int).requires_reboot(),
    AttrSpec::new("arn", AttrKind::String).computed(),
];
pub const TEST_SCHEMA: Schema = Schema::new(TEST_ATTRS);

pub const TEST_HANDLERS: &[HandlerSpec] = &[
    HandlerSpec::create("create", &["region", "groupName"]),
    HandlerSpec::update("parent", &["parent"]),
    HandlerSpec::update("size", &["size"]).after(&["create"]),
    HandlerSpec::update("tags", &["tags"]).after(&["size"]),
];

pub struct TestType {
    pub tag: &'static str,
    pub schema: Schema,
    pub handlers: &'static [HandlerSpec],
    pub create_after: &'static [&'static str],
    pub confirm: bool,
}

impl TestType {
    pub fn new(tag: &'static str) -> Self {
        TestType {
            tag,
            schema: TEST_SCHEMA,
            handlers: TEST_HANDLERS,
            create_after: &[],
            confirm: false,
        }
    }
}

pub fn params(pairs: &[(&str, Value)]) -> Params {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

pub fn output(pairs: &[(&str, &str)]) -> Output {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), Value::from(*v)))
        .collect()
}

pub fn defn(name: &str, tag: &str) -> Definition {
    Definition::new(name, tag, Attrs::new()).with("region", "us-east-1")
}

#[async_trait::async_trait]
impl ResourceType for TestType {
    fn type_tag(&self) -> &'static str {
        self.tag
    }

    fn schema(&self) -> &Schema {
        &self.schema
    }

    fn handlers(&self) -> &[HandlerSpec] {
        self.handlers
    }

    fn create_after_types(&self) -> &[&'static str] {
        self.create_after
    }

    fn confirm_destroy(&self, _ctx: &ResourceContext<'_>) -> bool {
        self.confirm
    }

    async fn run_handler(
        &self,
        handler: &'static str,
        ctx: &mut HandlerContext<'_>,
    ) -> Result<(), ReconcileError> {
        match handler {
            "create" => {
                let out = ctx
                    .invoke(
                        "test:CreateThing",
                        params(&[
                            ("Region", ctx.desired("region").clone()),
                            ("Name", Value::from(ctx.name)),
                            ("Parent", ctx.desired("parent").clone()),
                            ("ClientToken", Value::from(ctx.idempotency_token()?)),
                        ]),
                    )
                    .await?;
                let id = out
                    .get("id")
                    .and_then(Value::as_str)
                    .map(str::to_owned)
                    .unwrap_or_else(|| format!("{}-{}", self.tag, ctx.name));
                ctx.set_resource_id(id);
                if let Some(arn) = out.get("arn") {
                    ctx.set("arn", arn.clone())?;
                }
            }
            "parent" => {
                ctx.invoke(
                    "test:ReparentThing",
                    params(&[
                        ("Id", Value::from(ctx.resource_id()?)),
                        ("Parent", ctx.desired("parent").clone()),
                    ]),
                )
                .await?;
            }
            "size" => {
                ctx.invoke(
                    "test:ResizeThing",
                    params(&[
                        ("Id", Value::from(ctx.resource_id()?)),
                        ("Size", ctx.desired("size").clone()),
                    ]),
                )
                .await?;
            }
            "tags" => {
                ctx.invoke(
                    "test:TagThing",
                    params(&[
                        ("Id", Value::from(ctx.resource_id()?)),
                        ("Tags", ctx.desired("tags").clone()),
                    ]),
                )
                .await?;
            }
            other => {
                return Err(ReconcileError::internal(
                    ctx.name,
                    format!("unknown handler {}", other),
                ))
            }
        }
        Ok(())
    }

    async fn poll(&self, ctx: &ResourceContext<'_>) -> Result<Observed, ReconcileError> {
        let query = match &ctx.record.resource_id {
            Some(id) => params(&[("Id", Value::from(id.as_str()))]),
            None => params(&[(
                "ClientToken",
                Value::from(ctx.record.idempotency_token.clone()),
            )]),
        };
        let out = ctx.invoke("test:DescribeThing", query).await?;
        let Some(id) = out.get("id").and_then(Value::as_str) else {
            return Ok(Observed::Absent);
        };
        let status = match out.get("status").and_then(Value::as_str) {
            None | Some("available") => ObservedStatus::Ready,
            Some("creating") => ObservedStatus::Transitional("creating".to_owned()),
            Some(other) => ObservedStatus::Unrecognized(other.to_owned()),
        };
        let attributes = out
            .get("arn")
            .map(|arn| Attrs::from([("arn".to_owned(), arn.clone())]))
            .unwrap_or_default();
        Ok(Observed::Present {
            resource_id: id.to_owned(),
            status,
            attributes,
        })
    }

    async fn delete(&self, ctx: &ResourceContext<'_>) -> Result<(), ReconcileError> {
        ctx.invoke(
            "test:DeleteThing",
            params(&[("Id", Value::from(ctx.resource_id()?))]),
        )
        .await?;
        Ok(())
    }
}
