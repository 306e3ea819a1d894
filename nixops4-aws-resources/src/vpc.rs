//! `vpc`: a virtual private cloud.
//!
//! `CreateVpc` takes no client token; the VPC is tagged with the idempotency
//! token, so that a creation whose result was lost can be found again.

use crate::common::{
    apply_ec2_tags, call, field, first, recorded_region, required_str, tag_map,
    token_tag_specifications, Lookup,
};
use nixops4_aws_core::{AttrKind, AttrSpec, Attrs, Schema, Value};
use nixops4_aws_engine::{
    HandlerContext, HandlerSpec, Observed, ObservedStatus, ReconcileError, ResourceContext,
    ResourceType,
};
use nixops4_aws_provider::RetryPolicy;
use std::collections::BTreeMap;

const ATTRS: &[AttrSpec] = &[
    AttrSpec::new("region", AttrKind::String).required().immutable(),
    AttrSpec::new("cidrBlock", AttrKind::String).required().immutable(),
    AttrSpec::new("instanceTenancy", AttrKind::String).immutable(),
    AttrSpec::new("enableDnsSupport", AttrKind::Bool),
    AttrSpec::new("enableDnsHostnames", AttrKind::Bool),
    AttrSpec::new("tags", AttrKind::Map),
];
const SCHEMA: Schema = Schema::new(ATTRS);

const HANDLERS: &[HandlerSpec] = &[
    HandlerSpec::create("create", &["region", "cidrBlock", "instanceTenancy"]),
    HandlerSpec::update("dns", &["enableDnsSupport", "enableDnsHostnames"]).after(&["create"]),
    HandlerSpec::update("tags", &["tags"]).after(&["create"]),
];

/// Support must be on before hostnames can be.
const DNS_ATTRIBUTES: &[(&str, &str)] = &[
    ("enableDnsSupport", "EnableDnsSupport"),
    ("enableDnsHostnames", "EnableDnsHostnames"),
];

pub struct Vpc;

async fn describe(
    ctx: &ResourceContext<'_>,
    region: &Value,
    lookup: Lookup<'_>,
) -> Result<Option<Attrs>, ReconcileError> {
    let out = ctx
        .invoke("ec2:DescribeVpcs", call(region, [lookup.param("VpcIds")]))
        .await?;
    Ok(first(&out, "Vpcs").cloned())
}

fn status(vpc: &Attrs) -> ObservedStatus {
    match vpc.get("State").and_then(Value::as_str) {
        Some("available") => ObservedStatus::Ready,
        Some("pending") => ObservedStatus::Transitional("pending".to_owned()),
        other => ObservedStatus::Unrecognized(other.unwrap_or("none").to_owned()),
    }
}

impl Vpc {
    async fn create(&self, ctx: &mut HandlerContext<'_>) -> Result<(), ReconcileError> {
        let region = ctx.desired("region");
        let out = ctx
            .invoke(
                "ec2:CreateVpc",
                call(
                    region,
                    [
                        ("CidrBlock", ctx.desired("cidrBlock").clone()),
                        ("InstanceTenancy", ctx.desired("instanceTenancy").clone()),
                        (
                            "TagSpecifications",
                            token_tag_specifications("vpc", ctx.idempotency_token()?),
                        ),
                    ],
                ),
            )
            .await?;
        let vpc = out.get("Vpc").and_then(Value::as_map).cloned().unwrap_or_default();
        let id = required_str(ctx.name, "ec2:CreateVpc", &vpc, "VpcId")?.to_owned();
        ctx.set_resource_id(id.as_str());

        let mut waiter = ctx.waiter("the VPC to become available");
        loop {
            match describe(ctx, region, Lookup::Id(&id)).await?.as_ref().map(status) {
                Some(ObservedStatus::Ready) => break,
                Some(ObservedStatus::Unrecognized(state)) => {
                    return Err(ReconcileError::internal(
                        ctx.name,
                        format!("VPC {} is in unexpected state {}", id, state),
                    ))
                }
                Some(ObservedStatus::Transitional(_)) | None => waiter.tick().await?,
            }
        }
        Ok(())
    }

    async fn dns(&self, ctx: &mut HandlerContext<'_>) -> Result<(), ReconcileError> {
        let region = ctx.desired("region");
        let id = ctx.resource_id()?.to_owned();
        for (attr, aws_attr) in DNS_ATTRIBUTES {
            let desired = ctx.desired(attr);
            if desired.is_null() || desired == ctx.current(attr) {
                continue;
            }
            let setting = Value::Map(BTreeMap::from([("Value".to_owned(), desired.clone())]));
            ctx.invoke(
                "ec2:ModifyVpcAttribute",
                call(region, [("VpcId", Value::from(id.as_str())), (*aws_attr, setting)]),
            )
            .await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResourceType for Vpc {
    fn type_tag(&self) -> &'static str {
        "vpc"
    }

    fn schema(&self) -> &Schema {
        &SCHEMA
    }

    fn handlers(&self) -> &[HandlerSpec] {
        HANDLERS
    }

    async fn run_handler(
        &self,
        handler: &'static str,
        ctx: &mut HandlerContext<'_>,
    ) -> Result<(), ReconcileError> {
        match handler {
            "create" => self.create(ctx).await,
            "dns" => self.dns(ctx).await,
            "tags" => apply_ec2_tags(ctx).await,
            other => Err(ReconcileError::internal(
                ctx.name,
                format!("unknown handler {}", other),
            )),
        }
    }

    async fn poll(&self, ctx: &ResourceContext<'_>) -> Result<Observed, ReconcileError> {
        let Some(lookup) = Lookup::recorded(ctx) else {
            return Ok(Observed::Absent);
        };
        let region = recorded_region(ctx)?;
        let Some(vpc) = describe(ctx, &region, lookup).await? else {
            return Ok(Observed::Absent);
        };
        let id = required_str(ctx.name, "ec2:DescribeVpcs", &vpc, "VpcId")?;
        let mut attributes = Attrs::from([
            ("cidrBlock".to_owned(), field(&vpc, "CidrBlock")),
            ("tags".to_owned(), tag_map(&vpc)),
        ]);
        // AWS reports a tenancy even when none was asked for.
        if !ctx.current("instanceTenancy").is_null() {
            attributes.insert("instanceTenancy".to_owned(), field(&vpc, "InstanceTenancy"));
        }
        Ok(Observed::Present {
            resource_id: id.to_owned(),
            status: status(&vpc),
            attributes,
        })
    }

    async fn delete(&self, ctx: &ResourceContext<'_>) -> Result<(), ReconcileError> {
        let region = recorded_region(ctx)?;
        ctx.invoke_with_retry(
            "ec2:DeleteVpc",
            call(&region, [("VpcId", Value::from(ctx.resource_id()?))]),
            &RetryPolicy::on_conflicts(),
        )
        .await?;
        Ok(())
    }
}
