//! `elastic-ip`: a static public IPv4 address.
//!
//! A VPC address is identified by its allocation id, an EC2-Classic one by
//! the address itself. `AllocateAddress` takes no client token, so the
//! address is tagged with the idempotency token instead.

use crate::common::{
    call, field_str, first, recorded_region, required_str, token_tag_specifications, Lookup,
};
use nixops4_aws_core::{AttrKind, AttrSpec, Attrs, Schema, Value};
use nixops4_aws_engine::{
    HandlerContext, HandlerSpec, Observed, ReconcileError, ResourceContext, ResourceType,
};

const ATTRS: &[AttrSpec] = &[
    AttrSpec::new("region", AttrKind::String).required().immutable(),
    AttrSpec::new("vpc", AttrKind::Bool).immutable(),
    AttrSpec::new("publicIp", AttrKind::String).computed(),
];
const SCHEMA: Schema = Schema::new(ATTRS);

const HANDLERS: &[HandlerSpec] = &[HandlerSpec::create("create", &["region", "vpc"])];

pub struct ElasticIp;

fn in_vpc(vpc: &Value) -> bool {
    vpc.as_bool().unwrap_or(false)
}

async fn describe(
    ctx: &ResourceContext<'_>,
    lookup: Lookup<'_>,
) -> Result<Option<Attrs>, ReconcileError> {
    let region = recorded_region(ctx)?;
    let ids_key = if in_vpc(ctx.current("vpc")) {
        "AllocationIds"
    } else {
        "PublicIps"
    };
    let out = ctx
        .invoke("ec2:DescribeAddresses", call(&region, [lookup.param(ids_key)]))
        .await?;
    Ok(first(&out, "Addresses").cloned())
}

#[async_trait::async_trait]
impl ResourceType for ElasticIp {
    fn type_tag(&self) -> &'static str {
        "elastic-ip"
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
        if handler != "create" {
            return Err(ReconcileError::internal(
                ctx.name,
                format!("unknown handler {}", handler),
            ));
        }
        let vpc = in_vpc(ctx.desired("vpc"));
        let domain = if vpc { "vpc" } else { "standard" };
        let out = ctx
            .invoke(
                "ec2:AllocateAddress",
                call(
                    ctx.desired("region"),
                    [
                        ("Domain", Value::from(domain)),
                        (
                            "TagSpecifications",
                            token_tag_specifications("elastic-ip", ctx.idempotency_token()?),
                        ),
                    ],
                ),
            )
            .await?;
        let public_ip = required_str(ctx.name, "ec2:AllocateAddress", &out, "PublicIp")?;
        let id = if vpc {
            required_str(ctx.name, "ec2:AllocateAddress", &out, "AllocationId")?
        } else {
            public_ip
        };
        tracing::info!(public_ip, "allocated address");
        ctx.set_resource_id(id);
        ctx.set("publicIp", public_ip)?;
        Ok(())
    }

    async fn poll(&self, ctx: &ResourceContext<'_>) -> Result<Observed, ReconcileError> {
        let Some(lookup) = Lookup::recorded(ctx) else {
            return Ok(Observed::Absent);
        };
        let Some(address) = describe(ctx, lookup).await? else {
            return Ok(Observed::Absent);
        };
        let vpc = field_str(&address, "Domain") == Some("vpc");
        let key = if vpc { "AllocationId" } else { "PublicIp" };
        let id = required_str(ctx.name, "ec2:DescribeAddresses", &address, key)?;
        Ok(Observed::ready(
            id,
            Attrs::from([(
                "publicIp".to_owned(),
                Value::from(field_str(&address, "PublicIp")),
            )]),
        ))
    }

    async fn delete(&self, ctx: &ResourceContext<'_>) -> Result<(), ReconcileError> {
        let Some(address) = describe(ctx, Lookup::Id(ctx.resource_id()?)).await? else {
            tracing::warn!("address was already released");
            return Ok(());
        };
        let region = recorded_region(ctx)?;
        let vpc = in_vpc(ctx.current("vpc"));
        if vpc {
            if let Some(association) = field_str(&address, "AssociationId") {
                ctx.invoke(
                    "ec2:DisassociateAddress",
                    call(&region, [("AssociationId", Value::from(association))]),
                )
                .await?;
            }
        }
        let release = if vpc {
            ("AllocationId", Value::from(ctx.resource_id()?))
        } else {
            ("PublicIp", Value::from(ctx.resource_id()?))
        };
        ctx.invoke("ec2:ReleaseAddress", call(&region, [release]))
            .await?;
        Ok(())
    }
}
