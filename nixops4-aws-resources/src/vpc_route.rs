//! `vpc-route`: one route of a route table. Routes cannot be modified, so
//! every attribute is immutable.

use crate::common::{call, field_str, items, recorded_region, string_list};
use nixops4_aws_core::{AttrKind, AttrSpec, Attrs, ConfigurationError, Definition, Schema, Value};
use nixops4_aws_engine::{
    HandlerContext, HandlerSpec, Observed, ReconcileError, ResourceContext, ResourceType,
};

const ATTRS: &[AttrSpec] = &[
    AttrSpec::new("region", AttrKind::String).required().immutable(),
    AttrSpec::new("routeTableId", AttrKind::String).required().immutable(),
    AttrSpec::new("destinationCidrBlock", AttrKind::String).immutable(),
    AttrSpec::new("destinationIpv6CidrBlock", AttrKind::String).immutable(),
    AttrSpec::new("egressOnlyInternetGatewayId", AttrKind::String).immutable(),
    AttrSpec::new("gatewayId", AttrKind::String).immutable(),
    AttrSpec::new("instanceId", AttrKind::String).immutable(),
    AttrSpec::new("natGatewayId", AttrKind::String).immutable(),
    AttrSpec::new("networkInterfaceId", AttrKind::String).immutable(),
];
const SCHEMA: Schema = Schema::new(ATTRS);

const HANDLERS: &[HandlerSpec] = &[HandlerSpec::create(
    "create",
    &[
        "region",
        "routeTableId",
        "destinationCidrBlock",
        "destinationIpv6CidrBlock",
        "egressOnlyInternetGatewayId",
        "gatewayId",
        "instanceId",
        "natGatewayId",
        "networkInterfaceId",
    ],
)];

/// Route targets: attribute and API parameter.
const TARGETS: &[(&str, &str)] = &[
    ("egressOnlyInternetGatewayId", "EgressOnlyInternetGatewayId"),
    ("gatewayId", "GatewayId"),
    ("instanceId", "InstanceId"),
    ("natGatewayId", "NatGatewayId"),
    ("networkInterfaceId", "NetworkInterfaceId"),
];

const DESTINATIONS: &[(&str, &str)] = &[
    ("destinationCidrBlock", "DestinationCidrBlock"),
    ("destinationIpv6CidrBlock", "DestinationIpv6CidrBlock"),
];

pub struct VpcRoute;

/// The destination parameter and value of a route's attributes.
fn destination<'a>(get: impl Fn(&str) -> &'a Value) -> Option<(&'static str, &'a str)> {
    DESTINATIONS
        .iter()
        .find_map(|(attr, param)| Some((*param, get(*attr).as_str()?)))
}

#[async_trait::async_trait]
impl ResourceType for VpcRoute {
    fn type_tag(&self) -> &'static str {
        "vpc-route"
    }

    fn schema(&self) -> &Schema {
        &SCHEMA
    }

    fn handlers(&self) -> &[HandlerSpec] {
        HANDLERS
    }

    fn create_after_types(&self) -> &[&'static str] {
        &["vpc-route-table"]
    }

    fn validate(&self, defn: &Definition) -> Result<(), ConfigurationError> {
        let targets: Vec<&str> = TARGETS
            .iter()
            .map(|(attr, _)| *attr)
            .filter(|attr| !defn.get(attr).is_null())
            .collect();
        if targets.len() > 1 {
            return Err(ConfigurationError::invalid(
                &defn.name,
                format!("only one route target may be set, found {}", targets.join(", ")),
            ));
        }
        if targets.is_empty() {
            return Err(ConfigurationError::invalid(
                &defn.name,
                "a route target must be set",
            ));
        }
        let destinations = DESTINATIONS
            .iter()
            .filter(|(attr, _)| !defn.get(attr).is_null())
            .count();
        if destinations != 1 {
            return Err(ConfigurationError::invalid(
                &defn.name,
                "exactly one of destinationCidrBlock and destinationIpv6CidrBlock must be set",
            ));
        }
        Ok(())
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
        let Some((dest_param, dest)) = destination(|attr| ctx.desired(attr)) else {
            return Err(ReconcileError::internal(ctx.name, "route has no destination"));
        };
        let mut args = vec![
            ("RouteTableId", ctx.desired("routeTableId").clone()),
            (dest_param, Value::from(dest)),
        ];
        args.extend(
            TARGETS
                .iter()
                .map(|(attr, param)| (*param, ctx.desired(attr).clone())),
        );
        ctx.invoke("ec2:CreateRoute", call(ctx.desired("region"), args))
            .await?;
        ctx.set_resource_id(dest);
        Ok(())
    }

    /// A route is found by its table and destination, which the starting
    /// record already carries.
    async fn poll(&self, ctx: &ResourceContext<'_>) -> Result<Observed, ReconcileError> {
        let region = recorded_region(ctx)?;
        let table = ctx.current("routeTableId");
        let Some(table_id) = table.as_str() else {
            return Ok(Observed::Absent);
        };
        let Some((dest_param, id)) = destination(|attr| ctx.current(attr)) else {
            return Ok(Observed::Absent);
        };
        let out = ctx
            .invoke(
                "ec2:DescribeRouteTables",
                call(&region, [("RouteTableIds", string_list([table_id]))]),
            )
            .await?;
        let found = items(&out, "RouteTables")
            .flat_map(|t| items(t, "Routes"))
            .find(|route| field_str(route, dest_param) == Some(id));
        let Some(route) = found else {
            return Ok(Observed::Absent);
        };
        // A route whose target is gone turns into a blackhole. It still
        // exists and must be deleted like any other.
        if field_str(route, "State") == Some("blackhole") {
            tracing::warn!(destination = id, "route is a blackhole");
        }
        let mut attributes = Attrs::new();
        for (attr, param) in TARGETS {
            if let Some(target) = field_str(route, param) {
                attributes.insert(attr.to_string(), Value::from(target));
            }
        }
        Ok(Observed::ready(id, attributes))
    }

    async fn delete(&self, ctx: &ResourceContext<'_>) -> Result<(), ReconcileError> {
        let region = recorded_region(ctx)?;
        let id = ctx.resource_id()?;
        let Some((dest_param, _)) = destination(|attr| ctx.current(attr)) else {
            return Err(ReconcileError::internal(ctx.name, "no destination is recorded"));
        };
        ctx.invoke(
            "ec2:DeleteRoute",
            call(
                &region,
                [
                    ("RouteTableId", ctx.current("routeTableId").clone()),
                    (dest_param, Value::from(id)),
                ],
            ),
        )
        .await?;
        Ok(())
    }
}
