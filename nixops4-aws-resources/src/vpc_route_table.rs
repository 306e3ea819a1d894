//! `vpc-route-table`: a route table of a VPC, with the virtual private
//! gateways whose routes it learns.

use crate::common::{
    apply_ec2_tags, call, field, first, recorded_region, required_str, string_list, string_set,
    tag_map, token_tag_specifications, Lookup,
};
use nixops4_aws_core::{AttrKind, AttrSpec, Attrs, Schema, Value};
use nixops4_aws_engine::{
    HandlerContext, HandlerSpec, Observed, ReconcileError, ResourceContext, ResourceType,
};

const ATTRS: &[AttrSpec] = &[
    AttrSpec::new("region", AttrKind::String).required().immutable(),
    AttrSpec::new("vpcId", AttrKind::String).required().immutable(),
    AttrSpec::new("propagatingVgws", AttrKind::List),
    AttrSpec::new("tags", AttrKind::Map),
];
const SCHEMA: Schema = Schema::new(ATTRS);

const HANDLERS: &[HandlerSpec] = &[
    HandlerSpec::create("create", &["region", "vpcId"]),
    HandlerSpec::update("propagateVgws", &["propagatingVgws"]).after(&["create"]),
    HandlerSpec::update("tags", &["tags"]).after(&["create"]),
];

pub struct VpcRouteTable;

impl VpcRouteTable {
    /// The client token makes a repeated call return the same table; the
    /// token tag lets a poll find it before its id is recorded.
    async fn create(&self, ctx: &mut HandlerContext<'_>) -> Result<(), ReconcileError> {
        let token = ctx.idempotency_token()?;
        let out = ctx
            .invoke(
                "ec2:CreateRouteTable",
                call(
                    ctx.desired("region"),
                    [
                        ("VpcId", ctx.desired("vpcId").clone()),
                        ("ClientToken", Value::from(token)),
                        (
                            "TagSpecifications",
                            token_tag_specifications("route-table", token),
                        ),
                    ],
                ),
            )
            .await?;
        let table = out
            .get("RouteTable")
            .and_then(Value::as_map)
            .cloned()
            .unwrap_or_default();
        let id = required_str(ctx.name, "ec2:CreateRouteTable", &table, "RouteTableId")?;
        ctx.set_resource_id(id);
        Ok(())
    }

    async fn propagate_vgws(&self, ctx: &mut HandlerContext<'_>) -> Result<(), ReconcileError> {
        let region = ctx.desired("region");
        let id = ctx.resource_id()?.to_owned();
        let current = string_set(ctx.current("propagatingVgws"));
        let desired = string_set(ctx.desired("propagatingVgws"));

        for vgw in current.difference(&desired) {
            ctx.invoke(
                "ec2:DisableVgwRoutePropagation",
                call(
                    region,
                    [
                        ("GatewayId", Value::from(vgw.as_str())),
                        ("RouteTableId", Value::from(id.as_str())),
                    ],
                ),
            )
            .await?;
        }
        for vgw in desired.difference(&current) {
            ctx.invoke(
                "ec2:EnableVgwRoutePropagation",
                call(
                    region,
                    [
                        ("GatewayId", Value::from(vgw.as_str())),
                        ("RouteTableId", Value::from(id.as_str())),
                    ],
                ),
            )
            .await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResourceType for VpcRouteTable {
    fn type_tag(&self) -> &'static str {
        "vpc-route-table"
    }

    fn schema(&self) -> &Schema {
        &SCHEMA
    }

    fn handlers(&self) -> &[HandlerSpec] {
        HANDLERS
    }

    fn create_after_types(&self) -> &[&'static str] {
        &["vpc"]
    }

    async fn run_handler(
        &self,
        handler: &'static str,
        ctx: &mut HandlerContext<'_>,
    ) -> Result<(), ReconcileError> {
        match handler {
            "create" => self.create(ctx).await,
            "propagateVgws" => self.propagate_vgws(ctx).await,
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
        let out = ctx
            .invoke(
                "ec2:DescribeRouteTables",
                call(&region, [lookup.param("RouteTableIds")]),
            )
            .await?;
        let Some(table) = first(&out, "RouteTables") else {
            return Ok(Observed::Absent);
        };
        let id = required_str(ctx.name, "ec2:DescribeRouteTables", table, "RouteTableId")?;
        let vgws: Vec<&str> = table
            .get("PropagatingVgws")
            .and_then(Value::as_list)
            .unwrap_or_default()
            .iter()
            .filter_map(|vgw| vgw.as_map()?.get("GatewayId")?.as_str())
            .collect();
        Ok(Observed::ready(
            id,
            Attrs::from([
                ("vpcId".to_owned(), field(table, "VpcId")),
                ("propagatingVgws".to_owned(), string_list(vgws)),
                ("tags".to_owned(), tag_map(table)),
            ]),
        ))
    }

    async fn delete(&self, ctx: &ResourceContext<'_>) -> Result<(), ReconcileError> {
        let region = recorded_region(ctx)?;
        ctx.invoke(
            "ec2:DeleteRouteTable",
            call(&region, [("RouteTableId", Value::from(ctx.resource_id()?))]),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{defn, listing, map, Harness};
    use nixops4_aws_core::{Definition, Lifecycle};
    use nixops4_aws_engine::ConvergeOutcome;

    fn table(vgws: Vec<&str>) -> Definition {
        defn("rt", "vpc-route-table")
            .with("vpcId", "vpc-1")
            .with("propagatingVgws", vgws)
    }

    async fn created(h: &Harness, vgws: Vec<&str>) {
        h.reply(
            "ec2:CreateRouteTable",
            Attrs::from([(
                "RouteTable".to_owned(),
                map([("RouteTableId", Value::from("rtb-1"))]),
            )]),
        );
        assert_eq!(h.converge(&table(vgws)).await.unwrap(), ConvergeOutcome::Created);
    }

    #[tokio::test]
    async fn creates_in_the_vpc_and_enables_propagation() {
        let h = Harness::new();
        created(&h, vec!["vgw-1"]).await;
        assert_eq!(
            h.provider.operations(),
            ["ec2:CreateRouteTable", "ec2:EnableVgwRoutePropagation"]
        );
        let create = h.params("ec2:CreateRouteTable");
        assert_eq!(create["VpcId"], Value::from("vpc-1"));
        assert_eq!(
            create["ClientToken"],
            Value::from(h.record("rt").idempotency_token)
        );
        let enable = h.params("ec2:EnableVgwRoutePropagation");
        assert_eq!(enable["GatewayId"], Value::from("vgw-1"));
        assert_eq!(enable["RouteTableId"], Value::from("rtb-1"));
        assert_eq!(enable["Region"], Value::from("us-east-1"));
    }

    #[tokio::test]
    async fn propagation_follows_the_set_difference() {
        let h = Harness::new();
        created(&h, vec!["vgw-1", "vgw-2"]).await;
        h.provider.clear_calls();

        let outcome = h.converge(&table(vec!["vgw-2", "vgw-3"])).await.unwrap();
        assert_eq!(outcome, ConvergeOutcome::Updated(vec!["propagateVgws"]));
        assert_eq!(
            h.params("ec2:DisableVgwRoutePropagation")["GatewayId"],
            Value::from("vgw-1")
        );
        assert_eq!(
            h.params("ec2:EnableVgwRoutePropagation")["GatewayId"],
            Value::from("vgw-3")
        );
    }

    #[tokio::test]
    async fn changing_the_vpc_needs_recreation() {
        let h = Harness::new();
        created(&h, vec![]).await;
        let err = h
            .converge(&table(vec![]).with("vpcId", "vpc-2"))
            .await
            .unwrap_err();
        assert!(matches!(err, ReconcileError::ImmutableAttributeChanged { .. }));
    }

    #[tokio::test]
    async fn polls_read_propagating_gateways() {
        let h = Harness::new();
        created(&h, vec![]).await;
        h.reply(
            "ec2:DescribeRouteTables",
            listing(
                "RouteTables",
                [
                    ("RouteTableId", Value::from("rtb-1")),
                    ("VpcId", Value::from("vpc-1")),
                    (
                        "PropagatingVgws",
                        Value::List(vec![map([("GatewayId", Value::from("vgw-9"))])]),
                    ),
                ],
            ),
        );
        let record = h.reconciler.poll("rt").await.unwrap().unwrap();
        assert_eq!(record.get("propagatingVgws"), &Value::from(vec!["vgw-9"]));
    }

    #[tokio::test]
    async fn deleting_a_deleted_table_succeeds() {
        let h = Harness::new();
        created(&h, vec![]).await;
        h.fail("ec2:DeleteRouteTable", "InvalidRouteTableID.NotFound");
        assert!(h.destroy("rt").await.unwrap());
        assert_eq!(h.record("rt").resource_id, None);
    }

    #[tokio::test]
    async fn a_lost_creation_is_found_by_its_token() {
        let h = Harness::new();
        let store = h.store.clone();
        h.provider.on("ec2:CreateRouteTable", move |_| {
            store.fail_next_commit();
            Ok(Attrs::from([(
                "RouteTable".to_owned(),
                map([("RouteTableId", Value::from("rtb-1"))]),
            )]))
        });
        assert!(h.converge(&table(vec![])).await.is_err());
        assert_eq!(h.record("rt").lifecycle, Lifecycle::Starting);
        h.provider.clear_calls();

        h.reply(
            "ec2:DescribeRouteTables",
            listing(
                "RouteTables",
                [
                    ("RouteTableId", Value::from("rtb-1")),
                    ("VpcId", Value::from("vpc-1")),
                ],
            ),
        );
        assert_eq!(
            h.converge(&table(vec![])).await.unwrap(),
            ConvergeOutcome::Adopted
        );
        assert_eq!(h.provider.operations(), ["ec2:DescribeRouteTables"]);
        assert!(h.params("ec2:DescribeRouteTables").contains_key("Filters"));
        assert_eq!(h.record("rt").resource_id.as_deref(), Some("rtb-1"));
    }
}
