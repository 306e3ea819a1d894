//! `rds-db-subnet-group`: the VPC subnets an RDS instance may be placed in.

use crate::common::{call, field, field_str, first, items, recorded_region, string_list};
use nixops4_aws_core::{AttrKind, AttrSpec, Attrs, Schema, Value};
use nixops4_aws_engine::{
    HandlerContext, HandlerSpec, Observed, ReconcileError, ResourceContext, ResourceType,
};
use nixops4_aws_provider::RetryPolicy;

const ATTRS: &[AttrSpec] = &[
    AttrSpec::new("region", AttrKind::String).required().immutable(),
    AttrSpec::new("groupName", AttrKind::String).required().immutable(),
    AttrSpec::new("description", AttrKind::String).required(),
    AttrSpec::new("subnetIds", AttrKind::List).required(),
];
const SCHEMA: Schema = Schema::new(ATTRS);

const HANDLERS: &[HandlerSpec] = &[
    HandlerSpec::create("create", &["region", "groupName"]),
    HandlerSpec::update("modify", &["description", "subnetIds"]).after(&["create"]),
];

/// Errors of a delete while instances are still leaving the group.
const DELETE_RETRY_CODES: &[&str] = &["DependencyViolation", "InvalidDBSubnetGroupStateFault"];

pub struct RdsDbSubnetGroup;

fn group_args(ctx: &HandlerContext<'_>, name: &str) -> [(&'static str, Value); 3] {
    [
        ("DBSubnetGroupName", Value::from(name)),
        (
            "DBSubnetGroupDescription",
            ctx.desired("description").clone(),
        ),
        ("SubnetIds", ctx.desired("subnetIds").clone()),
    ]
}

impl RdsDbSubnetGroup {
    async fn create(&self, ctx: &mut HandlerContext<'_>) -> Result<(), ReconcileError> {
        let name = ctx.desired_str("groupName")?;
        ctx.invoke(
            "rds:CreateDBSubnetGroup",
            call(ctx.desired("region"), group_args(ctx, name)),
        )
        .await?;
        ctx.set_resource_id(name);
        // the creating call takes the whole group
        ctx.set("description", ctx.desired("description").clone())?;
        ctx.set("subnetIds", ctx.desired("subnetIds").clone())?;
        Ok(())
    }

    async fn modify(&self, ctx: &mut HandlerContext<'_>) -> Result<(), ReconcileError> {
        let name = ctx.resource_id()?.to_owned();
        ctx.invoke(
            "rds:ModifyDBSubnetGroup",
            call(ctx.desired("region"), group_args(ctx, &name)),
        )
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResourceType for RdsDbSubnetGroup {
    fn type_tag(&self) -> &'static str {
        "rds-db-subnet-group"
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
            "modify" => self.modify(ctx).await,
            other => Err(ReconcileError::internal(
                ctx.name,
                format!("unknown handler {}", other),
            )),
        }
    }

    async fn poll(&self, ctx: &ResourceContext<'_>) -> Result<Observed, ReconcileError> {
        let recorded = ctx.record.resource_id.as_deref();
        let Some(name) = recorded.or_else(|| ctx.current_str("groupName")) else {
            return Ok(Observed::Absent);
        };
        let region = recorded_region(ctx)?;
        let out = ctx
            .invoke(
                "rds:DescribeDBSubnetGroups",
                call(&region, [("DBSubnetGroupName", Value::from(name))]),
            )
            .await?;
        let Some(group) = first(&out, "DBSubnetGroups") else {
            return Ok(Observed::Absent);
        };
        let subnets = string_list(
            items(group, "Subnets").filter_map(|s| field_str(s, "SubnetIdentifier")),
        );
        Ok(Observed::ready(
            name,
            Attrs::from([
                ("description".to_owned(), field(group, "DBSubnetGroupDescription")),
                ("subnetIds".to_owned(), subnets),
            ]),
        ))
    }

    async fn delete(&self, ctx: &ResourceContext<'_>) -> Result<(), ReconcileError> {
        let region = recorded_region(ctx)?;
        ctx.invoke_with_retry(
            "rds:DeleteDBSubnetGroup",
            call(&region, [("DBSubnetGroupName", Value::from(ctx.resource_id()?))]),
            &RetryPolicy::on_codes(DELETE_RETRY_CODES),
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

    fn subnets(ids: Vec<&str>) -> Definition {
        defn("dbsubnets", "rds-db-subnet-group")
            .with("groupName", "app")
            .with("description", "app subnets")
            .with("subnetIds", ids)
    }

    #[tokio::test]
    async fn creation_carries_the_whole_group() {
        let h = Harness::new();
        assert_eq!(
            h.converge(&subnets(vec!["subnet-1", "subnet-2"])).await.unwrap(),
            ConvergeOutcome::Created
        );
        assert_eq!(h.provider.operations(), ["rds:CreateDBSubnetGroup"]);
        let create = h.params("rds:CreateDBSubnetGroup");
        assert_eq!(create["SubnetIds"], Value::from(vec!["subnet-1", "subnet-2"]));
        assert_eq!(create["DBSubnetGroupDescription"], Value::from("app subnets"));
        assert_eq!(h.record("dbsubnets").resource_id.as_deref(), Some("app"));

        h.provider.clear_calls();
        let outcome = h.converge(&subnets(vec!["subnet-3"])).await.unwrap();
        assert_eq!(outcome, ConvergeOutcome::Updated(vec!["modify"]));
        let modify = h.params("rds:ModifyDBSubnetGroup");
        assert_eq!(modify["DBSubnetGroupName"], Value::from("app"));
        assert_eq!(modify["SubnetIds"], Value::from(vec!["subnet-3"]));
    }

    #[tokio::test(start_paused = true)]
    async fn deletes_wait_for_instances_to_leave() {
        let h = Harness::new();
        h.converge(&subnets(vec!["subnet-1"])).await.unwrap();
        h.provider.clear_calls();

        h.fail("rds:DeleteDBSubnetGroup", "InvalidDBSubnetGroupStateFault");
        h.fail("rds:DeleteDBSubnetGroup", "DependencyViolation");
        assert!(h.destroy("dbsubnets").await.unwrap());
        assert_eq!(h.provider.count("rds:DeleteDBSubnetGroup"), 3);

        h.converge(&subnets(vec!["subnet-1"])).await.unwrap();
        h.fail("rds:DeleteDBSubnetGroup", "DBSubnetGroupNotFoundFault");
        assert!(h.destroy("dbsubnets").await.unwrap());
    }

    #[tokio::test]
    async fn a_lost_creation_is_found_by_name() {
        let h = Harness::new();
        let store = h.store.clone();
        h.provider.on("rds:CreateDBSubnetGroup", move |_| {
            store.fail_next_commit();
            Ok(Default::default())
        });
        let d = subnets(vec!["subnet-1"]);
        assert!(h.converge(&d).await.is_err());
        assert_eq!(h.record("dbsubnets").lifecycle, Lifecycle::Starting);

        h.reply(
            "rds:DescribeDBSubnetGroups",
            listing(
                "DBSubnetGroups",
                [
                    ("DBSubnetGroupName", Value::from("app")),
                    ("DBSubnetGroupDescription", Value::from("app subnets")),
                    (
                        "Subnets",
                        Value::List(vec![map([(
                            "SubnetIdentifier",
                            Value::from("subnet-1"),
                        )])]),
                    ),
                ],
            ),
        );
        assert_eq!(h.converge(&d).await.unwrap(), ConvergeOutcome::Adopted);
        assert_eq!(h.provider.count("rds:CreateDBSubnetGroup"), 1);
        assert_eq!(
            h.params("rds:DescribeDBSubnetGroups")["DBSubnetGroupName"],
            Value::from("app")
        );
        assert_eq!(h.record("dbsubnets").resource_id.as_deref(), Some("app"));
    }
}
