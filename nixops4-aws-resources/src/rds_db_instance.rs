//! `ec2-rds-dbinstance`: an RDS database instance.
//!
//! Creating, modifying and deleting an instance all take minutes; each waits
//! for the instance to reach the status it is after. Deleting one asks for
//! confirmation and keeps a final snapshot.

use crate::common::{call, field, field_str, first, recorded_region};
use nixops4_aws_core::{AttrKind, AttrSpec, Attrs, ConfigurationError, Definition, Schema, Value};
use nixops4_aws_engine::{
    HandlerContext, HandlerSpec, Observed, ObservedStatus, ReconcileError, ResourceContext,
    ResourceType,
};
use uuid::Uuid;

const ATTRS: &[AttrSpec] = &[
    AttrSpec::new("region", AttrKind::String).required().immutable(),
    AttrSpec::new("id", AttrKind::String).required().requires_reboot(),
    AttrSpec::new("masterUsername", AttrKind::String).required().immutable(),
    AttrSpec::new("engine", AttrKind::String).required().immutable(),
    AttrSpec::new("dbName", AttrKind::String).immutable(),
    AttrSpec::new("port", AttrKind::Int).immutable(),
    AttrSpec::new("subnetGroup", AttrKind::String).immutable(),
    AttrSpec::new("instanceClass", AttrKind::String).required().requires_reboot(),
    AttrSpec::new("allocatedStorage", AttrKind::Int).required().requires_reboot(),
    AttrSpec::new("masterPassword", AttrKind::String).required().requires_reboot(),
    AttrSpec::new("multiAZ", AttrKind::Bool),
    AttrSpec::new("securityGroups", AttrKind::List),
    AttrSpec::new("vpcSecurityGroups", AttrKind::List),
    AttrSpec::new("endpoint", AttrKind::String).computed(),
];
const SCHEMA: Schema = Schema::new(ATTRS);

const MODIFIABLE: &[&str] = &[
    "id",
    "instanceClass",
    "allocatedStorage",
    "masterPassword",
    "multiAZ",
    "securityGroups",
    "vpcSecurityGroups",
];

const HANDLERS: &[HandlerSpec] = &[
    HandlerSpec::create(
        "create",
        &["region", "masterUsername", "engine", "dbName", "port", "subnetGroup"],
    ),
    HandlerSpec::update("modify", MODIFIABLE).after(&["create"]),
];

const AVAILABLE: &str = "available";

/// Statuses an instance passes through on its way to `available`.
const TRANSITIONAL: &[&str] = &[
    "creating",
    "backing-up",
    "modifying",
    "configuring-enhanced-monitoring",
];

/// Modifiable attributes and the `ModifyDBInstance` parameters for them.
const MODIFY_PARAMS: &[(&str, &str)] = &[
    ("instanceClass", "DBInstanceClass"),
    ("allocatedStorage", "AllocatedStorage"),
    ("masterPassword", "MasterUserPassword"),
    ("multiAZ", "MultiAZ"),
    ("securityGroups", "DBSecurityGroups"),
    ("vpcSecurityGroups", "VpcSecurityGroupIds"),
];

pub struct RdsDbInstance;

/// The instance named `identifier`, or `None` if there is no such instance.
async fn describe(
    ctx: &ResourceContext<'_>,
    region: &Value,
    identifier: &str,
) -> Result<Option<Attrs>, ReconcileError> {
    let result = ctx
        .invoke(
            "rds:DescribeDBInstances",
            call(region, [("DBInstanceIdentifier", Value::from(identifier))]),
        )
        .await;
    match result {
        Ok(out) => Ok(first(&out, "DBInstances").cloned()),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}

fn status(instance: &Attrs) -> &str {
    field_str(instance, "DBInstanceStatus").unwrap_or("unknown")
}

fn endpoint(instance: &Attrs) -> Value {
    let Some(endpoint) = instance.get("Endpoint").and_then(Value::as_map) else {
        return Value::Null;
    };
    match (field_str(endpoint, "Address"), endpoint.get("Port")) {
        (Some(address), Some(Value::Int(port))) => Value::from(format!("{}:{}", address, port)),
        _ => Value::Null,
    }
}

/// Poll until the instance has status `target`. Statuses other than the
/// known transitional ones are errors.
async fn wait_for_status(
    ctx: &ResourceContext<'_>,
    region: &Value,
    identifier: &str,
    target: &str,
) -> Result<Attrs, ReconcileError> {
    let mut waiter = ctx.waiter(format!("instance {} to become {}", identifier, target));
    loop {
        if let Some(instance) = describe(ctx, region, identifier).await? {
            let current = status(&instance);
            if current == target {
                return Ok(instance);
            }
            if current != AVAILABLE && !TRANSITIONAL.contains(&current) {
                return Err(ReconcileError::internal(
                    ctx.name,
                    format!("instance {} is in unexpected status {}", identifier, current),
                ));
            }
            tracing::debug!(identifier, status = current, "waiting for instance");
        }
        waiter.tick().await?;
    }
}

impl RdsDbInstance {
    async fn create(&self, ctx: &mut HandlerContext<'_>) -> Result<(), ReconcileError> {
        let region = ctx.desired("region");
        let identifier = ctx.desired_str("id")?;
        let in_vpc = !ctx.desired("subnetGroup").is_null();
        let (sg_param, sg_attr) = if in_vpc {
            ("VpcSecurityGroupIds", "vpcSecurityGroups")
        } else {
            ("DBSecurityGroups", "securityGroups")
        };
        ctx.invoke(
            "rds:CreateDBInstance",
            call(
                region,
                [
                    ("DBInstanceIdentifier", Value::from(identifier)),
                    ("DBName", ctx.desired("dbName").clone()),
                    ("AllocatedStorage", ctx.desired("allocatedStorage").clone()),
                    ("DBInstanceClass", ctx.desired("instanceClass").clone()),
                    ("Engine", ctx.desired("engine").clone()),
                    ("MasterUsername", ctx.desired("masterUsername").clone()),
                    ("MasterUserPassword", ctx.desired("masterPassword").clone()),
                    ("Port", ctx.desired("port").clone()),
                    ("MultiAZ", ctx.desired("multiAZ").clone()),
                    ("DBSubnetGroupName", ctx.desired("subnetGroup").clone()),
                    (sg_param, ctx.desired(sg_attr).clone()),
                ],
            ),
        )
        .await?;
        ctx.set_resource_id(identifier);

        let instance = wait_for_status(ctx, region, identifier, AVAILABLE).await?;
        for attr in MODIFIABLE {
            ctx.set(attr, ctx.desired(attr).clone())?;
        }
        ctx.set("endpoint", endpoint(&instance))?;
        Ok(())
    }

    async fn modify(&self, ctx: &mut HandlerContext<'_>) -> Result<(), ReconcileError> {
        let region = ctx.desired("region");
        let identifier = ctx.resource_id()?.to_owned();
        let new_identifier = ctx.desired_str("id")?;
        let renamed = ctx.current("id") != ctx.desired("id");

        let mut args = vec![
            ("DBInstanceIdentifier", Value::from(identifier.as_str())),
            ("ApplyImmediately", Value::from(true)),
        ];
        let mut changed = Vec::new();
        for (attr, param) in MODIFY_PARAMS {
            if ctx.current(attr) != ctx.desired(attr) {
                args.push((*param, ctx.desired(attr).clone()));
                changed.push(*attr);
            }
        }
        if renamed {
            args.push(("NewDBInstanceIdentifier", Value::from(new_identifier)));
        }

        wait_for_status(ctx, region, &identifier, AVAILABLE).await?;
        ctx.invoke("rds:ModifyDBInstance", call(region, args)).await?;

        // Security group changes apply without the instance leaving
        // `available`; anything else passes through `modifying`.
        let groups_only = !renamed
            && changed
                .iter()
                .all(|attr| matches!(*attr, "securityGroups" | "vpcSecurityGroups"));
        let target = if renamed { new_identifier } else { identifier.as_str() };
        if !groups_only {
            wait_for_status(ctx, region, target, "modifying").await?;
        }
        wait_for_status(ctx, region, target, AVAILABLE).await?;
        if renamed {
            tracing::info!(from = %identifier, to = new_identifier, "renamed instance");
            ctx.set_resource_id(new_identifier);
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResourceType for RdsDbInstance {
    fn type_tag(&self) -> &'static str {
        "ec2-rds-dbinstance"
    }

    fn schema(&self) -> &Schema {
        &SCHEMA
    }

    fn handlers(&self) -> &[HandlerSpec] {
        HANDLERS
    }

    fn create_after_types(&self) -> &[&'static str] {
        &["ec2-rds-dbsecurity-group", "rds-db-subnet-group"]
    }

    fn starting_attributes(&self) -> &[&'static str] {
        MODIFIABLE
    }

    fn confirm_destroy(&self, _ctx: &ResourceContext<'_>) -> bool {
        true
    }

    fn validate(&self, defn: &Definition) -> Result<(), ConfigurationError> {
        let vpc_groups = defn.get("vpcSecurityGroups");
        let has_vpc_groups = vpc_groups.as_list().is_some_and(|l| !l.is_empty());
        if defn.get("subnetGroup").is_null() {
            if has_vpc_groups {
                return Err(ConfigurationError::invalid(
                    &defn.name,
                    "vpcSecurityGroups is only valid for an instance in a subnetGroup",
                ));
            }
            return Ok(());
        }
        if !has_vpc_groups {
            return Err(ConfigurationError::invalid(
                &defn.name,
                "an instance in a subnetGroup needs vpcSecurityGroups",
            ));
        }
        let groups = defn.get("securityGroups");
        if !groups.is_null() && groups.string_items() != ["default"] {
            return Err(ConfigurationError::invalid(
                &defn.name,
                "securityGroups must be [\"default\"] for an instance in a subnetGroup",
            ));
        }
        Ok(())
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
        let identifier = match ctx.record.resource_id.as_deref() {
            Some(id) => id,
            None => match ctx.current_str("id") {
                Some(id) => id,
                None => return Ok(Observed::Absent),
            },
        };
        let region = recorded_region(ctx)?;
        let Some(instance) = describe(ctx, &region, identifier).await? else {
            return Ok(Observed::Absent);
        };
        let status = match status(&instance) {
            AVAILABLE => ObservedStatus::Ready,
            s if TRANSITIONAL.contains(&s) => ObservedStatus::Transitional(s.to_owned()),
            s => ObservedStatus::Unrecognized(s.to_owned()),
        };
        let resource_id = field_str(&instance, "DBInstanceIdentifier").unwrap_or(identifier);
        Ok(Observed::Present {
            resource_id: resource_id.to_owned(),
            status,
            attributes: Attrs::from([
                ("instanceClass".to_owned(), field(&instance, "DBInstanceClass")),
                ("allocatedStorage".to_owned(), field(&instance, "AllocatedStorage")),
                ("multiAZ".to_owned(), field(&instance, "MultiAZ")),
                ("endpoint".to_owned(), endpoint(&instance)),
            ]),
        })
    }

    async fn delete(&self, ctx: &ResourceContext<'_>) -> Result<(), ReconcileError> {
        let region = recorded_region(ctx)?;
        let identifier = ctx.resource_id()?;
        let Some(instance) = describe(ctx, &region, identifier).await? else {
            tracing::warn!(identifier, "instance was already deleted");
            return Ok(());
        };
        if status(&instance) != "deleting" {
            let snapshot = format!("{}-final-snapshot-{}", identifier, Uuid::new_v4().simple());
            ctx.invoke(
                "rds:DeleteDBInstance",
                call(
                    &region,
                    [
                        ("DBInstanceIdentifier", Value::from(identifier)),
                        ("FinalDBSnapshotIdentifier", Value::from(snapshot.as_str())),
                    ],
                ),
            )
            .await?;
            tracing::info!(identifier, snapshot = %snapshot, "deleting instance");
        }
        let mut waiter = ctx.waiter(format!("instance {} to be deleted", identifier));
        while describe(ctx, &region, identifier).await?.is_some() {
            waiter.tick().await?;
        }
        Ok(())
    }
}
