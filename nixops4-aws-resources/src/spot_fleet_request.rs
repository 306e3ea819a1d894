//! `aws-spot-fleet-request`: a spot fleet request over launch templates.
//!
//! The request is made with the idempotency token as its `ClientToken`, so
//! repeating an interrupted request returns the request already made.

use crate::common::{
    apply_ec2_tags, call, field, field_str, first, global_call, recorded_region, required_str,
    string_list, tag_list, tag_map,
};
use nixops4_aws_core::{AttrKind, AttrSpec, Attrs, ConfigurationError, Definition, Schema, Value};
use nixops4_aws_engine::{
    HandlerContext, HandlerSpec, Observed, ObservedStatus, ReconcileError, ResourceContext,
    ResourceType,
};
use nixops4_aws_provider::ProviderError;
use std::collections::BTreeMap;

const ATTRS: &[AttrSpec] = &[
    AttrSpec::new("region", AttrKind::String).required().immutable(),
    AttrSpec::new("iamFleetRole", AttrKind::String).required().immutable(),
    AttrSpec::new("type", AttrKind::String).immutable(),
    AttrSpec::new("launchTemplateConfigs", AttrKind::List).required().immutable(),
    AttrSpec::new("spotPrice", AttrKind::String).immutable(),
    AttrSpec::new("spotMaxTotalPrice", AttrKind::String).immutable(),
    AttrSpec::new("targetCapacity", AttrKind::Int).required(),
    AttrSpec::new("tags", AttrKind::Map),
];
const SCHEMA: Schema = Schema::new(ATTRS);

const HANDLERS: &[HandlerSpec] = &[
    HandlerSpec::create(
        "create",
        &[
            "region",
            "iamFleetRole",
            "type",
            "launchTemplateConfigs",
            "spotPrice",
            "spotMaxTotalPrice",
        ],
    ),
    HandlerSpec::update("targetCapacity", &["targetCapacity"]).after(&["create"]),
    HandlerSpec::update("tags", &["tags"]).after(&["create"]),
];

const REQUEST_TYPES: &[&str] = &["request", "maintain"];

/// Definition keys of a launch template override, and the keys AWS uses.
const OVERRIDE_KEYS: &[(&str, &str)] = &[
    ("instanceType", "InstanceType"),
    ("spotPrice", "SpotPrice"),
    ("subnetId", "SubnetId"),
    ("availabilityZone", "AvailabilityZone"),
    ("weightedCapacity", "WeightedCapacity"),
    ("priority", "Priority"),
];

pub struct SpotFleetRequest;

fn status(state: &str) -> Option<ObservedStatus> {
    match state {
        "active" => Some(ObservedStatus::Ready),
        "submitted" | "modifying" => Some(ObservedStatus::Transitional(state.to_owned())),
        "cancelled" | "cancelled_running" | "cancelled_terminating" | "failed" => None,
        other => Some(ObservedStatus::Unrecognized(other.to_owned())),
    }
}

fn ids_arg(id: &str) -> (&'static str, Value) {
    ("SpotFleetRequestIds", string_list([id]))
}

fn launch_template_config(config: &Attrs) -> Value {
    let specification = BTreeMap::from([
        ("LaunchTemplateName".to_owned(), field(config, "launchTemplateName")),
        ("Version".to_owned(), field(config, "version")),
    ]);
    let overrides: Vec<Value> = config
        .get("overrides")
        .and_then(Value::as_list)
        .unwrap_or_default()
        .iter()
        .filter_map(Value::as_map)
        .map(|o| {
            Value::Map(
                OVERRIDE_KEYS
                    .iter()
                    .map(|(from, to)| (to.to_string(), field(o, from)))
                    .filter(|(_, v)| !v.is_null())
                    .collect(),
            )
        })
        .collect();
    let mut result = BTreeMap::from([(
        "LaunchTemplateSpecification".to_owned(),
        Value::Map(specification),
    )]);
    if !overrides.is_empty() {
        result.insert("Overrides".to_owned(), Value::List(overrides));
    }
    Value::Map(result)
}

impl SpotFleetRequest {
    /// The fleet role as an ARN; a bare role name is looked up.
    async fn fleet_role_arn(&self, ctx: &HandlerContext<'_>) -> Result<String, ReconcileError> {
        let role = ctx.desired_str("iamFleetRole")?;
        if role.starts_with("arn:") {
            return Ok(role.to_owned());
        }
        let out = ctx
            .invoke("iam:GetRole", global_call([("RoleName", Value::from(role))]))
            .await?;
        let found = out.get("Role").and_then(Value::as_map).ok_or_else(|| {
            ReconcileError::internal(ctx.name, "iam:GetRole returned no Role")
        })?;
        Ok(required_str(ctx.name, "iam:GetRole", found, "Arn")?.to_owned())
    }

    async fn create(&self, ctx: &mut HandlerContext<'_>) -> Result<(), ReconcileError> {
        let role = self.fleet_role_arn(ctx).await?;
        let configs: Vec<Value> = ctx
            .desired("launchTemplateConfigs")
            .as_list()
            .unwrap_or_default()
            .iter()
            .filter_map(Value::as_map)
            .map(launch_template_config)
            .collect();
        let tags = ctx.desired("tags").as_map().filter(|t| !t.is_empty());
        let tag_specifications = tags
            .map(|tags| {
                Value::List(vec![Value::Map(BTreeMap::from([
                    ("ResourceType".to_owned(), Value::from("spot-fleet-request")),
                    ("Tags".to_owned(), tag_list(tags)),
                ]))])
            })
            .unwrap_or_default();
        let request_type = match ctx.desired("type") {
            Value::Null => Value::from("maintain"),
            t => t.clone(),
        };
        let config: Attrs = [
            ("ClientToken", Value::from(ctx.idempotency_token()?)),
            ("IamFleetRole", Value::from(role)),
            ("LaunchTemplateConfigs", Value::List(configs)),
            ("TargetCapacity", ctx.desired("targetCapacity").clone()),
            ("Type", request_type),
            ("SpotPrice", ctx.desired("spotPrice").clone()),
            ("SpotMaxTotalPrice", ctx.desired("spotMaxTotalPrice").clone()),
            ("TagSpecifications", tag_specifications),
        ]
        .into_iter()
        .filter(|(_, v)| !v.is_null())
        .map(|(k, v)| (k.to_owned(), v))
        .collect();

        tracing::info!(
            capacity = ?ctx.desired("targetCapacity"),
            "requesting spot fleet"
        );
        let out = ctx
            .invoke(
                "ec2:RequestSpotFleet",
                call(ctx.desired("region"), [("SpotFleetRequestConfig", Value::Map(config))]),
            )
            .await?;
        let id = required_str(ctx.name, "ec2:RequestSpotFleet", &out, "SpotFleetRequestId")?;
        ctx.set_resource_id(id);
        let (capacity, tags) = (ctx.desired("targetCapacity"), ctx.desired("tags"));
        ctx.set("targetCapacity", capacity.clone())?;
        ctx.set("tags", tags.clone())?;
        Ok(())
    }

    async fn target_capacity(&self, ctx: &mut HandlerContext<'_>) -> Result<(), ReconcileError> {
        ctx.invoke(
            "ec2:ModifySpotFleetRequest",
            call(
                ctx.desired("region"),
                [
                    ("SpotFleetRequestId", Value::from(ctx.resource_id()?)),
                    ("TargetCapacity", ctx.desired("targetCapacity").clone()),
                ],
            ),
        )
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResourceType for SpotFleetRequest {
    fn type_tag(&self) -> &'static str {
        "aws-spot-fleet-request"
    }

    fn schema(&self) -> &Schema {
        &SCHEMA
    }

    fn handlers(&self) -> &[HandlerSpec] {
        HANDLERS
    }

    fn create_after_types(&self) -> &[&'static str] {
        &["iam-role", "aws-ec2-launch-template"]
    }

    fn validate(&self, defn: &Definition) -> Result<(), ConfigurationError> {
        if let Some(t) = defn.get("type").as_str() {
            if !REQUEST_TYPES.contains(&t) {
                return Err(ConfigurationError::invalid(
                    &defn.name,
                    format!("type must be request or maintain, not `{}`", t),
                ));
            }
        }
        let configs = defn.get("launchTemplateConfigs").as_list().unwrap_or_default();
        if configs.is_empty() {
            return Err(ConfigurationError::invalid(
                &defn.name,
                "a spot fleet needs at least one launch template config",
            ));
        }
        for config in configs {
            let named = config
                .as_map()
                .and_then(|c| field_str(c, "launchTemplateName"))
                .is_some();
            if !named {
                return Err(ConfigurationError::invalid(
                    &defn.name,
                    "every launch template config needs a launchTemplateName",
                ));
            }
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
            "targetCapacity" => self.target_capacity(ctx).await,
            "tags" => apply_ec2_tags(ctx).await,
            other => Err(ReconcileError::internal(
                ctx.name,
                format!("unknown handler {}", other),
            )),
        }
    }

    /// Without a recorded id there is nothing to look up. Creating again with
    /// the recorded token returns the request an interrupted creation made.
    async fn poll(&self, ctx: &ResourceContext<'_>) -> Result<Observed, ReconcileError> {
        let Some(id) = ctx.record.resource_id.as_deref() else {
            return Ok(Observed::Absent);
        };
        let region = recorded_region(ctx)?;
        let out = ctx
            .invoke("ec2:DescribeSpotFleetRequests", call(&region, [ids_arg(id)]))
            .await?;
        let Some(request) = first(&out, "SpotFleetRequestConfigs") else {
            return Ok(Observed::Absent);
        };
        let state = field_str(request, "SpotFleetRequestState").unwrap_or("none");
        let Some(status) = status(state) else {
            return Ok(Observed::Absent);
        };
        let config = request
            .get("SpotFleetRequestConfig")
            .and_then(Value::as_map)
            .cloned()
            .unwrap_or_default();
        Ok(Observed::Present {
            resource_id: id.to_owned(),
            status,
            attributes: Attrs::from([
                ("targetCapacity".to_owned(), field(&config, "TargetCapacity")),
                ("tags".to_owned(), tag_map(request)),
            ]),
        })
    }

    async fn delete(&self, ctx: &ResourceContext<'_>) -> Result<(), ReconcileError> {
        let id = ctx.resource_id()?;
        let region = recorded_region(ctx)?;
        let out = ctx
            .invoke(
                "ec2:CancelSpotFleetRequests",
                call(
                    &region,
                    [ids_arg(id), ("TerminateInstances", Value::from(true))],
                ),
            )
            .await?;
        // the call succeeds even when a request could not be cancelled
        if let Some(error) = first(&out, "UnsuccessfulFleetRequests")
            .and_then(|failed| failed.get("Error"))
            .and_then(Value::as_map)
        {
            let code = field_str(error, "Code").unwrap_or("Unknown");
            if code == "fleetRequestIdDoesNotExist" {
                tracing::warn!(request = id, "spot fleet request was already deleted");
                return Ok(());
            }
            return Err(ReconcileError::Provider {
                resource: ctx.name.to_owned(),
                operation: "ec2:CancelSpotFleetRequests".to_owned(),
                error: ProviderError::new(
                    code,
                    field_str(error, "Message").unwrap_or_default(),
                ),
            });
        }
        Ok(())
    }
}
