//! `aws-ec2-launch-template`: an EC2 launch template. Templates are never
//! modified in place; any change creates a new template.

use crate::common::{call, field, first, recorded_region, required_str, string_list, tag_list};
use nixops4_aws_core::{AttrKind, AttrSpec, Attrs, Schema, Value};
use nixops4_aws_engine::{
    HandlerContext, HandlerSpec, Observed, ReconcileError, ResourceContext, ResourceType,
};
use std::collections::BTreeMap;

const ATTRS: &[AttrSpec] = &[
    AttrSpec::new("region", AttrKind::String).required().immutable(),
    AttrSpec::new("name", AttrKind::String).required().immutable(),
    AttrSpec::new("versionDescription", AttrKind::String).immutable(),
    AttrSpec::new("launchTemplateData", AttrKind::Map).required().immutable(),
    AttrSpec::new("tags", AttrKind::Map).immutable(),
    AttrSpec::new("latestVersion", AttrKind::Int).computed(),
];
const SCHEMA: Schema = Schema::new(ATTRS);

const HANDLERS: &[HandlerSpec] = &[HandlerSpec::create(
    "create",
    &[
        "region",
        "name",
        "versionDescription",
        "launchTemplateData",
        "tags",
    ],
)];

pub struct LaunchTemplate;

#[async_trait::async_trait]
impl ResourceType for LaunchTemplate {
    fn type_tag(&self) -> &'static str {
        "aws-ec2-launch-template"
    }

    fn schema(&self) -> &Schema {
        &SCHEMA
    }

    fn handlers(&self) -> &[HandlerSpec] {
        HANDLERS
    }

    fn create_after_types(&self) -> &[&'static str] {
        &["iam-role"]
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
        let tags = ctx.desired("tags").as_map().filter(|t| !t.is_empty());
        let tag_specifications = tags.map(|tags| {
            Value::List(vec![Value::Map(BTreeMap::from([
                ("ResourceType".to_owned(), Value::from("launch-template")),
                ("Tags".to_owned(), tag_list(tags)),
            ]))])
        });
        let out = ctx
            .invoke(
                "ec2:CreateLaunchTemplate",
                call(
                    ctx.desired("region"),
                    [
                        ("LaunchTemplateName", ctx.desired("name").clone()),
                        ("VersionDescription", ctx.desired("versionDescription").clone()),
                        ("LaunchTemplateData", ctx.desired("launchTemplateData").clone()),
                        ("ClientToken", Value::from(ctx.idempotency_token()?)),
                        ("TagSpecifications", Value::from(tag_specifications)),
                    ],
                ),
            )
            .await?;
        let template = out
            .get("LaunchTemplate")
            .and_then(Value::as_map)
            .cloned()
            .unwrap_or_default();
        let id = required_str(ctx.name, "ec2:CreateLaunchTemplate", &template, "LaunchTemplateId")?;
        ctx.set_resource_id(id);
        ctx.set("latestVersion", field(&template, "LatestVersionNumber"))?;
        Ok(())
    }

    /// Before its id is recorded, a template is looked up by its name, which
    /// is unique within the region.
    async fn poll(&self, ctx: &ResourceContext<'_>) -> Result<Observed, ReconcileError> {
        let query = match (ctx.record.resource_id.as_deref(), ctx.current_str("name")) {
            (Some(id), _) => ("LaunchTemplateIds", string_list([id])),
            (None, Some(name)) => ("LaunchTemplateNames", string_list([name])),
            (None, None) => return Ok(Observed::Absent),
        };
        let region = recorded_region(ctx)?;
        let out = ctx
            .invoke("ec2:DescribeLaunchTemplates", call(&region, [query]))
            .await?;
        let Some(template) = first(&out, "LaunchTemplates") else {
            return Ok(Observed::Absent);
        };
        let id = required_str(
            ctx.name,
            "ec2:DescribeLaunchTemplates",
            template,
            "LaunchTemplateId",
        )?;
        let latest = field(template, "LatestVersionNumber");
        if template.get("DefaultVersionNumber") != Some(&latest) {
            tracing::warn!("the template's default version is not the version deployed here");
        }
        Ok(Observed::ready(
            id,
            Attrs::from([("latestVersion".to_owned(), latest)]),
        ))
    }

    async fn delete(&self, ctx: &ResourceContext<'_>) -> Result<(), ReconcileError> {
        let region = recorded_region(ctx)?;
        ctx.invoke(
            "ec2:DeleteLaunchTemplate",
            call(&region, [("LaunchTemplateId", Value::from(ctx.resource_id()?))]),
        )
        .await?;
        Ok(())
    }
}
