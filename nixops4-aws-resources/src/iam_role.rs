//! `iam-role`: an IAM role with its inline policy, and an instance profile
//! of the same name holding it.
//!
//! IAM has no regions, so calls carry none. The role name is the resource
//! id. Creation checks each step before taking it, so running it again
//! after an interruption finishes what is missing.

use crate::common::{field_str, found, global_call, required_str};
use nixops4_aws_core::{AttrKind, AttrSpec, Attrs, Schema, Value};
use nixops4_aws_engine::{
    HandlerContext, HandlerSpec, Observed, ReconcileError, ResourceContext, ResourceType,
};
use nixops4_aws_provider::Output;

const ATTRS: &[AttrSpec] = &[
    AttrSpec::new("name", AttrKind::String).required().immutable(),
    AttrSpec::new("assumeRolePolicy", AttrKind::String).required(),
    AttrSpec::new("policy", AttrKind::String),
    AttrSpec::new("arn", AttrKind::String).computed(),
];
const SCHEMA: Schema = Schema::new(ATTRS);

const HANDLERS: &[HandlerSpec] = &[
    HandlerSpec::create("create", &["name"]),
    HandlerSpec::update("assumeRolePolicy", &["assumeRolePolicy"]).after(&["create"]),
    HandlerSpec::update("policy", &["policy"]).after(&["create"]),
];

pub struct IamRole;

fn role_arg(name: &str) -> (&'static str, Value) {
    ("RoleName", Value::from(name))
}

fn profile_arg(name: &str) -> (&'static str, Value) {
    ("InstanceProfileName", Value::from(name))
}

fn role_arn<'a>(resource: &str, out: &'a Output) -> Result<&'a str, ReconcileError> {
    let role = out
        .get("Role")
        .and_then(Value::as_map)
        .ok_or_else(|| ReconcileError::internal(resource, "iam:GetRole returned no Role"))?;
    required_str(resource, "iam:GetRole", role, "Arn")
}

/// Whether the instance profile `name` holds the role `name`; `None` if
/// there is no such profile.
async fn profile_holds_role(
    ctx: &ResourceContext<'_>,
    name: &str,
) -> Result<Option<bool>, ReconcileError> {
    let Some(out) = found(
        ctx.invoke("iam:GetInstanceProfile", global_call([profile_arg(name)]))
            .await,
    )?
    else {
        return Ok(None);
    };
    let holds = out
        .get("InstanceProfile")
        .and_then(Value::as_map)
        .and_then(|profile| profile.get("Roles"))
        .and_then(Value::as_list)
        .unwrap_or_default()
        .iter()
        .filter_map(Value::as_map)
        .any(|role| field_str(role, "RoleName") == Some(name));
    Ok(Some(holds))
}

impl IamRole {
    async fn create(&self, ctx: &mut HandlerContext<'_>) -> Result<(), ReconcileError> {
        let name = ctx.desired_str("name")?;
        let assume_role_policy = ctx.desired("assumeRolePolicy");

        let existing = found(ctx.invoke("iam:GetRole", global_call([role_arg(name)])).await)?;
        let role = match existing {
            Some(role) => {
                tracing::info!(role = name, "role already exists");
                ctx.invoke(
                    "iam:UpdateAssumeRolePolicy",
                    global_call([role_arg(name), ("PolicyDocument", assume_role_policy.clone())]),
                )
                .await?;
                role
            }
            None => {
                ctx.invoke(
                    "iam:CreateRole",
                    global_call([
                        role_arg(name),
                        ("AssumeRolePolicyDocument", assume_role_policy.clone()),
                    ]),
                )
                .await?
            }
        };
        let arn = role_arn(ctx.name, &role)?.to_owned();

        match profile_holds_role(ctx, name).await? {
            Some(true) => {}
            holds => {
                if holds.is_none() {
                    ctx.invoke(
                        "iam:CreateInstanceProfile",
                        global_call([profile_arg(name), ("Path", Value::from("/"))]),
                    )
                    .await?;
                }
                ctx.invoke(
                    "iam:AddRoleToInstanceProfile",
                    global_call([profile_arg(name), role_arg(name)]),
                )
                .await?;
            }
        }

        ctx.set_resource_id(name);
        ctx.set("assumeRolePolicy", assume_role_policy.clone())?;
        ctx.set("arn", arn)?;
        Ok(())
    }

    async fn assume_role_policy(&self, ctx: &mut HandlerContext<'_>) -> Result<(), ReconcileError> {
        ctx.invoke(
            "iam:UpdateAssumeRolePolicy",
            global_call([
                role_arg(ctx.resource_id()?),
                ("PolicyDocument", ctx.desired("assumeRolePolicy").clone()),
            ]),
        )
        .await?;
        Ok(())
    }

    async fn policy(&self, ctx: &mut HandlerContext<'_>) -> Result<(), ReconcileError> {
        let name = ctx.resource_id()?.to_owned();
        match ctx.desired("policy") {
            Value::Null => {
                found(
                    ctx.invoke(
                        "iam:DeleteRolePolicy",
                        global_call([role_arg(&name), ("PolicyName", Value::from(name.as_str()))]),
                    )
                    .await,
                )?;
            }
            policy => {
                ctx.invoke(
                    "iam:PutRolePolicy",
                    global_call([
                        role_arg(&name),
                        ("PolicyName", Value::from(name.as_str())),
                        ("PolicyDocument", policy.clone()),
                    ]),
                )
                .await?;
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResourceType for IamRole {
    fn type_tag(&self) -> &'static str {
        "iam-role"
    }

    fn schema(&self) -> &Schema {
        &SCHEMA
    }

    fn handlers(&self) -> &[HandlerSpec] {
        HANDLERS
    }

    /// Role policies name the buckets they grant access to.
    fn create_after_types(&self) -> &[&'static str] {
        &["s3-bucket"]
    }

    async fn run_handler(
        &self,
        handler: &'static str,
        ctx: &mut HandlerContext<'_>,
    ) -> Result<(), ReconcileError> {
        match handler {
            "create" => self.create(ctx).await,
            "assumeRolePolicy" => self.assume_role_policy(ctx).await,
            "policy" => self.policy(ctx).await,
            other => Err(ReconcileError::internal(
                ctx.name,
                format!("unknown handler {}", other),
            )),
        }
    }

    /// A role whose creation was interrupted before its instance profile
    /// held it is reported absent, so that creation runs again.
    async fn poll(&self, ctx: &ResourceContext<'_>) -> Result<Observed, ReconcileError> {
        let recorded = ctx.record.resource_id.as_deref();
        let Some(name) = recorded.or_else(|| ctx.current_str("name")) else {
            return Ok(Observed::Absent);
        };
        let role = ctx
            .invoke("iam:GetRole", global_call([role_arg(name)]))
            .await?;
        if recorded.is_none() && profile_holds_role(ctx, name).await? != Some(true) {
            return Ok(Observed::Absent);
        }
        Ok(Observed::ready(
            name,
            Attrs::from([("arn".to_owned(), Value::from(role_arn(ctx.name, &role)?))]),
        ))
    }

    async fn delete(&self, ctx: &ResourceContext<'_>) -> Result<(), ReconcileError> {
        let name = ctx.resource_id()?;
        found(
            ctx.invoke(
                "iam:RemoveRoleFromInstanceProfile",
                global_call([profile_arg(name), role_arg(name)]),
            )
            .await,
        )?;
        found(
            ctx.invoke("iam:DeleteInstanceProfile", global_call([profile_arg(name)]))
                .await,
        )?;
        found(
            ctx.invoke(
                "iam:DeleteRolePolicy",
                global_call([role_arg(name), ("PolicyName", Value::from(name))]),
            )
            .await,
        )?;
        ctx.invoke("iam:DeleteRole", global_call([role_arg(name)]))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{attrs, defn, map, Harness};
    use nixops4_aws_core::{Definition, Lifecycle};
    use nixops4_aws_engine::ConvergeOutcome;

    const TRUST: &str = r#"{"Statement":[{"Effect":"Allow","Principal":{"Service":"ec2.amazonaws.com"},"Action":"sts:AssumeRole"}]}"#;

    fn role() -> Definition {
        Definition::new("web-role", "iam-role", Attrs::new())
            .with("name", "web")
            .with("assumeRolePolicy", TRUST)
            .with("policy", r#"{"Statement":[]}"#)
    }

    fn role_output() -> Output {
        attrs([(
            "Role",
            map([
                ("RoleName", Value::from("web")),
                ("Arn", Value::from("arn:aws:iam::123:role/web")),
            ]),
        )])
    }

    fn profile_output(roles: Vec<Value>) -> Output {
        attrs([("InstanceProfile", map([("Roles", Value::List(roles))]))])
    }

    #[tokio::test]
    async fn creates_the_role_and_its_profile() {
        let h = Harness::new();
        h.fail("iam:GetRole", "NoSuchEntity");
        h.reply("iam:CreateRole", role_output());
        h.fail("iam:GetInstanceProfile", "NoSuchEntity");
        assert_eq!(h.converge(&role()).await.unwrap(), ConvergeOutcome::Created);
        assert_eq!(
            h.provider.operations(),
            [
                "iam:GetRole",
                "iam:CreateRole",
                "iam:GetInstanceProfile",
                "iam:CreateInstanceProfile",
                "iam:AddRoleToInstanceProfile",
                "iam:PutRolePolicy",
            ]
        );
        let create = h.params("iam:CreateRole");
        assert!(!create.contains_key("Region"));
        assert_eq!(create["AssumeRolePolicyDocument"], Value::from(TRUST));
        assert_eq!(h.params("iam:PutRolePolicy")["PolicyName"], Value::from("web"));

        let record = h.record("web-role");
        assert_eq!(record.resource_id.as_deref(), Some("web"));
        assert_eq!(record.get("arn"), &Value::from("arn:aws:iam::123:role/web"));
    }

    #[tokio::test]
    async fn removing_the_policy_deletes_it() {
        let h = Harness::new();
        h.fail("iam:GetRole", "NoSuchEntity");
        h.reply("iam:CreateRole", role_output());
        h.fail("iam:GetInstanceProfile", "NoSuchEntity");
        h.converge(&role()).await.unwrap();
        h.provider.clear_calls();

        let d = role().with("policy", Value::Null);
        assert_eq!(
            h.converge(&d).await.unwrap(),
            ConvergeOutcome::Updated(vec!["policy"])
        );
        assert_eq!(h.provider.operations(), ["iam:DeleteRolePolicy"]);
    }

    #[tokio::test]
    async fn a_lost_creation_finishes_what_is_missing() {
        let h = Harness::new();
        h.fail("iam:GetRole", "NoSuchEntity");
        h.reply("iam:CreateRole", role_output());
        h.fail("iam:GetInstanceProfile", "NoSuchEntity");
        h.fail("iam:AddRoleToInstanceProfile", "ServiceFailure");
        assert!(h.converge(&role()).await.is_err());
        let record = h.record("web-role");
        assert_eq!(record.lifecycle, Lifecycle::Starting);
        assert_eq!(record.resource_id, None);
        h.provider.clear_calls();

        // the poll finds the role but an empty profile, then creation resumes
        h.reply("iam:GetRole", role_output());
        h.reply("iam:GetInstanceProfile", profile_output(vec![]));
        h.reply("iam:GetRole", role_output());
        h.reply("iam:GetInstanceProfile", profile_output(vec![]));
        assert_eq!(h.converge(&role()).await.unwrap(), ConvergeOutcome::Created);
        assert_eq!(
            h.provider.operations(),
            [
                "iam:GetRole",
                "iam:GetInstanceProfile",
                "iam:GetRole",
                "iam:UpdateAssumeRolePolicy",
                "iam:GetInstanceProfile",
                "iam:AddRoleToInstanceProfile",
                "iam:PutRolePolicy",
            ]
        );
        assert_eq!(h.provider.count("iam:CreateRole"), 0);
        assert_eq!(h.record("web-role").lifecycle, Lifecycle::Up);
    }

    #[tokio::test]
    async fn a_complete_lost_creation_is_adopted() {
        let h = Harness::new();
        let store = h.store.clone();
        h.fail("iam:GetRole", "NoSuchEntity");
        h.reply("iam:CreateRole", role_output());
        h.fail("iam:GetInstanceProfile", "NoSuchEntity");
        h.provider.on("iam:AddRoleToInstanceProfile", move |_| {
            store.fail_next_commit();
            Ok(Default::default())
        });
        assert!(h.converge(&role()).await.is_err());
        h.provider.clear_calls();

        h.reply("iam:GetRole", role_output());
        h.reply(
            "iam:GetInstanceProfile",
            profile_output(vec![map([("RoleName", Value::from("web"))])]),
        );
        assert_eq!(
            h.converge(&role()).await.unwrap(),
            ConvergeOutcome::Updated(vec!["assumeRolePolicy", "policy"])
        );
        assert_eq!(h.provider.count("iam:CreateRole"), 0);
        assert_eq!(h.provider.count("iam:AddRoleToInstanceProfile"), 0);
        assert_eq!(h.record("web-role").resource_id.as_deref(), Some("web"));
    }

    #[tokio::test]
    async fn deletion_tolerates_missing_parts() {
        let h = Harness::new();
        h.fail("iam:GetRole", "NoSuchEntity");
        h.reply("iam:CreateRole", role_output());
        h.fail("iam:GetInstanceProfile", "NoSuchEntity");
        h.converge(&role()).await.unwrap();
        h.provider.clear_calls();

        h.fail("iam:RemoveRoleFromInstanceProfile", "NoSuchEntity");
        h.fail("iam:DeleteInstanceProfile", "NoSuchEntity");
        assert!(h.destroy("web-role").await.unwrap());
        assert_eq!(
            h.provider.operations(),
            [
                "iam:RemoveRoleFromInstanceProfile",
                "iam:DeleteInstanceProfile",
                "iam:DeleteRolePolicy",
                "iam:DeleteRole",
            ]
        );
        assert_eq!(h.record("web-role").lifecycle, Lifecycle::Missing);
    }
}
