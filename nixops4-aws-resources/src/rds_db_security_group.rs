//! `ec2-rds-dbsecurity-group`: an RDS DB security group and its ingress
//! rules.
//!
//! A rule is a map with `cidrIp`, or with an EC2 security group given by
//! `securityGroupName` or `securityGroupId`, plus `securityGroupOwnerId`.

use crate::common::{call, field_str, first, items, recorded_region};
use nixops4_aws_core::{AttrKind, AttrSpec, Attrs, ConfigurationError, Definition, Schema, Value};
use nixops4_aws_engine::{
    HandlerContext, HandlerSpec, Observed, ObservedStatus, ReconcileError, ResourceContext,
    ResourceType,
};

const ATTRS: &[AttrSpec] = &[
    AttrSpec::new("region", AttrKind::String).required().immutable(),
    AttrSpec::new("groupName", AttrKind::String).required().immutable(),
    AttrSpec::new("description", AttrKind::String).required().immutable(),
    AttrSpec::new("rules", AttrKind::List),
];
const SCHEMA: Schema = Schema::new(ATTRS);

const HANDLERS: &[HandlerSpec] = &[
    HandlerSpec::create("create", &["region", "groupName", "description"]),
    HandlerSpec::update("rules", &["rules"]).after(&["create"]),
];

/// Rule keys and the ingress API parameters they map to.
const RULE_KEYS: &[(&str, &str)] = &[
    ("cidrIp", "CIDRIP"),
    ("securityGroupName", "EC2SecurityGroupName"),
    ("securityGroupId", "EC2SecurityGroupId"),
    ("securityGroupOwnerId", "EC2SecurityGroupOwnerId"),
];

pub struct RdsDbSecurityGroup;

fn rule_args(rule: &Value) -> Vec<(&'static str, Value)> {
    let Some(rule) = rule.as_map() else {
        return Vec::new();
    };
    RULE_KEYS
        .iter()
        .filter_map(|(key, param)| Some((*param, rule.get(*key)?.clone())))
        .collect()
}

/// The rules of a described group, in definition form.
fn observed_rules(group: &Attrs) -> Value {
    let ec2 = items(group, "EC2SecurityGroups").map(|sg| {
        let mut rule = Attrs::new();
        for (key, field) in [
            ("securityGroupId", "EC2SecurityGroupId"),
            ("securityGroupOwnerId", "EC2SecurityGroupOwnerId"),
        ] {
            if let Some(v) = field_str(sg, field) {
                rule.insert(key.to_owned(), Value::from(v));
            }
        }
        Value::Map(rule)
    });
    let cidrs = items(group, "IPRanges").filter_map(|range| {
        let cidr = field_str(range, "CIDRIP")?;
        Some(Value::Map(Attrs::from([(
            "cidrIp".to_owned(),
            Value::from(cidr),
        )])))
    });
    Value::List(ec2.chain(cidrs).collect())
}

async fn describe(
    ctx: &ResourceContext<'_>,
    region: &Value,
    name: &str,
) -> Result<Option<Attrs>, ReconcileError> {
    let out = ctx
        .invoke(
            "rds:DescribeDBSecurityGroups",
            call(region, [("DBSecurityGroupName", Value::from(name))]),
        )
        .await?;
    Ok(first(&out, "DBSecurityGroups").cloned())
}

impl RdsDbSecurityGroup {
    async fn create(&self, ctx: &mut HandlerContext<'_>) -> Result<(), ReconcileError> {
        let name = ctx.desired_str("groupName")?;
        ctx.invoke(
            "rds:CreateDBSecurityGroup",
            call(
                ctx.desired("region"),
                [
                    ("DBSecurityGroupName", Value::from(name)),
                    (
                        "DBSecurityGroupDescription",
                        ctx.desired("description").clone(),
                    ),
                ],
            ),
        )
        .await?;
        ctx.set_resource_id(name);
        Ok(())
    }

    async fn rules(&self, ctx: &mut HandlerContext<'_>) -> Result<(), ReconcileError> {
        let region = ctx.desired("region");
        let group = ctx.resource_id()?.to_owned();
        let current = ctx.current("rules").as_list().unwrap_or_default();
        let desired = ctx.desired("rules").as_list().unwrap_or_default();

        for rule in current.iter().filter(|r| !desired.contains(r)) {
            let mut args = vec![("DBSecurityGroupName", Value::from(group.as_str()))];
            args.extend(rule_args(rule));
            ctx.invoke("rds:RevokeDBSecurityGroupIngress", call(region, args))
                .await?;
        }
        for rule in desired.iter().filter(|r| !current.contains(r)) {
            let mut args = vec![("DBSecurityGroupName", Value::from(group.as_str()))];
            args.extend(rule_args(rule));
            ctx.invoke("rds:AuthorizeDBSecurityGroupIngress", call(region, args))
                .await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResourceType for RdsDbSecurityGroup {
    fn type_tag(&self) -> &'static str {
        "ec2-rds-dbsecurity-group"
    }

    fn schema(&self) -> &Schema {
        &SCHEMA
    }

    fn handlers(&self) -> &[HandlerSpec] {
        HANDLERS
    }

    fn validate(&self, defn: &Definition) -> Result<(), ConfigurationError> {
        for rule in defn.get("rules").as_list().unwrap_or_default() {
            let Some(rule) = rule.as_map() else {
                return Err(ConfigurationError::invalid(
                    &defn.name,
                    "each rule must be an attribute set",
                ));
            };
            if let Some(key) = rule
                .keys()
                .find(|k| !RULE_KEYS.iter().any(|(known, _)| known == k))
            {
                return Err(ConfigurationError::invalid(
                    &defn.name,
                    format!("unknown rule attribute `{}`", key),
                ));
            }
            let has = |key: &str| rule.get(key).is_some_and(|v| !v.is_null());
            if has("cidrIp") == (has("securityGroupName") || has("securityGroupId")) {
                return Err(ConfigurationError::invalid(
                    &defn.name,
                    "a rule needs either cidrIp or an EC2 security group",
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
            "rules" => self.rules(ctx).await,
            other => Err(ReconcileError::internal(
                ctx.name,
                format!("unknown handler {}", other),
            )),
        }
    }

    /// The group's name is its id, and is recorded before it is created.
    async fn poll(&self, ctx: &ResourceContext<'_>) -> Result<Observed, ReconcileError> {
        let recorded = ctx.record.resource_id.as_deref();
        let Some(name) = recorded.or_else(|| ctx.current_str("groupName")) else {
            return Ok(Observed::Absent);
        };
        let region = recorded_region(ctx)?;
        let Some(group) = describe(ctx, &region, name).await? else {
            return Ok(Observed::Absent);
        };
        // Authorizations still in progress leave the group as it is.
        let pending = items(&group, "EC2SecurityGroups")
            .chain(items(&group, "IPRanges"))
            .any(|r| field_str(r, "Status") == Some("authorizing"));
        let status = if pending {
            ObservedStatus::Transitional("authorizing".to_owned())
        } else {
            ObservedStatus::Ready
        };
        Ok(Observed::Present {
            resource_id: name.to_owned(),
            status,
            attributes: Attrs::from([("rules".to_owned(), observed_rules(&group))]),
        })
    }

    async fn delete(&self, ctx: &ResourceContext<'_>) -> Result<(), ReconcileError> {
        let region = recorded_region(ctx)?;
        ctx.invoke(
            "rds:DeleteDBSecurityGroup",
            call(
                &region,
                [("DBSecurityGroupName", Value::from(ctx.resource_id()?))],
            ),
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{defn, listing, map, Harness};
    use nixops4_aws_core::Lifecycle;
    use nixops4_aws_engine::ConvergeOutcome;
    use nixops4_aws_provider::ProviderError;

    fn cidr(c: &str) -> Value {
        map([("cidrIp", Value::from(c))])
    }

    fn group(rules: Vec<Value>) -> Definition {
        defn("dbsg", "ec2-rds-dbsecurity-group")
            .with("groupName", "app-db")
            .with("description", "app database")
            .with("rules", Value::List(rules))
    }

    #[test]
    fn rules_are_checked() {
        assert!(RdsDbSecurityGroup.validate(&group(vec![cidr("10.0.0.0/8")])).is_ok());
        let by_group = map([
            ("securityGroupId", Value::from("sg-1")),
            ("securityGroupOwnerId", Value::from("1234")),
        ]);
        assert!(RdsDbSecurityGroup.validate(&group(vec![by_group])).is_ok());

        let both = map([
            ("cidrIp", Value::from("10.0.0.0/8")),
            ("securityGroupId", Value::from("sg-1")),
        ]);
        assert!(RdsDbSecurityGroup.validate(&group(vec![both])).is_err());
        let unknown = map([("port", Value::from(5432i64))]);
        assert!(RdsDbSecurityGroup.validate(&group(vec![unknown])).is_err());
    }

    #[tokio::test]
    async fn rules_follow_the_set_difference() {
        let h = Harness::new();
        let d = group(vec![cidr("10.0.0.0/8"), cidr("10.1.0.0/16")]);
        assert_eq!(h.converge(&d).await.unwrap(), ConvergeOutcome::Created);
        let create = h.params("rds:CreateDBSecurityGroup");
        assert_eq!(create["DBSecurityGroupName"], Value::from("app-db"));
        assert_eq!(create["DBSecurityGroupDescription"], Value::from("app database"));
        assert_eq!(h.provider.count("rds:AuthorizeDBSecurityGroupIngress"), 2);
        assert_eq!(h.record("dbsg").resource_id.as_deref(), Some("app-db"));
        h.provider.clear_calls();

        let d = group(vec![cidr("10.1.0.0/16"), cidr("192.168.0.0/24")]);
        assert_eq!(
            h.converge(&d).await.unwrap(),
            ConvergeOutcome::Updated(vec!["rules"])
        );
        let revoke = h.params("rds:RevokeDBSecurityGroupIngress");
        assert_eq!(revoke["CIDRIP"], Value::from("10.0.0.0/8"));
        assert_eq!(revoke["DBSecurityGroupName"], Value::from("app-db"));
        let authorize = h.params("rds:AuthorizeDBSecurityGroupIngress");
        assert_eq!(authorize["CIDRIP"], Value::from("192.168.0.0/24"));
        assert!(!authorize.contains_key("EC2SecurityGroupId"));
    }

    #[tokio::test]
    async fn polls_read_rules_back() {
        let h = Harness::new();
        h.converge(&group(vec![])).await.unwrap();
        h.reply(
            "rds:DescribeDBSecurityGroups",
            listing(
                "DBSecurityGroups",
                [
                    ("DBSecurityGroupName", Value::from("app-db")),
                    (
                        "IPRanges",
                        Value::List(vec![map([
                            ("CIDRIP", Value::from("10.0.0.0/8")),
                            ("Status", Value::from("authorized")),
                        ])]),
                    ),
                    (
                        "EC2SecurityGroups",
                        Value::List(vec![map([
                            ("EC2SecurityGroupId", Value::from("sg-1")),
                            ("EC2SecurityGroupOwnerId", Value::from("1234")),
                            ("Status", Value::from("authorized")),
                        ])]),
                    ),
                ],
            ),
        );
        let record = h.reconciler.poll("dbsg").await.unwrap().unwrap();
        assert_eq!(
            record.get("rules"),
            &Value::List(vec![
                map([
                    ("securityGroupId", Value::from("sg-1")),
                    ("securityGroupOwnerId", Value::from("1234")),
                ]),
                cidr("10.0.0.0/8"),
            ])
        );

        h.fail("rds:DescribeDBSecurityGroups", "DBSecurityGroupNotFound");
        let record = h.reconciler.poll("dbsg").await.unwrap().unwrap();
        assert_eq!(record.resource_id, None);
    }

    #[tokio::test]
    async fn a_lost_creation_is_found_by_name() {
        let h = Harness::new();
        let store = h.store.clone();
        let created = std::sync::atomic::AtomicBool::new(false);
        h.provider.on("rds:CreateDBSecurityGroup", move |_| {
            if created.swap(true, std::sync::atomic::Ordering::SeqCst) {
                return Err(ProviderError::new("DBSecurityGroupAlreadyExists", "exists"));
            }
            store.fail_next_commit();
            Ok(Default::default())
        });
        let d = group(vec![]);
        assert!(h.converge(&d).await.is_err());
        assert_eq!(h.record("dbsg").lifecycle, Lifecycle::Starting);

        h.reply(
            "rds:DescribeDBSecurityGroups",
            listing(
                "DBSecurityGroups",
                [("DBSecurityGroupName", Value::from("app-db"))],
            ),
        );
        assert_eq!(h.converge(&d).await.unwrap(), ConvergeOutcome::Adopted);
        assert_eq!(h.provider.count("rds:CreateDBSecurityGroup"), 1);
        assert_eq!(
            h.params("rds:DescribeDBSecurityGroups")["DBSecurityGroupName"],
            Value::from("app-db")
        );
        assert_eq!(h.record("dbsg").resource_id.as_deref(), Some("app-db"));
    }
}
