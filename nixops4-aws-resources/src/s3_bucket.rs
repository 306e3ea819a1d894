//! `s3-bucket`: an S3 bucket with its versioning, policy, lifecycle and
//! website configuration.
//!
//! The bucket name is the resource id. It is recorded before the bucket is
//! created, so an interrupted creation is found by it.

use crate::common::{call, field, items, recorded_region};
use nixops4_aws_core::{AttrKind, AttrSpec, Attrs, ConfigurationError, Definition, Schema, Value};
use nixops4_aws_engine::{
    HandlerContext, HandlerSpec, Observed, ReconcileError, ResourceContext, ResourceType,
};
use std::collections::BTreeMap;

const ATTRS: &[AttrSpec] = &[
    AttrSpec::new("region", AttrKind::String).required().immutable(),
    AttrSpec::new("name", AttrKind::String).required().immutable(),
    AttrSpec::new("versioning", AttrKind::String),
    AttrSpec::new("policy", AttrKind::String),
    AttrSpec::new("lifeCycle", AttrKind::Map),
    AttrSpec::new("website", AttrKind::Map),
    AttrSpec::new("persistOnDestroy", AttrKind::Bool),
    AttrSpec::new("arn", AttrKind::String).computed(),
];
const SCHEMA: Schema = Schema::new(ATTRS);

const HANDLERS: &[HandlerSpec] = &[
    HandlerSpec::create("create", &["region", "name"]),
    HandlerSpec::update("versioning", &["versioning"]).after(&["create"]),
    HandlerSpec::update("policy", &["policy"]).after(&["create"]),
    HandlerSpec::update("lifecycle", &["lifeCycle"]).after(&["create"]),
    HandlerSpec::update("website", &["website"]).after(&["create"]),
    HandlerSpec::update("persistOnDestroy", &["persistOnDestroy"]).after(&["create"]),
];

const MAX_NAME_LENGTH: usize = 63;
const VERSIONING_STATUSES: &[&str] = &["Enabled", "Suspended"];
const WEBSITE_KEYS: &[&str] = &["enabled", "suffix", "errorDocument"];

pub struct S3Bucket;

fn arn(bucket: &str) -> Value {
    Value::from(format!("arn:aws:s3:::{}", bucket))
}

/// The `LocationConstraint` of a bucket in `region`. Buckets in us-east-1
/// take none, and eu-west-1 has a name of its own.
fn location_constraint(region: &str) -> Option<&str> {
    match region {
        "us-east-1" => None,
        "eu-west-1" => Some("EU"),
        other => Some(other),
    }
}

fn has_code(e: &ReconcileError, code: &str) -> bool {
    e.provider_error().is_some_and(|e| e.code == code)
}

fn bucket_arg(bucket: &str) -> (&'static str, Value) {
    ("Bucket", Value::from(bucket))
}

/// The website configuration for a desired `website`, or `None` to remove it.
fn website_configuration(website: &Value) -> Option<Value> {
    let website = website.as_map()?;
    if website.get("enabled").and_then(Value::as_bool) != Some(true) {
        return None;
    }
    let mut config = BTreeMap::from([(
        "IndexDocument".to_owned(),
        Value::Map(BTreeMap::from([(
            "Suffix".to_owned(),
            field(website, "suffix"),
        )])),
    )]);
    if let Some(key) = website
        .get("errorDocument")
        .and_then(Value::as_str)
        .filter(|k| !k.is_empty())
    {
        config.insert(
            "ErrorDocument".to_owned(),
            Value::Map(BTreeMap::from([("Key".to_owned(), Value::from(key))])),
        );
    }
    Some(Value::Map(config))
}

/// Delete every object version and delete marker in the bucket.
async fn empty(ctx: &ResourceContext<'_>, region: &Value, bucket: &str) -> Result<(), ReconcileError> {
    loop {
        let out = ctx
            .invoke("s3:ListObjectVersions", call(region, [bucket_arg(bucket)]))
            .await?;
        let objects: Vec<Value> = items(&out, "Versions")
            .chain(items(&out, "DeleteMarkers"))
            .map(|version| {
                Value::Map(
                    [("Key", "Key"), ("VersionId", "VersionId")]
                        .into_iter()
                        .map(|(key, from)| (key.to_owned(), field(version, from)))
                        .filter(|(_, v)| !v.is_null())
                        .collect(),
                )
            })
            .collect();
        if objects.is_empty() {
            return Ok(());
        }
        tracing::info!(count = objects.len(), "deleting objects");
        let delete = Value::Map(BTreeMap::from([
            ("Objects".to_owned(), Value::List(objects)),
            ("Quiet".to_owned(), Value::from(true)),
        ]));
        ctx.invoke(
            "s3:DeleteObjects",
            call(region, [bucket_arg(bucket), ("Delete", delete)]),
        )
        .await?;
    }
}

impl S3Bucket {
    async fn create(&self, ctx: &mut HandlerContext<'_>) -> Result<(), ReconcileError> {
        let region = ctx.desired("region");
        let bucket = ctx.desired_str("name")?;
        let configuration = region
            .as_str()
            .and_then(location_constraint)
            .map(|location| {
                Value::Map(BTreeMap::from([(
                    "LocationConstraint".to_owned(),
                    Value::from(location),
                )]))
            })
            .unwrap_or_default();
        let result = ctx
            .invoke(
                "s3:CreateBucket",
                call(
                    region,
                    [
                        bucket_arg(bucket),
                        ("ACL", Value::from("private")),
                        ("CreateBucketConfiguration", configuration),
                    ],
                ),
            )
            .await;
        match result {
            Ok(_) => {}
            Err(e) if has_code(&e, "BucketAlreadyOwnedByYou") => {
                tracing::info!(bucket, "bucket already exists in this account");
            }
            Err(e) => return Err(e),
        }
        ctx.set_resource_id(bucket);
        ctx.set("arn", arn(bucket))?;
        Ok(())
    }

    async fn versioning(&self, ctx: &mut HandlerContext<'_>) -> Result<(), ReconcileError> {
        let status = ctx.desired("versioning");
        if status.is_null() {
            // a bucket can be suspended, but never unversioned
            if !ctx.current("versioning").is_null() {
                tracing::warn!("versioning is left as it is; set it to Suspended to stop it");
            }
            return Ok(());
        }
        let configuration = Value::Map(BTreeMap::from([("Status".to_owned(), status.clone())]));
        ctx.invoke(
            "s3:PutBucketVersioning",
            call(
                ctx.desired("region"),
                [
                    bucket_arg(ctx.resource_id()?),
                    ("VersioningConfiguration", configuration),
                ],
            ),
        )
        .await?;
        Ok(())
    }

    async fn policy(&self, ctx: &mut HandlerContext<'_>) -> Result<(), ReconcileError> {
        let region = ctx.desired("region");
        let bucket = ctx.resource_id()?.to_owned();
        match ctx.desired("policy").as_str() {
            Some(policy) => {
                ctx.invoke(
                    "s3:PutBucketPolicy",
                    call(
                        region,
                        [bucket_arg(&bucket), ("Policy", Value::from(policy.trim()))],
                    ),
                )
                .await?;
            }
            None => {
                ctx.invoke("s3:DeleteBucketPolicy", call(region, [bucket_arg(&bucket)]))
                    .await?;
            }
        }
        Ok(())
    }

    async fn lifecycle(&self, ctx: &mut HandlerContext<'_>) -> Result<(), ReconcileError> {
        let region = ctx.desired("region");
        let bucket = ctx.resource_id()?.to_owned();
        let configuration = ctx.desired("lifeCycle");
        if configuration.is_null() {
            ctx.invoke("s3:DeleteBucketLifecycle", call(region, [bucket_arg(&bucket)]))
                .await?;
        } else {
            ctx.invoke(
                "s3:PutBucketLifecycleConfiguration",
                call(
                    region,
                    [
                        bucket_arg(&bucket),
                        ("LifecycleConfiguration", configuration.clone()),
                    ],
                ),
            )
            .await?;
        }
        Ok(())
    }

    async fn website(&self, ctx: &mut HandlerContext<'_>) -> Result<(), ReconcileError> {
        let region = ctx.desired("region");
        let bucket = ctx.resource_id()?.to_owned();
        match website_configuration(ctx.desired("website")) {
            Some(configuration) => {
                ctx.invoke(
                    "s3:PutBucketWebsite",
                    call(
                        region,
                        [
                            bucket_arg(&bucket),
                            ("WebsiteConfiguration", configuration),
                        ],
                    ),
                )
                .await?;
            }
            None => {
                ctx.invoke("s3:DeleteBucketWebsite", call(region, [bucket_arg(&bucket)]))
                    .await?;
            }
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl ResourceType for S3Bucket {
    fn type_tag(&self) -> &'static str {
        "s3-bucket"
    }

    fn schema(&self) -> &Schema {
        &SCHEMA
    }

    fn handlers(&self) -> &[HandlerSpec] {
        HANDLERS
    }

    fn validate(&self, defn: &Definition) -> Result<(), ConfigurationError> {
        if let Some(name) = defn.get("name").as_str() {
            if name.len() > MAX_NAME_LENGTH {
                return Err(ConfigurationError::invalid(
                    &defn.name,
                    format!(
                        "bucket name `{}` is longer than {} characters",
                        name, MAX_NAME_LENGTH
                    ),
                ));
            }
        }
        if let Some(status) = defn.get("versioning").as_str() {
            if !VERSIONING_STATUSES.contains(&status) {
                return Err(ConfigurationError::invalid(
                    &defn.name,
                    format!("versioning must be Enabled or Suspended, not `{}`", status),
                ));
            }
        }
        if let Some(website) = defn.get("website").as_map() {
            if let Some(key) = website.keys().find(|k| !WEBSITE_KEYS.contains(&k.as_str())) {
                return Err(ConfigurationError::invalid(
                    &defn.name,
                    format!("unknown website attribute `{}`", key),
                ));
            }
            let enabled = website.get("enabled").and_then(Value::as_bool) == Some(true);
            if enabled && website.get("suffix").and_then(Value::as_str).is_none() {
                return Err(ConfigurationError::invalid(
                    &defn.name,
                    "a website needs an index document suffix",
                ));
            }
        }
        Ok(())
    }

    /// Destroying a bucket deletes the objects in it, unless it is kept.
    fn confirm_destroy(&self, ctx: &ResourceContext<'_>) -> bool {
        ctx.current("persistOnDestroy").as_bool() != Some(true)
    }

    async fn run_handler(
        &self,
        handler: &'static str,
        ctx: &mut HandlerContext<'_>,
    ) -> Result<(), ReconcileError> {
        match handler {
            "create" => self.create(ctx).await,
            "versioning" => self.versioning(ctx).await,
            "policy" => self.policy(ctx).await,
            "lifecycle" => self.lifecycle(ctx).await,
            "website" => self.website(ctx).await,
            "persistOnDestroy" => Ok(()),
            other => Err(ReconcileError::internal(
                ctx.name,
                format!("unknown handler {}", other),
            )),
        }
    }

    async fn poll(&self, ctx: &ResourceContext<'_>) -> Result<Observed, ReconcileError> {
        let recorded = ctx.record.resource_id.as_deref();
        let Some(bucket) = recorded.or_else(|| ctx.current_str("name")) else {
            return Ok(Observed::Absent);
        };
        let region = recorded_region(ctx)?;
        ctx.invoke("s3:HeadBucket", call(&region, [bucket_arg(bucket)]))
            .await?;
        let versioning = ctx
            .invoke("s3:GetBucketVersioning", call(&region, [bucket_arg(bucket)]))
            .await?;
        Ok(Observed::ready(
            bucket,
            Attrs::from([
                ("versioning".to_owned(), field(&versioning, "Status")),
                ("arn".to_owned(), arn(bucket)),
            ]),
        ))
    }

    async fn delete(&self, ctx: &ResourceContext<'_>) -> Result<(), ReconcileError> {
        let bucket = ctx.resource_id()?;
        if ctx.current("persistOnDestroy").as_bool() == Some(true) {
            tracing::warn!(bucket, "leaving the bucket in place, because persistOnDestroy is set");
            return Ok(());
        }
        let region = recorded_region(ctx)?;
        let delete = call(&region, [bucket_arg(bucket)]);
        match ctx.invoke("s3:DeleteBucket", delete.clone()).await {
            Err(e) if has_code(&e, "BucketNotEmpty") => {
                empty(ctx, &region, bucket).await?;
                ctx.invoke("s3:DeleteBucket", delete).await?;
            }
            result => {
                result?;
            }
        }
        Ok(())
    }
}
