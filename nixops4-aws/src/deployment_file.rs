//! Reading deployment files.
//!
//! ```json
//! {
//!   "resources": {
//!     "main": { "type": "vpc", "region": "us-east-1", "cidrBlock": "10.0.0.0/16" },
//!     "rt": { "type": "vpc-route-table", "region": "us-east-1", "vpcId": "res-main.vpc" }
//!   }
//! }
//! ```
//!
//! Strings starting with `res-` are references to other resources.

use anyhow::{bail, Context, Result};
use nixops4_aws_core::{Attrs, Definition, Value};
use serde::Deserialize;
use std::{collections::BTreeMap, path::Path};

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DeploymentFile {
    #[serde(default)]
    resources: BTreeMap<String, serde_json::Map<String, serde_json::Value>>,
}

pub(crate) fn load(path: &Path) -> Result<Vec<Definition>> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading deployment file {}", path.display()))?;
    parse(&text).with_context(|| format!("loading deployment file {}", path.display()))
}

/// Definitions in name order.
pub(crate) fn parse(text: &str) -> Result<Vec<Definition>> {
    let file: DeploymentFile = serde_json::from_str(text).context("parsing deployment JSON")?;
    file.resources
        .into_iter()
        .map(|(name, mut attrs)| {
            let type_tag = match attrs.remove("type") {
                Some(serde_json::Value::String(t)) => t,
                Some(_) => bail!("resource `{}`: `type` must be a string", name),
                None => bail!("resource `{}`: missing `type`", name),
            };
            let attributes = attrs
                .into_iter()
                .map(|(attr, json)| {
                    let value = Value::try_from(json)
                        .with_context(|| format!("resource `{}`: attribute `{}`", name, attr))?;
                    Ok((attr, value))
                })
                .collect::<Result<Attrs>>()?;
            Ok(Definition::new(name, type_tag, attributes))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use nixops4_aws_core::Reference;
    use std::io::Write as _;

    #[test]
    fn definitions_with_references() {
        let defs = parse(
            r#"{
                "resources": {
                    "rt": {
                        "type": "vpc-route-table",
                        "region": "us-east-1",
                        "vpcId": "res-main.vpc",
                        "propagatingVgws": ["vgw-1"]
                    },
                    "main": { "type": "vpc", "region": "us-east-1", "enableDnsSupport": true }
                }
            }"#,
        )
        .unwrap();
        assert_eq!(defs.len(), 2);
        assert_eq!(defs[0].name, "main");
        assert_eq!(defs[0].type_tag, "vpc");
        assert_eq!(defs[0].get("enableDnsSupport"), &Value::from(true));
        assert!(defs[0].get("type").is_null());

        let rt = &defs[1];
        assert_eq!(
            rt.get("vpcId"),
            &Value::Reference(Reference::new("main", "vpc"))
        );
        assert_eq!(rt.get("propagatingVgws"), &Value::from(vec!["vgw-1"]));
    }

    #[test]
    fn rejects_bad_resources() {
        assert!(parse(r#"{"resources": {"a": {"region": "us-east-1"}}}"#).is_err());
        assert!(parse(r#"{"resources": {"a": {"type": 3}}}"#).is_err());
        let e = parse(r#"{"resources": {"a": {"type": "rds-db-subnet-group", "x": 1.5}}}"#)
            .unwrap_err();
        assert!(format!("{:#}", e).contains("attribute `x`"));
        assert!(parse(r#"{"resources": {"a": {"type": "vpc", "x": "res-"}}}"#).is_err());
        assert!(parse(r#"{"resource": {}}"#).is_err());
    }

    #[test]
    fn empty_deployment() {
        assert!(parse("{}").unwrap().is_empty());
    }

    #[test]
    fn load_names_the_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{\"resources\": {\"ip\": {\"type\": \"elastic-ip\", \"region\": \"eu-west-1\"}}}")
            .unwrap();
        let defs = load(file.path()).unwrap();
        assert_eq!(defs[0].get("region"), &Value::from("eu-west-1"));

        let missing = file.path().with_extension("missing");
        let e = load(&missing).unwrap_err();
        assert!(e.to_string().contains("reading deployment file"));
    }
}
