use std::{fmt::Display, str::FromStr};

/// Prefix that marks a string attribute as a reference to another resource.
pub const REFERENCE_PREFIX: &str = "res-";

/// A reference from one resource's definition to another resource in the
/// same deployment, written `res-<name>.<type>` or `res-<name>.<type>.<attr>`.
///
/// Without an attribute, the reference resolves to the referenced resource's
/// cloud identifier. With an attribute, it resolves to that attribute as it
/// was last recorded in the referenced resource's state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Reference {
    pub name: String,
    pub type_tag: String,
    pub attr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReferenceError {
    #[error("missing `res-` prefix")]
    MissingPrefix,
    #[error("expected `res-<name>.<type>` or `res-<name>.<type>.<attr>`")]
    Malformed,
}

impl Reference {
    pub fn new(name: impl Into<String>, type_tag: impl Into<String>) -> Self {
        Reference {
            name: name.into(),
            type_tag: type_tag.into(),
            attr: None,
        }
    }

    pub fn with_attr(mut self, attr: impl Into<String>) -> Self {
        self.attr = Some(attr.into());
        self
    }

    /// Whether a string is meant to be parsed as a reference.
    pub fn is_reference(s: &str) -> bool {
        s.starts_with(REFERENCE_PREFIX)
    }
}

impl FromStr for Reference {
    type Err = ReferenceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let rest = s
            .strip_prefix(REFERENCE_PREFIX)
            .ok_or(ReferenceError::MissingPrefix)?;
        let parts: Vec<&str> = rest.split('.').collect();
        if parts.iter().any(|p| p.is_empty()) {
            return Err(ReferenceError::Malformed);
        }
        match parts.as_slice() {
            [name, type_tag] => Ok(Reference::new(*name, *type_tag)),
            [name, type_tag, attr] => Ok(Reference::new(*name, *type_tag).with_attr(*attr)),
            _ => Err(ReferenceError::Malformed),
        }
    }
}

impl Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}.{}", REFERENCE_PREFIX, self.name, self.type_tag)?;
        if let Some(attr) = &self.attr {
            write!(f, ".{}", attr)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_without_attr() {
        let r: Reference = "res-main.vpc".parse().unwrap();
        assert_eq!(r, Reference::new("main", "vpc"));
        assert_eq!(r.to_string(), "res-main.vpc");
    }

    #[test]
    fn parse_with_attr() {
        let r: Reference = "res-db.ec2-rds-dbinstance.endpoint".parse().unwrap();
        assert_eq!(r.name, "db");
        assert_eq!(r.type_tag, "ec2-rds-dbinstance");
        assert_eq!(r.attr.as_deref(), Some("endpoint"));
        assert_eq!(r.to_string(), "res-db.ec2-rds-dbinstance.endpoint");
    }

    #[test]
    fn parse_rejects_malformed() {
        assert_eq!(
            "vpc-123".parse::<Reference>(),
            Err(ReferenceError::MissingPrefix)
        );
        assert_eq!("res-main".parse::<Reference>(), Err(ReferenceError::Malformed));
        assert_eq!("res-main..x".parse::<Reference>(), Err(ReferenceError::Malformed));
        assert_eq!(
            "res-a.b.c.d".parse::<Reference>(),
            Err(ReferenceError::Malformed)
        );
    }
}
