//! The AWS resource types of `nixops4-aws`.
//!
//! Each type declares its attributes and handlers, and talks to AWS through
//! provider operations named after the service and the API action, such as
//! `ec2:CreateRouteTable`. Every regional call carries the resource's
//! `Region`.

mod common;
pub mod elastic_ip;
pub mod iam_role;
pub mod launch_template;
pub mod rds_db_instance;
pub mod rds_db_security_group;
pub mod rds_db_subnet_group;
pub mod s3_bucket;
pub mod spot_fleet_request;
pub mod vpc;
pub mod vpc_route;
pub mod vpc_route_table;

#[cfg(test)]
mod testing;

pub use elastic_ip::ElasticIp;
pub use iam_role::IamRole;
pub use launch_template::LaunchTemplate;
pub use rds_db_instance::RdsDbInstance;
pub use rds_db_security_group::RdsDbSecurityGroup;
pub use rds_db_subnet_group::RdsDbSubnetGroup;
pub use s3_bucket::S3Bucket;
pub use spot_fleet_request::SpotFleetRequest;
pub use vpc::Vpc;
pub use vpc_route::VpcRoute;
pub use vpc_route_table::VpcRouteTable;

use nixops4_aws_core::ConfigurationError;
use nixops4_aws_engine::Registry;

/// A registry with every resource type of this crate.
pub fn default_registry() -> Result<Registry, ConfigurationError> {
    let mut registry = Registry::new();
    registry.register(Vpc)?;
    registry.register(VpcRouteTable)?;
    registry.register(VpcRoute)?;
    registry.register(ElasticIp)?;
    registry.register(RdsDbSecurityGroup)?;
    registry.register(RdsDbSubnetGroup)?;
    registry.register(RdsDbInstance)?;
    registry.register(LaunchTemplate)?;
    registry.register(S3Bucket)?;
    registry.register(IamRole)?;
    registry.register(SpotFleetRequest)?;
    Ok(registry)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_type_registers() {
        let registry = default_registry().unwrap();
        let tags: Vec<_> = registry.type_tags().collect();
        assert_eq!(tags.len(), 11);
        for tag in [
            "vpc",
            "vpc-route-table",
            "vpc-route",
            "elastic-ip",
            "ec2-rds-dbsecurity-group",
            "rds-db-subnet-group",
            "ec2-rds-dbinstance",
            "aws-ec2-launch-template",
            "s3-bucket",
            "iam-role",
            "aws-spot-fleet-request",
        ] {
            assert!(registry.get(tag).is_some(), "{} is not registered", tag);
        }
    }

    #[test]
    fn creation_orders_name_registered_types() {
        let registry = default_registry().unwrap();
        for tag in registry.type_tags() {
            for after in registry.get(tag).unwrap().create_after_types() {
                assert!(
                    registry.get(after).is_some(),
                    "{} is created after unknown type {}",
                    tag,
                    after
                );
            }
        }
    }
}
