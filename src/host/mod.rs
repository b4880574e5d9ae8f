//! Hosts: compute targets that services are placed on
//!
//! A host is provisioned once per deployment through a [`Provisioner`],
//! after which it carries a resolved [`Reachability`].

pub mod config;
pub mod provision;

pub use config::{
    AuthMaterial, CloudVmParams, Host, HostId, HostKind, NetworkZone, PodParams, Reachability,
};
pub use provision::{LocalProvisioner, Provisioner, StaticProvisioner};
