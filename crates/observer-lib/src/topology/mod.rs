//! Cluster topology resolution
//!
//! Everything between the directory service and the list of monitored
//! entities for a cycle: the directory abstraction and its in-memory
//! implementation, the self-healing client holder, application filters,
//! manifest governance parsing and the resolver itself.

mod connection;
mod directory;
mod filter;
mod manifest;
mod resolver;
mod static_directory;

pub use connection::ConnectionManager;
pub use directory::{
    ApplicationInfo, DeployedApplication, DeployedApplicationQuery, DeployedCodePackage,
    DeployedReplica, DirectoryService, Page, DEFAULT_PAGE_SIZE,
};
pub use filter::AppFilter;
pub use manifest::{
    cpu_limit_cores, cpu_share_limit, has_governance_policy, memory_limit_mb,
    parse_app_parameter_value, resource_governance_limits,
};
pub use resolver::{
    effective_concurrency, ResolverConfig, TopologyResolver, DEFAULT_RUNTIME_HOST_NAME,
    MIN_PARALLEL_PROCESSORS,
};
pub use static_directory::{
    ApplicationTopology, ApplicationTypeTopology, StaticDirectory, Topology,
};
