//! # dockyard
//!
//! Deploys applications onto a Docker swarm and manages the nodes the swarm
//! runs on.
//!
//! - [`cluster`]: control-plane client (Docker Engine API and an in-process
//!   implementation) plus the node/service/task model
//! - [`provision`]: the provisioner capability set and the swarm provisioner
//!   (node membership, build pipeline, service reconciliation, units)
//! - [`image`]: image naming, Procfile parsing and image metadata
//! - [`store`]: image metadata and cluster member persistence
//! - [`config`]: configuration file loading

pub mod cli;
pub mod cluster;
pub mod config;
pub mod image;
pub mod provision;
pub mod store;
