//! Ephemeral Linux network topologies
//!
//! This crate materializes a described graph of hosts, routers, switches and
//! point-to-point links as real kernel objects: network namespaces, bridges,
//! veth pairs, addresses, routes and per-namespace mount views. Everything
//! is created through a [`Manager`] scope which keeps a teardown ledger and
//! dismantles the whole topology in reverse creation order, on every exit
//! path.
//!
//! Typical use: create a [`Manager`], ask it for switches, hosts and
//! routers, wire them with [`Manager::connect`], assign addresses from
//! [`Network`] allocators, then run [`Manager::update_hosts`] and
//! [`Manager::simple_route`] before exercising the network with
//! [`Manager::spawn`].
//!
//! All kernel mutation goes through rtnetlink and raw namespace syscalls;
//! CAP_NET_ADMIN is required for anything beyond constructing the scope.

pub mod addr;
pub mod container;
pub mod manager;
pub mod netlink;
pub mod netns;
pub mod qdisc;
mod route;
pub mod spawn;

pub use addr::{AddressError, Network};
pub use container::{Entity, LinkId, NodeId, RouteDirection};
pub use manager::{ConnectOptions, Manager};
pub use netlink::NetlinkError;
pub use netns::NetNsError;
pub use qdisc::{NetemSpec, QdiscError, TcAction};
pub use spawn::{Child, SpawnError, SpawnOptions, Stdio};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TopologyError {
    #[error("Entity '{0}' is already running")]
    EntityUp(String),

    #[error("Entity '{0}' is not running")]
    EntityDown(String),

    #[error("Name '{0}' is already in use")]
    NameCollision(String),

    #[error("Unknown interface '{0}'")]
    UnknownInterface(String),

    #[error("Address {0} is not assigned")]
    UnknownAddress(ipnetwork::IpNetwork),

    #[error("Operation not supported on '{0}'")]
    Unsupported(String),

    #[error("Network namespace error: {0}")]
    NetNs(#[from] NetNsError),

    #[error("Netlink error: {0}")]
    Netlink(#[from] NetlinkError),

    #[error("Address allocation error: {0}")]
    Address(#[from] AddressError),

    #[error("Spawn error: {0}")]
    Spawn(#[from] SpawnError),

    #[error("Traffic control error: {0}")]
    Qdisc(#[from] QdiscError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
