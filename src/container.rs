//! Topology entities
//!
//! The entity graph is arena-based: the [`Manager`](crate::Manager) owns
//! every container and link, and hands out stable [`NodeId`]/[`LinkId`]
//! handles. Interfaces live in their container's ordered interface list and
//! point back at the link they belong to, so the graph carries no reference
//! cycles.

use crate::addr::Network;
use crate::netlink::Gateway;
use crate::netns::NetNs;
use ipnetwork::IpNetwork;
use std::path::PathBuf;

/// Routing policy tag of an interface, set when its link is created.
///
/// After `simple_route` removes prohibited routes, an interface only keeps
/// (or receives) routes in the directions its tag allows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteDirection {
    #[default]
    Default,
    None,
    Inward,
    Outward,
}

impl RouteDirection {
    pub fn allow_ingress(self) -> bool {
        matches!(self, RouteDirection::Inward | RouteDirection::Default)
    }

    pub fn allow_egress(self) -> bool {
        matches!(self, RouteDirection::Outward | RouteDirection::Default)
    }

    pub fn reverse(self) -> Self {
        match self {
            RouteDirection::Inward => RouteDirection::Outward,
            RouteDirection::Outward => RouteDirection::Inward,
            other => other,
        }
    }
}

/// Stable handle to a container owned by the Manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(pub(crate) usize);

/// Stable handle to a link owned by the Manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub(crate) usize);

/// An entry in the Manager's teardown ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Entity {
    Node(NodeId),
    Link(LinkId),
}

/// An interface registered with a container.
#[derive(Debug)]
pub(crate) struct Iface {
    pub name: String,
    /// Kernel ifindex in the interface's current namespace.
    pub index: u32,
    pub addresses: Vec<IpNetwork>,
    pub route: Option<RouteDirection>,
    /// Back-reference to the owning link; `None` for adopted physical
    /// interfaces and bridge devices.
    pub link: Option<LinkId>,
}

/// Mutable state of a namespaced host.
#[derive(Debug)]
pub(crate) struct HostState {
    pub ns: Option<NetNs>,
    pub gateway: Option<Gateway>,
    /// Bind-mount map applied to spawned children: source in the root
    /// namespace, destination inside the child's mount namespace.
    pub mounts: Vec<(PathBuf, PathBuf)>,
    /// Extra DNS-style aliases propagated by `update_hosts`.
    pub aliases: Vec<String>,
}

impl HostState {
    pub fn new() -> Self {
        Self {
            ns: None,
            gateway: None,
            mounts: Vec::new(),
            aliases: Vec::new(),
        }
    }
}

/// Mutable state of a switch (a bridge device in the root namespace).
#[derive(Debug)]
pub(crate) struct SwitchState {
    pub index: Option<u32>,
    /// Default network the connect algorithm draws addresses from.
    pub network: Option<Network>,
}

#[derive(Debug)]
pub(crate) enum NodeKind {
    /// The root namespace.
    Physical,
    Host(HostState),
    Router(HostState),
    Switch(SwitchState),
}

#[derive(Debug)]
pub(crate) struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub running: bool,
    /// Present in the teardown ledger. Cleared on stop.
    pub registered: bool,
    pub interfaces: Vec<Iface>,
}

impl Node {
    pub fn new(name: String, kind: NodeKind) -> Self {
        Self {
            name,
            kind,
            running: false,
            registered: false,
            interfaces: Vec::new(),
        }
    }

    pub fn is_router(&self) -> bool {
        matches!(self.kind, NodeKind::Router(_))
    }

    pub fn is_switch(&self) -> bool {
        matches!(self.kind, NodeKind::Switch(_))
    }

    /// Whether this container owns a network namespace.
    pub fn is_namespaced(&self) -> bool {
        matches!(self.kind, NodeKind::Host(_) | NodeKind::Router(_))
    }

    pub fn host_state(&self) -> Option<&HostState> {
        match &self.kind {
            NodeKind::Host(state) | NodeKind::Router(state) => Some(state),
            _ => None,
        }
    }

    pub fn host_state_mut(&mut self) -> Option<&mut HostState> {
        match &mut self.kind {
            NodeKind::Host(state) | NodeKind::Router(state) => Some(state),
            _ => None,
        }
    }

    pub fn switch_state(&self) -> Option<&SwitchState> {
        match &self.kind {
            NodeKind::Switch(state) => Some(state),
            _ => None,
        }
    }

    pub fn switch_state_mut(&mut self) -> Option<&mut SwitchState> {
        match &mut self.kind {
            NodeKind::Switch(state) => Some(state),
            _ => None,
        }
    }

    pub fn iface(&self, name: &str) -> Option<&Iface> {
        self.interfaces.iter().find(|i| i.name == name)
    }

    pub fn iface_mut(&mut self, name: &str) -> Option<&mut Iface> {
        self.interfaces.iter_mut().find(|i| i.name == name)
    }
}

/// One side of a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Endpoint {
    pub node: NodeId,
    pub iface: String,
}

/// A veth pair between two containers. The `main` side carries the link's
/// direction tag, the `peer` side its reverse.
#[derive(Debug)]
pub(crate) struct LinkEntry {
    pub main: Endpoint,
    pub peer: Endpoint,
    pub route: RouteDirection,
    pub running: bool,
    pub registered: bool,
}

impl LinkEntry {
    /// The other side of the link, seen from `(node, iface)`.
    pub fn partner(&self, node: NodeId, iface: &str) -> Option<&Endpoint> {
        if self.main.node == node && self.main.iface == iface {
            Some(&self.peer)
        } else if self.peer.node == node && self.peer.iface == iface {
            Some(&self.main)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_reversal() {
        assert_eq!(RouteDirection::Inward.reverse(), RouteDirection::Outward);
        assert_eq!(RouteDirection::Outward.reverse(), RouteDirection::Inward);
        assert_eq!(RouteDirection::Default.reverse(), RouteDirection::Default);
        assert_eq!(RouteDirection::None.reverse(), RouteDirection::None);
    }

    #[test]
    fn direction_permissions() {
        assert!(RouteDirection::Default.allow_ingress());
        assert!(RouteDirection::Default.allow_egress());
        assert!(RouteDirection::Inward.allow_ingress());
        assert!(!RouteDirection::Inward.allow_egress());
        assert!(RouteDirection::Outward.allow_egress());
        assert!(!RouteDirection::Outward.allow_ingress());
        assert!(!RouteDirection::None.allow_ingress());
        assert!(!RouteDirection::None.allow_egress());
    }

    #[test]
    fn link_partner_lookup() {
        let link = LinkEntry {
            main: Endpoint {
                node: NodeId(0),
                iface: "eth0".to_string(),
            },
            peer: Endpoint {
                node: NodeId(1),
                iface: "host00".to_string(),
            },
            route: RouteDirection::Default,
            running: true,
            registered: true,
        };
        let partner = link.partner(NodeId(0), "eth0").unwrap();
        assert_eq!(partner.node, NodeId(1));
        assert_eq!(partner.iface, "host00");
        assert!(link.partner(NodeId(2), "eth0").is_none());
    }
}
