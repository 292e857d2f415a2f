//! Topology manager
//!
//! The [`Manager`] is the ownership scope of a topology: every container and
//! link is created through it, lives in its arenas, and is dismantled by it
//! in reverse creation order. Entities with kernel-visible side effects are
//! entered into the teardown ledger as soon as their first kernel object
//! exists, so a failure halfway through a start sequence still unwinds
//! cleanly.

use crate::addr::Network;
use crate::container::{
    Endpoint, Entity, HostState, Iface, LinkEntry, LinkId, Node, NodeId, NodeKind, RouteDirection,
    SwitchState,
};
use crate::netlink::{Gateway, NetlinkError};
use crate::netns::{self, HostsEntry, NetNs, NetNsError};
use crate::qdisc::{self, NetemSpec, TcAction};
use crate::spawn::{self, Child, SpawnOptions};
use crate::TopologyError;
use ipnetwork::IpNetwork;
use nix::unistd::gethostname;
use rtnetlink::IpVersion;
use std::net::IpAddr;
use std::os::unix::io::RawFd;
use tracing::{debug, info, warn};

/// Transient names for a veth pair while its endpoints are created in the
/// root namespace and moved to their destinations.
const VETH_MAIN: &str = "virt0Master";
const VETH_PEER: &str = "virt0Peer";

/// Options for [`Manager::connect_with`].
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Name of the remote-side interface. Defaults to the local container's
    /// name followed by its interface count.
    pub remote_name: Option<String>,
    /// Direction tag for the local (`main`) side; the remote side gets its
    /// reverse.
    pub direction: RouteDirection,
}

pub(crate) fn default_remote_name(local: &str, interface_count: usize) -> String {
    format!("{}{}", local, interface_count)
}

enum StopPlan {
    HostLike {
        ns: Option<NetNs>,
        gateway: Option<Gateway>,
    },
    Switch {
        index: Option<u32>,
    },
    Nothing,
}

/// Ownership scope for a network topology.
pub struct Manager {
    root: Gateway,
    nodes: Vec<Node>,
    links: Vec<LinkEntry>,
    ledger: Vec<Entity>,
    physical: NodeId,
    shut_down: bool,
}

impl Manager {
    /// Open the scope. Creates the root-namespace netlink handle and the
    /// root container.
    pub async fn new() -> Result<Self, TopologyError> {
        let root = Gateway::new()?;
        let hostname = gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "localhost".to_string());
        let mut physical = Node::new(hostname, NodeKind::Physical);
        physical.running = true;
        Ok(Self {
            root,
            nodes: vec![physical],
            links: Vec::new(),
            ledger: Vec::new(),
            physical: NodeId(0),
            shut_down: false,
        })
    }

    /// The root container (the caller's own namespace).
    pub fn physical_host(&self) -> NodeId {
        self.physical
    }

    fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    fn check_name_free(&self, name: &str) -> Result<(), TopologyError> {
        if self.nodes.iter().any(|n| n.running && n.name == name) {
            return Err(TopologyError::NameCollision(name.to_string()));
        }
        Ok(())
    }

    /// Netlink handle serving a container: its own for namespaced hosts,
    /// the root handle for everything else.
    pub(crate) fn gateway_of(&self, id: NodeId) -> Result<&Gateway, TopologyError> {
        let node = self.node(id);
        match &node.kind {
            NodeKind::Host(state) | NodeKind::Router(state) => state
                .gateway
                .as_ref()
                .ok_or_else(|| TopologyError::EntityDown(node.name.clone())),
            _ => Ok(&self.root),
        }
    }

    fn ns_fd(&self, id: NodeId) -> Option<RawFd> {
        self.node(id)
            .host_state()
            .and_then(|s| s.ns.as_ref())
            .map(|ns| ns.raw_fd())
    }

    // ---- factories ------------------------------------------------------

    /// Create a host in its own network namespace.
    pub async fn host(&mut self, name: &str) -> Result<NodeId, TopologyError> {
        self.host_like(name, false).await
    }

    /// Create a router: a host with IP forwarding enabled.
    pub async fn router(&mut self, name: &str) -> Result<NodeId, TopologyError> {
        let id = self.host_like(name, true).await?;
        let mut child = self.spawn(
            id,
            &[
                "sysctl",
                "-w",
                "net.ipv4.ip_forward=1",
                "net.ipv6.conf.all.forwarding=1",
                "net.ipv4.conf.default.rp_filter=0",
            ],
            SpawnOptions::quiet(),
        )?;
        let status = child.wait().await?;
        if status != 0 {
            warn!("sysctl in router {} exited with status {}", name, status);
        }
        Ok(id)
    }

    async fn host_like(&mut self, name: &str, router: bool) -> Result<NodeId, TopologyError> {
        let ns = NetNs::create(name).await.map_err(|e| match e {
            NetNsError::AlreadyExists(n) => TopologyError::EntityUp(n),
            other => other.into(),
        })?;

        // The namespace exists now; register before the remaining sub-steps
        // so a partial start still unwinds.
        let id = NodeId(self.nodes.len());
        let mut state = HostState::new();
        state.ns = Some(ns);
        let kind = if router {
            NodeKind::Router(state)
        } else {
            NodeKind::Host(state)
        };
        let mut node = Node::new(name.to_string(), kind);
        node.running = true;
        node.registered = true;
        self.nodes.push(node);
        self.ledger.push(Entity::Node(id));

        let mounts = netns::setup_etc(name).await?;
        let gateway = {
            let state = self.nodes[id.0]
                .host_state_mut()
                .expect("host node was just created");
            state.mounts = mounts;
            Gateway::new_in_namespace(state.ns.as_ref().expect("namespace was just created"))?
        };
        let lo = gateway.wait_link_index("lo").await?;
        gateway.set_up(lo).await?;
        self.nodes[id.0]
            .host_state_mut()
            .expect("host node was just created")
            .gateway = Some(gateway);

        info!("Started {} {}", if router { "router" } else { "host" }, name);
        Ok(id)
    }

    /// Create a switch: a bridge device in the root namespace.
    pub async fn switch(&mut self, name: &str) -> Result<NodeId, TopologyError> {
        self.switch_inner(name, None).await
    }

    /// Create a switch carrying a default [`Network`] that `connect` draws
    /// addresses from.
    pub async fn switch_with_network(
        &mut self,
        name: &str,
        network: Network,
    ) -> Result<NodeId, TopologyError> {
        self.switch_inner(name, Some(network)).await
    }

    async fn switch_inner(
        &mut self,
        name: &str,
        network: Option<Network>,
    ) -> Result<NodeId, TopologyError> {
        self.check_name_free(name)?;
        self.root.create_bridge(name).await.map_err(|e| match e {
            NetlinkError::AlreadyExists(n) => TopologyError::NameCollision(n),
            other => other.into(),
        })?;

        let id = NodeId(self.nodes.len());
        let mut node = Node::new(
            name.to_string(),
            NodeKind::Switch(SwitchState {
                index: None,
                network,
            }),
        );
        node.running = true;
        node.registered = true;
        self.nodes.push(node);
        self.ledger.push(Entity::Node(id));

        let index = self.root.wait_link_index(name).await?;
        self.root.set_up(index).await?;
        if let Some(state) = self.nodes[id.0].switch_state_mut() {
            state.index = Some(index);
        }

        info!("Started switch {}", name);
        Ok(id)
    }

    /// Adopt an existing root-namespace device into the root container.
    /// The device is never brought down or removed.
    pub async fn physical_interface(&mut self, name: &str) -> Result<(), TopologyError> {
        let physical = self.physical;
        if self.nodes[physical.0].iface(name).is_some() {
            return Err(TopologyError::NameCollision(name.to_string()));
        }
        let index = self.root.link_index(name).await?;
        self.nodes[physical.0].interfaces.push(Iface {
            name: name.to_string(),
            index,
            addresses: Vec::new(),
            route: None,
            link: None,
        });
        Ok(())
    }

    // ---- links ----------------------------------------------------------

    /// Connect `local` to `remote` with a veth link named `name` on the
    /// local side, with default options.
    pub async fn connect(
        &mut self,
        local: NodeId,
        remote: NodeId,
        name: &str,
    ) -> Result<LinkId, TopologyError> {
        self.connect_with(local, remote, name, ConnectOptions::default())
            .await
    }

    /// Connect `local` to `remote` with a veth link.
    ///
    /// The `main` endpoint lands in `local`, the `peer` endpoint in
    /// `remote`; a switch remote enslaves the peer endpoint to its bridge.
    /// If the remote carries a network, the main endpoint is addressed from
    /// it: routers take the reserved router slot (with a `Default`
    /// direction), other containers take the next free address plus, when a
    /// router slot is reserved, a default route through it.
    pub async fn connect_with(
        &mut self,
        local: NodeId,
        remote: NodeId,
        name: &str,
        options: ConnectOptions,
    ) -> Result<LinkId, TopologyError> {
        if !self.node(local).running {
            return Err(TopologyError::EntityDown(self.node(local).name.clone()));
        }
        if !self.node(remote).running {
            return Err(TopologyError::EntityDown(self.node(remote).name.clone()));
        }
        let remote_name = options.remote_name.clone().unwrap_or_else(|| {
            default_remote_name(&self.node(local).name, self.node(local).interfaces.len())
        });
        if self.node(local).iface(name).is_some() {
            return Err(TopologyError::NameCollision(name.to_string()));
        }
        if self.node(remote).iface(&remote_name).is_some() {
            return Err(TopologyError::NameCollision(remote_name));
        }

        debug!(
            "Connecting {}:{} <-> {}:{}",
            self.node(local).name,
            name,
            self.node(remote).name,
            remote_name
        );

        // The pair starts out in the root namespace under transient names;
        // endpoints destined for another namespace are moved before the
        // rename.
        self.root.create_veth(VETH_MAIN, VETH_PEER).await?;
        if let Some(fd) = self.ns_fd(local) {
            let index = self.root.wait_link_index(VETH_MAIN).await?;
            self.root.move_to_ns(index, fd).await?;
        }
        if let Some(fd) = self.ns_fd(remote) {
            let index = self.root.wait_link_index(VETH_PEER).await?;
            self.root.move_to_ns(index, fd).await?;
        }

        let main_index = {
            let gw = self.gateway_of(local)?;
            let index = gw.wait_link_index(VETH_MAIN).await?;
            gw.rename(index, name).await?;
            gw.set_up(index).await?;
            index
        };
        let peer_index = {
            let gw = self.gateway_of(remote)?;
            let index = gw.wait_link_index(VETH_PEER).await?;
            gw.rename(index, &remote_name).await?;
            gw.set_up(index).await?;
            index
        };

        let link_id = LinkId(self.links.len());
        self.links.push(LinkEntry {
            main: Endpoint {
                node: local,
                iface: name.to_string(),
            },
            peer: Endpoint {
                node: remote,
                iface: remote_name.clone(),
            },
            route: options.direction,
            running: true,
            registered: true,
        });
        self.ledger.push(Entity::Link(link_id));
        self.nodes[local.0].interfaces.push(Iface {
            name: name.to_string(),
            index: main_index,
            addresses: Vec::new(),
            route: Some(options.direction),
            link: Some(link_id),
        });
        self.nodes[remote.0].interfaces.push(Iface {
            name: remote_name,
            index: peer_index,
            addresses: Vec::new(),
            route: Some(options.direction.reverse()),
            link: Some(link_id),
        });

        // A switch remote takes the endpoint that stayed in its namespace
        // as a bridge port.
        if let Some(bridge) = self.node(remote).switch_state().and_then(|s| s.index) {
            self.root.set_controller(peer_index, bridge).await?;
        }

        // Draw an address from the remote's network, if it has one.
        let drawn = {
            let local_is_router = self.node(local).is_router();
            match self.nodes[remote.0]
                .switch_state_mut()
                .and_then(|s| s.network.as_mut())
            {
                Some(network) => {
                    let router = network.router();
                    if local_is_router {
                        if options.direction == RouteDirection::Default && router.is_some() {
                            network.router_interface().map(|ifaddr| (ifaddr, None))
                        } else {
                            Some((network.next_interface()?, None))
                        }
                    } else {
                        let ifaddr = network.next_interface()?;
                        let via = if options.direction == RouteDirection::Default {
                            router
                        } else {
                            None
                        };
                        Some((ifaddr, via))
                    }
                }
                None => None,
            }
        };
        if let Some((ifaddr, default_gw)) = drawn {
            self.add_address_inner(local, name, ifaddr).await?;
            if let Some(router_ip) = default_gw {
                let gw = self.gateway_of(local)?;
                if !gw.has_default_route(version_of_addr(router_ip)).await? {
                    gw.add_default_route(router_ip).await?;
                }
            }
        }

        info!(
            "Connected {}:{} to {}",
            self.node(local).name,
            name,
            self.node(remote).name
        );
        Ok(link_id)
    }

    // ---- addresses ------------------------------------------------------

    /// Assign the next free address of `network` to an interface.
    pub async fn add_ip(
        &mut self,
        node: NodeId,
        iface: &str,
        network: &mut Network,
    ) -> Result<IpNetwork, TopologyError> {
        let ifaddr = network.next_interface()?;
        self.add_address_inner(node, iface, ifaddr).await?;
        Ok(ifaddr)
    }

    /// Assign a specific interface address.
    pub async fn add_ip_addr(
        &mut self,
        node: NodeId,
        iface: &str,
        ifaddr: IpNetwork,
    ) -> Result<(), TopologyError> {
        self.add_address_inner(node, iface, ifaddr).await
    }

    async fn add_address_inner(
        &mut self,
        node: NodeId,
        iface: &str,
        ifaddr: IpNetwork,
    ) -> Result<(), TopologyError> {
        let index = self
            .node(node)
            .iface(iface)
            .ok_or_else(|| TopologyError::UnknownInterface(iface.to_string()))?
            .index;
        {
            let gw = self.gateway_of(node)?;
            gw.add_address(index, ifaddr).await?;
        }
        if let Some(entry) = self.nodes[node.0].iface_mut(iface) {
            entry.addresses.push(ifaddr);
        }
        Ok(())
    }

    /// Remove an interface address.
    pub async fn del_ip(
        &mut self,
        node: NodeId,
        iface: &str,
        ifaddr: IpNetwork,
    ) -> Result<(), TopologyError> {
        let index = self
            .node(node)
            .iface(iface)
            .ok_or_else(|| TopologyError::UnknownInterface(iface.to_string()))?
            .index;
        if !self
            .node(node)
            .iface(iface)
            .map(|i| i.addresses.contains(&ifaddr))
            .unwrap_or(false)
        {
            return Err(TopologyError::UnknownAddress(ifaddr));
        }
        {
            let gw = self.gateway_of(node)?;
            gw.del_address(index, ifaddr).await?;
        }
        if let Some(entry) = self.nodes[node.0].iface_mut(iface) {
            entry.addresses.retain(|a| *a != ifaddr);
        }
        Ok(())
    }

    // ---- interface management -------------------------------------------

    /// Move an interface into another container's namespace and bring it
    /// back up there.
    pub async fn move_interface(
        &mut self,
        from: NodeId,
        iface: &str,
        to: NodeId,
    ) -> Result<(), TopologyError> {
        let index = self
            .node(from)
            .iface(iface)
            .ok_or_else(|| TopologyError::UnknownInterface(iface.to_string()))?
            .index;
        if self.node(to).iface(iface).is_some() {
            return Err(TopologyError::NameCollision(iface.to_string()));
        }

        {
            let gw = self.gateway_of(from)?;
            match self.ns_fd(to) {
                Some(fd) => gw.move_to_ns(index, fd).await?,
                None => gw.move_to_root(index).await?,
            }
        }
        let new_index = {
            let gw = self.gateway_of(to)?;
            let new_index = gw.wait_link_index(iface).await?;
            gw.set_up(new_index).await?;
            new_index
        };

        let position = self.nodes[from.0]
            .interfaces
            .iter()
            .position(|i| i.name == iface)
            .ok_or_else(|| TopologyError::UnknownInterface(iface.to_string()))?;
        let mut entry = self.nodes[from.0].interfaces.remove(position);
        entry.index = new_index;
        let link = entry.link;
        self.nodes[to.0].interfaces.push(entry);

        if let Some(link_id) = link {
            let entry = &mut self.links[link_id.0];
            for endpoint in [&mut entry.main, &mut entry.peer] {
                if endpoint.node == from && endpoint.iface == iface {
                    endpoint.node = to;
                }
            }
        }
        Ok(())
    }

    /// Rename an interface.
    pub async fn rename_interface(
        &mut self,
        node: NodeId,
        from: &str,
        to: &str,
    ) -> Result<(), TopologyError> {
        let index = self
            .node(node)
            .iface(from)
            .ok_or_else(|| TopologyError::UnknownInterface(from.to_string()))?
            .index;
        if self.node(node).iface(to).is_some() {
            return Err(TopologyError::NameCollision(to.to_string()));
        }
        {
            let gw = self.gateway_of(node)?;
            gw.rename(index, to).await?;
        }
        if let Some(entry) = self.nodes[node.0].iface_mut(from) {
            entry.name = to.to_string();
        }
        for link in &mut self.links {
            for endpoint in [&mut link.main, &mut link.peer] {
                if endpoint.node == node && endpoint.iface == from {
                    endpoint.iface = to.to_string();
                }
            }
        }
        Ok(())
    }

    /// Register an extra hosts-file alias for a host.
    pub fn add_alias(&mut self, node: NodeId, alias: &str) -> Result<(), TopologyError> {
        let name = self.node(node).name.clone();
        match self.nodes[node.0].host_state_mut() {
            Some(state) => {
                state.aliases.push(alias.to_string());
                Ok(())
            }
            None => Err(TopologyError::Unsupported(name)),
        }
    }

    /// Enable or disable spanning tree on a switch.
    pub async fn set_stp(&self, switch: NodeId, enabled: bool) -> Result<(), TopologyError> {
        let node = self.node(switch);
        if !node.is_switch() {
            return Err(TopologyError::Unsupported(node.name.clone()));
        }
        let path = format!("/sys/class/net/{}/bridge/stp_state", node.name);
        tokio::fs::write(path, if enabled { "1" } else { "0" }).await?;
        Ok(())
    }

    // ---- processes ------------------------------------------------------

    /// Spawn a process inside a container. Namespaced hosts get the full
    /// namespace entry with their faked `/etc` files; the root container
    /// spawns plainly. Switches run no processes.
    pub fn spawn(
        &self,
        node: NodeId,
        argv: &[&str],
        options: SpawnOptions,
    ) -> Result<Child, TopologyError> {
        let n = self.node(node);
        let argv: Vec<String> = argv.iter().map(|s| s.to_string()).collect();
        match &n.kind {
            NodeKind::Host(state) | NodeKind::Router(state) => {
                if !n.running {
                    return Err(TopologyError::EntityDown(n.name.clone()));
                }
                let ns = state
                    .ns
                    .as_ref()
                    .ok_or_else(|| TopologyError::EntityDown(n.name.clone()))?;
                Ok(spawn::spawn_in_namespace(
                    ns,
                    &n.name,
                    &state.mounts,
                    &argv,
                    options,
                )?)
            }
            NodeKind::Physical => Ok(spawn::spawn_root(&argv, options)?),
            NodeKind::Switch(_) => Err(TopologyError::Unsupported(n.name.clone())),
        }
    }

    /// Apply a netem qdisc operation to an interface, inside its
    /// container's namespace.
    pub async fn tc_netem(
        &self,
        node: NodeId,
        iface: &str,
        action: TcAction,
        spec: &NetemSpec,
    ) -> Result<(), TopologyError> {
        if self.node(node).iface(iface).is_none() {
            return Err(TopologyError::UnknownInterface(iface.to_string()));
        }
        let args = qdisc::netem_args(action, iface, spec)?;
        match &self.node(node).kind {
            NodeKind::Host(_) | NodeKind::Router(_) => {
                let refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
                let mut child = self.spawn(node, &refs, SpawnOptions::quiet())?;
                let status = child.wait().await?;
                if status != 0 {
                    return Err(qdisc::QdiscError::CommandFailed(status).into());
                }
                Ok(())
            }
            _ => Ok(qdisc::run_tc_root(&args).await?),
        }
    }

    // ---- hosts files ----------------------------------------------------

    /// Propagate every registered host's addresses into every host's hosts
    /// file. The root container contributes nothing and is not written.
    pub async fn update_hosts(&self) -> Result<(), TopologyError> {
        let mut entries: Vec<HostsEntry> = Vec::new();
        for entity in &self.ledger {
            let Entity::Node(id) = *entity else { continue };
            let node = self.node(id);
            if !node.running || !node.is_namespaced() {
                continue;
            }
            let aliases = node
                .host_state()
                .map(|s| s.aliases.clone())
                .unwrap_or_default();
            for iface in &node.interfaces {
                for addr in &iface.addresses {
                    entries.push(HostsEntry {
                        name: node.name.clone(),
                        address: addr.ip(),
                        aliases: aliases.clone(),
                    });
                }
            }
        }

        for entity in &self.ledger {
            let Entity::Node(id) = *entity else { continue };
            let node = self.node(id);
            if !node.running || !node.is_namespaced() {
                continue;
            }
            let path = netns::etc_dir(&node.name).join("hosts");
            netns::write_hosts(&path, &entries).await?;
        }
        Ok(())
    }

    // ---- lifecycle ------------------------------------------------------

    /// Stop a container: remove its kernel objects, release its namespace
    /// and unregister it. Stopping the root container is a no-op; stopping
    /// a stopped container is an error.
    pub async fn stop_node(&mut self, id: NodeId) -> Result<(), TopologyError> {
        if matches!(self.node(id).kind, NodeKind::Physical) {
            return Ok(());
        }
        if !self.node(id).running {
            return Err(TopologyError::EntityDown(self.node(id).name.clone()));
        }
        let name = self.node(id).name.clone();
        self.nodes[id.0].running = false;
        self.nodes[id.0].registered = false;

        let plan = match &mut self.nodes[id.0].kind {
            NodeKind::Host(state) | NodeKind::Router(state) => StopPlan::HostLike {
                ns: state.ns.take(),
                gateway: state.gateway.take(),
            },
            NodeKind::Switch(state) => StopPlan::Switch {
                index: state.index.take(),
            },
            NodeKind::Physical => StopPlan::Nothing,
        };

        let mut first_error: Option<TopologyError> = None;
        match plan {
            StopPlan::HostLike { ns, gateway } => {
                if let Some(gateway) = gateway {
                    gateway.release();
                }
                if let Some(ns) = ns {
                    if let Err(e) = ns.delete().await {
                        warn!("Failed to delete namespace {}: {}", name, e);
                        first_error.get_or_insert(e.into());
                    }
                }
                netns::remove_etc(&name).await;
            }
            StopPlan::Switch { index } => {
                if let Some(index) = index {
                    if let Err(e) = self.root.set_down(index).await {
                        warn!("Failed to bring down bridge {}: {}", name, e);
                        first_error.get_or_insert(e.into());
                    }
                    if let Err(e) = self.root.delete_link(index).await {
                        warn!("Failed to delete bridge {}: {}", name, e);
                        first_error.get_or_insert(e.into());
                    }
                }
            }
            StopPlan::Nothing => {}
        }

        info!("Stopped {}", name);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop a link: removing one veth endpoint removes both. Stopping a
    /// stopped link is an error.
    pub async fn stop_link(&mut self, id: LinkId) -> Result<(), TopologyError> {
        if !self.links[id.0].running {
            return Err(TopologyError::EntityDown(format!(
                "link {}",
                self.links[id.0].main.iface
            )));
        }
        self.links[id.0].running = false;
        self.links[id.0].registered = false;
        let main = self.links[id.0].main.clone();
        let peer = self.links[id.0].peer.clone();

        let mut first_error: Option<TopologyError> = None;
        // Delete from whichever side still has a live namespace; a side
        // whose host already stopped lost its devices with the namespace.
        for endpoint in [&main, &peer] {
            let node = self.node(endpoint.node);
            if !node.running {
                continue;
            }
            let Some(index) = node.iface(&endpoint.iface).map(|i| i.index) else {
                continue;
            };
            let Ok(gw) = self.gateway_of(endpoint.node) else {
                continue;
            };
            match gw.delete_link(index).await {
                Ok(()) | Err(NetlinkError::NotFound(_)) => {}
                Err(e) => {
                    warn!("Failed to delete link {}: {}", endpoint.iface, e);
                    first_error.get_or_insert(e.into());
                }
            }
            break;
        }

        for endpoint in [&main, &peer] {
            self.nodes[endpoint.node.0]
                .interfaces
                .retain(|i| i.name != endpoint.iface);
        }

        debug!("Stopped link {} <-> {}", main.iface, peer.iface);
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Dismantle every registered entity in reverse creation order.
    /// Failures are logged and teardown continues; on return nothing
    /// remains registered.
    pub async fn shutdown(&mut self) {
        while let Some(entity) = self.ledger.pop() {
            let live = match entity {
                Entity::Node(id) => self.nodes[id.0].registered && self.nodes[id.0].running,
                Entity::Link(id) => self.links[id.0].registered && self.links[id.0].running,
            };
            if !live {
                continue;
            }
            let result = match entity {
                Entity::Node(id) => self.stop_node(id).await,
                Entity::Link(id) => self.stop_link(id).await,
            };
            if let Err(e) = result {
                warn!("Teardown error (continuing): {}", e);
            }
        }
        self.shut_down = true;
    }

    // ---- queries --------------------------------------------------------

    pub fn name(&self, id: NodeId) -> &str {
        &self.node(id).name
    }

    pub fn is_running(&self, id: NodeId) -> bool {
        self.node(id).running
    }

    pub fn link_running(&self, id: LinkId) -> bool {
        self.links[id.0].running
    }

    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.nodes
            .iter()
            .position(|n| n.name == name && n.running)
            .map(NodeId)
    }

    /// Addresses currently assigned to an interface.
    pub fn addresses(&self, node: NodeId, iface: &str) -> Option<Vec<IpNetwork>> {
        self.node(node).iface(iface).map(|i| i.addresses.clone())
    }

    /// Direction tag of an interface.
    pub fn interface_direction(&self, node: NodeId, iface: &str) -> Option<RouteDirection> {
        self.node(node).iface(iface).and_then(|i| i.route)
    }

    /// Interface names of a container, in attachment order.
    pub fn interface_names(&self, node: NodeId) -> Vec<String> {
        self.node(node)
            .interfaces
            .iter()
            .map(|i| i.name.clone())
            .collect()
    }

    /// Both sides of a link: `(main, peer)` as `(node, interface)` pairs.
    pub fn link_endpoints(&self, id: LinkId) -> ((NodeId, String), (NodeId, String)) {
        let link = &self.links[id.0];
        (
            (link.main.node, link.main.iface.clone()),
            (link.peer.node, link.peer.iface.clone()),
        )
    }

    /// The container and interface on the other side of an interface's
    /// link, if the interface belongs to one.
    pub fn partner(&self, node: NodeId, iface: &str) -> Option<(NodeId, String)> {
        let link_id = self.node(node).iface(iface)?.link?;
        self.links[link_id.0]
            .partner(node, iface)
            .map(|endpoint| (endpoint.node, endpoint.iface.clone()))
    }

    pub(crate) fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub(crate) fn links(&self) -> &[LinkEntry] {
        &self.links
    }
}

impl Drop for Manager {
    fn drop(&mut self) {
        if self.shut_down || self.ledger.is_empty() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == tokio::runtime::RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| handle.block_on(self.shutdown()));
            }
            _ => warn!(
                "Manager dropped without shutdown; {} entities may leak",
                self.ledger.len()
            ),
        }
    }
}

fn version_of_addr(addr: IpAddr) -> IpVersion {
    match addr {
        IpAddr::V4(_) => IpVersion::V4,
        IpAddr::V6(_) => IpVersion::V6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_remote_names_follow_interface_count() {
        assert_eq!(default_remote_name("host0", 0), "host00");
        assert_eq!(default_remote_name("host0", 1), "host01");
        assert_eq!(default_remote_name("central", 3), "central3");
    }
}
