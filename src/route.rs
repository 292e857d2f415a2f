//! Route planning
//!
//! `simple_route` wires a constructed topology into a working IP network in
//! two phases: directly-connected routes forbidden by an interface's
//! direction tag are removed, then every router walks the graph breadth
//! first and installs routes towards every other routed subnet, using the
//! address of its first hop into that direction as the gateway. Hosts
//! without a default route afterwards search their local subnet for any
//! router. Both phases are idempotent: installs are guarded by
//! routing-table presence checks and removals of absent routes are no-ops.

use crate::addr::containing_network;
use crate::container::NodeId;
use crate::manager::Manager;
use crate::TopologyError;
use ipnetwork::IpNetwork;
use rtnetlink::IpVersion;
use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use tracing::debug;

/// First address of `dst` whose IP lies in one of the networks of `src`.
pub(crate) fn compatible_address(src: &[IpNetwork], dst: &[IpNetwork]) -> Option<IpAddr> {
    dst.iter()
        .map(|a| a.ip())
        .find(|ip| src.iter().any(|net| net.contains(*ip)))
}

fn family_matches(net: &IpNetwork, version: &IpVersion) -> bool {
    matches!(
        (net, version),
        (IpNetwork::V4(_), IpVersion::V4) | (IpNetwork::V6(_), IpVersion::V6)
    )
}

impl Manager {
    /// Plan and install routes for the whole topology. Must run after all
    /// `connect` calls.
    pub async fn simple_route(&mut self) -> Result<(), TopologyError> {
        self.remove_prohibited_routes().await?;

        let routers: Vec<NodeId> = self
            .nodes()
            .iter()
            .enumerate()
            .filter(|(_, n)| n.running && n.is_router())
            .map(|(i, _)| NodeId(i))
            .collect();
        for id in &routers {
            self.install_router_routes(*id, IpVersion::V4).await?;
            self.install_router_routes(*id, IpVersion::V6).await?;
        }

        let hosts: Vec<NodeId> = self
            .nodes()
            .iter()
            .enumerate()
            .filter(|(_, n)| n.running && n.is_namespaced() && !n.is_router())
            .map(|(i, _)| NodeId(i))
            .collect();
        for id in hosts {
            self.ensure_default_route(id, IpVersion::V4).await?;
            self.ensure_default_route(id, IpVersion::V6).await?;
        }
        Ok(())
    }

    /// Remove the directly-connected route of every interface whose
    /// direction tag forbids egress. Already-absent routes are fine.
    async fn remove_prohibited_routes(&self) -> Result<(), TopologyError> {
        for (i, node) in self.nodes().iter().enumerate() {
            if !node.running || !node.is_namespaced() {
                continue;
            }
            let prohibited: Vec<IpNetwork> = node
                .interfaces
                .iter()
                .filter(|ifc| ifc.route.is_some_and(|r| !r.allow_egress()))
                .flat_map(|ifc| ifc.addresses.iter().map(containing_network))
                .collect();
            if prohibited.is_empty() {
                continue;
            }
            let gw = self.gateway_of(NodeId(i))?;
            for net in prohibited {
                if gw.del_route(net).await? {
                    debug!("Removed prohibited route {} from {}", net, node.name);
                }
            }
        }
        Ok(())
    }

    /// Breadth-first traversal from `start`, installing one route per
    /// routed subnet discovered behind another router.
    ///
    /// Switch neighbours are appended to the work deque (explored next, so
    /// routers on the local subnet are found first); router neighbours are
    /// prepended (explored once the local subnet is exhausted). The first
    /// hop is fixed when the traversal first crosses into another router
    /// and reused for everything behind it.
    async fn install_router_routes(
        &self,
        start: NodeId,
        version: IpVersion,
    ) -> Result<(), TopologyError> {
        type Frame = (NodeId, Option<Vec<IpNetwork>>, Option<IpAddr>);
        let mut queue: VecDeque<Frame> = VecDeque::new();
        let mut visited: HashSet<NodeId> = HashSet::new();
        queue.push_back((start, None, None));
        visited.insert(start);

        while let Some((node_id, mut router_addresses, first_hop)) = queue.pop_back() {
            let node_is_router = self.nodes()[node_id.0].is_router();
            let ifaces: Vec<_> = self.nodes()[node_id.0]
                .interfaces
                .iter()
                .map(|i| (i.route, i.addresses.clone(), i.link, i.name.clone()))
                .collect();

            for (route, addresses, link, name) in ifaces {
                if route.is_some_and(|r| !r.allow_egress()) {
                    continue;
                }

                if node_is_router {
                    let addrs: Vec<IpNetwork> = addresses
                        .iter()
                        .filter(|a| family_matches(a, &version))
                        .cloned()
                        .collect();
                    if node_id != start {
                        if let Some(gateway) = first_hop {
                            let gw = self.gateway_of(start)?;
                            for addr in &addrs {
                                let net = containing_network(addr);
                                if !gw.has_route(net).await? {
                                    debug!(
                                        "Installing route {} via {} on {}",
                                        net,
                                        gateway,
                                        self.nodes()[start.0].name
                                    );
                                    gw.add_route(net, Some(gateway), None).await?;
                                }
                            }
                        }
                    }
                    router_addresses = Some(addrs);
                }

                let Some(link_id) = link else { continue };
                let Some(partner) = self.links()[link_id.0].partner(node_id, &name) else {
                    continue;
                };
                let peer_id = partner.node;
                let peer_iface = partner.iface.clone();
                if visited.contains(&peer_id) {
                    continue;
                }
                let peer = &self.nodes()[peer_id.0];
                if !(peer.is_router() || peer.is_switch()) {
                    continue;
                }
                if peer.is_switch() {
                    queue.push_back((peer_id, router_addresses.clone(), first_hop));
                } else {
                    // A router hop must share a subnet with the addresses
                    // carried so far; partially-connected branches are
                    // skipped, not an error.
                    let peer_addrs: Vec<IpNetwork> = peer
                        .iface(&peer_iface)
                        .map(|i| i.addresses.clone())
                        .unwrap_or_default();
                    let Some(address) =
                        compatible_address(router_addresses.as_deref().unwrap_or(&[]), &peer_addrs)
                    else {
                        continue;
                    };
                    let hop = first_hop.or(Some(address));
                    queue.push_front((peer_id, None, hop));
                }
                visited.insert(peer_id);
            }
        }
        Ok(())
    }

    /// Give a host lacking a default route one through the nearest router
    /// on its local subnet.
    async fn ensure_default_route(
        &self,
        host: NodeId,
        version: IpVersion,
    ) -> Result<(), TopologyError> {
        {
            let gw = self.gateway_of(host)?;
            if gw.has_default_route(version.clone()).await? {
                return Ok(());
            }
        }

        let iface_info: Vec<(String, Vec<IpNetwork>)> = self.nodes()[host.0]
            .interfaces
            .iter()
            .filter(|i| i.link.is_some())
            .map(|i| (i.name.clone(), i.addresses.clone()))
            .collect();

        for (iface_name, all_addresses) in iface_info {
            let addresses: Vec<IpNetwork> = all_addresses
                .iter()
                .filter(|a| family_matches(a, &version))
                .cloned()
                .collect();
            if addresses.is_empty() {
                continue;
            }

            let mut stack: Vec<(NodeId, String)> = vec![(host, iface_name)];
            let mut visited: HashSet<(NodeId, String)> = stack.iter().cloned().collect();
            while let Some((node_id, name)) = stack.pop() {
                let node = &self.nodes()[node_id.0];
                let Some(ifc) = node.iface(&name) else { continue };
                let Some(link_id) = ifc.link else { continue };
                let Some(partner) = self.links()[link_id.0].partner(node_id, &name) else {
                    continue;
                };
                let peer = &self.nodes()[partner.node.0];
                if peer.is_router() {
                    let peer_addrs = peer
                        .iface(&partner.iface)
                        .map(|i| i.addresses.clone())
                        .unwrap_or_default();
                    if let Some(gateway) = compatible_address(&addresses, &peer_addrs) {
                        debug!(
                            "Installing default route via {} on {}",
                            gateway,
                            self.nodes()[host.0].name
                        );
                        let gw = self.gateway_of(host)?;
                        gw.add_default_route(gateway).await?;
                        return Ok(());
                    }
                } else if peer.is_switch() {
                    for port in &peer.interfaces {
                        if port.link.is_none() {
                            continue;
                        }
                        let key = (partner.node, port.name.clone());
                        if visited.insert(key.clone()) {
                            stack.push(key);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compatible_address_picks_first_contained() {
        let src: Vec<IpNetwork> = vec!["192.168.0.2/24".parse().unwrap()];
        let dst: Vec<IpNetwork> = vec![
            "10.0.0.1/24".parse().unwrap(),
            "192.168.0.1/24".parse().unwrap(),
        ];
        assert_eq!(
            compatible_address(&src, &dst),
            Some("192.168.0.1".parse().unwrap())
        );
    }

    #[test]
    fn compatible_address_respects_family() {
        let src: Vec<IpNetwork> = vec!["fd00::2/64".parse().unwrap()];
        let dst: Vec<IpNetwork> = vec!["192.168.0.1/24".parse().unwrap()];
        assert_eq!(compatible_address(&src, &dst), None);
    }

    #[test]
    fn compatible_address_empty_sources() {
        let dst: Vec<IpNetwork> = vec!["192.168.0.1/24".parse().unwrap()];
        assert_eq!(compatible_address(&[], &dst), None);
    }
}
