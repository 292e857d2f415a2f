//! rtnetlink gateway
//!
//! One [`Gateway`] wraps one rtnetlink handle bound to one network
//! namespace, together with the task driving its socket. Every operation is
//! a single netlink transaction: it either commits or leaves no partial
//! state. Gateways are held for the lifetime of their container and
//! released on stop; an operation on a released gateway surfaces as
//! [`NetlinkError::NamespaceGone`].

use crate::netns::{NetNs, NetNsError};
use futures::TryStreamExt;
use ipnetwork::{IpNetwork, Ipv4Network, Ipv6Network};
use netlink_packet_route::address::AddressAttribute;
use netlink_packet_route::route::{RouteAddress, RouteAttribute, RouteMessage, RouteType};
use netlink_packet_route::AddressFamily;
use nix::errno::Errno;
use nix::unistd::getpid;
use rtnetlink::{new_connection, Handle, IpVersion};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::unix::io::RawFd;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::debug;

#[derive(Error, Debug)]
pub enum NetlinkError {
    #[error("Netlink connection failed: {0}")]
    Connection(std::io::Error),

    #[error("Link '{0}' not found")]
    NotFound(String),

    #[error("Link '{0}' already exists")]
    AlreadyExists(String),

    #[error("Invalid interface name: {0}")]
    InvalidName(String),

    #[error("Namespace handle already released")]
    NamespaceGone,

    #[error("Route has mismatched address families")]
    MixedFamilies,

    #[error("Netlink error: {0}")]
    Netlink(rtnetlink::Error),

    #[error("Namespace error: {0}")]
    NetNs(#[from] NetNsError),
}

const RT_TABLE_MAIN: u8 = 254;

/// Retries while waiting for a moved link to appear in its new namespace.
const LOOKUP_RETRIES: u32 = 50;
const LOOKUP_DELAY: Duration = Duration::from_millis(20);

fn errno_of(err: &rtnetlink::Error) -> Option<i32> {
    match err {
        rtnetlink::Error::NetlinkError(msg) => msg.code.map(|c| -c.get()),
        _ => None,
    }
}

/// A netlink handle bound to one namespace.
#[derive(Debug)]
pub struct Gateway {
    handle: Handle,
    driver: JoinHandle<()>,
}

impl Gateway {
    /// Open a handle in the caller's (root) namespace.
    pub fn new() -> Result<Self, NetlinkError> {
        let (connection, handle, _) = new_connection().map_err(NetlinkError::Connection)?;
        let driver = tokio::spawn(connection);
        Ok(Self { handle, driver })
    }

    /// Open a handle bound to a named namespace. The socket is created with
    /// the current thread moved into the namespace and keeps its binding
    /// after the thread returns.
    pub fn new_in_namespace(ns: &NetNs) -> Result<Self, NetlinkError> {
        let _guard = ns.enter()?;
        let (connection, handle, _) = new_connection().map_err(NetlinkError::Connection)?;
        let driver = tokio::spawn(connection);
        Ok(Self { handle, driver })
    }

    fn map_err(&self, err: rtnetlink::Error, name: &str) -> NetlinkError {
        match errno_of(&err) {
            Some(code) if code == Errno::EEXIST as i32 => {
                NetlinkError::AlreadyExists(name.to_string())
            }
            Some(code)
                if code == Errno::ENODEV as i32
                    || code == Errno::ENOENT as i32
                    || code == Errno::ESRCH as i32 =>
            {
                NetlinkError::NotFound(name.to_string())
            }
            _ => match err {
                rtnetlink::Error::RequestFailed => NetlinkError::NamespaceGone,
                other => NetlinkError::Netlink(other),
            },
        }
    }

    /// Look up a link index by name.
    pub async fn link_index(&self, name: &str) -> Result<u32, NetlinkError> {
        let mut links = self
            .handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute();
        match links.try_next().await {
            Ok(Some(link)) => Ok(link.header.index),
            Ok(None) => Err(NetlinkError::NotFound(name.to_string())),
            Err(e) => Err(self.map_err(e, name)),
        }
    }

    /// Look up a link index, retrying while the link is not yet visible.
    ///
    /// A link moved between namespaces is briefly absent from both link
    /// tables; this covers that window.
    pub async fn wait_link_index(&self, name: &str) -> Result<u32, NetlinkError> {
        for _ in 0..LOOKUP_RETRIES {
            match self.link_index(name).await {
                Ok(index) => return Ok(index),
                Err(NetlinkError::NotFound(_)) => sleep(LOOKUP_DELAY).await,
                Err(e) => return Err(e),
            }
        }
        Err(NetlinkError::NotFound(name.to_string()))
    }

    /// Create a veth pair with both endpoints in this namespace.
    pub async fn create_veth(&self, name: &str, peer: &str) -> Result<(), NetlinkError> {
        validate_name(name)?;
        validate_name(peer)?;
        debug!("Creating veth pair: {} <-> {}", name, peer);
        self.handle
            .link()
            .add()
            .veth(name.to_string(), peer.to_string())
            .execute()
            .await
            .map_err(|e| self.map_err(e, name))
    }

    /// Create a bridge device.
    pub async fn create_bridge(&self, name: &str) -> Result<(), NetlinkError> {
        validate_name(name)?;
        debug!("Creating bridge: {}", name);
        self.handle
            .link()
            .add()
            .bridge(name.to_string())
            .execute()
            .await
            .map_err(|e| self.map_err(e, name))
    }

    /// Delete a link. Deleting one end of a veth pair removes both.
    pub async fn delete_link(&self, index: u32) -> Result<(), NetlinkError> {
        self.handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| self.map_err(e, &index.to_string()))
    }

    pub async fn set_up(&self, index: u32) -> Result<(), NetlinkError> {
        self.handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|e| self.map_err(e, &index.to_string()))
    }

    pub async fn set_down(&self, index: u32) -> Result<(), NetlinkError> {
        self.handle
            .link()
            .set(index)
            .down()
            .execute()
            .await
            .map_err(|e| self.map_err(e, &index.to_string()))
    }

    pub async fn rename(&self, index: u32, name: &str) -> Result<(), NetlinkError> {
        validate_name(name)?;
        self.handle
            .link()
            .set(index)
            .name(name.to_string())
            .execute()
            .await
            .map_err(|e| self.map_err(e, name))
    }

    /// Enslave a link to a bridge.
    pub async fn set_controller(&self, index: u32, bridge: u32) -> Result<(), NetlinkError> {
        self.handle
            .link()
            .set(index)
            .controller(bridge)
            .execute()
            .await
            .map_err(|e| self.map_err(e, &index.to_string()))
    }

    /// Move a link into the namespace behind `fd`. The kernel removes the
    /// device from this namespace's view.
    pub async fn move_to_ns(&self, index: u32, fd: RawFd) -> Result<(), NetlinkError> {
        self.handle
            .link()
            .set(index)
            .setns_by_fd(fd)
            .execute()
            .await
            .map_err(|e| self.map_err(e, &index.to_string()))
    }

    /// Move a link back to the root namespace (the one of this process).
    pub async fn move_to_root(&self, index: u32) -> Result<(), NetlinkError> {
        self.handle
            .link()
            .set(index)
            .setns_by_pid(getpid().as_raw() as u32)
            .execute()
            .await
            .map_err(|e| self.map_err(e, &index.to_string()))
    }

    /// Add an interface address to a link.
    pub async fn add_address(&self, index: u32, ifaddr: IpNetwork) -> Result<(), NetlinkError> {
        debug!("Adding address {} to link {}", ifaddr, index);
        self.handle
            .address()
            .add(index, ifaddr.ip(), ifaddr.prefix())
            .execute()
            .await
            .map_err(|e| self.map_err(e, &ifaddr.to_string()))
    }

    /// Remove an interface address from a link.
    pub async fn del_address(&self, index: u32, ifaddr: IpNetwork) -> Result<(), NetlinkError> {
        let mut addresses = self
            .handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        while let Some(msg) = addresses
            .try_next()
            .await
            .map_err(|e| self.map_err(e, &ifaddr.to_string()))?
        {
            if msg.header.prefix_len != ifaddr.prefix() {
                continue;
            }
            let matches = msg.attributes.iter().any(|attr| {
                matches!(attr, AddressAttribute::Address(addr) if *addr == ifaddr.ip())
            });
            if matches {
                self.handle
                    .address()
                    .del(msg)
                    .execute()
                    .await
                    .map_err(|e| self.map_err(e, &ifaddr.to_string()))?;
                return Ok(());
            }
        }
        Err(NetlinkError::NotFound(ifaddr.to_string()))
    }

    /// Add a route. `dest` `0.0.0.0/0` or `::/0` is the default route.
    pub async fn add_route(
        &self,
        dest: IpNetwork,
        gateway: Option<IpAddr>,
        oif: Option<u32>,
    ) -> Result<(), NetlinkError> {
        self.route_request(dest, gateway, oif, false).await
    }

    /// Add a route, replacing an existing one to the same destination.
    pub async fn replace_route(
        &self,
        dest: IpNetwork,
        gateway: Option<IpAddr>,
        oif: Option<u32>,
    ) -> Result<(), NetlinkError> {
        self.route_request(dest, gateway, oif, true).await
    }

    async fn route_request(
        &self,
        dest: IpNetwork,
        gateway: Option<IpAddr>,
        oif: Option<u32>,
        replace: bool,
    ) -> Result<(), NetlinkError> {
        debug!("Adding route {} via {:?} oif {:?}", dest, gateway, oif);
        match dest {
            IpNetwork::V4(net) => {
                let mut request = self
                    .handle
                    .route()
                    .add()
                    .v4()
                    .destination_prefix(net.ip(), net.prefix());
                match gateway {
                    Some(IpAddr::V4(gw)) => request = request.gateway(gw),
                    Some(IpAddr::V6(_)) => return Err(NetlinkError::MixedFamilies),
                    None => {}
                }
                if let Some(index) = oif {
                    request = request.output_interface(index);
                }
                if replace {
                    request = request.replace();
                }
                request
                    .execute()
                    .await
                    .map_err(|e| self.map_err(e, &dest.to_string()))
            }
            IpNetwork::V6(net) => {
                let mut request = self
                    .handle
                    .route()
                    .add()
                    .v6()
                    .destination_prefix(net.ip(), net.prefix());
                match gateway {
                    Some(IpAddr::V6(gw)) => request = request.gateway(gw),
                    Some(IpAddr::V4(_)) => return Err(NetlinkError::MixedFamilies),
                    None => {}
                }
                if let Some(index) = oif {
                    request = request.output_interface(index);
                }
                if replace {
                    request = request.replace();
                }
                request
                    .execute()
                    .await
                    .map_err(|e| self.map_err(e, &dest.to_string()))
            }
        }
    }

    /// Add a default route through `gateway`.
    pub async fn add_default_route(&self, gateway: IpAddr) -> Result<(), NetlinkError> {
        self.add_route(default_destination(gateway), Some(gateway), None)
            .await
    }

    /// Remove the route to `dest` from the main table. Returns whether a
    /// route was removed; an absent route is not an error.
    pub async fn del_route(&self, dest: IpNetwork) -> Result<bool, NetlinkError> {
        let routes = self
            .dump_main_routes(version_of(dest))
            .await
            .map_err(|e| self.map_err(e, &dest.to_string()))?;
        for msg in routes {
            if route_destination(&msg) == Some(dest) {
                match self.handle.route().del(msg).execute().await {
                    Ok(()) => return Ok(true),
                    Err(e) => match errno_of(&e) {
                        Some(code) if code == Errno::ESRCH as i32 => return Ok(false),
                        _ => return Err(self.map_err(e, &dest.to_string())),
                    },
                }
            }
        }
        Ok(false)
    }

    /// Whether the main table holds a route to exactly `dest`.
    pub async fn has_route(&self, dest: IpNetwork) -> Result<bool, NetlinkError> {
        let routes = self
            .dump_main_routes(version_of(dest))
            .await
            .map_err(|e| self.map_err(e, &dest.to_string()))?;
        Ok(routes
            .iter()
            .any(|msg| route_destination(msg) == Some(dest)))
    }

    /// Whether the main table holds a default route for this family.
    pub async fn has_default_route(&self, version: IpVersion) -> Result<bool, NetlinkError> {
        let routes = self
            .dump_main_routes(version)
            .await
            .map_err(|e| self.map_err(e, "default"))?;
        Ok(routes
            .iter()
            .any(|msg| msg.header.destination_prefix_length == 0))
    }

    async fn dump_main_routes(
        &self,
        version: IpVersion,
    ) -> Result<Vec<RouteMessage>, rtnetlink::Error> {
        let mut stream = self.handle.route().get(version).execute();
        let mut routes = Vec::new();
        while let Some(msg) = stream.try_next().await? {
            if msg.header.table == RT_TABLE_MAIN && msg.header.kind == RouteType::Unicast {
                routes.push(msg);
            }
        }
        Ok(routes)
    }

    /// Release the handle. Subsequent operations through clones fail.
    pub fn release(self) {
        self.driver.abort();
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// Validate an interface name against the kernel's rules.
fn validate_name(name: &str) -> Result<(), NetlinkError> {
    let valid = !name.is_empty()
        && name.len() <= 15
        && !name.starts_with('-')
        && name
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(NetlinkError::InvalidName(name.to_string()))
    }
}

fn version_of(net: IpNetwork) -> IpVersion {
    match net {
        IpNetwork::V4(_) => IpVersion::V4,
        IpNetwork::V6(_) => IpVersion::V6,
    }
}

fn default_destination(gateway: IpAddr) -> IpNetwork {
    match gateway {
        IpAddr::V4(_) => IpNetwork::V4(
            Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0).expect("zero prefix is valid"),
        ),
        IpAddr::V6(_) => IpNetwork::V6(
            Ipv6Network::new(Ipv6Addr::UNSPECIFIED, 0).expect("zero prefix is valid"),
        ),
    }
}

/// Destination network of a dumped route, if it carries one. A missing
/// destination attribute with prefix length zero is the default route.
fn route_destination(msg: &RouteMessage) -> Option<IpNetwork> {
    let prefix = msg.header.destination_prefix_length;
    for attr in &msg.attributes {
        if let RouteAttribute::Destination(dst) = attr {
            return match dst {
                RouteAddress::Inet(addr) => {
                    Ipv4Network::new(*addr, prefix).ok().map(IpNetwork::V4)
                }
                RouteAddress::Inet6(addr) => {
                    Ipv6Network::new(*addr, prefix).ok().map(IpNetwork::V6)
                }
                _ => None,
            };
        }
    }
    if prefix == 0 {
        return match msg.header.address_family {
            AddressFamily::Inet => Some(IpNetwork::V4(
                Ipv4Network::new(Ipv4Addr::UNSPECIFIED, 0).expect("zero prefix is valid"),
            )),
            AddressFamily::Inet6 => Some(IpNetwork::V6(
                Ipv6Network::new(Ipv6Addr::UNSPECIFIED, 0).expect("zero prefix is valid"),
            )),
            _ => None,
        };
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interface_name_validation() {
        assert!(validate_name("eth0").is_ok());
        assert!(validate_name("veth-test").is_ok());
        assert!(validate_name("test_123").is_ok());

        assert!(validate_name("").is_err());
        assert!(validate_name("this-name-is-way-too-long-for-linux").is_err());
        assert!(validate_name("-invalid").is_err());
        assert!(validate_name("invalid@name").is_err());
    }

    #[test]
    fn default_destination_follows_gateway_family() {
        assert_eq!(
            default_destination("10.0.0.1".parse().unwrap()).to_string(),
            "0.0.0.0/0"
        );
        assert_eq!(
            default_destination("fd00::1".parse().unwrap()).to_string(),
            "::/0"
        );
    }
}
