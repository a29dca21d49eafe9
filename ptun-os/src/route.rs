//! Routing table operations
//!
//! Route add/delete/list goes through the `net-route` crate; the pieces it
//! does not cover (interface metric, static interface addressing) fall back
//! to `netsh` invocations.

use std::net::{IpAddr, Ipv4Addr};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::shell::run_checked;

/// A single IPv4 route owned by the product
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteEntry {
    /// Destination network address
    pub destination: Ipv4Addr,
    /// Destination prefix length
    pub prefix_length: u8,
    /// Next-hop gateway
    pub gateway: Ipv4Addr,
    /// Interface the route is bound to
    #[serde(rename = "interfaceIndex")]
    pub if_index: u32,
    /// Route metric (lower wins)
    pub metric: u32,
}

impl RouteEntry {
    /// Create a new route entry
    pub fn new(
        destination: Ipv4Addr,
        prefix_length: u8,
        gateway: Ipv4Addr,
        if_index: u32,
        metric: u32,
    ) -> Self {
        Self {
            destination,
            prefix_length,
            gateway,
            if_index,
            metric,
        }
    }

    /// Host route (/32) to a single address
    pub fn host(destination: Ipv4Addr, gateway: Ipv4Addr, if_index: u32, metric: u32) -> Self {
        Self::new(destination, 32, gateway, if_index, metric)
    }

    /// Check if this is a default route
    pub fn is_default(&self) -> bool {
        self.prefix_length == 0
    }
}

impl std::fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{} via {} dev {} metric {}",
            self.destination, self.prefix_length, self.gateway, self.if_index, self.metric
        )
    }
}

/// Routing table capability
///
/// Add and delete are idempotent: adding an already-present route and
/// deleting an absent one both succeed without touching the table.
#[async_trait]
pub trait RoutingOps: Send + Sync {
    /// Find the 0.0.0.0/0 route with the lowest metric; returns
    /// `(next_hop, interface_index)`.
    async fn find_default_route(&self) -> Result<(Ipv4Addr, u32)>;

    /// Add a route to the table
    async fn add_route(&self, route: &RouteEntry) -> Result<()>;

    /// Delete a route from the table
    async fn delete_route(&self, route: &RouteEntry) -> Result<()>;

    /// Disable automatic metric on an interface and pin a fixed one
    async fn set_interface_metric(&self, if_index: u32, metric: u32) -> Result<()>;

    /// Assign a static IPv4 address to an interface without a gateway
    async fn set_interface_address(&self, if_index: u32, addr: Ipv4Addr, prefix: u8) -> Result<()>;
}

/// Production routing implementation
pub struct NativeRouting {
    handle: net_route::Handle,
}

impl NativeRouting {
    /// Create a routing handle
    ///
    /// Requires Administrator on Windows, root or `CAP_NET_ADMIN` elsewhere.
    pub fn new() -> Result<Self> {
        let handle = net_route::Handle::new()
            .map_err(|e| Error::Route(format!("failed to create route handle: {}", e)))?;
        Ok(Self { handle })
    }

    fn to_native(route: &RouteEntry) -> net_route::Route {
        // net-route does not carry a metric; precedence comes from the
        // interface metric pinned via netsh
        net_route::Route::new(IpAddr::V4(route.destination), route.prefix_length)
            .with_gateway(IpAddr::V4(route.gateway))
            .with_ifindex(route.if_index)
    }

    async fn is_present(&self, route: &RouteEntry) -> Result<bool> {
        let routes = self
            .handle
            .list()
            .await
            .map_err(|e| Error::Route(format!("failed to list routes: {}", e)))?;
        Ok(routes.iter().any(|r| {
            r.prefix == route.prefix_length && r.destination == IpAddr::V4(route.destination)
        }))
    }
}

#[async_trait]
impl RoutingOps for NativeRouting {
    async fn find_default_route(&self) -> Result<(Ipv4Addr, u32)> {
        let routes = self
            .handle
            .list()
            .await
            .map_err(|e| Error::Route(format!("failed to list routes: {}", e)))?;

        // The table yields defaults in ascending precedence, so the first
        // IPv4 default with a gateway is the one the OS actually uses
        let best = routes
            .iter()
            .filter(|r| r.prefix == 0 && r.destination == IpAddr::V4(Ipv4Addr::UNSPECIFIED))
            .find(|r| matches!(r.gateway, Some(IpAddr::V4(_))))
            .ok_or_else(|| Error::Route("no IPv4 default route present".into()))?;

        let gateway = match best.gateway {
            Some(IpAddr::V4(gw)) => gw,
            _ => return Err(Error::Route("default route has no IPv4 gateway".into())),
        };
        let if_index = best
            .ifindex
            .ok_or_else(|| Error::Route("default route has no interface index".into()))?;

        Ok((gateway, if_index))
    }

    async fn add_route(&self, route: &RouteEntry) -> Result<()> {
        match self.handle.add(&Self::to_native(route)).await {
            Ok(()) => {
                log::info!("Added route: {}", route);
                Ok(())
            }
            Err(e) => {
                // Route already present counts as success
                if self.is_present(route).await.unwrap_or(false) {
                    log::debug!("Route already exists: {}", route);
                    Ok(())
                } else {
                    Err(Error::Route(format!("failed to add {}: {}", route, e)))
                }
            }
        }
    }

    async fn delete_route(&self, route: &RouteEntry) -> Result<()> {
        match self.handle.delete(&Self::to_native(route)).await {
            Ok(()) => {
                log::info!("Deleted route: {}", route);
                Ok(())
            }
            Err(e) => {
                // Route already gone counts as success
                if !self.is_present(route).await.unwrap_or(true) {
                    log::debug!("Route already absent: {}", route);
                    Ok(())
                } else {
                    Err(Error::Route(format!("failed to delete {}: {}", route, e)))
                }
            }
        }
    }

    async fn set_interface_metric(&self, if_index: u32, metric: u32) -> Result<()> {
        let index = if_index.to_string();
        let metric_arg = format!("metric={}", metric);
        run_checked(
            "set interface metric",
            "netsh",
            &["interface", "ipv4", "set", "interface", &index, &metric_arg],
        )
        .await?;
        log::info!("Interface {} metric set to {}", if_index, metric);
        Ok(())
    }

    async fn set_interface_address(&self, if_index: u32, addr: Ipv4Addr, prefix: u8) -> Result<()> {
        let name = format!("name={}", if_index);
        let addr_str = addr.to_string();
        let mask = prefix_to_mask(prefix).to_string();
        run_checked(
            "set interface address",
            "netsh",
            &[
                "interface", "ipv4", "set", "address", &name, "static", &addr_str, &mask,
            ],
        )
        .await?;
        log::info!("Interface {} addressed {}/{}", if_index, addr, prefix);
        Ok(())
    }
}

/// Convert a prefix length to a dotted-quad netmask
pub fn prefix_to_mask(prefix: u8) -> Ipv4Addr {
    let bits = if prefix == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix.min(32)))
    };
    Ipv4Addr::from(bits)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_display() {
        let route = RouteEntry::new(Ipv4Addr::new(10, 0, 0, 0), 8, Ipv4Addr::new(192, 168, 1, 1), 7, 1);
        assert_eq!(format!("{}", route), "10.0.0.0/8 via 192.168.1.1 dev 7 metric 1");
    }

    #[test]
    fn test_host_route() {
        let route = RouteEntry::host(
            Ipv4Addr::new(203, 0, 113, 9),
            Ipv4Addr::new(192, 168, 1, 1),
            7,
            1,
        );
        assert_eq!(route.prefix_length, 32);
        assert!(!route.is_default());
    }

    #[test]
    fn test_prefix_to_mask() {
        assert_eq!(prefix_to_mask(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(prefix_to_mask(32), Ipv4Addr::new(255, 255, 255, 255));
        assert_eq!(prefix_to_mask(0), Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(prefix_to_mask(12), Ipv4Addr::new(255, 240, 0, 0));
    }

    #[test]
    fn test_route_entry_serde_layout() {
        let route = RouteEntry::new(Ipv4Addr::new(198, 18, 0, 255), 32, Ipv4Addr::new(192, 168, 1, 1), 7, 1);
        let json = serde_json::to_value(&route).unwrap();
        assert_eq!(json["destination"], "198.18.0.255");
        assert_eq!(json["prefixLength"], 32);
        assert_eq!(json["gateway"], "192.168.1.1");
        assert_eq!(json["interfaceIndex"], 7);
        assert_eq!(json["metric"], 1);
    }
}
