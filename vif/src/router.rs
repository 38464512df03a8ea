//! Keeps the claimed subnets and the OS route table consistent.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use ip_network::IpNetwork;

use crate::routing::{OsRoute, RoutingTable};
use tun::Device;

/// A requested subnet overlaps a route owned by something else on this
/// machine. Surfaced as a configuration error: the user must either shrink
/// the subnet or whitelist the conflict.
#[derive(Debug, thiserror::Error)]
#[error("subnet {subnet} overlaps existing route {existing}")]
pub struct RouteConflict {
    pub subnet: IpNetwork,
    pub existing: OsRoute,
}

/// Maintains the proxied and never-proxied CIDR sets, diff-applies them to
/// the device and reconciles static overrides on the OS.
pub struct Router {
    device: Arc<dyn Device>,
    table: Arc<dyn RoutingTable>,
    routed: HashSet<IpNetwork>,
    never_proxy: Vec<OsRoute>,
    static_overrides: Vec<OsRoute>,
}

impl Router {
    pub fn new(device: Arc<dyn Device>, table: Arc<dyn RoutingTable>) -> Self {
        Self {
            device,
            table,
            routed: HashSet::new(),
            never_proxy: Vec::new(),
            static_overrides: Vec::new(),
        }
    }

    /// Checks `routes` for conflicts with routes that already exist on this
    /// machine.
    ///
    /// Default routes, half-default routes and routes owned by our own device
    /// are exempt. A conflicting route passes if it is whitelisted or if the
    /// OS route is the requested subnet verbatim.
    pub fn validate_routes(
        &self,
        routes: &[IpNetwork],
        whitelist: &[IpNetwork],
    ) -> Result<(), RouteConflict> {
        let os_routes = match self.table.routes() {
            Ok(routes) => routes,
            Err(e) => {
                tracing::warn!("Failed to read OS routes, skipping validation: {e:#}");
                return Ok(());
            }
        };

        for subnet in routes {
            for os_route in &os_routes {
                if os_route.interface == self.device.name()
                    || os_route.is_default()
                    || os_route.is_half_default()
                {
                    continue;
                }

                if !overlaps(&os_route.dest, subnet) {
                    continue;
                }

                if os_route.dest == *subnet {
                    continue; // Already present verbatim.
                }

                if whitelist.iter().any(|w| w == subnet || contains(w, subnet)) {
                    tracing::debug!(%subnet, existing = %os_route, "Whitelisted route overlap");
                    continue;
                }

                return Err(RouteConflict {
                    subnet: *subnet,
                    existing: os_route.clone(),
                });
            }
        }

        Ok(())
    }

    /// Recomputes the routed set, applying only the difference to the device,
    /// and replaces the never-proxy set with freshly resolved static routes.
    pub async fn update_routes(
        &mut self,
        please_proxy: &[IpNetwork],
        dont_proxy: &[IpNetwork],
    ) -> Result<()> {
        let desired: HashSet<IpNetwork> = please_proxy.iter().copied().collect();

        for subnet in self.routed.difference(&desired) {
            self.device
                .remove_subnet(*subnet)
                .await
                .with_context(|| format!("Failed to withdraw subnet {subnet}"))?;
        }

        for subnet in desired.difference(&self.routed) {
            self.device
                .add_subnet(*subnet)
                .await
                .with_context(|| format!("Failed to claim subnet {subnet}"))?;
        }

        self.routed = desired;

        self.never_proxy = dont_proxy
            .iter()
            .filter_map(|subnet| self.resolve_static(*subnet))
            .collect();

        self.reconcile_static_overrides()?;

        Ok(())
    }

    /// Resolves the route an excluded CIDR would take today, so a static
    /// override can preserve that next-hop once the TUN claims a broader
    /// subnet.
    fn resolve_static(&self, subnet: IpNetwork) -> Option<OsRoute> {
        let os_routes = self
            .table
            .routes()
            .inspect_err(|e| tracing::warn!(%subnet, "Failed to read OS routes: {e:#}"))
            .ok()?;

        let original = os_routes
            .iter()
            .filter(|r| r.interface != self.device.name())
            .filter(|r| r.dest.contains(subnet.network_address()))
            .max_by_key(|r| r.dest.netmask())?;

        Some(OsRoute {
            dest: subnet,
            gateway: original.gateway,
            interface: original.interface.clone(),
        })
    }

    /// Installs the static overrides that are needed and removes the ones
    /// that no longer are.
    ///
    /// An override is needed for every never-proxy route that is contained in
    /// or contains a routed subnet; anything else is already handled by the
    /// OS's longest-prefix match.
    pub fn reconcile_static_overrides(&mut self) -> Result<()> {
        let desired: Vec<OsRoute> = self
            .never_proxy
            .iter()
            .filter(|r| self.routed.iter().any(|s| overlaps(s, &r.dest)))
            .cloned()
            .collect();

        for route in desired.iter().filter(|r| !self.static_overrides.contains(r)) {
            self.table
                .add_route(route)
                .with_context(|| format!("Failed to install static override {route}"))?;

            tracing::debug!(%route, "Installed static override");
        }

        for route in self.static_overrides.iter().filter(|r| !desired.contains(r)) {
            self.table
                .remove_route(route)
                .with_context(|| format!("Failed to remove static override {route}"))?;

            tracing::debug!(%route, "Removed static override");
        }

        self.static_overrides = desired;

        Ok(())
    }

    /// Removes every routed subnet from the device and every static override
    /// from the OS.
    pub async fn close(&mut self) -> Result<()> {
        for subnet in std::mem::take(&mut self.routed) {
            if let Err(e) = self.device.remove_subnet(subnet).await {
                tracing::warn!(%subnet, "Failed to withdraw subnet: {e:#}");
            }
        }

        for route in std::mem::take(&mut self.static_overrides) {
            if let Err(e) = self.table.remove_route(&route) {
                tracing::warn!(%route, "Failed to remove static override: {e:#}");
            }
        }

        self.never_proxy.clear();

        Ok(())
    }

    pub fn routed(&self) -> &HashSet<IpNetwork> {
        &self.routed
    }
}

/// Whether `outer` contains all of `inner`.
fn contains(outer: &IpNetwork, inner: &IpNetwork) -> bool {
    outer.netmask() <= inner.netmask() && outer.contains(inner.network_address())
}

fn overlaps(a: &IpNetwork, b: &IpNetwork) -> bool {
    contains(a, b) || contains(b, a)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    #[test]
    fn containment() {
        assert!(contains(&net("192.0.2.0/24"), &net("192.0.2.4/32")));
        assert!(!contains(&net("192.0.2.4/32"), &net("192.0.2.0/24")));
        assert!(!contains(&net("192.0.2.0/24"), &net("198.51.100.0/24")));
        assert!(contains(&net("192.0.2.0/24"), &net("192.0.2.0/24")));
    }

    #[test]
    fn overlap_is_symmetric() {
        assert!(overlaps(&net("192.0.2.0/26"), &net("192.0.2.32/27")));
        assert!(overlaps(&net("192.0.2.32/27"), &net("192.0.2.0/26")));
        assert!(!overlaps(&net("192.0.2.64/26"), &net("192.0.2.32/27")));
    }
}
