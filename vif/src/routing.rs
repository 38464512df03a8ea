//! The seam to the OS routing table.
//!
//! The router only consumes this trait; the platform primitives behind it are
//! owned by the front end. [`MemoryRoutingTable`] backs tests and dry runs.

use std::net::IpAddr;

use anyhow::Result;
use ip_network::IpNetwork;
use parking_lot::Mutex;

/// A route as the OS reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsRoute {
    pub dest: IpNetwork,
    pub gateway: Option<IpAddr>,
    pub interface: String,
}

impl OsRoute {
    pub fn is_default(&self) -> bool {
        self.dest.netmask() == 0
    }

    /// OpenVPN-style "half-default" routes claim one half of the address
    /// space each instead of overriding the default route.
    pub fn is_half_default(&self) -> bool {
        self.dest.netmask() == 1
    }
}

impl std::fmt::Display for OsRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} via {:?} dev {}", self.dest, self.gateway, self.interface)
    }
}

/// Read and mutate the system routing table.
pub trait RoutingTable: Send + Sync + 'static {
    /// A snapshot of the current routes.
    fn routes(&self) -> Result<Vec<OsRoute>>;

    /// Installs a static route, e.g. a never-proxy override.
    fn add_route(&self, route: &OsRoute) -> Result<()>;

    /// Removes a previously installed static route.
    fn remove_route(&self, route: &OsRoute) -> Result<()>;
}

/// An in-memory routing table.
#[derive(Default)]
pub struct MemoryRoutingTable {
    routes: Mutex<Vec<OsRoute>>,
}

impl MemoryRoutingTable {
    pub fn new(routes: Vec<OsRoute>) -> Self {
        Self {
            routes: Mutex::new(routes),
        }
    }

    pub fn contains(&self, route: &OsRoute) -> bool {
        self.routes.lock().contains(route)
    }
}

impl RoutingTable for MemoryRoutingTable {
    fn routes(&self) -> Result<Vec<OsRoute>> {
        Ok(self.routes.lock().clone())
    }

    fn add_route(&self, route: &OsRoute) -> Result<()> {
        let mut routes = self.routes.lock();

        if !routes.contains(route) {
            routes.push(route.clone());
        }

        Ok(())
    }

    fn remove_route(&self, route: &OsRoute) -> Result<()> {
        self.routes.lock().retain(|r| r != route);

        Ok(())
    }
}
