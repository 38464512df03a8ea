#![cfg_attr(test, allow(clippy::unwrap_used))]

//! The virtual interface (VIF).
//!
//! A TUN device, an embedded userspace TCP/IP stack and a router over the
//! claimed subnets, composed into one [`TunnelingDevice`]. Flows accepted by
//! the stack are handed to the tunnel layer through a
//! [`tunnel::StreamCreator`].

mod device;
mod netstack;
mod router;
pub mod routing;
mod udp_flow;

pub use device::TunnelingDevice;
pub use netstack::{Netstack, NetstackConfig};
pub use router::{RouteConflict, Router};
pub use routing::{OsRoute, RoutingTable};
pub use udp_flow::UdpFlow;
