#![cfg_attr(test, allow(clippy::unwrap_used))]

//! The virtual interface's TUN device.
//!
//! Every platform hides behind [`Device`]: packet I/O, claiming subnets and
//! DNS configuration. The netstack and the router only ever see the trait.

pub mod dns;

#[cfg(any(target_os = "linux", target_os = "macos"))]
pub mod ioctl;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::TunDevice;

#[cfg(target_os = "macos")]
mod darwin;
#[cfg(target_os = "macos")]
pub use darwin::TunDevice;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
pub use windows::TunDevice;

pub use dns::DnsStrategy;

use anyhow::Result;
use async_trait::async_trait;
use ip_network::IpNetwork;
use ip_packet::{IpPacket, IpPacketBuf};
use std::io;
use std::net::IpAddr;

/// The name of the TUN interface.
pub const IFACE_NAME: &str = "tun-seam";

/// Default MTU of the TUN interface.
pub const DEFAULT_MTU: u32 = 1500;

/// Capacity of the outbound packet queue feeding the device.
pub const OUT_QUEUE_SIZE: usize = 1024;

/// A userspace TUN device.
///
/// Packets are raw IP datagrams on every platform; macOS' 4-byte
/// address-family header is managed internally. The handle is concurrent-safe:
/// reads and writes may proceed in parallel.
#[async_trait]
pub trait Device: Send + Sync + 'static {
    /// Reads the next IP packet into `buf`, returning its length.
    ///
    /// Unblocks with an error once the device is closed.
    async fn read_packet(&self, buf: &mut IpPacketBuf) -> io::Result<usize>;

    /// Writes one IP packet, returning the number of payload bytes written.
    async fn write_packet(&self, packet: &IpPacket) -> io::Result<usize>;

    /// Claims `subnet` by routing it to this interface.
    async fn add_subnet(&self, subnet: IpNetwork) -> Result<()>;

    /// Releases a previously claimed subnet.
    async fn remove_subnet(&self, subnet: IpNetwork) -> Result<()>;

    async fn set_mtu(&self, mtu: u32) -> Result<()>;

    /// Points DNS for the cluster domain at `server` and installs the search
    /// list.
    async fn set_dns(&self, cluster_domain: &str, server: IpAddr, search: &[String])
    -> Result<()>;

    /// The name of the TUN device.
    fn name(&self) -> &str;

    /// Initiates cooperative shutdown: pending and future reads fail.
    fn close(&self);
}
