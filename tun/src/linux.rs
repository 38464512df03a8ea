use anyhow::{Context as _, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use ip_network::{IpNetwork, Ipv4Network, Ipv6Network};
use ip_packet::{IpPacket, IpPacketBuf};
use libc::{F_GETFL, F_SETFL, O_NONBLOCK, O_RDWR, fcntl, open};
use netlink_packet_route::route::{RouteMessage, RouteProtocol, RouteScope};
use rtnetlink::{Error::NetlinkError, Handle, LinkUnspec, RouteMessageBuilder, new_connection};
use std::ffi::CStr;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, RawFd};
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::{DEFAULT_MTU, ioctl};

const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
const TUN_FILE: &CStr = c"/dev/net/tun";

#[derive(Debug)]
struct TunFd(RawFd);

impl AsRawFd for TunFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl Drop for TunFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

pub struct TunDevice {
    fd: AsyncFd<TunFd>,
    name: String,
    handle: Handle,
    connection: tokio::task::JoinHandle<()>,
    interface_index: u32,
    closing: CancellationToken,
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        self.connection.abort();
    }
}

impl TunDevice {
    /// Opens the TUN device and assigns its interface addresses.
    ///
    /// Panics if called without a Tokio runtime.
    pub async fn open(name: &str, ipv4: Ipv4Addr, ipv6: Ipv6Addr) -> Result<Self> {
        let fd = match unsafe { open(TUN_FILE.as_ptr() as _, O_RDWR) } {
            -1 => {
                return Err(anyhow::Error::new(io::Error::last_os_error()))
                    .context("Failed to open '/dev/net/tun'");
            }
            fd => fd,
        };

        unsafe {
            ioctl::exec(
                fd,
                TUNSETIFF,
                &mut ioctl::Request::<ioctl::SetTunFlagsPayload>::new(name),
            )
            .context("Failed to set flags on TUN device")?;
        }

        set_non_blocking(fd).context("Failed to make TUN device non-blocking")?;

        let (cxn, handle, _) = new_connection().context("Failed to create netlink connection")?;
        let connection = tokio::spawn(cxn);

        let interface_index = handle
            .link()
            .get()
            .match_name(name.to_string())
            .execute()
            .try_next()
            .await?
            .context("No interface")?
            .header
            .index;

        let this = Self {
            fd: AsyncFd::new(TunFd(fd))?,
            name: name.to_string(),
            handle,
            connection,
            interface_index,
            closing: CancellationToken::new(),
        };

        this.set_addresses(ipv4, ipv6).await?;
        this.set_mtu_inner(DEFAULT_MTU).await?;
        this.up().await?;

        Ok(this)
    }

    async fn set_addresses(&self, ipv4: Ipv4Addr, ipv6: Ipv6Addr) -> Result<()> {
        let handle = &self.handle;

        let ips = handle
            .address()
            .get()
            .set_link_index_filter(self.interface_index)
            .execute();

        ips.try_for_each(|ip| handle.address().del(ip).execute())
            .await
            .context("Failed to delete existing addresses")?;

        let res_v4 = handle
            .address()
            .add(self.interface_index, ipv4.into(), 32)
            .execute()
            .await;
        let res_v6 = handle
            .address()
            .add(self.interface_index, ipv6.into(), 128)
            .execute()
            .await;

        // On systems without IPv6 support, assigning only the v4 address is fine.
        res_v4.or(res_v6)?;

        Ok(())
    }

    async fn set_mtu_inner(&self, mtu: u32) -> Result<()> {
        self.handle
            .link()
            .set(
                LinkUnspec::new_with_index(self.interface_index)
                    .mtu(mtu)
                    .build(),
            )
            .execute()
            .await
            .context("Failed to set MTU")?;

        Ok(())
    }

    async fn up(&self) -> Result<()> {
        self.handle
            .link()
            .set(
                LinkUnspec::new_with_index(self.interface_index)
                    .up()
                    .build(),
            )
            .execute()
            .await
            .context("Failed to bring up interface")?;

        Ok(())
    }

    fn route_message(&self, subnet: IpNetwork) -> RouteMessage {
        match subnet {
            IpNetwork::V4(net) => make_route_v4(self.interface_index, net),
            IpNetwork::V6(net) => make_route_v6(self.interface_index, net),
        }
    }
}

#[async_trait]
impl crate::Device for TunDevice {
    async fn read_packet(&self, buf: &mut IpPacketBuf) -> io::Result<usize> {
        let read = self.fd.async_io(Interest::READABLE, |fd| {
            let dst = buf.buf();

            // Safety: Within this module, the file descriptor is always valid.
            match unsafe { libc::read(fd.as_raw_fd(), dst.as_mut_ptr() as _, dst.len()) } {
                -1 => Err(io::Error::last_os_error()),
                n => Ok(n as usize),
            }
        });

        tokio::select! {
            () = self.closing.cancelled() => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "TUN device is closed")),
            res = read => res,
        }
    }

    async fn write_packet(&self, packet: &IpPacket) -> io::Result<usize> {
        self.fd
            .async_io(Interest::WRITABLE, |fd| {
                let src = packet.packet();

                // Safety: Within this module, the file descriptor is always valid.
                match unsafe { libc::write(fd.as_raw_fd(), src.as_ptr() as _, src.len() as _) } {
                    -1 => Err(io::Error::last_os_error()),
                    n => Ok(n as usize),
                }
            })
            .await
    }

    async fn add_subnet(&self, subnet: IpNetwork) -> Result<()> {
        let res = self
            .handle
            .route()
            .add(self.route_message(subnet))
            .execute()
            .await;

        match res {
            Ok(()) => {
                tracing::debug!(%subnet, "Created new route");
                Ok(())
            }
            // We expect to be called with already routed subnets.
            Err(NetlinkError(err)) if err.raw_code() == -libc::EEXIST => Ok(()),
            // No IPv6 support.
            Err(NetlinkError(err)) if err.raw_code() == -libc::EOPNOTSUPP => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to add route for {subnet}")),
        }
    }

    async fn remove_subnet(&self, subnet: IpNetwork) -> Result<()> {
        let res = self
            .handle
            .route()
            .del(self.route_message(subnet))
            .execute()
            .await;

        match res {
            Ok(()) => {
                tracing::debug!(%subnet, "Removed route");
                Ok(())
            }
            // Our view of the routes may be stale; both codes are versions of
            // "route does not exist".
            Err(NetlinkError(err)) if err.raw_code() == -libc::ENOENT => Ok(()),
            Err(NetlinkError(err)) if err.raw_code() == -libc::ESRCH => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove route for {subnet}")),
        }
    }

    async fn set_mtu(&self, mtu: u32) -> Result<()> {
        self.set_mtu_inner(mtu).await
    }

    async fn set_dns(
        &self,
        cluster_domain: &str,
        server: IpAddr,
        search: &[String],
    ) -> Result<()> {
        // systemd-resolved is the only resolver we configure on Linux.
        let status = Command::new("resolvectl")
            .args(["dns", &self.name, &server.to_string()])
            .status()
            .await
            .context("Failed to run resolvectl dns")?;
        anyhow::ensure!(status.success(), "resolvectl dns failed: {status}");

        let status = Command::new("resolvectl")
            .arg("domain")
            .arg(&self.name)
            .args(search)
            .arg(format!("~{cluster_domain}"))
            .status()
            .await
            .context("Failed to run resolvectl domain")?;
        anyhow::ensure!(status.success(), "resolvectl domain failed: {status}");

        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&self) {
        self.closing.cancel();
    }
}

fn make_route_v4(idx: u32, route: Ipv4Network) -> RouteMessage {
    RouteMessageBuilder::<Ipv4Addr>::new()
        .output_interface(idx)
        .protocol(RouteProtocol::Static)
        .scope(RouteScope::Universe)
        .destination_prefix(route.network_address(), route.netmask())
        .build()
}

fn make_route_v6(idx: u32, route: Ipv6Network) -> RouteMessage {
    RouteMessageBuilder::<Ipv6Addr>::new()
        .output_interface(idx)
        .protocol(RouteProtocol::Static)
        .scope(RouteScope::Universe)
        .destination_prefix(route.network_address(), route.netmask())
        .build()
}

fn set_non_blocking(fd: RawFd) -> io::Result<()> {
    match unsafe { fcntl(fd, F_GETFL) } {
        -1 => Err(io::Error::last_os_error()),
        flags => match unsafe { fcntl(fd, F_SETFL, flags | O_NONBLOCK) } {
            -1 => Err(io::Error::last_os_error()),
            _ => Ok(()),
        },
    }
}
