mod dns;

use anyhow::{Context as _, Result};
use async_trait::async_trait;
use ip_network::IpNetwork;
use ip_packet::{IpPacket, IpPacketBuf};
use std::io;
use std::iter;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use tokio::process::Command;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use windows::Win32::Foundation::BOOLEAN;
use windows::Win32::NetworkManagement::IpHelper::{
    AddIPAddress, CreateIpForwardEntry2, DeleteIpForwardEntry2, GetAdapterIndex,
    GetIpInterfaceEntry, InitializeIpForwardEntry, MIB_IPFORWARD_ROW2, MIB_IPINTERFACE_ROW,
    SetIpInterfaceEntry,
};
use windows::Win32::Networking::WinSock::{
    AF_INET, AF_INET6, MIB_IPPROTO_NETMGMT, SOCKADDR_INET,
};
use windows::core::{HRESULT, PCWSTR};

use crate::{DEFAULT_MTU, DnsStrategy, IFACE_NAME};

const IFACE_TYPE: &str = "vpn";

/// The fixed GUID of our adapter; keeping it stable means the registry paths
/// for DNS settings are known ahead of time.
const TUNNEL_UUID: &str = "2bdc1f1b-3a9a-4f17-9b3a-2f0e52a7c7c8";
const TUNNEL_UUID_U128: u128 = 0x2bdc1f1b_3a9a_4f17_9b3a_2f0e52a7c7c8;

/// Passed to `CreateProcess` so console commands don't flash a window.
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

pub struct TunDevice {
    session: Arc<wintun::Session>,
    _adapter: Arc<wintun::Adapter>,
    adapter_index: u32,
    inbound_rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    dns_strategy: DnsStrategy,
    closing: CancellationToken,
}

impl Drop for TunDevice {
    fn drop(&mut self) {
        // Cancels a pending blocking receive.
        let _ = self.session.shutdown();
    }
}

impl TunDevice {
    /// Creates the wintun adapter and assigns its interface addresses.
    ///
    /// wintun.dll must be installed next to the executable or in System32, and
    /// creating adapters requires Administrator rights.
    pub async fn open(
        ipv4: Ipv4Addr,
        ipv6: Ipv6Addr,
        dns_strategy: DnsStrategy,
    ) -> Result<Self> {
        // SAFETY: Safe as long as we load the correct DLL.
        let wt = unsafe { wintun::load() }.context("Failed to load wintun.dll")?;

        let adapter = wintun::Adapter::create(&wt, IFACE_NAME, IFACE_TYPE, Some(TUNNEL_UUID_U128))
            .context("Failed to create wintun adapter")?;
        let session = Arc::new(
            adapter
                .start_session(wintun::MAX_RING_CAPACITY)
                .context("Failed to start wintun session")?,
        );

        let mut adapter_index = 0u32;
        let adapter_name: Vec<_> = IFACE_NAME.encode_utf16().chain(iter::once(0)).collect();
        // SAFETY: We just created the adapter, it must exist. Going by index
        // instead of GUID avoids relying on undocumented behaviour.
        unsafe {
            GetAdapterIndex(PCWSTR::from_raw(adapter_name.as_ptr()), &mut adapter_index)
        };

        let (inbound_tx, inbound_rx) = mpsc::channel(crate::OUT_QUEUE_SIZE);

        // wintun's receive is blocking; pump packets onto a channel from a
        // dedicated thread.
        std::thread::Builder::new()
            .name("TUN recv".to_owned())
            .spawn({
                let session = session.clone();

                move || {
                    loop {
                        let packet = match session.receive_blocking() {
                            Ok(packet) => packet,
                            Err(_) => break, // Session was shut down.
                        };

                        if inbound_tx.blocking_send(packet.bytes().to_vec()).is_err() {
                            break;
                        }
                    }
                }
            })
            .map_err(io::Error::other)?;

        let this = Self {
            session,
            _adapter: adapter,
            adapter_index,
            inbound_rx: Mutex::new(inbound_rx),
            dns_strategy,
            closing: CancellationToken::new(),
        };

        this.set_addresses(ipv4, ipv6).await?;

        Ok(this)
    }

    async fn set_addresses(&self, ipv4: Ipv4Addr, ipv6: Ipv6Addr) -> Result<()> {
        self.set_interface_entry(DEFAULT_MTU)?;

        let ipv4_res = set_ipv4_addr(self.adapter_index, ipv4);
        let ipv6_res = set_ipv6_addr(self.adapter_index, ipv6).await;

        if ipv4_res.is_err() && ipv6_res.is_err() {
            ipv4_res?;
        }

        Ok(())
    }

    /// Lowers the interface metric and sets the MTU, so the adapter wins route
    /// selection for the subnets it claims.
    fn set_interface_entry(&self, mtu: u32) -> Result<()> {
        let mut row = MIB_IPINTERFACE_ROW {
            InterfaceIndex: self.adapter_index,
            // We use this to get/set the MTU and metric, family is irrelevant.
            Family: AF_INET,
            ..Default::default()
        };

        unsafe { GetIpInterfaceEntry(&mut row) }
            .ok()
            .context("Failed to query interface entry")?;

        row.ManagedAddressConfigurationSupported = BOOLEAN(0);
        row.OtherStatefulConfigurationSupported = BOOLEAN(0);
        row.NlMtu = mtu;
        row.UseAutomaticMetric = BOOLEAN(0);
        row.Metric = 0;

        unsafe { SetIpInterfaceEntry(&mut row) }
            .ok()
            .context("Failed to update interface entry")?;

        Ok(())
    }

    fn forward_row(&self, subnet: IpNetwork) -> MIB_IPFORWARD_ROW2 {
        let mut row = MIB_IPFORWARD_ROW2::default();
        unsafe { InitializeIpForwardEntry(&mut row) };

        row.ValidLifetime = u32::MAX;
        row.PreferredLifetime = u32::MAX;
        row.Protocol = MIB_IPPROTO_NETMGMT;
        row.Metric = 0;
        row.InterfaceIndex = self.adapter_index;

        let mut prefix = SOCKADDR_INET::default();
        match subnet {
            IpNetwork::V4(net) => {
                prefix.si_family = AF_INET;
                prefix.Ipv4.sin_addr.S_un.S_addr = u32::from(net.network_address()).to_be();
            }
            IpNetwork::V6(net) => {
                prefix.si_family = AF_INET6;
                prefix.Ipv6.sin6_addr.u.Byte = net.network_address().octets();
            }
        }

        row.DestinationPrefix.Prefix = prefix;
        row.DestinationPrefix.PrefixLength = subnet.netmask();

        row
    }
}

#[async_trait]
impl crate::Device for TunDevice {
    async fn read_packet(&self, buf: &mut IpPacketBuf) -> io::Result<usize> {
        let mut inbound_rx = self.inbound_rx.lock().await;

        let packet = tokio::select! {
            () = self.closing.cancelled() => return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "TUN device is closed")),
            packet = inbound_rx.recv() => packet,
        };

        let Some(packet) = packet else {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "TUN device is closed",
            ));
        };

        let dst = buf.buf();

        if packet.len() > dst.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "packet exceeds MTU",
            ));
        }

        dst[..packet.len()].copy_from_slice(&packet);

        Ok(packet.len())
    }

    async fn write_packet(&self, packet: &IpPacket) -> io::Result<usize> {
        let bytes = packet.packet();

        let mut send_packet = self
            .session
            .allocate_send_packet(bytes.len() as u16)
            .map_err(io::Error::other)?;
        send_packet.bytes_mut().copy_from_slice(bytes);

        self.session.send_packet(send_packet);

        Ok(bytes.len())
    }

    async fn add_subnet(&self, subnet: IpNetwork) -> Result<()> {
        let mut row = self.forward_row(subnet);

        unsafe { CreateIpForwardEntry2(&mut row) }
            .ok()
            .with_context(|| format!("Failed to add route for {subnet}"))?;

        Ok(())
    }

    async fn remove_subnet(&self, subnet: IpNetwork) -> Result<()> {
        let row = self.forward_row(subnet);

        unsafe { DeleteIpForwardEntry2(&row) }
            .ok()
            .with_context(|| format!("Failed to remove route for {subnet}"))?;

        Ok(())
    }

    async fn set_mtu(&self, mtu: u32) -> Result<()> {
        self.set_interface_entry(mtu)
    }

    async fn set_dns(
        &self,
        cluster_domain: &str,
        server: IpAddr,
        search: &[String],
    ) -> Result<()> {
        dns::apply(
            self.dns_strategy,
            self.adapter_index,
            cluster_domain,
            server,
            search,
        )
        .await
    }

    fn name(&self) -> &str {
        IFACE_NAME
    }

    fn close(&self) {
        self.closing.cancel();
        let _ = self.session.shutdown();
    }
}

fn set_ipv4_addr(idx: u32, addr: Ipv4Addr) -> Result<()> {
    const IPV4_NETMASK_32: u32 = 0xFFFF_FFFF;

    let mut ip_context = 0u32;
    let mut ip_instance = 0u32;

    let res = unsafe {
        AddIPAddress(
            u32::from(addr).to_be(),
            IPV4_NETMASK_32.to_be(),
            idx,
            &mut ip_context,
            &mut ip_instance,
        )
    };

    HRESULT::from_win32(res).ok()?;

    Ok(())
}

// There is no Win32 call for this one, alas.
async fn set_ipv6_addr(idx: u32, addr: Ipv6Addr) -> Result<()> {
    let status = Command::new("netsh")
        .args([
            "interface",
            "ipv6",
            "add",
            "address",
            &idx.to_string(),
            &addr.to_string(),
        ])
        .creation_flags(CREATE_NO_WINDOW)
        .status()
        .await?;

    anyhow::ensure!(status.success(), "netsh failed: {status}");

    Ok(())
}
