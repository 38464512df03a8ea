use anyhow::{Context as _, Result};
use async_trait::async_trait;
use ip_network::IpNetwork;
use ip_packet::{IpPacket, IpPacketBuf, IpVersion};
use libc::{
    AF_INET, AF_INET6, AF_SYS_CONTROL, AF_SYSTEM, CTLIOCGINFO, F_GETFL, F_SETFL, O_NONBLOCK,
    PF_SYSTEM, SOCK_DGRAM, SYSPROTO_CONTROL, UTUN_OPT_IFNAME, connect, ctl_info, fcntl,
    getsockopt, ioctl, iovec, msghdr, recvmsg, sendmsg, sockaddr, sockaddr_ctl, socket, socklen_t,
};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use tokio::io::Interest;
use tokio::io::unix::AsyncFd;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

const CTL_NAME: &[u8] = b"com.apple.net.utun_control";

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
    closing: CancellationToken,
}

impl TunDevice {
    /// Creates a new utun device and assigns its interface addresses.
    ///
    /// The kernel picks the unit number; the resulting name is `utunN`.
    pub async fn open(ipv4: Ipv4Addr, ipv6: Ipv6Addr) -> Result<Self> {
        let fd = match unsafe { socket(PF_SYSTEM, SOCK_DGRAM, SYSPROTO_CONTROL) } {
            -1 => return Err(io::Error::last_os_error()).context("Failed to open system socket"),
            fd => fd,
        };

        let mut info = ctl_info {
            ctl_id: 0,
            ctl_name: [0; 96],
        };
        info.ctl_name[..CTL_NAME.len()]
            // SAFETY: We only care about maintaining the same byte values, the
            // slice is just a blob of bytes to us; this conversion is needed
            // because `c_char` is i8.
            .copy_from_slice(unsafe { &*(CTL_NAME as *const [u8] as *const [i8]) });

        if unsafe { ioctl(fd, CTLIOCGINFO, &mut info) } < 0 {
            return Err(io::Error::last_os_error()).context("Failed to query utun control id");
        }

        let addr = sockaddr_ctl {
            sc_len: size_of::<sockaddr_ctl>() as u8,
            sc_family: AF_SYSTEM as u8,
            ss_sysaddr: AF_SYS_CONTROL as u16,
            sc_id: info.ctl_id,
            // Unit 0 lets the kernel pick the next free utun.
            sc_unit: 0,
            sc_reserved: Default::default(),
        };

        if unsafe {
            connect(
                fd,
                &addr as *const sockaddr_ctl as *const sockaddr,
                size_of::<sockaddr_ctl>() as socklen_t,
            )
        } < 0
        {
            return Err(io::Error::last_os_error()).context("Failed to connect utun control");
        }

        set_non_blocking(fd).context("Failed to make utun non-blocking")?;

        let name = name(fd)?;

        let this = Self {
            fd: AsyncFd::new(TunFd(fd))?,
            name,
            closing: CancellationToken::new(),
        };

        this.set_addresses(ipv4, ipv6).await?;

        Ok(this)
    }

    async fn set_addresses(&self, ipv4: Ipv4Addr, ipv6: Ipv6Addr) -> Result<()> {
        run(Command::new("ifconfig").args([
            &self.name,
            "inet",
            &ipv4.to_string(),
            &ipv4.to_string(),
            "up",
        ]))
        .await?;

        run(Command::new("ifconfig").args([
            &self.name,
            "inet6",
            &ipv6.to_string(),
            "prefixlen",
            "128",
        ]))
        .await?;

        Ok(())
    }
}

#[async_trait]
impl crate::Device for TunDevice {
    async fn read_packet(&self, buf: &mut IpPacketBuf) -> io::Result<usize> {
        let read = self.fd.async_io(Interest::READABLE, |fd| {
            // utun prepends a 4-byte address-family header; strip it here so
            // the rest of the stack only sees raw IP.
            let mut hdr = [0u8; 4];
            let dst = buf.buf();

            let mut iov = [
                iovec {
                    iov_base: hdr.as_mut_ptr() as _,
                    iov_len: hdr.len(),
                },
                iovec {
                    iov_base: dst.as_mut_ptr() as _,
                    iov_len: dst.len(),
                },
            ];

            let mut msg_hdr = msghdr {
                msg_name: std::ptr::null_mut(),
                msg_namelen: 0,
                msg_iov: &mut iov[0],
                msg_iovlen: iov.len() as _,
                msg_control: std::ptr::null_mut(),
                msg_controllen: 0,
                msg_flags: 0,
            };

            match unsafe { recvmsg(fd.as_raw_fd(), &mut msg_hdr, 0) } {
                -1 => Err(io::Error::last_os_error()),
                0..=4 => Ok(0),
                n => Ok((n - 4) as usize),
            }
        });

        tokio::select! {
            () = self.closing.cancelled() => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "TUN device is closed")),
            res = read => res,
        }
    }

    async fn write_packet(&self, packet: &IpPacket) -> io::Result<usize> {
        let af = match packet.version() {
            IpVersion::V4 => AF_INET as u8,
            IpVersion::V6 => AF_INET6 as u8,
        };

        self.fd
            .async_io(Interest::WRITABLE, |fd| {
                let mut hdr = [0, 0, 0, af];
                let src = packet.packet();

                let mut iov = [
                    iovec {
                        iov_base: hdr.as_mut_ptr() as _,
                        iov_len: hdr.len(),
                    },
                    iovec {
                        iov_base: src.as_ptr() as *mut _,
                        iov_len: src.len(),
                    },
                ];

                let msg_hdr = msghdr {
                    msg_name: std::ptr::null_mut(),
                    msg_namelen: 0,
                    msg_iov: &mut iov[0],
                    msg_iovlen: iov.len() as _,
                    msg_control: std::ptr::null_mut(),
                    msg_controllen: 0,
                    msg_flags: 0,
                };

                match unsafe { sendmsg(fd.as_raw_fd(), &msg_hdr, 0) } {
                    -1 => Err(io::Error::last_os_error()),
                    n => Ok((n as usize).saturating_sub(4)),
                }
            })
            .await
    }

    async fn add_subnet(&self, subnet: IpNetwork) -> Result<()> {
        let family = match subnet {
            IpNetwork::V4(_) => "-inet",
            IpNetwork::V6(_) => "-inet6",
        };

        run(Command::new("route").args([
            "-n",
            "add",
            family,
            &subnet.to_string(),
            "-interface",
            &self.name,
        ]))
        .await
    }

    async fn remove_subnet(&self, subnet: IpNetwork) -> Result<()> {
        let family = match subnet {
            IpNetwork::V4(_) => "-inet",
            IpNetwork::V6(_) => "-inet6",
        };

        run(Command::new("route").args([
            "-n",
            "delete",
            family,
            &subnet.to_string(),
            "-interface",
            &self.name,
        ]))
        .await
    }

    async fn set_mtu(&self, mtu: u32) -> Result<()> {
        run(Command::new("ifconfig").args([&self.name, "mtu", &mtu.to_string()])).await
    }

    async fn set_dns(
        &self,
        cluster_domain: &str,
        server: IpAddr,
        search: &[String],
    ) -> Result<()> {
        // macOS resolves per-domain resolver files; one for the cluster domain
        // routes all cluster lookups to us.
        let dir = Path::new("/etc/resolver");
        tokio::fs::create_dir_all(dir)
            .await
            .context("Failed to create /etc/resolver")?;

        let mut config = format!("nameserver {server}\n");
        if !search.is_empty() {
            config.push_str(&format!("search {}\n", search.join(" ")));
        }

        let file = dir.join(cluster_domain.trim_end_matches('.'));
        tokio::fs::write(&file, config)
            .await
            .with_context(|| format!("Failed to write {}", file.display()))?;

        Ok(())
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn close(&self) {
        self.closing.cancel();
    }
}

async fn run(command: &mut Command) -> Result<()> {
    let status = command.status().await.context("Failed to spawn command")?;
    anyhow::ensure!(status.success(), "Command failed: {status}");

    Ok(())
}

fn name(fd: RawFd) -> Result<String> {
    let mut tunnel_name = [0u8; libc::IF_NAMESIZE];
    let mut tunnel_name_len = tunnel_name.len() as socklen_t;

    if unsafe {
        getsockopt(
            fd,
            SYSPROTO_CONTROL,
            UTUN_OPT_IFNAME,
            tunnel_name.as_mut_ptr() as _,
            &mut tunnel_name_len,
        )
    } < 0
        || tunnel_name_len == 0
    {
        return Err(io::Error::last_os_error()).context("Failed to read utun name");
    }

    Ok(String::from_utf8_lossy(&tunnel_name[..(tunnel_name_len - 1) as usize]).to_string())
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
