//! DNS configuration on Windows.
//!
//! Two mechanisms exist because neither is universally reliable: writing the
//! Tcpip registry keys directly, or going through the DnsClient PowerShell
//! cmdlets. The per-interface nameserver and the *global* suffix search list
//! are both updated; the latter merges our entries (first, in order) with any
//! existing entries that do not belong to the cluster domain. Every mutation
//! ends with a DNS cache flush.

use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context as _, Result};
use tokio::process::Command;

use crate::dns::merge_search_list;
use crate::DnsStrategy;

use super::{CREATE_NO_WINDOW, TUNNEL_UUID};

pub(super) async fn apply(
    strategy: DnsStrategy,
    adapter_index: u32,
    cluster_domain: &str,
    server: IpAddr,
    search: &[String],
) -> Result<()> {
    match strategy {
        DnsStrategy::Auto => {
            if let Err(e) = set_with_registry(cluster_domain, server, search) {
                tracing::warn!("Registry DNS configuration failed, falling back to PowerShell: {e:#}");

                set_with_powershell(adapter_index, cluster_domain, server, search).await?;
            }
        }
        DnsStrategy::Registry => set_with_registry(cluster_domain, server, search)?,
        DnsStrategy::Powershell => {
            set_with_powershell(adapter_index, cluster_domain, server, search).await?
        }
    }

    flush_cache().await
}

fn set_with_registry(cluster_domain: &str, server: IpAddr, search: &[String]) -> Result<()> {
    let hklm = winreg::RegKey::predef(winreg::enums::HKEY_LOCAL_MACHINE);

    let service = match server {
        IpAddr::V4(_) => "Tcpip",
        IpAddr::V6(_) => "Tcpip6",
    };

    let interface_key = hklm
        .open_subkey_with_flags(
            Path::new(&format!(
                r"SYSTEM\CurrentControlSet\Services\{service}\Parameters\Interfaces\{{{TUNNEL_UUID}}}"
            )),
            winreg::enums::KEY_WRITE,
        )
        .context("Failed to open tunnel interface registry key")?;

    interface_key
        .set_value("NameServer", &server.to_string())
        .context("Failed to set interface nameserver")?;
    interface_key
        .set_value("SearchList", &itertools::join(search, ","))
        .context("Failed to set interface search list")?;

    set_global_search_list_registry(cluster_domain, search)?;

    Ok(())
}

fn set_global_search_list_registry(cluster_domain: &str, search: &[String]) -> Result<()> {
    let hklm = winreg::RegKey::predef(winreg::enums::HKEY_LOCAL_MACHINE);

    let params = hklm
        .open_subkey_with_flags(
            Path::new(r"SYSTEM\CurrentControlSet\Services\Tcpip\Parameters"),
            winreg::enums::KEY_READ | winreg::enums::KEY_WRITE,
        )
        .context("Failed to open Tcpip parameters key")?;

    let existing: String = params.get_value("SearchList").unwrap_or_default();
    let existing = existing
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.trim().to_string())
        .collect::<Vec<_>>();

    let merged = merge_search_list(search, &existing, cluster_domain);

    params
        .set_value("SearchList", &itertools::join(&merged, ","))
        .context("Failed to set global search list")?;

    tracing::debug!(?merged, "Updated global DNS search list");

    Ok(())
}

async fn set_with_powershell(
    adapter_index: u32,
    cluster_domain: &str,
    server: IpAddr,
    search: &[String],
) -> Result<()> {
    run_powershell(&format!(
        "Set-DnsClientServerAddress -InterfaceIndex {adapter_index} -ServerAddresses ('{server}')"
    ))
    .await
    .context("Failed to set interface nameserver")?;

    // The merge source of truth stays the registry; only the mutation goes
    // through PowerShell.
    let existing = read_global_search_list().unwrap_or_default();
    let merged = merge_search_list(search, &existing, cluster_domain);
    let list = merged
        .iter()
        .map(|d| format!("'{d}'"))
        .collect::<Vec<_>>()
        .join(",");

    run_powershell(&format!(
        "Set-DnsClientGlobalSetting -SuffixSearchList @({list})"
    ))
    .await
    .context("Failed to set global search list")?;

    Ok(())
}

fn read_global_search_list() -> Result<Vec<String>> {
    let hklm = winreg::RegKey::predef(winreg::enums::HKEY_LOCAL_MACHINE);

    let params = hklm.open_subkey(Path::new(
        r"SYSTEM\CurrentControlSet\Services\Tcpip\Parameters",
    ))?;

    let existing: String = params.get_value("SearchList")?;

    Ok(existing
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| s.trim().to_string())
        .collect())
}

async fn run_powershell(command: &str) -> Result<()> {
    let status = Command::new("powershell")
        .args(["-NoProfile", "-NonInteractive", "-Command", command])
        .creation_flags(CREATE_NO_WINDOW)
        .status()
        .await
        .context("Failed to spawn powershell")?;

    anyhow::ensure!(status.success(), "powershell failed: {status}");

    Ok(())
}

async fn flush_cache() -> Result<()> {
    tracing::debug!("Flushing Windows DNS cache...");

    let status = Command::new("ipconfig")
        .args(["/flushdns"])
        .creation_flags(CREATE_NO_WINDOW)
        .status()
        .await?;

    anyhow::ensure!(status.success(), "ipconfig /flushdns failed: {status}");

    tracing::debug!("Flushed DNS.");

    Ok(())
}
