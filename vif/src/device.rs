//! The composite tunneling device.

use std::sync::Arc;

use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tun::Device;
use tunnel::{HandlerPool, StreamCreator};

use crate::netstack::{Netstack, NetstackConfig};
use crate::router::Router;
use crate::routing::RoutingTable;

/// Owns the TUN device, the netstack and the router, and shuts them down
/// cleanly together.
pub struct TunnelingDevice {
    device: Arc<dyn Device>,
    netstack: Netstack,
    router: Router,
}

impl TunnelingDevice {
    /// Attaches a netstack to `device` and wires accepted flows to `creator`.
    pub fn new(
        device: Arc<dyn Device>,
        table: Arc<dyn RoutingTable>,
        pool: HandlerPool,
        creator: Arc<dyn StreamCreator>,
        config: NetstackConfig,
        cancel: CancellationToken,
    ) -> Self {
        let netstack = Netstack::spawn(device.clone(), pool, creator, config, cancel);
        let router = Router::new(device.clone(), table);

        Self {
            device,
            netstack,
            router,
        }
    }

    pub fn router(&mut self) -> &mut Router {
        &mut self.router
    }

    /// Waits for the stack to exit.
    pub async fn run(&self) {
        self.netstack.done().cancelled_owned().await;
    }

    /// Tears down in reverse order: stack, router, device.
    pub async fn close(&mut self) -> Result<()> {
        self.netstack.stop();
        self.netstack.done().cancelled_owned().await;

        self.router.close().await?;

        self.device.close();

        Ok(())
    }
}
