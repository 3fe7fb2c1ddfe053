//! The UDP bind lifecycle: open, rebind, mark changes and teardown.

use std::sync::Arc;

use tokio::task::JoinSet;

use crate::task::Task;
use crate::udp::{Bind as _, BindFactory as _, IpVersion};

use super::pipeline;
use super::{DeviceInner, DeviceTransports, Error};

/// The network-facing state of a device, behind the `net` lock.
pub(crate) struct NetState<T: DeviceTransports> {
    pub bind: Option<Arc<T::Bind>>,
    /// The desired (and, while bound, actual) listen port. 0 requests an
    /// ephemeral port.
    pub port: u16,
    /// Firewall mark applied to new binds. 0 means disabled.
    pub fwmark: u32,
    route_listener: Option<Task>,
    /// The UDP receivers of the current bind, awaited during teardown.
    receivers: JoinSet<()>,
}

impl<T: DeviceTransports> NetState<T> {
    pub fn new(port: u16) -> Self {
        NetState {
            bind: None,
            port,
            fwmark: 0,
            route_listener: None,
            receivers: JoinSet::new(),
        }
    }

    /// Close the current bind and wait for its receivers. Callers hold the
    /// `net` write lock.
    async fn unsafe_close_bind(&mut self) {
        if let Some(listener) = self.route_listener.take() {
            listener.stop().await;
        }
        if let Some(bind) = self.bind.take() {
            bind.close();
        }
        self.receivers.shutdown().await;
    }
}

impl<T: DeviceTransports> DeviceInner<T> {
    /// The current bind, if any.
    pub(crate) async fn bind(&self) -> Option<Arc<T::Bind>> {
        self.net.read().await.bind.clone()
    }

    /// Replace the bind: close the old sockets and, if the device is up,
    /// open new ones on the desired port and start the receivers.
    pub(crate) async fn bind_update(self: &Arc<Self>) -> Result<(), Error> {
        let mut net = self.net.write().await;

        if self.callbacks.skip_bind_update && net.bind.is_some() {
            log::debug!("UDP bind update skipped");
            return Ok(());
        }

        net.unsafe_close_bind().await;

        if self.is_up() {
            let (bind, port) = match self.bind_factory.open(net.port).await {
                Ok(opened) => opened,
                Err(err) => {
                    net.port = 0;
                    return Err(Error::Bind(err));
                }
            };
            let bind = Arc::new(bind);
            net.port = port;

            if let Some(route_changes) = bind.take_route_changes() {
                net.route_listener = Some(Task::spawn(
                    "route listener",
                    pipeline::routine_route_listener(Arc::downgrade(self), route_changes),
                ));
            }

            if net.fwmark != 0 {
                if let Err(err) = bind.set_mark(net.fwmark) {
                    bind.close();
                    net.port = 0;
                    return Err(Error::Bind(err));
                }
            }

            // Routing may differ behind the new socket; let the OS pick
            // egress addresses afresh.
            self.clear_endpoint_srcs().await;

            for version in [IpVersion::V4, IpVersion::V6] {
                net.receivers.spawn(pipeline::routine_receive_incoming(
                    Arc::downgrade(self),
                    Arc::clone(&bind),
                    version,
                    self.stop.child_token(),
                ));
            }

            net.bind = Some(bind);
            log::debug!("UDP bind has been updated (port {port})");
        }

        Ok(())
    }

    /// Close the bind synchronously under the net lock.
    pub(crate) async fn bind_close(&self) {
        let mut net = self.net.write().await;
        net.unsafe_close_bind().await;
    }

    /// Change the firewall mark, applying it to the live bind when up.
    pub(crate) async fn bind_set_mark(&self, mark: u32) -> Result<(), Error> {
        let mut net = self.net.write().await;

        if net.fwmark == mark {
            return Ok(());
        }
        net.fwmark = mark;

        if self.is_up()
            && let Some(bind) = &net.bind
        {
            bind.set_mark(mark).map_err(Error::Bind)?;
        }

        self.clear_endpoint_srcs().await;
        Ok(())
    }

    /// Clear the cached source address of every peer endpoint.
    pub(crate) async fn clear_endpoint_srcs(&self) {
        let peers = self.peer_list().await;
        for peer in peers {
            let mut inner = peer.inner.lock().await;
            if let Some(endpoint) = &mut inner.endpoint {
                endpoint.clear_src();
            }
        }
    }
}
