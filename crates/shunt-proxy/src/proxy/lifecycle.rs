//! Start/stop state of a proxy listener.

use super::network::create_listener;
use crate::error::ProxyError;
use parking_lot::RwLock;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{error, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct Running {
    shutdown_tx: broadcast::Sender<()>,
    accept_task: JoinHandle<()>,
}

/// Serializes start and stop of one listener.
///
/// Starting a running proxy and stopping a stopped one are no-ops reported as
/// `false`. Stopping closes the listener; connections already accepted run
/// to completion.
pub(crate) struct Lifecycle {
    name: &'static str,
    running: Mutex<Option<Running>>,
    state: RwLock<ProxyState>,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl Lifecycle {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            running: Mutex::new(None),
            state: RwLock::new(ProxyState::Stopped),
            local_addr: RwLock::new(None),
        }
    }

    pub(crate) fn state(&self) -> ProxyState {
        *self.state.read()
    }

    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Run `prepare`, bind `addr` and hand every accepted connection to
    /// `on_accept`. Nothing stays bound when any step fails.
    pub(crate) async fn start<P, F>(
        &self,
        addr: SocketAddr,
        prepare: P,
        on_accept: F,
    ) -> Result<bool, ProxyError>
    where
        P: Future<Output = Result<(), ProxyError>>,
        F: Fn(TcpStream, SocketAddr) + Send + Sync + 'static,
    {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Ok(false);
        }
        *self.state.write() = ProxyState::Starting;

        let bound = prepare.await.and_then(|()| {
            let listener =
                create_listener(addr).map_err(|e| ProxyError::Bind(addr.port(), e))?;
            let bound = listener.local_addr()?;
            Ok((listener, bound))
        });
        let (listener, bound) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                *self.state.write() = ProxyState::Stopped;
                return Err(e);
            }
        };

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let accept_task = tokio::spawn(accept_loop(self.name, listener, shutdown_rx, on_accept));

        *running = Some(Running {
            shutdown_tx,
            accept_task,
        });
        *self.local_addr.write() = Some(bound);
        *self.state.write() = ProxyState::Running;
        info!("{} proxy listening on {}", self.name, bound);
        Ok(true)
    }

    pub(crate) async fn stop(&self) -> bool {
        let mut running = self.running.lock().await;
        let Some(current) = running.take() else {
            return false;
        };
        *self.state.write() = ProxyState::Stopping;

        let _ = current.shutdown_tx.send(());
        if let Err(e) = current.accept_task.await {
            error!("{} proxy accept loop failed: {}", self.name, e);
        }

        *self.local_addr.write() = None;
        *self.state.write() = ProxyState::Stopped;
        info!("{} proxy stopped", self.name);
        true
    }
}

async fn accept_loop<F>(
    name: &'static str,
    listener: TcpListener,
    mut shutdown_rx: broadcast::Receiver<()>,
    on_accept: F,
) where
    F: Fn(TcpStream, SocketAddr),
{
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => on_accept(stream, peer),
                    Err(e) => error!("{} proxy accept error: {}", name, e),
                }
            }
            _ = shutdown_rx.recv() => break,
        }
    }
}
