//! Session ownership, port forwards and supervision

use std::net::TcpListener;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::backoff::{Backoff, ReconnectPolicy};
use super::{
    ExecOutput, ForwardDirection, ForwardSpec, SessionState, TunnelConnector, TunnelCredentials,
    TunnelError, TunnelTransport,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BridgeSettings {
    /// Seconds between liveness checks
    #[serde(default = "default_check_interval")]
    pub check_interval_secs: u64,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            check_interval_secs: default_check_interval(),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

fn default_check_interval() -> u64 {
    10
}

/// Handle to a forward registered on a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardHandle {
    pub cluster: String,
    pub id: u64,
    pub spec: ForwardSpec,
}

impl ForwardHandle {
    pub fn local_address(&self) -> String {
        self.spec.local_address()
    }
}

struct SessionInner {
    credentials: TunnelCredentials,
    transport: RwLock<Option<Arc<dyn TunnelTransport>>>,
    state: watch::Sender<SessionState>,
    forwards: DashMap<u64, ForwardSpec>,
    /// Local forwards by cluster-side address, for address rewriting
    by_remote: DashMap<String, u64>,
    next_handle: AtomicU64,
    forward_lock: tokio::sync::Mutex<()>,
    cancel: CancellationToken,
}

/// Shared view of one cluster session.
///
/// Cloning is cheap; only [`TunnelBridge`] opens or closes the underlying
/// connection.
#[derive(Clone)]
pub struct TunnelSession {
    inner: Arc<SessionInner>,
}

impl TunnelSession {
    fn new(credentials: TunnelCredentials, transport: Arc<dyn TunnelTransport>) -> Self {
        let (state, _) = watch::channel(SessionState::Up);
        Self {
            inner: Arc::new(SessionInner {
                credentials,
                transport: RwLock::new(Some(transport)),
                state,
                forwards: DashMap::new(),
                by_remote: DashMap::new(),
                next_handle: AtomicU64::new(1),
                forward_lock: tokio::sync::Mutex::new(()),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn cluster(&self) -> &str {
        &self.inner.credentials.cluster
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn is_up(&self) -> bool {
        self.state() == SessionState::Up
    }

    /// Watch state changes (up / reconnecting / closed)
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// Registered forwards
    pub fn forwards(&self) -> Vec<ForwardSpec> {
        self.inner.forwards.iter().map(|f| f.value().clone()).collect()
    }

    /// Current transport, failing fast while the session is down
    async fn transport(&self) -> Result<Arc<dyn TunnelTransport>, TunnelError> {
        if !self.is_up() {
            return Err(TunnelError::Down(self.cluster().to_string()));
        }
        self.inner
            .transport
            .read()
            .await
            .clone()
            .ok_or_else(|| TunnelError::Down(self.cluster().to_string()))
    }

    fn set_state(&self, state: SessionState) {
        let previous = self.inner.state.send_replace(state);
        if previous != state {
            info!(
                cluster = %self.cluster(),
                "Tunnel session {} -> {}",
                previous.as_str(),
                state.as_str()
            );
        }
    }
}

/// Owns every tunnel session of this gateway
pub struct TunnelBridge {
    connector: Arc<dyn TunnelConnector>,
    settings: BridgeSettings,
    sessions: DashMap<String, TunnelSession>,
    establish_lock: tokio::sync::Mutex<()>,
    supervisors: Mutex<Vec<JoinHandle<()>>>,
}

impl TunnelBridge {
    pub fn new(connector: Arc<dyn TunnelConnector>, settings: BridgeSettings) -> Self {
        Self {
            connector,
            settings,
            sessions: DashMap::new(),
            establish_lock: tokio::sync::Mutex::new(()),
            supervisors: Mutex::new(Vec::new()),
        }
    }

    /// Open the session for a cluster, or return the one already open
    pub async fn establish(
        &self,
        credentials: TunnelCredentials,
    ) -> Result<TunnelSession, TunnelError> {
        let _guard = self.establish_lock.lock().await;
        if let Some(existing) = self.sessions.get(&credentials.cluster) {
            return Ok(existing.clone());
        }

        info!(
            cluster = %credentials.cluster,
            "Establishing tunnel to {}",
            credentials.destination()
        );
        let transport = self.connector.connect(&credentials).await?;
        let session = TunnelSession::new(credentials, transport);

        let handle = tokio::spawn(supervise(
            session.clone(),
            self.connector.clone(),
            self.settings.clone(),
        ));
        self.supervisors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(handle);

        self.sessions
            .insert(session.cluster().to_string(), session.clone());
        Ok(session)
    }

    pub fn session(&self, cluster: &str) -> Option<TunnelSession> {
        self.sessions.get(cluster).map(|s| s.clone())
    }

    /// Register and open a forward.
    ///
    /// Local forwards without an explicit port get a free gateway port.
    /// Remote forwards must name the gateway port they reach back to.
    pub async fn forward(
        &self,
        session: &TunnelSession,
        direction: ForwardDirection,
        local_port: Option<u16>,
        remote: &str,
    ) -> Result<ForwardHandle, TunnelError> {
        let _guard = session.inner.forward_lock.lock().await;
        self.open_forward_locked(session, direction, local_port, remote)
            .await
    }

    async fn open_forward_locked(
        &self,
        session: &TunnelSession,
        direction: ForwardDirection,
        local_port: Option<u16>,
        remote: &str,
    ) -> Result<ForwardHandle, TunnelError> {
        let transport = session.transport().await?;

        let local_port = match (direction, local_port) {
            (_, Some(port)) => port,
            (ForwardDirection::Local, None) => free_local_port()?,
            (ForwardDirection::Remote, None) => {
                return Err(TunnelError::ForwardFailed(format!(
                    "remote forward {} needs a gateway port",
                    remote
                )))
            }
        };
        let spec = ForwardSpec {
            direction,
            local_port,
            remote: remote.to_string(),
        };

        transport.open_forward(&spec).await?;

        let id = session.inner.next_handle.fetch_add(1, Ordering::SeqCst);
        session.inner.forwards.insert(id, spec.clone());
        if direction == ForwardDirection::Local {
            session.inner.by_remote.insert(spec.remote.clone(), id);
        }
        debug!(cluster = %session.cluster(), "Opened forward #{} {}", id, spec);

        Ok(ForwardHandle {
            cluster: session.cluster().to_string(),
            id,
            spec,
        })
    }

    /// Close a forward. Unknown handles are ignored.
    pub async fn teardown(&self, handle: &ForwardHandle) -> Result<(), TunnelError> {
        let Some(session) = self.session(&handle.cluster) else {
            return Ok(());
        };
        let _guard = session.inner.forward_lock.lock().await;

        let Some((_, spec)) = session.inner.forwards.remove(&handle.id) else {
            return Ok(());
        };
        session
            .inner
            .by_remote
            .remove_if(&spec.remote, |_, id| *id == handle.id);

        // A down session has no live forwards to cancel
        if let Ok(transport) = session.transport().await {
            transport.close_forward(&spec).await?;
        }
        debug!(cluster = %handle.cluster, "Closed forward #{} {}", handle.id, spec);
        Ok(())
    }

    /// Gateway-reachable address for a cluster-internal `host:port`,
    /// opening a local forward on first use
    pub async fn local_address(
        &self,
        session: &TunnelSession,
        remote: &str,
    ) -> Result<String, TunnelError> {
        if !session.is_up() {
            return Err(TunnelError::Down(session.cluster().to_string()));
        }
        if let Some(address) = lookup_forward(session, remote) {
            return Ok(address);
        }

        let _guard = session.inner.forward_lock.lock().await;
        if let Some(address) = lookup_forward(session, remote) {
            return Ok(address);
        }
        let handle = self
            .open_forward_locked(session, ForwardDirection::Local, None, remote)
            .await?;
        Ok(handle.local_address())
    }

    /// Close the local forward for a cluster-internal `host:port`, if open
    pub async fn release(&self, session: &TunnelSession, remote: &str) -> Result<(), TunnelError> {
        let Some(id) = session.inner.by_remote.get(remote).map(|id| *id) else {
            return Ok(());
        };
        let Some(spec) = session.inner.forwards.get(&id).map(|f| f.value().clone()) else {
            return Ok(());
        };
        self.teardown(&ForwardHandle {
            cluster: session.cluster().to_string(),
            id,
            spec,
        })
        .await
    }

    /// Run a command on the cluster login node
    pub async fn exec(
        &self,
        session: &TunnelSession,
        program: &str,
        args: &[String],
        stdin: Option<&str>,
    ) -> Result<ExecOutput, TunnelError> {
        session.transport().await?.exec(program, args, stdin).await
    }

    /// Close every forward and session and stop the supervisors
    pub async fn shutdown(&self) {
        let sessions: Vec<TunnelSession> = self.sessions.iter().map(|s| s.clone()).collect();

        for session in sessions {
            session.inner.cancel.cancel();
            let _guard = session.inner.forward_lock.lock().await;

            let transport = session.inner.transport.write().await.take();
            if let Some(transport) = transport {
                for forward in session.forwards() {
                    if let Err(e) = transport.close_forward(&forward).await {
                        debug!("Failed to close forward {}: {}", forward, e);
                    }
                }
                if let Err(e) = transport.close().await {
                    warn!(cluster = %session.cluster(), "Failed to close tunnel: {}", e);
                }
            }
            session.inner.forwards.clear();
            session.inner.by_remote.clear();
            session.set_state(SessionState::Closed);
            self.sessions.remove(session.cluster());
        }

        let handles: Vec<JoinHandle<()>> = self
            .supervisors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            let _ = handle.await;
        }
        info!("Tunnel bridge shut down");
    }
}

fn lookup_forward(session: &TunnelSession, remote: &str) -> Option<String> {
    let id = *session.inner.by_remote.get(remote)?;
    session
        .inner
        .forwards
        .get(&id)
        .map(|spec| spec.local_address())
}

fn free_local_port() -> Result<u16, TunnelError> {
    let listener = TcpListener::bind("127.0.0.1:0").map_err(|_| TunnelError::NoFreePort)?;
    let port = listener.local_addr().map_err(|_| TunnelError::NoFreePort)?.port();
    Ok(port)
}

// =============================================================================
// Supervisor
// =============================================================================

async fn supervise(
    session: TunnelSession,
    connector: Arc<dyn TunnelConnector>,
    settings: BridgeSettings,
) {
    let check_interval = Duration::from_secs(settings.check_interval_secs.max(1));
    let cancel = session.inner.cancel.clone();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(check_interval) => {}
        }

        let transport = session.inner.transport.read().await.clone();
        let healthy = match transport {
            Some(t) => t.check().await.is_ok(),
            None => false,
        };
        if healthy || cancel.is_cancelled() {
            continue;
        }

        warn!(cluster = %session.cluster(), "Tunnel liveness check failed");
        session.set_state(SessionState::Reconnecting);
        session.inner.transport.write().await.take();

        if !reconnect(&session, connector.as_ref(), &settings.reconnect, &cancel).await {
            break;
        }
    }

    debug!(cluster = %session.cluster(), "Tunnel supervisor stopped");
}

/// Reconnect until it works or the session is cancelled.
/// Returns false when cancelled.
async fn reconnect(
    session: &TunnelSession,
    connector: &dyn TunnelConnector,
    policy: &ReconnectPolicy,
    cancel: &CancellationToken,
) -> bool {
    let mut backoff = Backoff::new(policy.clone());

    loop {
        let delay = backoff.next_delay();
        info!(
            cluster = %session.cluster(),
            delay_ms = delay.as_millis() as u64,
            attempt = backoff.failures() + 1,
            "Reconnecting tunnel after delay"
        );
        tokio::select! {
            _ = cancel.cancelled() => return false,
            _ = tokio::time::sleep(delay) => {}
        }

        let transport = match connector.connect(&session.inner.credentials).await {
            Ok(t) => t,
            Err(e) => {
                warn!(cluster = %session.cluster(), "Tunnel reconnect failed: {}", e);
                backoff.record_failure();
                continue;
            }
        };

        let _guard = session.inner.forward_lock.lock().await;
        if cancel.is_cancelled() {
            let _ = transport.close().await;
            return false;
        }

        // A forward that cannot be restored is dropped; the rest of the
        // session comes back without it
        let forwards: Vec<(u64, ForwardSpec)> = session
            .inner
            .forwards
            .iter()
            .map(|f| (*f.key(), f.value().clone()))
            .collect();
        for (id, forward) in forwards {
            if let Err(e) = transport.open_forward(&forward).await {
                warn!(
                    cluster = %session.cluster(),
                    "Dropping forward {} that could not be restored: {}",
                    forward,
                    e
                );
                session.inner.forwards.remove(&id);
                session
                    .inner
                    .by_remote
                    .remove_if(&forward.remote, |_, owner| *owner == id);
            }
        }

        *session.inner.transport.write().await = Some(transport);
        session.set_state(SessionState::Up);
        info!(
            cluster = %session.cluster(),
            forwards = session.inner.forwards.len(),
            "Tunnel restored"
        );
        return true;
    }
}

// =============================================================================
// Endpoint resolution
// =============================================================================

/// Turns cluster-internal addresses into addresses the gateway can dial
#[derive(Clone)]
pub enum EndpointResolver {
    /// Gateway runs inside the cluster network
    Direct,
    Tunnel {
        bridge: Arc<TunnelBridge>,
        session: TunnelSession,
    },
}

impl EndpointResolver {
    pub async fn resolve(&self, internal: &str) -> Result<String, TunnelError> {
        match self {
            EndpointResolver::Direct => Ok(internal.to_string()),
            EndpointResolver::Tunnel { bridge, session } => {
                bridge.local_address(session, internal).await
            }
        }
    }

    /// Drop whatever was opened to reach `internal`; failures are logged
    pub async fn release(&self, internal: &str) {
        if let EndpointResolver::Tunnel { bridge, session } = self {
            if let Err(e) = bridge.release(session, internal).await {
                warn!(
                    cluster = %session.cluster(),
                    "Failed to close forward to {}: {}",
                    internal,
                    e
                );
            }
        }
    }

    /// Session state, `None` in direct mode
    pub fn state(&self) -> Option<SessionState> {
        match self {
            EndpointResolver::Direct => None,
            EndpointResolver::Tunnel { session, .. } => Some(session.state()),
        }
    }
}
