//! In-process tunnel transport for tests

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{
    ExecOutput, ForwardSpec, TunnelConnector, TunnelCredentials, TunnelError, TunnelTransport,
};

/// Transport that only records what it was asked to do
#[derive(Default)]
pub struct MemoryTransport {
    dead: AtomicBool,
    forwards: Mutex<Vec<ForwardSpec>>,
    commands: Mutex<Vec<String>>,
    /// Gateway ports that cannot be bound on this transport
    refused: HashSet<u16>,
}

impl MemoryTransport {
    /// Simulate the connection dropping
    pub fn kill(&self) {
        self.dead.store(true, Ordering::SeqCst);
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    pub fn open_forwards(&self) -> Vec<ForwardSpec> {
        self.forwards.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Commands run through `exec`, space-joined
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn alive(&self) -> Result<(), TunnelError> {
        if self.is_dead() {
            Err(TunnelError::Exec("connection closed".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl TunnelTransport for MemoryTransport {
    async fn check(&self) -> Result<(), TunnelError> {
        self.alive()
    }

    async fn open_forward(&self, spec: &ForwardSpec) -> Result<(), TunnelError> {
        self.alive()?;
        if self.refused.contains(&spec.local_port) {
            return Err(TunnelError::ForwardFailed(format!(
                "bind 127.0.0.1:{}: Address already in use",
                spec.local_port
            )));
        }
        self.forwards
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(spec.clone());
        Ok(())
    }

    async fn close_forward(&self, spec: &ForwardSpec) -> Result<(), TunnelError> {
        self.forwards
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .retain(|f| f != spec);
        Ok(())
    }

    async fn exec(
        &self,
        program: &str,
        args: &[String],
        _stdin: Option<&str>,
    ) -> Result<ExecOutput, TunnelError> {
        self.alive()?;
        let line = std::iter::once(program.to_string())
            .chain(args.iter().cloned())
            .collect::<Vec<_>>()
            .join(" ");
        self.commands
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(line.clone());
        Ok(ExecOutput {
            status: 0,
            stdout: line,
            stderr: String::new(),
        })
    }

    async fn close(&self) -> Result<(), TunnelError> {
        self.kill();
        Ok(())
    }
}

/// Connector handing out [`MemoryTransport`]s
#[derive(Default)]
pub struct MemoryConnector {
    attempts: AtomicUsize,
    fail_next: AtomicUsize,
    refused: Mutex<HashSet<u16>>,
    transports: Mutex<Vec<Arc<MemoryTransport>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` connect attempts fail
    pub fn fail_next_connects(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Transports created from now on cannot bind this gateway port
    pub fn refuse_local_port(&self, port: u16) {
        self.refused
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(port);
    }

    /// Connect attempts so far, failed ones included
    pub fn connects(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Most recently created transport
    pub fn latest(&self) -> Option<Arc<MemoryTransport>> {
        self.transports
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .last()
            .cloned()
    }
}

#[async_trait]
impl TunnelConnector for MemoryConnector {
    async fn connect(
        &self,
        credentials: &TunnelCredentials,
    ) -> Result<Arc<dyn TunnelTransport>, TunnelError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(TunnelError::ConnectFailed(format!(
                "{}: connection refused",
                credentials.host
            )));
        }

        let transport = Arc::new(MemoryTransport {
            refused: self.refused.lock().unwrap_or_else(|p| p.into_inner()).clone(),
            ..MemoryTransport::default()
        });
        self.transports
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(transport.clone());
        Ok(transport)
    }
}
