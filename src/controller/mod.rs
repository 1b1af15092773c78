//! The dynamic proxy controller (spec §4.E): owns `portMap`, `ruleMap`, and
//! `ruleTargetMap` behind a single write lock (`opMut`), applies
//! [`Operation`]s one at a time, runs each port's accept loop, and pipes
//! bytes between accepted connections and the target a rule's picker
//! selects for them.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::task::AbortHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::diff::Operation;
use crate::echodispatch::EchoDispatch;
use crate::error::{is_expected_close, ProxyError};
use crate::healthset::{HealthCheckConfig, ProbeFn, TargetSetWithHealthCheck};
use crate::pickset::Picker;

/// Default dial timeout used both for picking an upstream and for the
/// default health probe (spec §4.B, §5).
pub const UPSTREAM_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

type ConnId = u64;
/// A finer-grained, per-port or per-(rule,target) set of live connections,
/// represented as each connection's task [`AbortHandle`] so the controller
/// can force-close it independently of the coarse `opMut` lock.
type ConnSet = Arc<SyncMutex<HashMap<ConnId, AbortHandle>>>;

fn new_conn_set() -> ConnSet {
    Arc::new(SyncMutex::new(HashMap::new()))
}

/// Removes this connection's id from every tracked set when dropped,
/// regardless of whether the connection ended normally or was aborted by
/// `RemovePort`/`RemoveTarget` — "destroyed when either set removes it"
/// (spec §3 Ownership) is realized by every set removing the same id.
struct ConnCleanup {
    id: ConnId,
    sets: Vec<ConnSet>,
}

impl ConnCleanup {
    fn new(id: ConnId, set: ConnSet) -> Self {
        ConnCleanup {
            id,
            sets: vec![set],
        }
    }

    fn track(&mut self, set: ConnSet) {
        self.sets.push(set);
    }
}

impl Drop for ConnCleanup {
    fn drop(&mut self) {
        for set in &self.sets {
            set.lock().remove(&self.id);
        }
    }
}

struct PortEntry {
    rule_key: String,
    /// `None` when this port is routed through the echo-dispatch
    /// accelerator instead of a dedicated listener (spec §4.F) — there is
    /// no per-port accept-loop task to abort in that case.
    accept_loop: Option<AbortHandle>,
    connections: ConnSet,
}

struct RuleEntry {
    targets: TargetSetWithHealthCheck,
    picker: Picker<String>,
}

#[derive(Default)]
struct ControllerState {
    port_map: HashMap<u16, PortEntry>,
    rule_map: HashMap<String, RuleEntry>,
    rule_target_map: HashMap<(String, String), ConnSet>,
}

/// Runtime state plus the accept loops and connection plumbing described in
/// spec §3/§4.E/§5. Cheap to clone: internally `Arc`-backed, so the same
/// controller handle can be held by every accept loop and connection task.
#[derive(Clone)]
pub struct Controller {
    state: Arc<RwLock<ControllerState>>,
    echo_dispatch: Arc<dyn EchoDispatch>,
    use_echo_dispatch: bool,
    next_conn_id: Arc<AtomicU64>,
    health_config: HealthCheckConfig,
    prober: ProbeFn,
}

impl Controller {
    /// Builds a controller. `echo_dispatch` is consulted on every
    /// `AddPort`/`RemovePort`; if `use_echo_dispatch` is true but the
    /// capability reports unsupported, the controller logs a warning once
    /// and transparently falls back to per-port listeners (spec §4.F).
    pub fn new(
        echo_dispatch: Arc<dyn EchoDispatch>,
        use_echo_dispatch: bool,
        health_config: HealthCheckConfig,
    ) -> Self {
        Controller {
            state: Arc::new(RwLock::new(ControllerState::default())),
            echo_dispatch,
            use_echo_dispatch,
            next_conn_id: Arc::new(AtomicU64::new(0)),
            health_config,
            prober: Arc::new(|target| Box::pin(default_probe(target))),
        }
    }

    /// Whether `key` names a currently-applied rule (spec §6).
    pub async fn has_rule(&self, key: &str) -> bool {
        self.state.read().await.rule_map.contains_key(key)
    }

    /// Applies a single [`Operation`] under the controller's write lock
    /// (spec §4.E). Errors are one of the stable identifiers in spec §6.
    pub async fn apply_operation(&self, op: Operation) -> Result<(), ProxyError> {
        let mut state = self.state.write().await;
        match op {
            Operation::AddRule { key } => self.add_rule(&mut state, key),
            Operation::RemoveRule { key } => self.remove_rule(&mut state, &key),
            Operation::AddTarget { key, target } => self.add_target(&mut state, &key, target),
            Operation::RemoveTarget { key, target } => {
                self.remove_target(&mut state, &key, &target)
            }
            Operation::AddPort { key, port } => self.add_port(&mut state, key, port).await,
            Operation::RemovePort { key, port } => self.remove_port(&mut state, &key, port).await,
        }
    }

    /// Applies a whole `Diff` result in order, stopping at the first error.
    /// On failure, returns how many leading operations were already applied
    /// (the "applied prefix") alongside the error; rollback policy is the
    /// caller's (spec §6).
    pub async fn apply_diff(&self, ops: Vec<Operation>) -> Result<(), (usize, ProxyError)> {
        for (applied, op) in ops.into_iter().enumerate() {
            if let Err(e) = self.apply_operation(op).await {
                return Err((applied, e));
            }
        }
        Ok(())
    }

    fn add_rule(&self, state: &mut ControllerState, key: String) -> Result<(), ProxyError> {
        if state.rule_map.contains_key(&key) {
            return Err(ProxyError::RuleAlreadyExist(key));
        }
        let targets = TargetSetWithHealthCheck::new(self.prober.clone(), self.health_config);
        targets.start();
        let picker = targets.picker();
        state.rule_map.insert(key, RuleEntry { targets, picker });
        Ok(())
    }

    fn remove_rule(&self, state: &mut ControllerState, key: &str) -> Result<(), ProxyError> {
        let has_ports = state.port_map.values().any(|p| p.rule_key == key);
        let has_targets = state.rule_target_map.keys().any(|(k, _)| k == key);
        if has_ports || has_targets {
            return Err(ProxyError::InternalIntegrity(format!(
                "RemoveRule({key}) requested while ports or targets still reference it"
            )));
        }
        let entry = state
            .rule_map
            .remove(key)
            .ok_or_else(|| ProxyError::RuleNotExist(key.to_string()))?;
        entry.targets.close();
        Ok(())
    }

    fn add_target(
        &self,
        state: &mut ControllerState,
        key: &str,
        target: String,
    ) -> Result<(), ProxyError> {
        let rule = state
            .rule_map
            .get(key)
            .ok_or_else(|| ProxyError::RuleNotExist(key.to_string()))?;
        if rule.targets.has(&target) {
            return Err(ProxyError::TargetAlreadyExist(target));
        }
        rule.targets.add(target.clone());
        state
            .rule_target_map
            .insert((key.to_string(), target), new_conn_set());
        Ok(())
    }

    fn remove_target(
        &self,
        state: &mut ControllerState,
        key: &str,
        target: &str,
    ) -> Result<(), ProxyError> {
        let rule = state
            .rule_map
            .get(key)
            .ok_or_else(|| ProxyError::RuleNotExist(key.to_string()))?;
        if !rule.targets.has(target) {
            return Err(ProxyError::TargetNotExist(target.to_string()));
        }
        rule.targets.remove(target);
        if let Some(conns) = state
            .rule_target_map
            .remove(&(key.to_string(), target.to_string()))
        {
            close_all(&conns);
        }
        Ok(())
    }

    async fn add_port(
        &self,
        state: &mut ControllerState,
        key: String,
        port: u16,
    ) -> Result<(), ProxyError> {
        if !state.rule_map.contains_key(&key) {
            return Err(ProxyError::RuleNotExist(key));
        }
        if state.port_map.contains_key(&port) {
            return Err(ProxyError::PortAlreadyExist(port));
        }

        if self.use_echo_dispatch && self.echo_dispatch.supported() {
            self.echo_dispatch.add_port(port).await?;
            state.port_map.insert(
                port,
                PortEntry {
                    rule_key: key,
                    accept_loop: None,
                    connections: new_conn_set(),
                },
            );
        } else {
            if self.use_echo_dispatch {
                warn!(port, "echo-dispatch requested but unsupported, falling back to a listener");
            }
            let addr = SocketAddr::from(([0, 0, 0, 0], port));
            let listener = TcpListener::bind(addr).await?;
            let connections = new_conn_set();
            let controller = self.clone();
            let rule_key = key.clone();
            let conns_for_loop = connections.clone();
            let join = tokio::spawn(async move {
                controller
                    .accept_loop(rule_key, port, listener, conns_for_loop)
                    .await;
            });
            state.port_map.insert(
                port,
                PortEntry {
                    rule_key: key,
                    accept_loop: Some(join.abort_handle()),
                    connections,
                },
            );
        }
        Ok(())
    }

    async fn remove_port(
        &self,
        state: &mut ControllerState,
        key: &str,
        port: u16,
    ) -> Result<(), ProxyError> {
        let entry = state
            .port_map
            .get(&port)
            .ok_or(ProxyError::PortNotExist(port))?;
        if entry.rule_key != key {
            return Err(ProxyError::PortNotExist(port));
        }

        if self.use_echo_dispatch && self.echo_dispatch.supported() {
            self.echo_dispatch.remove_port(port).await?;
        }

        let entry = state.port_map.remove(&port).expect("checked above");
        if let Some(handle) = entry.accept_loop {
            handle.abort();
        }
        close_all(&entry.connections);
        Ok(())
    }

    async fn accept_loop(
        &self,
        rule_key: String,
        port: u16,
        listener: TcpListener,
        connections: ConnSet,
    ) {
        info!(port, rule = %rule_key, "listening");
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
                    metrics::counter!("proxy_connections_accepted_total", "rule" => rule_key.clone())
                        .increment(1);
                    let controller = self.clone();
                    let rk = rule_key.clone();
                    let conns = connections.clone();
                    // Registered in the port's connection set (step 1) as
                    // soon as the task exists; the task carries a clone of
                    // its own abort handle so it can register the same
                    // handle into the (rule, target) connection set once a
                    // target is picked, satisfying the spec's "jointly
                    // referenced by two sets" ownership.
                    let join = tokio::spawn(async move {
                        controller
                            .handle_connection(rk, conn_id, stream, peer, conns)
                            .await;
                    });
                    connections.lock().insert(conn_id, join.abort_handle());
                }
                Err(e) => {
                    if is_expected_close(&e) {
                        debug!(port, "accept loop closing");
                        return;
                    }
                    error!(port, error = %e, "unexpected accept error");
                }
            }
        }
    }

    async fn handle_connection(
        &self,
        rule_key: String,
        conn_id: ConnId,
        mut client: TcpStream,
        peer: SocketAddr,
        port_conns: ConnSet,
    ) {
        let mut cleanup = ConnCleanup::new(conn_id, port_conns.clone());

        let Some((picker, targets)) = self.rule_handles(&rule_key).await else {
            debug!(rule = %rule_key, %peer, "rule disappeared before dispatch");
            return;
        };

        let target = match picker.pick() {
            Ok(t) => t,
            Err(e) => {
                debug!(rule = %rule_key, %peer, error = %e, "no target available, closing connection");
                return;
            }
        };

        let dial = timeout(UPSTREAM_CONNECTION_TIMEOUT, TcpStream::connect(&target)).await;
        let mut upstream = match dial {
            Ok(Ok(s)) => s,
            _ => {
                warn!(rule = %rule_key, target = %target, "dial failed, blocking target");
                metrics::counter!("proxy_dial_failures_total", "rule" => rule_key.clone())
                    .increment(1);
                targets.block(&target);
                return;
            }
        };

        let Some(target_conns) = self.target_conn_set(&rule_key, &target).await else {
            debug!(rule = %rule_key, target = %target, "target removed before registration");
            return;
        };
        // The same abort handle the port's connection set holds for this
        // connection is mirrored into the target's connection set, so
        // either set can independently force-close it.
        if let Some(handle) = port_conns.lock().get(&conn_id).cloned() {
            target_conns.lock().insert(conn_id, handle);
            cleanup.track(target_conns);
        }

        run_proxy_copy(&rule_key, &target, &mut client, &mut upstream).await;
    }

    async fn rule_handles(&self, key: &str) -> Option<(Picker<String>, TargetSetWithHealthCheck)> {
        let state = self.state.read().await;
        let rule = state.rule_map.get(key)?;
        Some((rule.picker.clone(), rule.targets.clone()))
    }

    async fn target_conn_set(&self, key: &str, target: &str) -> Option<ConnSet> {
        let state = self.state.read().await;
        state
            .rule_target_map
            .get(&(key.to_string(), target.to_string()))
            .cloned()
    }
}

fn close_all(conns: &ConnSet) {
    for (_, handle) in conns.lock().drain() {
        handle.abort();
    }
}

async fn default_probe(target: String) -> bool {
    matches!(
        timeout(UPSTREAM_CONNECTION_TIMEOUT, TcpStream::connect(&target)).await,
        Ok(Ok(_))
    )
}

async fn run_proxy_copy(
    rule_key: &str,
    target: &str,
    client: &mut TcpStream,
    upstream: &mut TcpStream,
) {
    metrics::gauge!("proxy_connections_active", "rule" => rule_key.to_string(), "target" => target.to_string())
        .increment(1.0);

    let (mut cr, mut cw) = client.split();
    let (mut ur, mut uw) = upstream.split();
    tokio::select! {
        res = tokio::io::copy(&mut cr, &mut uw) => log_copy_result("client->target", res),
        res = tokio::io::copy(&mut ur, &mut cw) => log_copy_result("target->client", res),
    }

    metrics::gauge!("proxy_connections_active", "rule" => rule_key.to_string(), "target" => target.to_string())
        .decrement(1.0);
}

fn log_copy_result(direction: &str, res: std::io::Result<u64>) {
    if let Err(e) = res {
        if is_expected_close(&e) {
            debug!(direction, "connection closed");
        } else {
            error!(direction, error = %e, "unexpected copy error");
        }
    }
}
