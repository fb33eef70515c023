//! Coordinator server: one long-running process nodes register with to
//! discover each other. Per connection: `Unregistered -> Registered ->
//! Closed` (spec.md §4.10). Registered nodes receive the full topology
//! snapshot whenever it changes, debounced so a burst of registrations
//! yields one broadcast per recipient, not one per mutation.
//!
//! Grounded on `original_source/src/easymesh/coordinator/server.py`'s
//! `RPCMeshCoordinatorServer`: `_handle_connection` removes the node and
//! re-broadcasts on any exit (`finally`), `_handle_register_node` stores the
//! spec and re-broadcasts, `_broadcast_topology` fans a
//! `MeshTopologyBroadcast` out to every currently-registered client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, trace, warn};

use crate::mesh::auth::{Authenticator, HmacAuthenticator, NoopAuthenticator};
use crate::mesh::codec::payload::DynPayloadCodec;
use crate::mesh::config::MeshConfig;
use crate::mesh::coordinator::protocol::{
    encode_message, read_message_async, CoordinatorMessage, CoordinatorRequestBody, CoordinatorResponseBody,
};
use crate::mesh::error::{Error, ErrorKind, Result};
use crate::mesh::peer::connection::{LockableWriter, MeshReadHalf, MeshWriteHalf};
use crate::mesh::specs::{MeshNodeSpec, MeshTopology, NodeId};

/// How long the broadcast loop waits after being woken before it snapshots
/// the topology, so a burst of registrations/updates within this window
/// collapses to a single broadcast per recipient.
const BROADCAST_DEBOUNCE: Duration = Duration::from_millis(20);

/// How often the heartbeat sweep checks for nodes that stopped pinging.
/// Runs more often than `heartbeat_timeout` itself so no node waits much
/// longer than the configured timeout to be noticed as gone.
const HEARTBEAT_SWEEP_INTERVAL_DIVISOR: u32 = 2;

struct RegisteredNode {
    writer: Arc<LockableWriter>,
    last_heartbeat: Mutex<Instant>,
}

/// Per-connection progress through the handshake; enforced before a
/// request is dispatched (spec.md §4.10: "Unregistered ... only register
/// and ping accepted").
#[derive(Clone, Debug, Eq, PartialEq)]
enum ConnState {
    Unregistered,
    Registered(NodeId),
}

pub struct CoordinatorServer {
    host: String,
    port: u16,
    authkey: Option<Vec<u8>>,
    challenge_len: usize,
    auth_timeout: Duration,
    heartbeat_timeout: Duration,
    log_heartbeats: bool,
    codec: DynPayloadCodec,

    topology: Mutex<MeshTopology>,
    registered: Mutex<HashMap<NodeId, RegisteredNode>>,
    broadcast_notify: Notify,
}

impl CoordinatorServer {
    pub fn new(config: &MeshConfig) -> Arc<CoordinatorServer> {
        Arc::new(CoordinatorServer {
            host: config.coordinator_host.clone(),
            port: config.coordinator_port,
            authkey: config.authkey.clone(),
            challenge_len: config.challenge_len,
            auth_timeout: config.auth_timeout(),
            heartbeat_timeout: config.heartbeat_timeout(),
            log_heartbeats: config.log_heartbeats,
            codec: DynPayloadCodec::from_kind(config.payload_codec),
            topology: Mutex::new(MeshTopology::new()),
            registered: Mutex::new(HashMap::new()),
            broadcast_notify: Notify::new(),
        })
    }

    /// Binds the listening socket and runs forever: the accept loop, the
    /// debounced broadcast loop, and the heartbeat sweep all run as
    /// sibling tasks under this one.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let listener = TcpListener::bind((self.host.as_str(), self.port))
            .await
            .map_err(|e| Error::wrapped(ErrorKind::Connection, "failed to bind coordinator port", e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::wrapped(ErrorKind::Connection, "failed to read bound coordinator address", e))?;
        info!(port = local_addr.port(), "coordinator listening");

        tokio::spawn(self.clone().broadcast_loop());
        tokio::spawn(self.clone().heartbeat_sweep_loop());

        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!(%addr, "coordinator accept");
                    tokio::spawn(self.clone().handle_connection(stream));
                }
                Err(e) => {
                    warn!(error = %e, "coordinator accept failed");
                    return Err(Error::wrapped(ErrorKind::Connection, "coordinator accept loop exited", e));
                }
            }
        }
    }

    async fn authenticate(&self, stream: &mut TcpStream) -> Result<()> {
        match &self.authkey {
            Some(key) => HmacAuthenticator::new(key, self.challenge_len, self.auth_timeout).authenticate(stream).await,
            None => NoopAuthenticator.authenticate(stream).await,
        }
    }

    async fn handle_connection(self: Arc<Self>, mut stream: TcpStream) {
        if let Err(e) = self.authenticate(&mut stream).await {
            debug!(error = %e, "coordinator connection failed authentication");
            return;
        }

        let (r, w) = tokio::io::split(stream);
        let mut reader = MeshReadHalf::Tcp(r);
        let writer = Arc::new(LockableWriter::new(MeshWriteHalf::Tcp(w)));

        let mut state = ConnState::Unregistered;
        loop {
            let message = match read_message_async(&mut reader, &self.codec).await {
                Ok(message) => message,
                Err(e) => {
                    debug!(error = %e, "coordinator connection closed");
                    break;
                }
            };
            let (id, body) = match message {
                CoordinatorMessage::Request { id, body } => (id, body),
                _ => {
                    warn!("coordinator received a non-request frame from a node, closing connection");
                    break;
                }
            };

            let response = self.handle_request(&mut state, body, &writer).await;
            let encoded = match encode_message(&CoordinatorMessage::Response { id, body: response }, &self.codec) {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!(error = %e, "failed to encode coordinator response");
                    break;
                }
            };
            if let Err(e) = writer.write_framed(&encoded).await {
                debug!(error = %e, "failed to write coordinator response");
                break;
            }
        }

        if let ConnState::Registered(id) = state {
            self.remove_node(&id).await;
        }
    }

    async fn handle_request(
        &self,
        state: &mut ConnState,
        body: CoordinatorRequestBody,
        writer: &Arc<LockableWriter>,
    ) -> CoordinatorResponseBody {
        match body {
            CoordinatorRequestBody::Ping => {
                if let ConnState::Registered(id) = state {
                    self.touch_heartbeat(id).await;
                    if self.log_heartbeats {
                        trace!(node = %id, "received heartbeat");
                    }
                }
                CoordinatorResponseBody::Pong
            }
            CoordinatorRequestBody::Register(spec) => self.register_node(state, spec, writer).await,
            CoordinatorRequestBody::Update(spec) => self.update_node(state, spec).await,
            CoordinatorRequestBody::GetTopology => match state {
                ConnState::Registered(_) => CoordinatorResponseBody::Topology(self.topology.lock().await.clone()),
                ConnState::Unregistered => {
                    CoordinatorResponseBody::Error("get_topology requires registration first".to_string())
                }
            },
        }
    }

    async fn register_node(
        &self,
        state: &mut ConnState,
        spec: MeshNodeSpec,
        writer: &Arc<LockableWriter>,
    ) -> CoordinatorResponseBody {
        if let ConnState::Registered(existing) = state {
            return CoordinatorResponseBody::Error(format!("connection already registered as {}", existing));
        }

        let id = spec.id.clone();
        {
            let mut registered = self.registered.lock().await;
            registered.insert(
                id.clone(),
                RegisteredNode {
                    writer: writer.clone(),
                    last_heartbeat: Mutex::new(Instant::now()),
                },
            );
        }
        self.topology.lock().await.put(spec);
        *state = ConnState::Registered(id.clone());
        info!(node = %id, "node registered");
        self.broadcast_notify.notify_one();
        CoordinatorResponseBody::Registered
    }

    async fn update_node(&self, state: &mut ConnState, spec: MeshNodeSpec) -> CoordinatorResponseBody {
        let id = match state {
            ConnState::Registered(id) => id.clone(),
            ConnState::Unregistered => {
                return CoordinatorResponseBody::Error("update requires registration first".to_string())
            }
        };
        if spec.id != id {
            return CoordinatorResponseBody::Error("update may not change a connection's registered node id".to_string());
        }
        self.topology.lock().await.put(spec);
        self.broadcast_notify.notify_one();
        CoordinatorResponseBody::Updated
    }

    async fn touch_heartbeat(&self, id: &NodeId) {
        let registered = self.registered.lock().await;
        if let Some(node) = registered.get(id) {
            *node.last_heartbeat.lock().await = Instant::now();
        }
    }

    async fn remove_node(&self, id: &NodeId) {
        let removed = self.registered.lock().await.remove(id);
        if removed.is_none() {
            return;
        }
        self.topology.lock().await.remove(id);
        info!(node = %id, "node removed from topology");
        self.broadcast_notify.notify_one();
    }

    async fn broadcast_loop(self: Arc<Self>) {
        loop {
            self.broadcast_notify.notified().await;
            tokio::time::sleep(BROADCAST_DEBOUNCE).await;
            self.broadcast_topology().await;
        }
    }

    async fn broadcast_topology(&self) {
        let topology = self.topology.lock().await.clone();
        let message = CoordinatorMessage::Broadcast(topology);
        let encoded = match encode_message(&message, &self.codec) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "failed to encode topology broadcast");
                return;
            }
        };

        let targets: Vec<(NodeId, Arc<LockableWriter>)> = {
            let registered = self.registered.lock().await;
            registered.iter().map(|(id, node)| (id.clone(), node.writer.clone())).collect()
        };

        let mut dead = Vec::new();
        for (id, writer) in targets {
            if let Err(e) = writer.write_framed(&encoded).await {
                debug!(node = %id, error = %e, "broadcast write failed, dropping node");
                dead.push(id);
            }
        }
        for id in dead {
            self.remove_node(&id).await;
        }
    }

    async fn heartbeat_sweep_loop(self: Arc<Self>) {
        let interval = self.heartbeat_timeout / HEARTBEAT_SWEEP_INTERVAL_DIVISOR.max(1);
        let interval = if interval.is_zero() { self.heartbeat_timeout } else { interval };
        loop {
            tokio::time::sleep(interval).await;
            self.sweep_expired_heartbeats().await;
        }
    }

    async fn sweep_expired_heartbeats(&self) {
        let expired: Vec<NodeId> = {
            let registered = self.registered.lock().await;
            let mut expired = Vec::new();
            for (id, node) in registered.iter() {
                let last = *node.last_heartbeat.lock().await;
                if last.elapsed() > self.heartbeat_timeout {
                    expired.push(id.clone());
                }
            }
            expired
        };
        for id in expired {
            warn!(node = %id, "heartbeat timed out, removing from topology");
            self.remove_node(&id).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::coordinator::client::CoordinatorClient;
    use crate::mesh::specs::{AddressFamily, ConnectionSpec};

    fn test_config(port: u16) -> MeshConfig {
        let mut config = MeshConfig::default();
        config.coordinator_host = "127.0.0.1".to_string();
        config.coordinator_port = port;
        config.heartbeat_timeout_secs = 1;
        config
    }

    fn spec(name: &str, port: u16) -> MeshNodeSpec {
        MeshNodeSpec::new(
            NodeId::new(name, "host-a"),
            vec![ConnectionSpec::Ip {
                host: "host-a".into(),
                port,
                family: AddressFamily::Inet,
            }],
        )
    }

    async fn start_server() -> (Arc<CoordinatorServer>, u16) {
        // bind on an ephemeral port by asking the OS for one first, then
        // reusing its number for the coordinator's own listener setup.
        let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = probe.local_addr().unwrap().port();
        drop(probe);

        let server = CoordinatorServer::new(&test_config(port));
        let running = server.clone();
        tokio::spawn(async move {
            let _ = running.run().await;
        });
        // give the accept loop a moment to bind before clients dial it.
        tokio::time::sleep(Duration::from_millis(30)).await;
        (server, port)
    }

    #[tokio::test]
    async fn register_then_get_topology_reflects_the_node() {
        let (_server, port) = start_server().await;
        let (client, _topology_rx) =
            CoordinatorClient::connect("127.0.0.1", port, None, 32, Duration::from_secs(1), DynPayloadCodec::Json(crate::mesh::codec::payload::JsonCodec))
                .await
                .unwrap();

        let node_spec = spec("worker", 4000);
        client.register(node_spec.clone()).await.unwrap();
        let topology = client.get_topology().await.unwrap();
        assert_eq!(topology.get(&node_spec.id), Some(&node_spec));
    }

    #[tokio::test]
    async fn get_topology_before_register_is_rejected() {
        let (_server, port) = start_server().await;
        let (client, _topology_rx) =
            CoordinatorClient::connect("127.0.0.1", port, None, 32, Duration::from_secs(1), DynPayloadCodec::Json(crate::mesh::codec::payload::JsonCodec))
                .await
                .unwrap();

        assert!(client.get_topology().await.is_err());
    }

    #[tokio::test]
    async fn second_node_receives_a_broadcast_when_a_peer_registers() {
        let (_server, port) = start_server().await;
        let codec = DynPayloadCodec::Json(crate::mesh::codec::payload::JsonCodec);

        let (client_a, _rx_a) = CoordinatorClient::connect("127.0.0.1", port, None, 32, Duration::from_secs(1), codec).await.unwrap();
        let spec_a = spec("a", 4001);
        client_a.register(spec_a.clone()).await.unwrap();

        let (client_b, mut rx_b) = CoordinatorClient::connect("127.0.0.1", port, None, 32, Duration::from_secs(1), codec).await.unwrap();
        let spec_b = spec("b", 4002);
        client_b.register(spec_b.clone()).await.unwrap();

        let topology = tokio::time::timeout(Duration::from_secs(1), rx_b.recv()).await.unwrap().unwrap();
        assert!(topology.get(&spec_a.id).is_some());
        assert!(topology.get(&spec_b.id).is_some());
    }

    #[tokio::test]
    async fn disconnecting_a_node_removes_it_from_the_topology() {
        let (server, port) = start_server().await;
        let codec = DynPayloadCodec::Json(crate::mesh::codec::payload::JsonCodec);

        let (client_a, _rx_a) = CoordinatorClient::connect("127.0.0.1", port, None, 32, Duration::from_secs(1), codec).await.unwrap();
        let spec_a = spec("a", 4003);
        client_a.register(spec_a.clone()).await.unwrap();
        drop(client_a);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let topology = server.topology.lock().await.clone();
        assert!(topology.get(&spec_a.id).is_none());
    }
}
