//! Node-side coordinator connection: one dedicated socket, used for
//! `ping`/`register`/`update`/`get_topology` requests and for receiving
//! unsolicited topology broadcasts.
//!
//! Grounded on `original_source/src/easymesh/coordinator/client.py`'s
//! `RPCMeshCoordinatorClient`: `send_heartbeat`/`register_node` are thin
//! request/response wrappers that raise on an unexpected response type, and
//! `_handle_rpc_message` dispatches a `MeshTopologyBroadcast` to a
//! registered handler. This port replaces the handler-callback style with a
//! bounded `mpsc` channel the node runtime drains (idiomatic for a
//! `tokio`-based consumer, and reused elsewhere in this crate for the same
//! push-style fan-out, see `topic::listener`).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::mesh::auth::{Authenticator, HmacAuthenticator, NoopAuthenticator};
use crate::mesh::codec::payload::DynPayloadCodec;
use crate::mesh::coordinator::protocol::{
    read_message_async, CoordinatorMessage, CoordinatorRequestBody, CoordinatorRequestId, CoordinatorResponseBody,
};
use crate::mesh::error::{Error, ErrorKind, Result};
use crate::mesh::peer::connection::{LockableWriter, MeshReadHalf, MeshWriteHalf};
use crate::mesh::specs::{MeshNodeSpec, MeshTopology};

/// Depth of the topology-broadcast channel. The node runtime only ever
/// needs the *latest* topology, but a bounded queue of a few entries lets a
/// slow consumer fall behind a handful of broadcasts instead of immediately
/// losing one to a full channel.
const TOPOLOGY_CHANNEL_CAPACITY: usize = 8;

pub struct CoordinatorClient {
    writer: Arc<LockableWriter>,
    codec: DynPayloadCodec,
    pending: Mutex<HashMap<CoordinatorRequestId, oneshot::Sender<Result<CoordinatorResponseBody>>>>,
    next_id: AtomicU16,
}

impl CoordinatorClient {
    /// Dials the coordinator, authenticates, and spawns the reader task.
    /// Returns the client plus a receiver of every topology broadcast the
    /// coordinator sends for the life of this connection.
    pub async fn connect(
        host: &str,
        port: u16,
        authkey: Option<&[u8]>,
        challenge_len: usize,
        auth_timeout: Duration,
        codec: DynPayloadCodec,
    ) -> Result<(Arc<CoordinatorClient>, mpsc::Receiver<MeshTopology>)> {
        let mut stream = TcpStream::connect((host, port))
            .await
            .map_err(|e| Error::wrapped(ErrorKind::Connection, "failed to connect to coordinator", e))?;

        match authkey {
            Some(key) => HmacAuthenticator::new(key, challenge_len, auth_timeout).authenticate(&mut stream).await?,
            None => NoopAuthenticator.authenticate(&mut stream).await?,
        }

        let (r, w) = tokio::io::split(stream);
        let reader = MeshReadHalf::Tcp(r);
        let writer = Arc::new(LockableWriter::new(MeshWriteHalf::Tcp(w)));

        let client = Arc::new(CoordinatorClient {
            writer,
            codec,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU16::new(0),
        });

        let (topology_tx, topology_rx) = mpsc::channel(TOPOLOGY_CHANNEL_CAPACITY);
        tokio::spawn(run_reader(client.clone(), reader, topology_tx));

        Ok((client, topology_rx))
    }

    pub async fn ping(&self) -> Result<()> {
        match self.request(CoordinatorRequestBody::Ping, None).await? {
            CoordinatorResponseBody::Pong => Ok(()),
            other => Err(unexpected_response("Pong", &other)),
        }
    }

    pub async fn register(&self, spec: MeshNodeSpec) -> Result<()> {
        match self.request(CoordinatorRequestBody::Register(spec), None).await? {
            CoordinatorResponseBody::Registered => Ok(()),
            other => Err(unexpected_response("Registered", &other)),
        }
    }

    pub async fn update(&self, spec: MeshNodeSpec) -> Result<()> {
        match self.request(CoordinatorRequestBody::Update(spec), None).await? {
            CoordinatorResponseBody::Updated => Ok(()),
            other => Err(unexpected_response("Updated", &other)),
        }
    }

    pub async fn get_topology(&self) -> Result<MeshTopology> {
        match self.request(CoordinatorRequestBody::GetTopology, None).await? {
            CoordinatorResponseBody::Topology(topology) => Ok(topology),
            other => Err(unexpected_response("Topology", &other)),
        }
    }

    async fn request(
        &self,
        body: CoordinatorRequestBody,
        call_timeout: Option<Duration>,
    ) -> Result<CoordinatorResponseBody> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let message = CoordinatorMessage::Request { id, body };
        let encoded = crate::mesh::coordinator::protocol::encode_message(&message, &self.codec)?;
        if let Err(e) = self.writer.write_framed(&encoded).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let received = match call_timeout {
            Some(duration) => tokio::time::timeout(duration, rx)
                .await
                .map_err(|_| Error::connection("timed out waiting for coordinator response"))?,
            None => rx.await,
        };

        received.map_err(|_| Error::connection("coordinator connection closed before response was received"))?
    }
}

async fn run_reader(client: Arc<CoordinatorClient>, mut reader: MeshReadHalf, topology_tx: mpsc::Sender<MeshTopology>) {
    loop {
        match read_message_async(&mut reader, &client.codec).await {
            Ok(CoordinatorMessage::Response { id, body }) => {
                if let Some(tx) = client.pending.lock().await.remove(&id) {
                    let _ = tx.send(Ok(body));
                } else {
                    warn!(id, "coordinator response for unknown or already-resolved request id");
                }
            }
            Ok(CoordinatorMessage::Broadcast(topology)) => {
                if topology_tx.send(topology).await.is_err() {
                    debug!("topology broadcast receiver dropped, stopping coordinator reader");
                    break;
                }
            }
            Ok(CoordinatorMessage::Request { .. }) => {
                warn!("coordinator sent a request frame on the client side, ignoring");
            }
            Err(e) => {
                warn!(error = %e, "coordinator connection lost");
                break;
            }
        }
    }
    fail_all_pending(&client).await;
}

async fn fail_all_pending(client: &CoordinatorClient) {
    let mut pending = client.pending.lock().await;
    for (_, tx) in pending.drain() {
        let _ = tx.send(Err(Error::connection("coordinator connection closed before response was received")));
    }
}

fn unexpected_response(expected: &str, got: &CoordinatorResponseBody) -> Error {
    match got {
        CoordinatorResponseBody::Error(message) => Error::connection(format!("coordinator returned an error: {}", message)),
        other => Error::protocol(format!("expected {} response from coordinator, got {:?}", expected, other)),
    }
}
