//! C4: peer connection pool and the lockable writer gate shared with the
//! coordinator (spec.md §4.4, §4.10 "same contract as §4.4").
//!
//! Grounded on `original_source/src/easymesh/node/peer.py`
//! (`PeerConnectionBuilder`/`PeerConnectionPool`/`LazyPeerConnection`).

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::debug;

#[cfg(unix)]
use tokio::net::UnixStream;

use crate::mesh::auth::{Authenticator, HmacAuthenticator, NoopAuthenticator};
use crate::mesh::error::{Error, Result};
use crate::mesh::specs::{ConnectionSpec, NodeId};
use crate::mesh::transport::AcceptedStream;

/// Either side of a split duplex stream. `Tcp`/`Unix` back outbound
/// connections this process dialed itself (`PeerConnectionBuilder`);
/// `Accepted` backs an inbound connection handed to the node's accept
/// callback by `transport::ServersManager`, already type-erased over
/// whichever `ServerProvider` produced it.
pub enum MeshReadHalf {
    Tcp(ReadHalf<TcpStream>),
    #[cfg(unix)]
    Unix(ReadHalf<UnixStream>),
    Accepted(ReadHalf<Box<dyn AcceptedStream>>),
}

pub enum MeshWriteHalf {
    Tcp(WriteHalf<TcpStream>),
    #[cfg(unix)]
    Unix(WriteHalf<UnixStream>),
    Accepted(WriteHalf<Box<dyn AcceptedStream>>),
}

impl AsyncRead for MeshReadHalf {
    fn poll_read(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            MeshReadHalf::Tcp(r) => std::pin::Pin::new(r).poll_read(cx, buf),
            #[cfg(unix)]
            MeshReadHalf::Unix(r) => std::pin::Pin::new(r).poll_read(cx, buf),
            MeshReadHalf::Accepted(r) => std::pin::Pin::new(r).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for MeshWriteHalf {
    fn poll_write(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &[u8],
    ) -> std::task::Poll<std::io::Result<usize>> {
        match self.get_mut() {
            MeshWriteHalf::Tcp(w) => std::pin::Pin::new(w).poll_write(cx, buf),
            #[cfg(unix)]
            MeshWriteHalf::Unix(w) => std::pin::Pin::new(w).poll_write(cx, buf),
            MeshWriteHalf::Accepted(w) => std::pin::Pin::new(w).poll_write(cx, buf),
        }
    }

    fn poll_flush(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            MeshWriteHalf::Tcp(w) => std::pin::Pin::new(w).poll_flush(cx),
            #[cfg(unix)]
            MeshWriteHalf::Unix(w) => std::pin::Pin::new(w).poll_flush(cx),
            MeshWriteHalf::Accepted(w) => std::pin::Pin::new(w).poll_flush(cx),
        }
    }

    fn poll_shutdown(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::io::Result<()>> {
        match self.get_mut() {
            MeshWriteHalf::Tcp(w) => std::pin::Pin::new(w).poll_shutdown(cx),
            #[cfg(unix)]
            MeshWriteHalf::Unix(w) => std::pin::Pin::new(w).poll_shutdown(cx),
            MeshWriteHalf::Accepted(w) => std::pin::Pin::new(w).poll_shutdown(cx),
        }
    }
}

/// Wraps a raw writer with an exclusive-access gate. The caller must hold
/// the lock before issuing any `write`; `drain`/`close`/`is_closing` don't
/// need it. No lock may be held across a suspension point other than within
/// one framed write (spec.md §4.4, §5).
pub struct LockableWriter {
    inner: Mutex<MeshWriteHalf>,
    closing: std::sync::atomic::AtomicBool,
}

impl LockableWriter {
    pub fn new(writer: MeshWriteHalf) -> Self {
        LockableWriter {
            inner: Mutex::new(writer),
            closing: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Acquire the write lock, write one length-already-framed buffer, and
    /// drain it — the only unit of work allowed while the lock is held.
    pub async fn write_framed(&self, frame: &[u8]) -> Result<()> {
        let mut guard = self.inner.lock().await;
        let result = guard.write_all(frame).await.and_then(|_| {
            // flush synchronously via a second await below
            Ok(())
        });
        if result.is_err() {
            self.closing.store(true, std::sync::atomic::Ordering::SeqCst);
        }
        result.map_err(|e| Error::wrapped(crate::mesh::error::ErrorKind::Connection, "write failed", e))?;
        guard.flush().await.map_err(|e| {
            self.closing.store(true, std::sync::atomic::Ordering::SeqCst);
            Error::wrapped(crate::mesh::error::ErrorKind::Connection, "drain failed", e)
        })
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub async fn close(&self) {
        self.closing.store(true, std::sync::atomic::Ordering::SeqCst);
        let mut guard = self.inner.lock().await;
        let _ = guard.shutdown().await;
    }
}

pub struct PeerConnection {
    pub reader: Mutex<MeshReadHalf>,
    pub writer: Arc<LockableWriter>,
}

/// Attempts connections against a node's advertised specs in order,
/// authenticating each before it's usable. Grounded on `peer.py`'s
/// `PeerConnectionBuilder.build`.
pub struct PeerConnectionBuilder {
    pub local_hostname: String,
    pub authkey: Option<Vec<u8>>,
    pub challenge_len: usize,
    pub auth_timeout: std::time::Duration,
}

impl PeerConnectionBuilder {
    async fn authenticate<S>(&self, stream: &mut S) -> Result<()>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin,
    {
        match &self.authkey {
            Some(key) => {
                HmacAuthenticator::new(key, self.challenge_len, self.auth_timeout)
                    .authenticate(stream)
                    .await
            }
            None => NoopAuthenticator.authenticate(stream).await,
        }
    }

    pub async fn build(&self, connection_specs: &[ConnectionSpec]) -> Result<PeerConnection> {
        let mut last_err = None;
        for spec in connection_specs {
            match self.try_connect(spec).await {
                Ok(conn) => return Ok(conn),
                Err(e) => {
                    debug!(error = %e, "connection attempt failed, trying next spec");
                    last_err = Some(e);
                }
            }
        }
        Err(Error::connection(format!(
            "could not connect to any connection spec: {}",
            last_err
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no specs provided".to_string())
        )))
    }

    async fn try_connect(&self, spec: &ConnectionSpec) -> Result<PeerConnection> {
        match spec {
            ConnectionSpec::Ip { host, port, .. } => {
                let mut stream = TcpStream::connect((host.as_str(), *port))
                    .await
                    .map_err(|e| Error::wrapped(crate::mesh::error::ErrorKind::Connection, "tcp connect failed", e))?;
                self.authenticate(&mut stream).await?;
                let (r, w) = tokio::io::split(stream);
                Ok(PeerConnection {
                    reader: Mutex::new(MeshReadHalf::Tcp(r)),
                    writer: Arc::new(LockableWriter::new(MeshWriteHalf::Tcp(w))),
                })
            }
            ConnectionSpec::Unix { path, host } => {
                if host != &self.local_hostname {
                    return Err(Error::connection(format!(
                        "unix spec advertises host {:?}, not reachable from {:?}",
                        host, self.local_hostname
                    )));
                }
                #[cfg(unix)]
                {
                    let mut stream = UnixStream::connect(path)
                        .await
                        .map_err(|e| Error::wrapped(crate::mesh::error::ErrorKind::Connection, "unix connect failed", e))?;
                    self.authenticate(&mut stream).await?;
                    let (r, w) = tokio::io::split(stream);
                    Ok(PeerConnection {
                        reader: Mutex::new(MeshReadHalf::Unix(r)),
                        writer: Arc::new(LockableWriter::new(MeshWriteHalf::Unix(w))),
                    })
                }
                #[cfg(not(unix))]
                {
                    let _ = path;
                    Err(Error::connection("unix sockets unsupported on this platform"))
                }
            }
        }
    }
}

/// `NodeId -> PeerConnection`, lazily populated, evicted on close.
pub struct PeerConnectionPool {
    builder: PeerConnectionBuilder,
    connections: Mutex<HashMap<NodeId, Arc<PeerConnection>>>,
}

impl PeerConnectionPool {
    pub fn new(builder: PeerConnectionBuilder) -> Self {
        PeerConnectionPool {
            builder,
            connections: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_connection_for(
        &self,
        id: &NodeId,
        connection_specs: &[ConnectionSpec],
    ) -> Result<Arc<PeerConnection>> {
        {
            let connections = self.connections.lock().await;
            if let Some(conn) = connections.get(id) {
                if !conn.writer.is_closing() {
                    return Ok(conn.clone());
                }
            }
        }

        let conn = Arc::new(self.builder.build(connection_specs).await?);
        let mut connections = self.connections.lock().await;
        connections.insert(id.clone(), conn.clone());
        Ok(conn)
    }

    pub fn get_node_ids_with_connections(&self) -> Vec<NodeId> {
        self.connections
            .try_lock()
            .map(|c| c.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub async fn remove_connection_for(&self, id: &NodeId) {
        let removed = {
            let mut connections = self.connections.lock().await;
            connections.remove(id)
        };
        if let Some(conn) = removed {
            conn.writer.close().await;
        }
    }
}
