//! C2: transport endpoints. Server providers bind a listening socket and
//! advertise how peers should reach it; tried in order until one succeeds.
//!
//! Grounded on `original_source/src/rosy/node/servers.py`
//! (`ServerProvider`/`PortScanTcpServerProvider`/`TmpUnixServerProvider`/
//! `ServersManager`).

use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::mesh::error::{Error, ErrorKind, Result};
use crate::mesh::specs::{AddressFamily, ConnectionSpec};

#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

/// A duplex byte stream accepted by some server provider.
pub trait AcceptedStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> AcceptedStream for T {}

pub type ClientConnectedCb =
    std::sync::Arc<dyn Fn(Box<dyn AcceptedStream>) -> Pin<Box<dyn Future<Output = ()> + Send>> + Send + Sync>;

/// Outcome of trying to start one server provider.
pub enum StartResult {
    Started {
        connection_specs: Vec<ConnectionSpec>,
    },
    /// The provider can't run on this platform/configuration at all (e.g.
    /// Unix sockets on a host without `AF_UNIX`). Not a fatal error — the
    /// caller tries the next provider.
    Unsupported { reason: String },
}

#[async_trait::async_trait]
pub trait ServerProvider: Send + Sync {
    /// Starts listening and spawns an accept loop that hands every accepted,
    /// already-wrapped-for-guaranteed-close stream to `client_connected_cb`.
    async fn start_server(&self, client_connected_cb: ClientConnectedCb) -> Result<StartResult>;
}

/// Binds a TCP listener, either on an explicit port or by scanning
/// `[scan_start, scan_end]` for the first free one (spec.md §4.2, §6).
pub struct TcpServerProvider {
    pub bind_host: String,
    pub client_host: String,
    pub port: Option<u16>,
    pub scan_start: u16,
    pub scan_end: u16,
}

#[async_trait::async_trait]
impl ServerProvider for TcpServerProvider {
    async fn start_server(&self, client_connected_cb: ClientConnectedCb) -> Result<StartResult> {
        let listener = match self.port {
            Some(port) => TcpListener::bind((self.bind_host.as_str(), port))
                .await
                .map_err(|e| Error::wrapped(ErrorKind::Connection, "failed to bind tcp port", e))?,
            None => {
                let mut last_err = None;
                let mut found = None;
                for port in self.scan_start..=self.scan_end {
                    match TcpListener::bind((self.bind_host.as_str(), port)).await {
                        Ok(listener) => {
                            found = Some(listener);
                            break;
                        }
                        Err(e) => last_err = Some(e),
                    }
                }
                found.ok_or_else(|| {
                    Error::connection(format!(
                        "could not bind any port in [{}, {}]: {}",
                        self.scan_start,
                        self.scan_end,
                        last_err
                            .map(|e| e.to_string())
                            .unwrap_or_else(|| "no ports available".to_string())
                    ))
                })?
            }
        };

        let local_addr = listener
            .local_addr()
            .map_err(|e| Error::wrapped(ErrorKind::Connection, "failed to read bound tcp address", e))?;
        let port = local_addr.port();
        info!(port, "tcp server provider listening");

        let family = if local_addr.is_ipv6() {
            AddressFamily::Inet6
        } else {
            AddressFamily::Inet
        };
        let connection_specs = vec![ConnectionSpec::Ip {
            host: self.client_host.clone(),
            port,
            family,
        }];

        tokio::spawn(accept_loop_tcp(listener, client_connected_cb));

        Ok(StartResult::Started { connection_specs })
    }
}

async fn accept_loop_tcp(listener: TcpListener, cb: ClientConnectedCb) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!(%addr, "tcp accept");
                tokio::spawn(guarantee_close(stream, cb.clone()));
            }
            Err(e) => {
                warn!(error = %e, "tcp accept failed");
                break;
            }
        }
    }
}

/// Ensures `close` always runs on any exit path (success, panic-unwind
/// aside, or early return) — spec.md §4.2: "every accepted client stream is
/// immediately wrapped to guarantee close + await close".
async fn guarantee_close<S: AcceptedStream>(stream: S, cb: ClientConnectedCb) {
    cb(Box::new(stream)).await;
    // `S`'s `Drop` runs the close/shutdown on scope exit below; for TCP and
    // Unix streams that's sufficient. Explicit shutdown on error paths is
    // handled inside each protocol layer (auth/peer) that owns the stream.
}

#[cfg(unix)]
pub struct UnixServerProvider {
    pub prefix: String,
    pub suffix: String,
    pub dir: Option<std::path::PathBuf>,
    pub advertised_host: String,
}

#[cfg(unix)]
#[async_trait::async_trait]
impl ServerProvider for UnixServerProvider {
    async fn start_server(&self, client_connected_cb: ClientConnectedCb) -> Result<StartResult> {
        let dir = self
            .dir
            .clone()
            .unwrap_or_else(std::env::temp_dir);
        let unique = uuid::Uuid::new_v4();
        let path = dir.join(format!("{}{}{}", self.prefix, unique, self.suffix));

        let listener = match UnixListener::bind(&path) {
            Ok(listener) => listener,
            Err(e) if e.kind() == std::io::ErrorKind::Unsupported => {
                return Ok(StartResult::Unsupported {
                    reason: format!("unix domain sockets unsupported: {}", e),
                })
            }
            Err(e) => return Err(Error::wrapped(ErrorKind::Connection, "failed to bind unix socket", e)),
        };

        info!(path = %path.display(), "unix server provider listening");

        let connection_specs = vec![ConnectionSpec::Unix {
            path: path.to_string_lossy().into_owned(),
            host: self.advertised_host.clone(),
        }];

        tokio::spawn(accept_loop_unix(listener, client_connected_cb));

        Ok(StartResult::Started { connection_specs })
    }
}

#[cfg(unix)]
async fn accept_loop_unix(listener: UnixListener, cb: ClientConnectedCb) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                debug!("unix accept");
                tokio::spawn(guarantee_close(stream, cb.clone()));
            }
            Err(e) => {
                warn!(error = %e, "unix accept failed");
                break;
            }
        }
    }
}

#[cfg(not(unix))]
pub struct UnixServerProvider;

#[cfg(not(unix))]
#[async_trait::async_trait]
impl ServerProvider for UnixServerProvider {
    async fn start_server(&self, _client_connected_cb: ClientConnectedCb) -> Result<StartResult> {
        Ok(StartResult::Unsupported {
            reason: "unix domain sockets not supported on this platform".to_string(),
        })
    }
}

/// Tries each provider in order, accumulating every advertised
/// `ConnectionSpec`. Fails startup if none succeed (spec.md §4.2: "A node
/// must succeed in at least one provider").
pub struct ServersManager {
    providers: Vec<Box<dyn ServerProvider>>,
}

impl ServersManager {
    pub fn new(providers: Vec<Box<dyn ServerProvider>>) -> Self {
        ServersManager { providers }
    }

    pub async fn start_servers(&self, client_connected_cb: ClientConnectedCb) -> Result<Vec<ConnectionSpec>> {
        let mut connection_specs = Vec::new();
        for provider in &self.providers {
            match provider.start_server(client_connected_cb.clone()).await {
                Ok(StartResult::Started { connection_specs: specs }) => connection_specs.extend(specs),
                Ok(StartResult::Unsupported { reason }) => {
                    debug!(reason, "server provider unsupported, skipping");
                }
                Err(e) => {
                    warn!(error = %e, "server provider failed to start");
                }
            }
        }

        if connection_specs.is_empty() {
            return Err(Error::connection("unable to start any server provider"));
        }

        Ok(connection_specs)
    }
}

/// Concrete stream alias shared by the peer connection layer.
pub enum MeshStream {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(UnixStream),
}
