use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex as StdMutex};

use rustls::pki_types::ServerName;
use tokio::net::TcpStream;
use tokio::sync::Mutex as AsyncMutex;
use tokio_rustls::TlsConnector;

use super::error::Error;
use super::messages::{read_frame, write_frame, Call, Ctrl, NodeToken, Reply, Request, WireError, WireResult};
use super::tls::{self, fingerprint, TlsIdentity};
use super::{auth_token, AsyncStream, DIAL_TIMEOUT};

/// Client for the RPC API of other nodes.
///
/// Holds the peer registry (endpoint + pinned fingerprint per name)
/// and a cache of live connections. The registry lock is only ever
/// held around map access, never across a network round-trip; each
/// live connection is serialised by its own async mutex.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    /// Token presented to other nodes for authentication.
    token: NodeToken,
    /// This client's own rpc interface (empty for pure clients).
    rpc: String,
    /// Client certificate; enables TLS when present.
    identity: Option<TlsIdentity>,
    state: StdMutex<ClientState>,
}

#[derive(Default)]
struct ClientState {
    peers: HashMap<String, String>,
    fingerprints: HashMap<String, String>,
    conns: HashMap<String, Arc<AsyncMutex<Connection>>>,
    /// Set while a redial attempt is in flight, so a broken redialed
    /// connection cannot retry forever.
    redial: bool,
}

struct Connection {
    stream: Box<dyn AsyncStream>,
}

impl Connection {
    async fn round_trip(&mut self, request: &Request) -> io::Result<WireResult> {
        let payload = bincode::serialize(request)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

        write_frame(&mut self.stream, &payload).await?;
        let reply = read_frame(&mut self.stream).await?;

        bincode::deserialize(&reply).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

/// Errors which indicate the cached connection died underneath us and
/// a single redial is worth attempting.
fn is_broken_conn(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::NotConnected
    )
}

impl Client {
    /// Create a pure client (no name, no rpc interface of its own).
    pub fn new(secret: &str, identity: Option<TlsIdentity>) -> Client {
        Client::with_details("", secret, "", identity)
    }

    pub(crate) fn with_details(
        name: &str,
        secret: &str,
        rpc: &str,
        identity: Option<TlsIdentity>,
    ) -> Client {
        Client {
            inner: Arc::new(ClientInner {
                token: NodeToken {
                    node_name: name.to_string(),
                    node_auth: auth_token(name, secret),
                },
                rpc: rpc.to_string(),
                identity,
                state: StdMutex::new(ClientState::default()),
            }),
        }
    }

    /// This client's own rpc interface, empty for pure clients.
    pub fn rpc_interface(&self) -> &str {
        &self.inner.rpc
    }

    /// Fingerprint of the client's own certificate, empty without TLS.
    pub fn ssl_fingerprint(&self) -> String {
        self.inner
            .identity
            .as_ref()
            .map(|id| id.fingerprint())
            .unwrap_or_default()
    }

    /// Register a new peer to communicate with. An empty fingerprint
    /// means the first certificate presented by the peer is adopted
    /// and pinned from then on.
    pub fn register_peer(&self, node: &str, rpc: &str, fingerprint: &str) -> Result<(), Error> {
        let mut state = self.inner.state.lock().unwrap();

        if state.peers.contains_key(node) {
            return Err(Error::Local(format!("Peer already registered: {}", node)));
        }
        if rpc.is_empty() {
            return Err(Error::Local("RPC interface must not be empty".to_string()));
        }

        state.peers.insert(node.to_string(), rpc.to_string());
        state.conns.remove(node);
        state
            .fingerprints
            .insert(node.to_string(), fingerprint.to_string());

        Ok(())
    }

    /// Remove a registered peer, closing its connection if present.
    pub fn remove_peer(&self, node: &str) {
        let mut state = self.inner.state.lock().unwrap();

        state.peers.remove(node);
        state.conns.remove(node);
        state.fingerprints.remove(node);
    }

    /// All registered peers (sorted) and their expected fingerprints.
    pub fn peers(&self) -> (Vec<String>, Vec<String>) {
        let state = self.inner.state.lock().unwrap();

        let mut names: Vec<String> = state.peers.keys().cloned().collect();
        names.sort();

        let fps = names
            .iter()
            .map(|n| state.fingerprints.get(n).cloned().unwrap_or_default())
            .collect();

        (names, fps)
    }

    pub fn is_registered(&self, node: &str) -> bool {
        self.inner.state.lock().unwrap().peers.contains_key(node)
    }

    /// Close all cached connections.
    pub fn shutdown(&self) {
        self.inner.state.lock().unwrap().conns.clear();
    }

    /// Ping a node and return the answer and the fingerprint of the
    /// certificate it presented. The `rpc` argument is only needed for
    /// nodes that are not registered peers; such nodes are registered
    /// temporarily and deregistered again before returning.
    pub async fn send_ping(&self, node: &str, rpc: &str) -> Result<(Vec<String>, String), Error> {
        let temporary = {
            let mut state = self.inner.state.lock().unwrap();
            if !state.peers.contains_key(node) && !rpc.is_empty() {
                state.peers.insert(node.to_string(), rpc.to_string());
                true
            } else {
                false
            }
        };

        let res = self.send_request(node, Call::Ping).await;

        let out = match res {
            Ok(Reply::Pong(answer)) => {
                let state = self.inner.state.lock().unwrap();
                let fp = state.fingerprints.get(node).cloned().unwrap_or_default();
                Ok((answer, fp))
            }
            Ok(_) => Err(Error::Local(
                "Unexpected response type for ping request".to_string(),
            )),
            Err(e) => Err(e),
        };

        if temporary {
            let mut state = self.inner.state.lock().unwrap();
            state.peers.remove(node);
            state.conns.remove(node);
            state.fingerprints.remove(node);
        }

        out
    }

    /// Send a data request to a registered peer and return the encoded
    /// result payload.
    pub async fn send_data(&self, node: &str, ctrl: Ctrl, data: Vec<u8>) -> Result<Vec<u8>, Error> {
        if !self.is_registered(node) {
            return Err(Error::Local(format!("Unknown peer: {}", node)));
        }

        match self.send_request(node, Call::Data { ctrl, data }).await? {
            Reply::Data(payload) => Ok(payload),
            _ => Err(Error::Local(
                "Unexpected response type for data request".to_string(),
            )),
        }
    }

    /// Send a request to another node, establishing a connection if
    /// needed and redialing exactly once when a cached connection
    /// turns out to be dead.
    pub async fn send_request(&self, node: &str, call: Call) -> Result<Reply, Error> {
        loop {
            let endpoint = {
                let state = self.inner.state.lock().unwrap();
                state.peers.get(node).cloned()
            };
            let endpoint = match endpoint {
                Some(endpoint) => endpoint,
                None => return Err(Error::UnknownTarget(node.to_string())),
            };

            let cached = {
                let state = self.inner.state.lock().unwrap();
                state.conns.get(node).cloned()
            };
            let conn = match cached {
                Some(conn) => conn,
                None => self.connect(node, &endpoint).await?,
            };

            let request = Request {
                target: node.to_string(),
                token: self.inner.token.clone(),
                call: call.clone(),
            };

            tracing::debug!(caller = %self.inner.token.node_name, %node, %endpoint, "> request");
            let result = conn.lock().await.round_trip(&request).await;

            match result {
                Ok(wire) => {
                    self.inner.state.lock().unwrap().redial = false;
                    tracing::debug!(caller = %self.inner.token.node_name, %node, ok = wire.is_ok(), "< reply");

                    return match wire {
                        Ok(reply) => Ok(reply),
                        Err(we) => Err(self.classify_wire_error(node, we)),
                    };
                }
                Err(ioe) => {
                    if is_broken_conn(&ioe) {
                        // Delete the closed connection and retry once
                        let retry = {
                            let mut state = self.inner.state.lock().unwrap();
                            state.conns.remove(node);
                            if !state.redial {
                                state.redial = true;
                                true
                            } else {
                                false
                            }
                        };
                        if retry {
                            tracing::debug!(%node, error = %ioe, "connection broken, redialing");
                            continue;
                        }
                    }

                    self.inner.state.lock().unwrap().redial = false;
                    return Err(Error::Network(ioe.to_string()));
                }
            }
        }
    }

    /// Establish and cache a connection to `endpoint`.
    ///
    /// With TLS the library's own verification is disabled and the
    /// trust decision is made here: the observed leaf fingerprint is
    /// adopted when no pin exists yet, and the connection is rejected
    /// (and not cached) when it contradicts the pin.
    async fn connect(
        &self,
        node: &str,
        endpoint: &str,
    ) -> Result<Arc<AsyncMutex<Connection>>, Error> {
        let tcp = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(endpoint))
            .await
            .map_err(|_| Error::Network(format!("dial timeout connecting to {}", endpoint)))?
            .map_err(|e| Error::Network(e.to_string()))?;

        let stream: Box<dyn AsyncStream> = match &self.inner.identity {
            Some(identity) => {
                let config =
                    tls::client_config(identity).map_err(|e| Error::Network(e.to_string()))?;
                let connector = TlsConnector::from(Arc::new(config));

                let host = match endpoint.rsplit_once(':') {
                    Some((host, _)) if !host.is_empty() => host,
                    _ => "127.0.0.1",
                };
                let server_name = ServerName::try_from(host.to_string())
                    .map_err(|e| Error::Network(e.to_string()))?;

                let tls_stream = connector
                    .connect(server_name, tcp)
                    .await
                    .map_err(|e| Error::Network(e.to_string()))?;

                let observed = tls_stream
                    .get_ref()
                    .1
                    .peer_certificates()
                    .and_then(|certs| certs.first())
                    .map(|cert| fingerprint(cert.as_ref()))
                    .unwrap_or_default();

                let expected = {
                    let state = self.inner.state.lock().unwrap();
                    state.fingerprints.get(node).cloned().unwrap_or_default()
                };

                if expected.is_empty() {
                    // Trust on first use: pin what we just saw
                    let mut state = self.inner.state.lock().unwrap();
                    state
                        .fingerprints
                        .insert(node.to_string(), observed.clone());
                } else if expected != observed {
                    tracing::warn!(
                        %node,
                        %endpoint,
                        presented = %observed,
                        expected = %expected,
                        "not trusting peer certificate"
                    );
                    return Err(Error::Untrusted(node.to_string()));
                }

                tracing::debug!(%node, %endpoint, fingerprint = %observed, "peer certificate accepted");
                Box::new(tls_stream)
            }
            None => Box::new(tcp),
        };

        let conn = Arc::new(AsyncMutex::new(Connection { stream }));
        self.inner
            .state
            .lock()
            .unwrap()
            .conns
            .insert(node.to_string(), conn.clone());

        Ok(conn)
    }

    fn classify_wire_error(&self, node: &str, we: WireError) -> Error {
        match we {
            WireError::UnknownTarget => Error::UnknownTarget(node.to_string()),
            WireError::InvalidToken => Error::InvalidToken,
            WireError::Handler(text) => Error::remote(text),
        }
    }
}
