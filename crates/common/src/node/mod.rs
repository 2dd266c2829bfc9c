use std::net::SocketAddr;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;

use sha2::{Digest, Sha512_224};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

use crate::util::upper_hex;

mod client;
mod error;
mod messages;
mod server;
mod tls;

pub use client::Client;
pub use error::{Error, ERR_EOF, ERR_NOT_EXIST};
pub use messages::{Call, Ctrl, ItemOp, NodeToken, Reply, Request, WireError, WireResult};
pub use tls::{fingerprint, TlsIdentity};

/// Dial timeout for RPC connections.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Streams a connection can run over (plain TCP or TLS).
pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

/// Handler for incoming data requests. The control variant says what
/// to do, the payload carries opaque bytes (write contents). Returns
/// the encoded result payload, or an error message which travels back
/// to the caller verbatim.
pub trait DataHandler: Send + Sync {
    fn handle(&self, ctrl: Ctrl, data: Vec<u8>) -> Result<Vec<u8>, String>;
}

/// Derive the auth token a caller presents to a target node.
///
/// The token authenticates `name` to whoever holds `secret` without
/// transmitting the secret: the target recomputes the same hash from
/// the claimed caller name and its own secret.
pub fn auth_token(name: &str, secret: &str) -> String {
    let mut hasher = Sha512_224::new();
    hasher.update(name.as_bytes());
    hasher.update(secret.as_bytes());
    upper_hex(&hasher.finalize())
}

/// A node in the canopy network.
///
/// A node owns its RPC listener and an optional data handler; its
/// embedded [`Client`] talks to other nodes. Pure clients (trees) use
/// a [`Client`] directly and never start a listener.
pub struct Node {
    pub(crate) inner: Arc<NodeInner>,
    client: Client,
}

pub(crate) struct NodeInner {
    pub(crate) name: String,
    pub(crate) secret: String,
    pub(crate) rpc: String,
    pub(crate) identity: Option<TlsIdentity>,
    pub(crate) handler: StdRwLock<Option<Arc<dyn DataHandler>>>,
    pub(crate) serving: StdMutex<Option<ServeHandle>>,
}

pub(crate) struct ServeHandle {
    addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl Node {
    /// Create a new node. `rpc` is the `host:port` interface the
    /// listener will bind (port `0` picks an ephemeral port).
    pub fn new(rpc: &str, name: &str, secret: &str, identity: Option<TlsIdentity>) -> Node {
        let client = Client::with_details(name, secret, rpc, identity.clone());

        Node {
            inner: Arc::new(NodeInner {
                name: name.to_string(),
                secret: secret.to_string(),
                rpc: rpc.to_string(),
                identity,
                handler: StdRwLock::new(None),
                serving: StdMutex::new(None),
            }),
            client,
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The node's RPC client, sharing the node's identity and token.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Fingerprint of the node's own certificate, empty without TLS.
    pub fn ssl_fingerprint(&self) -> String {
        self.inner
            .identity
            .as_ref()
            .map(|id| id.fingerprint())
            .unwrap_or_default()
    }

    /// Install the handler invoked for incoming data requests.
    pub fn set_data_handler(&self, handler: Arc<dyn DataHandler>) {
        *self.inner.handler.write().unwrap() = Some(handler);
    }

    /// The bound listener address, if the node is running.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.inner.serving.lock().unwrap().as_ref().map(|s| s.addr)
    }

    /// Start the RPC listener for this node.
    pub async fn start(&self) -> Result<SocketAddr, Error> {
        if self.addr().is_some() {
            return Err(Error::Local(format!(
                "Cannot start node {} twice",
                self.inner.name
            )));
        }

        let listener = TcpListener::bind(&self.inner.rpc)
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        let addr = listener
            .local_addr()
            .map_err(|e| Error::Network(e.to_string()))?;

        let acceptor = match &self.inner.identity {
            Some(identity) => {
                tracing::info!(
                    node = %self.inner.name,
                    fingerprint = %identity.fingerprint(),
                    "node SSL fingerprint"
                );
                let config =
                    tls::server_config(identity).map_err(|e| Error::Network(e.to_string()))?;
                Some(TlsAcceptor::from(Arc::new(config)))
            }
            None => None,
        };

        tracing::info!(node = %self.inner.name, %addr, "starting node rpc server");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(server::serve(
            listener,
            acceptor,
            self.inner.clone(),
            shutdown_rx,
        ));

        *self.inner.serving.lock().unwrap() = Some(ServeHandle {
            addr,
            shutdown: shutdown_tx,
            task,
        });

        Ok(addr)
    }

    /// Stop the listener and drop all of the client's connections.
    pub async fn shutdown(&self) {
        let handle = self.inner.serving.lock().unwrap().take();

        match handle {
            Some(handle) => {
                tracing::info!(node = %self.inner.name, addr = %handle.addr, "shutdown rpc server");
                let _ = handle.shutdown.send(true);
                let _ = handle.task.await;
                self.client.shutdown();
            }
            None => {
                tracing::debug!(node = %self.inner.name, "node already shut down");
            }
        }
    }
}
