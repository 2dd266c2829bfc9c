use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_rustls::TlsAcceptor;

use super::messages::{read_frame, write_frame, Call, Reply, Request, WireError, WireResult};
use super::{auth_token, AsyncStream, NodeInner};

/// Accept loop for a node's RPC listener. Runs until the shutdown
/// signal fires; every accepted connection gets its own task.
pub(crate) async fn serve(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    node: Arc<NodeInner>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!(node = %node.name, %peer, "accepted connection");
                        tokio::spawn(handle_connection(
                            stream,
                            acceptor.clone(),
                            node.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(node = %node.name, error = %e, "accept failed");
                    }
                }
            }
        }
    }

    tracing::info!(node = %node.name, "rpc server stopped");
}

/// Serve requests on one connection until the peer goes away or the
/// node shuts down. Requests on a connection are handled in order,
/// which serialises operations per branch.
async fn handle_connection(
    stream: TcpStream,
    acceptor: Option<TlsAcceptor>,
    node: Arc<NodeInner>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut stream: Box<dyn AsyncStream> = match acceptor {
        Some(acceptor) => match acceptor.accept(stream).await {
            Ok(tls) => Box::new(tls),
            Err(e) => {
                tracing::debug!(node = %node.name, error = %e, "tls handshake failed");
                return;
            }
        },
        None => Box::new(stream),
    };

    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = read_frame(&mut stream) => frame,
        };

        let bytes = match frame {
            Ok(bytes) => bytes,
            // Peer closed the connection; normal end of session
            Err(_) => break,
        };

        let result: WireResult = match bincode::deserialize::<Request>(&bytes) {
            Ok(request) => dispatch(&node, request),
            Err(e) => Err(WireError::Handler(format!(
                "Failed to decode request: {}",
                e
            ))),
        };

        let payload = match bincode::serialize(&result) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(node = %node.name, error = %e, "failed to encode reply");
                break;
            }
        };

        if write_frame(&mut stream, &payload).await.is_err() {
            break;
        }
    }
}

/// Verify the token and route the call.
fn dispatch(node: &NodeInner, request: Request) -> WireResult {
    check_token(node, &request)?;

    match request.call {
        Call::Ping => {
            tracing::debug!(node = %node.name, caller = %request.token.node_name, "ping");
            Ok(Reply::Pong(vec!["Pong".to_string()]))
        }
        Call::Data { ctrl, data } => {
            let handler = node.handler.read().unwrap().clone();

            match handler {
                Some(handler) => handler
                    .handle(ctrl, data)
                    .map(Reply::Data)
                    .map_err(WireError::Handler),
                // A node without a handler answers with an empty payload
                None => Ok(Reply::Data(Vec::new())),
            }
        }
    }
}

/// Check the caller's token against this node.
///
/// The expected auth is recomputed from the claimed caller name and
/// the target's own secret; only a caller knowing the secret can have
/// produced a matching token.
fn check_token(node: &NodeInner, request: &Request) -> Result<(), WireError> {
    if request.target != node.name {
        return Err(WireError::UnknownTarget);
    }

    let expected = auth_token(&request.token.node_name, &node.secret);
    if request.token.node_auth != expected {
        tracing::warn!(
            node = %node.name,
            caller = %request.token.node_name,
            "rejected request with invalid token"
        );
        return Err(WireError::InvalidToken);
    }

    Ok(())
}
