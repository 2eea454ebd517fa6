//! The node's single TCPROS accept loop, shared by all topics and services.
//! Every inbound connection starts with one header frame; a `topic` key
//! routes the socket to the matching publication, a `service` key to the
//! matching service endpoint. The endpoints are looked up by name in the
//! node's registries, so neither side holds the other alive.

use async_trait::async_trait;
use std::sync::Weak;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, warn};

use tcpros::framing;
use tcpros::header::ConnectionHeader;

use crate::node::NodeInner;

/// What a publication or service endpoint exposes to the listener.
#[async_trait]
pub(crate) trait PeerConnectionTarget: Send + Sync {
    /// Take ownership of a freshly accepted socket whose header has been
    ///  read. Validation and the reply header are the target's business.
    async fn handle_inbound(&self, stream: TcpStream, header: ConnectionHeader) -> anyhow::Result<()>;

    /// Stop accepting work; existing peer sockets are torn down.
    fn close(&self);
}

pub(crate) async fn run_peer_listener(listener: TcpListener, node: Weak<NodeInner>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("peer listener accept failed: {}", e);
                continue;
            }
        };

        let node = match node.upgrade() {
            Some(node) => node,
            None => return, // node is gone, stop accepting
        };
        tokio::spawn(async move {
            if let Err(e) = route_connection(stream, node).await {
                warn!("peer connection from {} broke during the handshake: {}", addr, e);
            }
        });
    }
}

async fn route_connection(mut stream: TcpStream, node: std::sync::Arc<NodeInner>) -> anyhow::Result<()> {
    let header_frame = framing::read_frame(&mut stream).await?;
    let header = ConnectionHeader::try_parse(&header_frame)?;

    if let Some(topic) = header.topic() {
        match node.publication_target(topic) {
            Some(target) => return target.handle_inbound(stream, header).await,
            None => return reject(stream, &format!("no publisher for topic {:?} on this node", topic)).await,
        }
    }
    if let Some(service) = header.service() {
        match node.service_target(service) {
            Some(target) => return target.handle_inbound(stream, header).await,
            None => return reject(stream, &format!("no provider for service {:?} on this node", service)).await,
        }
    }
    reject(stream, "connection header carries neither 'topic' nor 'service'").await
}

async fn reject(mut stream: TcpStream, error_text: &str) -> anyhow::Result<()> {
    debug!("rejecting peer connection: {}", error_text);
    let reply = ConnectionHeader::for_error(error_text);
    framing::write_frame(&mut stream, &reply.ser_fields()).await
}
