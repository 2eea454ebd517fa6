//! The serving side of a service: accepts client connections handed over by
//! the peer listener, validates the handshake, and runs the user handler for
//! every request frame. Handler failures travel back to the peer as
//! `0`-tagged responses carrying a short message; they never kill the
//! endpoint.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use tcpros::framing;
use tcpros::header::{self, ConnectionHeader};
use tcpros::message::{to_payload, RosMessage, RosService};

use crate::master::MasterClient;
use crate::node::peer_listener::PeerConnectionTarget;

/// User-facing handle, created by `NodeHandle::advertise_service`.
pub struct ServiceServer {
    service: String,
}

impl ServiceServer {
    pub fn service(&self) -> &str {
        &self.service
    }

    pub(crate) fn new(service: &str) -> ServiceServer {
        ServiceServer { service: service.to_string() }
    }
}

type Handler<S> = dyn Fn(<S as RosService>::Request) -> anyhow::Result<<S as RosService>::Response> + Send + Sync;

pub(crate) struct ServiceEndpoint<S: RosService> {
    service: String,
    node_name: String,
    handler: Box<Handler<S>>,
    shut_down: AtomicBool,
    me: Weak<ServiceEndpoint<S>>,
}

impl<S: RosService> ServiceEndpoint<S> {
    pub(crate) fn new(
        service: &str,
        node_name: &str,
        handler: impl Fn(S::Request) -> anyhow::Result<S::Response> + Send + Sync + 'static,
    ) -> Arc<ServiceEndpoint<S>> {
        Arc::new_cyclic(|me| ServiceEndpoint {
            service: service.to_string(),
            node_name: node_name.to_string(),
            handler: Box::new(handler),
            shut_down: AtomicBool::new(false),
            me: me.clone(),
        })
    }

    pub(crate) async fn register(&self, master: MasterClient, service_uri: String, slave_uri: String) {
        match master.register_service(&self.service, &service_uri, &slave_uri).await {
            Ok(()) => info!("service {:?} registered at {}", self.service, service_uri),
            Err(e) => warn!("failed to register service {:?}: {}", self.service, e),
        }
    }

    /// One request/response exchange. The handler runs on the connection
    ///  task; its error text is what the peer sees.
    async fn serve_one(&self, stream: &mut TcpStream) -> anyhow::Result<bool> {
        let request_frame = match framing::read_frame(stream).await {
            Ok(frame) => frame,
            Err(_) => return Ok(false), // client hung up, a regular end
        };

        let mut cursor: &[u8] = &request_frame;
        let reply = match S::Request::try_deser(&mut cursor) {
            Ok(request) => (self.handler)(request),
            Err(e) => {
                // a request that doesn't parse poisons the connection
                framing::write_service_reply(stream, Err(&format!("malformed request: {}", e))).await?;
                return Ok(false);
            }
        };

        match reply {
            Ok(response) => {
                let payload = to_payload(&response)?;
                framing::write_service_reply(stream, Ok(&payload)).await?;
            }
            Err(e) => {
                debug!("handler for {:?} failed: {}", self.service, e);
                framing::write_service_reply(stream, Err(&e.to_string())).await?;
            }
        }
        Ok(true)
    }
}

#[async_trait]
impl<S: RosService> PeerConnectionTarget for ServiceEndpoint<S> {
    async fn handle_inbound(&self, mut stream: TcpStream, peer_header: ConnectionHeader) -> anyhow::Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            anyhow::bail!("service {:?} is shut down", self.service);
        }

        if let Err(error_text) = header::validate_service_header(&peer_header, &self.service, S::md5sum()) {
            warn!("rejecting service client on {:?}: {}", self.service, error_text);
            let reply = ConnectionHeader::for_error(&error_text);
            framing::write_frame(&mut stream, &reply.ser_fields()).await?;
            return Ok(());
        }

        let reply = ConnectionHeader::for_service_reply(&self.node_name, S::datatype(), S::md5sum());
        framing::write_frame(&mut stream, &reply.ser_fields()).await?;

        let persistent = peer_header.persistent();
        let caller_id = peer_header.caller_id().unwrap_or("(anonymous)").to_string();
        debug!("service client {:?} connected to {:?} (persistent: {})", caller_id, self.service, persistent);

        let endpoint = self.me.upgrade().expect("handle_inbound is only reachable through the Arc");
        tokio::spawn(async move {
            loop {
                match endpoint.serve_one(&mut stream).await {
                    Ok(true) if persistent => continue,
                    Ok(_) => break,
                    Err(e) => {
                        debug!("service connection from {:?} on {:?} broke: {}", caller_id, endpoint.service, e);
                        break;
                    }
                }
            }
        });
        Ok(())
    }

    fn close(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}
