//! The calling side of a service: resolves the service URI through the
//! master, opens a TCPROS connection (cached across calls when persistent),
//! and exchanges success-tagged request/response frames. Calls are strictly
//! serialized: at most one request is in flight per client, the rest wait in
//! a FIFO queue with an optional bound.

use anyhow::{anyhow, bail};
use std::collections::VecDeque;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use tcpros::framing;
use tcpros::header::{self, ConnectionHeader};
use tcpros::message::{to_payload, RosMessage, RosService};

use crate::master::MasterClient;

#[derive(Clone, Debug)]
pub struct ServiceClientOptions {
    /// keep the connection open between calls
    pub persistent: bool,
    /// maximum number of waiting calls; negative means unbounded. When the
    ///  bound is exceeded the OLDEST waiting call is rejected, never the one
    ///  currently in flight.
    pub queue_length: i32,
}

impl Default for ServiceClientOptions {
    fn default() -> ServiceClientOptions {
        ServiceClientOptions {
            persistent: false,
            queue_length: -1,
        }
    }
}

struct PendingCall<S: RosService> {
    request: S::Request,
    reply: oneshot::Sender<anyhow::Result<S::Response>>,
}

/// User-facing handle, created by `NodeHandle::service_client`.
pub struct ServiceClient<S: RosService> {
    service: String,
    queue: mpsc::UnboundedSender<PendingCall<S>>,
}

impl<S: RosService> ServiceClient<S> {
    pub(crate) fn new(service: &str, node_name: &str, opts: ServiceClientOptions, master: MasterClient) -> ServiceClient<S> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_call_worker::<S>(service.to_string(), node_name.to_string(), opts, master, rx));
        ServiceClient {
            service: service.to_string(),
            queue: tx,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub async fn call(&self, request: S::Request) -> anyhow::Result<S::Response> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.queue.send(PendingCall { request, reply: reply_tx })
            .map_err(|_| anyhow!("service client for {:?} is shut down", self.service))?;
        reply_rx.await
            .map_err(|_| anyhow!("service client for {:?} shut down while the call was pending", self.service))?
    }
}

async fn run_call_worker<S: RosService>(
    service: String,
    node_name: String,
    opts: ServiceClientOptions,
    master: MasterClient,
    mut queue: mpsc::UnboundedReceiver<PendingCall<S>>,
) {
    let mut waiting: VecDeque<PendingCall<S>> = VecDeque::new();
    let mut cached: Option<TcpStream> = None;

    loop {
        let head = match waiting.pop_front() {
            Some(head) => head,
            // idle: the next call goes straight to execution, it never
            //  counts against the waiting bound
            None => match queue.recv().await {
                Some(call) => call,
                None => break, // client handle dropped, nothing waiting
            },
        };

        let outcome = execute::<S>(&service, &node_name, &opts, &master, &mut cached, &head.request).await;
        if outcome.is_err() {
            // a persistent socket that produced an error is never reused
            cached = None;
        } else if !opts.persistent {
            cached = None;
        }
        let _ = head.reply.send(outcome);

        // calls that arrived while the head was in flight; the bound applies
        //  to these, oldest first, never to the call that just executed
        while let Ok(call) = queue.try_recv() {
            waiting.push_back(call);
        }
        if opts.queue_length >= 0 {
            while waiting.len() > opts.queue_length as usize {
                let overflow = waiting.pop_front().expect("length was just checked");
                debug!("service call to {:?} dropped by queue overflow", service);
                let _ = overflow.reply.send(Err(anyhow!("service call to {:?} dropped by queue overflow", service)));
            }
        }
    }
}

async fn execute<S: RosService>(
    service: &str,
    node_name: &str,
    opts: &ServiceClientOptions,
    master: &MasterClient,
    cached: &mut Option<TcpStream>,
    request: &S::Request,
) -> anyhow::Result<S::Response> {
    let mut stream = match cached.take() {
        Some(stream) => stream,
        None => connect::<S>(service, node_name, opts, master).await?,
    };

    let payload = to_payload(request)?;
    framing::write_frame(&mut stream, &payload).await?;

    let reply = framing::read_service_reply(&mut stream).await?;
    let response = match reply {
        Ok(bytes) => {
            let mut cursor: &[u8] = &bytes;
            S::Response::try_deser(&mut cursor)?
        }
        Err(errmsg) => bail!("service {:?} failed the call: {}", service, errmsg),
    };

    if opts.persistent {
        *cached = Some(stream);
    }
    Ok(response)
}

/// Resolve through the master, connect and exchange headers.
async fn connect<S: RosService>(
    service: &str,
    node_name: &str,
    opts: &ServiceClientOptions,
    master: &MasterClient,
) -> anyhow::Result<TcpStream> {
    let service_uri = master.lookup_service(service).await?;
    let (host, port) = parse_service_uri(&service_uri)?;

    let mut stream = TcpStream::connect((host.as_str(), port)).await?;

    let request = ConnectionHeader::for_service_call(node_name, service, S::md5sum(), opts.persistent);
    framing::write_frame(&mut stream, &request.ser_fields()).await?;

    let reply_frame = framing::read_frame(&mut stream).await?;
    let reply = ConnectionHeader::try_parse(&reply_frame)?;
    if let Err(error_text) = header::validate_service_reply(&reply, S::md5sum()) {
        warn!("service {:?} rejected the connection: {}", service, error_text);
        bail!("{}", error_text);
    }
    Ok(stream)
}

fn parse_service_uri(uri: &str) -> anyhow::Result<(String, u16)> {
    let rest = uri.strip_prefix("rosrpc://")
        .ok_or_else(|| anyhow!("service URI {:?} does not use the rosrpc scheme", uri))?;
    let rest = rest.trim_end_matches('/');
    let (host, port) = rest.split_once(':')
        .ok_or_else(|| anyhow!("service URI {:?} has no port", uri))?;
    let port: u16 = port.parse()
        .map_err(|_| anyhow!("service URI {:?} has an invalid port", uri))?;
    Ok((host.to_string(), port))
}
