//! The publishing side of a topic: owns the sockets of subscribers that
//! connected through the node's peer listener, broadcasts serialized
//! messages to all of them, and optionally latches the last message for
//! late joiners.

use async_trait::async_trait;
use bytes::Bytes;
use rustc_hash::FxHashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::select;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

use tcpros::framing;
use tcpros::header::{self, ConnectionHeader};
use tcpros::message::{to_payload, RosMessage};

use crate::master::MasterClient;
use crate::node::peer_listener::PeerConnectionTarget;
use crate::spinner::{SpinClient, Spinner};
use crate::topic::{RegistrationState, TopicEvent};

#[derive(Clone, Debug)]
pub struct PublisherOptions {
    /// spinner queue bound; the oldest message is dropped on overflow
    pub queue_size: usize,
    /// negative: bypass the spinner and write inside `publish()`; zero:
    ///  deliver at the next tick; positive: minimum ms between dispatches
    pub throttle_ms: i64,
    /// deliver the last published message to every newly connecting subscriber
    pub latching: bool,
    pub tcp_nodelay: bool,
}

impl Default for PublisherOptions {
    fn default() -> PublisherOptions {
        PublisherOptions {
            queue_size: 1,
            throttle_ms: 0,
            latching: false,
            tcp_nodelay: false,
        }
    }
}

/// User-facing handle, created by `NodeHandle::advertise`.
#[derive(Clone)]
pub struct Publisher<M: RosMessage> {
    inner: Arc<Publication<M>>,
}

impl<M: RosMessage> Publisher<M> {
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    /// Serialize once and fan out to every connected subscriber, either
    ///  synchronously (negative throttle) or via the spinner.
    pub fn publish(&self, msg: &M) -> anyhow::Result<()> {
        self.inner.publish(msg)
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.links.read().expect("publisher lock poisoned").len()
    }

    pub fn events(&self) -> broadcast::Receiver<TopicEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn new(inner: Arc<Publication<M>>) -> Publisher<M> {
        Publisher { inner }
    }
}

pub(crate) struct Publication<M: RosMessage> {
    topic: String,
    node_name: String,
    opts: PublisherOptions,
    spin_id: String,
    spinner: Spinner,
    state: RwLock<RegistrationState>,
    links: RwLock<FxHashMap<u64, SubscriberLink>>,
    next_link_id: AtomicU64,
    latched: RwLock<Option<Bytes>>,
    events: broadcast::Sender<TopicEvent>,
    me: Weak<Publication<M>>,
    _marker: PhantomData<fn() -> M>,
}

struct SubscriberLink {
    caller_id: String,
    frames: mpsc::UnboundedSender<Bytes>,
}

impl<M: RosMessage> Publication<M> {
    pub(crate) fn new(topic: &str, node_name: &str, opts: PublisherOptions, spinner: Spinner) -> Arc<Publication<M>> {
        let spin_id = format!("pub:{}", topic);
        let (events, _) = broadcast::channel(32);

        let publication = Arc::new_cyclic(|me| Publication {
            topic: topic.to_string(),
            node_name: node_name.to_string(),
            opts: opts.clone(),
            spin_id: spin_id.clone(),
            spinner: spinner.clone(),
            state: RwLock::new(RegistrationState::Unregistered),
            links: RwLock::new(FxHashMap::default()),
            next_link_id: AtomicU64::new(0),
            latched: RwLock::new(None),
            events,
            me: me.clone(),
            _marker: PhantomData,
        });

        if opts.throttle_ms >= 0 {
            let throttle = Duration::from_millis(opts.throttle_ms as u64);
            spinner.register(&spin_id, opts.queue_size, throttle, publication.clone());
        }
        publication
    }

    /// Master registration, run as a spawned task by the node.
    pub(crate) async fn register(&self, master: MasterClient, slave_uri: String) {
        *self.state.write().expect("publisher lock poisoned") = RegistrationState::Registering;

        match master.register_publisher(&self.topic, M::datatype(), &slave_uri).await {
            Ok(_current_subscribers) => {
                // subscribers reach us through requestTopic; the returned list needs no action
                let mut state = self.state.write().expect("publisher lock poisoned");
                if *state != RegistrationState::Shutdown {
                    *state = RegistrationState::Ready;
                    drop(state);
                    info!("publisher for {:?} registered", self.topic);
                    let _ = self.events.send(TopicEvent::Registered);
                }
            }
            Err(e) => {
                warn!("failed to register publisher for {:?}: {}", self.topic, e);
            }
        }
    }

    fn publish(&self, msg: &M) -> anyhow::Result<()> {
        if *self.state.read().expect("publisher lock poisoned") == RegistrationState::Shutdown {
            anyhow::bail!("publisher for {:?} is shut down", self.topic);
        }

        let payload = to_payload(msg)?;
        if self.opts.latching {
            *self.latched.write().expect("publisher lock poisoned") = Some(payload.clone());
        }

        if self.opts.throttle_ms < 0 {
            self.fan_out(&payload);
        } else {
            self.spinner.ping(&self.spin_id, payload);
        }
        Ok(())
    }

    fn fan_out(&self, payload: &Bytes) {
        let links = self.links.read().expect("publisher lock poisoned");
        for link in links.values() {
            // a closed link is cleaned up by its own writer task
            let _ = link.frames.send(payload.clone());
        }
    }

    fn remove_link(&self, link_id: u64) {
        let removed = self.links.write().expect("publisher lock poisoned").remove(&link_id);
        if let Some(link) = removed {
            debug!("subscriber {:?} disconnected from {:?}", link.caller_id, self.topic);
            let _ = self.events.send(TopicEvent::Disconnect { peer: link.caller_id });
        }
    }

    pub(crate) fn close(&self) {
        *self.state.write().expect("publisher lock poisoned") = RegistrationState::Shutdown;
        // dropping the senders ends the writer tasks
        self.links.write().expect("publisher lock poisoned").clear();
        self.spinner.deregister(&self.spin_id);
    }
}

#[async_trait]
impl<M: RosMessage> SpinClient for Publication<M> {
    async fn dispatch_batch(&self, batch: Vec<Bytes>) {
        for payload in &batch {
            self.fan_out(payload);
        }
    }
}

#[async_trait]
impl<M: RosMessage> PeerConnectionTarget for Publication<M> {
    /// A subscriber connected through the peer listener: validate its header,
    ///  reply, then hand the socket to a writer task.
    async fn handle_inbound(&self, mut stream: TcpStream, peer_header: ConnectionHeader) -> anyhow::Result<()> {
        if *self.state.read().expect("publisher lock poisoned") == RegistrationState::Shutdown {
            anyhow::bail!("publisher for {:?} is shut down", self.topic);
        }

        if let Err(error_text) = header::validate_subscriber_header(&peer_header, &self.topic, M::md5sum()) {
            warn!("rejecting subscriber on {:?}: {}", self.topic, error_text);
            let reply = ConnectionHeader::for_error(&error_text);
            framing::write_frame(&mut stream, &reply.ser_fields()).await?;
            return Ok(());
        }

        let reply = ConnectionHeader::for_publisher_reply(
            &self.node_name, M::datatype(), M::md5sum(), M::message_definition(), self.opts.latching);
        framing::write_frame(&mut stream, &reply.ser_fields()).await?;

        if self.opts.tcp_nodelay || peer_header.tcp_nodelay() {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("could not set TCP_NODELAY for a subscriber of {:?}: {}", self.topic, e);
            }
        }

        let caller_id = peer_header.caller_id().unwrap_or("(anonymous)").to_string();
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();

        if let Some(latched) = self.latched.read().expect("publisher lock poisoned").clone() {
            let _ = frames_tx.send(latched);
        }

        let link_id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
        self.links.write().expect("publisher lock poisoned").insert(link_id, SubscriberLink {
            caller_id: caller_id.clone(),
            frames: frames_tx,
        });

        debug!("subscriber {:?} connected to {:?}", caller_id, self.topic);
        let _ = self.events.send(TopicEvent::Connection { peer: caller_id });

        let publication = self.me.upgrade().expect("handle_inbound is only reachable through the Arc");
        tokio::spawn(run_subscriber_link(publication, link_id, stream, frames_rx));
        Ok(())
    }

    fn close(&self) {
        Publication::close(self);
    }
}

/// Writer task for one connected subscriber. Ends when the publication drops
///  the link, the peer closes, or a write fails; a failure affects only this
///  subscriber.
async fn run_subscriber_link<M: RosMessage>(
    publication: Arc<Publication<M>>,
    link_id: u64,
    mut stream: TcpStream,
    mut frames: mpsc::UnboundedReceiver<Bytes>,
) {
    let mut scratch = [0u8; 256];
    loop {
        select! {
            frame = frames.recv() => {
                match frame {
                    Some(frame) => {
                        if let Err(e) = framing::write_frame(&mut stream, &frame).await {
                            warn!("write to a subscriber of {:?} failed, dropping it: {}", publication.topic, e);
                            break;
                        }
                    }
                    None => break, // publication closed the link
                }
            }
            read = stream.read(&mut scratch) => {
                match read {
                    Ok(0) => break, // peer closed
                    Ok(_) => {}     // subscribers don't send payload after the handshake
                    Err(e) => {
                        debug!("subscriber socket on {:?} errored: {}", publication.topic, e);
                        break;
                    }
                }
            }
        }
    }
    publication.remove_link(link_id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::std_msgs;
    use tokio::net::TcpListener;
    use tokio::time::{sleep, timeout};

    async fn connected_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn string_msg(data: &str) -> std_msgs::String {
        std_msgs::String { data: data.to_string() }
    }

    async fn subscribe_handshake(publication: &Arc<Publication<std_msgs::String>>, md5: &str) -> TcpStream {
        let (mut sub_side, pub_side) = connected_pair().await;

        let header = ConnectionHeader::for_subscription(
            "/listener", &publication.topic, std_msgs::String::datatype(), md5, "", false);
        publication.handle_inbound(pub_side, header).await.unwrap();

        let reply_frame = framing::read_frame(&mut sub_side).await.unwrap();
        let reply = ConnectionHeader::try_parse(&reply_frame).unwrap();
        assert!(reply.error().is_none(), "handshake rejected: {:?}", reply.error());
        sub_side
    }

    #[tokio::test]
    async fn test_publish_reaches_connected_subscriber() {
        let spinner = Spinner::start(200);
        let publication = Publication::<std_msgs::String>::new("/chatter", "/talker", Default::default(), spinner);

        let mut sub_side = subscribe_handshake(&publication, std_msgs::String::md5sum()).await;
        publication.publish(&string_msg("hi")).unwrap();

        let frame = timeout(Duration::from_secs(5), framing::read_frame(&mut sub_side)).await.unwrap().unwrap();
        let mut cursor: &[u8] = &frame;
        let msg = std_msgs::String::try_deser(&mut cursor).unwrap();
        assert_eq!(msg.data, "hi");
    }

    #[tokio::test]
    async fn test_md5_mismatch_answers_error_header() {
        let spinner = Spinner::start(200);
        let publication = Publication::<std_msgs::String>::new("/chatter", "/talker", Default::default(), spinner);

        let (mut sub_side, pub_side) = connected_pair().await;
        let header = ConnectionHeader::for_subscription(
            "/listener", "/chatter", std_msgs::String::datatype(), "0000deadbeef", "", false);
        publication.handle_inbound(pub_side, header).await.unwrap();

        let reply_frame = framing::read_frame(&mut sub_side).await.unwrap();
        let reply = ConnectionHeader::try_parse(&reply_frame).unwrap();
        assert!(reply.error().unwrap().contains("md5sum mismatch"));
        assert_eq!(publication.links.read().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_latched_message_replayed_to_late_subscriber() {
        let spinner = Spinner::start(200);
        let opts = PublisherOptions { latching: true, ..Default::default() };
        let publication = Publication::<std_msgs::String>::new("/map", "/mapper", opts, spinner);

        publication.publish(&string_msg("A")).unwrap();
        sleep(Duration::from_millis(100)).await;

        let mut late = subscribe_handshake(&publication, std_msgs::String::md5sum()).await;
        let frame = timeout(Duration::from_secs(5), framing::read_frame(&mut late)).await.unwrap().unwrap();
        let mut cursor: &[u8] = &frame;
        assert_eq!(std_msgs::String::try_deser(&mut cursor).unwrap().data, "A");
    }

    #[tokio::test]
    async fn test_subscriber_close_drops_only_that_link() {
        let spinner = Spinner::start(200);
        let publication = Publication::<std_msgs::String>::new("/chatter", "/talker", Default::default(), spinner);

        let first = subscribe_handshake(&publication, std_msgs::String::md5sum()).await;
        let mut second = subscribe_handshake(&publication, std_msgs::String::md5sum()).await;
        assert_eq!(publication.links.read().unwrap().len(), 2);

        drop(first);
        // the writer task notices the close
        for _ in 0..50 {
            if publication.links.read().unwrap().len() == 1 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(publication.links.read().unwrap().len(), 1);

        publication.publish(&string_msg("still here")).unwrap();
        let frame = timeout(Duration::from_secs(5), framing::read_frame(&mut second)).await.unwrap().unwrap();
        let mut cursor: &[u8] = &frame;
        assert_eq!(std_msgs::String::try_deser(&mut cursor).unwrap().data, "still here");
    }

    #[tokio::test]
    async fn test_publish_after_close_fails() {
        let spinner = Spinner::start(200);
        let publication = Publication::<std_msgs::String>::new("/chatter", "/talker", Default::default(), spinner);
        publication.close();
        assert!(publication.publish(&string_msg("x")).is_err());
    }

    #[tokio::test]
    async fn test_synchronous_publish_bypasses_spinner() {
        let spinner = Spinner::start(200);
        let opts = PublisherOptions { throttle_ms: -1, ..Default::default() };
        let publication = Publication::<std_msgs::String>::new("/chatter", "/talker", opts, spinner);

        let mut sub_side = subscribe_handshake(&publication, std_msgs::String::md5sum()).await;
        publication.publish(&string_msg("direct")).unwrap();

        let frame = timeout(Duration::from_secs(5), framing::read_frame(&mut sub_side)).await.unwrap().unwrap();
        let mut cursor: &[u8] = &frame;
        assert_eq!(std_msgs::String::try_deser(&mut cursor).unwrap().data, "direct");
    }
}
