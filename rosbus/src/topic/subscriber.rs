//! The subscribing side of a topic: discovers publishers through the master,
//! opens one peer connection per publisher URI, validates the handshake and
//! feeds decoded messages to the user callback via the spinner.

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use hyper::Uri;
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use tcpros::framing;
use tcpros::header::{self, ConnectionHeader};
use tcpros::message::RosMessage;

use crate::master::xmlrpc::{self, XmlRpcValue};
use crate::master::MasterClient;
use crate::spinner::{SpinClient, Spinner};
use crate::topic::TopicEvent;

#[derive(Clone, Debug)]
pub struct SubscriberOptions {
    /// spinner queue bound; the oldest message is dropped on overflow
    pub queue_size: usize,
    /// negative: run the callback directly on the connection task; zero:
    ///  deliver at the next tick; positive: minimum ms between dispatches
    pub throttle_ms: i64,
    /// ask publishers to set TCP_NODELAY on their side of the socket
    pub tcp_nodelay: bool,
}

impl Default for SubscriberOptions {
    fn default() -> SubscriberOptions {
        SubscriberOptions {
            queue_size: 1,
            throttle_ms: 0,
            tcp_nodelay: false,
        }
    }
}

/// User-facing handle, created by `NodeHandle::subscribe`.
pub struct Subscriber<M: RosMessage> {
    inner: Arc<Subscription<M>>,
}

impl<M: RosMessage> Subscriber<M> {
    pub fn topic(&self) -> &str {
        &self.inner.topic
    }

    pub fn publisher_count(&self) -> usize {
        self.inner.links.read().expect("subscriber lock poisoned").len()
    }

    pub fn events(&self) -> broadcast::Receiver<TopicEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn new(inner: Arc<Subscription<M>>) -> Subscriber<M> {
        Subscriber { inner }
    }
}

pub(crate) struct Subscription<M: RosMessage> {
    topic: String,
    node_name: String,
    opts: SubscriberOptions,
    spin_id: String,
    spinner: Spinner,
    callback: Box<dyn Fn(M) + Send + Sync>,
    /// publisher URI -> link; at most one connection per URI
    links: RwLock<FxHashMap<String, PublisherLink>>,
    next_link_id: AtomicU64,
    shut_down: AtomicBool,
    events: broadcast::Sender<TopicEvent>,
    me: Weak<Subscription<M>>,
}

struct PublisherLink {
    id: u64,
    task: Option<JoinHandle<()>>,
}

impl<M: RosMessage> Subscription<M> {
    pub(crate) fn new(
        topic: &str,
        node_name: &str,
        opts: SubscriberOptions,
        spinner: Spinner,
        callback: impl Fn(M) + Send + Sync + 'static,
    ) -> Arc<Subscription<M>> {
        let spin_id = format!("sub:{}", topic);
        let (events, _) = broadcast::channel(32);

        let subscription = Arc::new_cyclic(|me| Subscription {
            topic: topic.to_string(),
            node_name: node_name.to_string(),
            opts: opts.clone(),
            spin_id: spin_id.clone(),
            spinner: spinner.clone(),
            callback: Box::new(callback),
            links: RwLock::new(FxHashMap::default()),
            next_link_id: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            events,
            me: me.clone(),
        });

        if opts.throttle_ms >= 0 {
            let throttle = Duration::from_millis(opts.throttle_ms as u64);
            spinner.register(&spin_id, opts.queue_size, throttle, subscription.clone());
        }
        subscription
    }

    /// Master registration, run as a spawned task by the node. The returned
    ///  publisher list seeds the connection map.
    pub(crate) async fn register(&self, master: MasterClient, slave_uri: String) {
        match master.register_subscriber(&self.topic, M::datatype(), &slave_uri).await {
            Ok(publisher_uris) => {
                info!("subscriber for {:?} registered, {} publisher(s) known", self.topic, publisher_uris.len());
                let _ = self.events.send(TopicEvent::Registered);
                self.update_publishers(publisher_uris);
            }
            Err(e) => {
                warn!("failed to register subscriber for {:?}: {}", self.topic, e);
            }
        }
    }

    /// Reconcile the connection map against the publisher list currently
    ///  known to the master: connect to new URIs, drop connections to
    ///  removed ones. Also invoked for the master's `publisherUpdate`.
    pub(crate) fn update_publishers(&self, publisher_uris: Vec<String>) {
        if self.shut_down.load(Ordering::SeqCst) {
            return;
        }
        let mut links = self.links.write().expect("subscriber lock poisoned");

        let removed: Vec<String> = links.keys()
            .filter(|uri| !publisher_uris.contains(uri))
            .cloned()
            .collect();
        for uri in removed {
            if let Some(link) = links.remove(&uri) {
                debug!("publisher {:?} no longer advertises {:?}, closing", uri, self.topic);
                if let Some(task) = link.task {
                    task.abort();
                }
                let _ = self.events.send(TopicEvent::Disconnect { peer: uri });
            }
        }

        for uri in publisher_uris {
            if links.contains_key(&uri) {
                continue;
            }
            let link_id = self.next_link_id.fetch_add(1, Ordering::Relaxed);
            links.insert(uri.clone(), PublisherLink { id: link_id, task: None });

            let subscription = self.me.upgrade().expect("update_publishers is only reachable through the Arc");
            let task = tokio::spawn(run_publisher_link(subscription, uri.clone(), link_id));
            if let Some(link) = links.get_mut(&uri) {
                if link.id == link_id {
                    link.task = Some(task);
                }
            }
        }
    }

    fn remove_link(&self, pub_uri: &str, link_id: u64) {
        let mut links = self.links.write().expect("subscriber lock poisoned");
        if links.get(pub_uri).map(|link| link.id) == Some(link_id) {
            links.remove(pub_uri);
        }
    }

    fn dispatch_one(&self, frame: &Bytes) {
        let mut cursor: &[u8] = frame;
        match M::try_deser(&mut cursor) {
            Ok(msg) => (self.callback)(msg),
            // a bad frame is dropped, the connection stays
            Err(e) => warn!("dropping a message on {:?} that failed to deserialize: {}", self.topic, e),
        }
    }

    pub(crate) fn close(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        let mut links = self.links.write().expect("subscriber lock poisoned");
        for (_, link) in links.drain() {
            if let Some(task) = link.task {
                task.abort();
            }
        }
        self.spinner.deregister(&self.spin_id);
    }
}

impl<M: RosMessage> crate::node::SubscriptionHandle for Subscription<M> {
    fn update_publishers(&self, uris: Vec<String>) {
        Subscription::update_publishers(self, uris);
    }

    fn close(&self) {
        Subscription::close(self);
    }
}

#[async_trait]
impl<M: RosMessage> SpinClient for Subscription<M> {
    async fn dispatch_batch(&self, batch: Vec<Bytes>) {
        for frame in &batch {
            self.dispatch_one(frame);
        }
    }
}

/// Connection task for one publisher URI: negotiate the transport via the
///  publisher's slave API, handshake over TCPROS, then stream frames until
///  the connection ends. A connection refused by the publisher (`error=`
///  reply) is not retried until the next publisher update.
async fn run_publisher_link<M: RosMessage>(subscription: Arc<Subscription<M>>, pub_uri: String, link_id: u64) {
    match stream_from_publisher(&subscription, &pub_uri).await {
        Ok(()) => debug!("connection to publisher {:?} for {:?} closed", pub_uri, subscription.topic),
        Err(e) => warn!("connection to publisher {:?} for {:?} broke: {}", pub_uri, subscription.topic, e),
    }
    subscription.remove_link(&pub_uri, link_id);
}

async fn stream_from_publisher<M: RosMessage>(subscription: &Subscription<M>, pub_uri: &str) -> anyhow::Result<()> {
    let (host, port) = request_topic(pub_uri, &subscription.node_name, &subscription.topic).await?;

    let mut stream = TcpStream::connect((host.as_str(), port)).await?;
    if subscription.opts.tcp_nodelay {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("could not set TCP_NODELAY towards {:?}: {}", pub_uri, e);
        }
    }

    let request = ConnectionHeader::for_subscription(
        &subscription.node_name,
        &subscription.topic,
        M::datatype(),
        M::md5sum(),
        M::message_definition(),
        subscription.opts.tcp_nodelay,
    );
    framing::write_frame(&mut stream, &request.ser_fields()).await?;

    let reply_frame = framing::read_frame(&mut stream).await?;
    let reply = ConnectionHeader::try_parse(&reply_frame)?;
    if let Err(error_text) = header::validate_publisher_reply(&reply, M::md5sum()) {
        // no message may be delivered from a connection that failed validation
        warn!("rejecting publisher {:?} for {:?}: {}", pub_uri, subscription.topic, error_text);
        return Ok(());
    }

    let peer = reply.caller_id().unwrap_or(pub_uri).to_string();
    debug!("connected to publisher {:?} for {:?}", peer, subscription.topic);
    let _ = subscription.events.send(TopicEvent::Connection { peer: peer.clone() });

    loop {
        let frame = match framing::read_frame(&mut stream).await {
            Ok(frame) => frame,
            Err(_) => break, // end of stream or socket error; the link is removed either way
        };
        if subscription.opts.throttle_ms < 0 {
            subscription.dispatch_one(&frame);
        } else {
            subscription.spinner.ping(&subscription.spin_id, frame);
        }
    }

    let _ = subscription.events.send(TopicEvent::Disconnect { peer });
    Ok(())
}

/// Ask the publishing node's slave API for transport parameters. This is a
///  direct one-shot RPC to the peer, deliberately outside the master queue.
async fn request_topic(pub_uri: &str, caller_id: &str, topic: &str) -> anyhow::Result<(String, u16)> {
    let uri: Uri = pub_uri.parse()
        .map_err(|e| anyhow!("invalid publisher URI {:?}: {}", pub_uri, e))?;

    let params = [
        XmlRpcValue::string(caller_id),
        XmlRpcValue::string(topic),
        XmlRpcValue::Array(vec![XmlRpcValue::Array(vec![XmlRpcValue::string("TCPROS")])]),
    ];
    let response = xmlrpc::call_xmlrpc(&uri, "requestTopic", &params).await?;
    let value = xmlrpc::try_unwrap_status(response)?;

    let fields = value.into_array()?;
    if fields.len() != 3 {
        bail!("requestTopic returned an unusable protocol description: {:?}", fields);
    }
    if fields[0].as_str()? != "TCPROS" {
        bail!("publisher {:?} offered an unsupported protocol {:?}", pub_uri, fields[0]);
    }
    let host = fields[1].as_str()?.to_string();
    let port = u16::try_from(fields[2].as_i32()?)
        .map_err(|_| anyhow!("requestTopic returned an invalid port"))?;
    Ok((host, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::std_msgs;
    use std::sync::Mutex;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio::time::sleep;

    fn collecting_subscription(topic: &str, opts: SubscriberOptions) -> (Arc<Subscription<std_msgs::String>>, Arc<Mutex<Vec<String>>>) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let spinner = Spinner::start(200);
        let subscription = Subscription::<std_msgs::String>::new(
            topic, "/listener", opts, spinner,
            move |msg: std_msgs::String| sink.lock().unwrap().push(msg.data),
        );
        (subscription, received)
    }

    /// a TCPROS-side-only fake publisher: accepts one connection, answers the
    ///  handshake with the given header, then sends the prepared frames
    async fn fake_publisher_socket(reply: ConnectionHeader, frames: Vec<Bytes>) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _request = framing::read_frame(&mut stream).await.unwrap();
            framing::write_frame(&mut stream, &reply.ser_fields()).await.unwrap();
            for frame in frames {
                framing::write_frame(&mut stream, &frame).await.unwrap();
            }
            // hold the connection open long enough for the test to observe
            sleep(Duration::from_secs(60)).await;
            let _ = stream.shutdown().await;
        });
        addr
    }

    fn frame_of(data: &str) -> Bytes {
        tcpros::message::to_payload(&std_msgs::String { data: data.to_string() }).unwrap()
    }

    fn ok_reply() -> ConnectionHeader {
        ConnectionHeader::for_publisher_reply(
            "/talker", std_msgs::String::datatype(), std_msgs::String::md5sum(), "", false)
    }

    async fn wait_for<F: Fn() -> bool>(condition: F) {
        for _ in 0..100 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("condition not reached within the deadline");
    }

    #[tokio::test]
    async fn test_messages_flow_to_callback() {
        let (subscription, received) = collecting_subscription("/chatter", Default::default());
        let addr = fake_publisher_socket(ok_reply(), vec![frame_of("one")]).await;

        // connect at the TCPROS level directly; URI negotiation has its own test
        let sub = subscription.clone();
        tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            drive_handshake_and_stream(&sub, stream).await;
        });

        wait_for(|| received.lock().unwrap().len() == 1).await;
        assert_eq!(received.lock().unwrap().as_slice(), &["one".to_string()]);
    }

    async fn drive_handshake_and_stream(subscription: &Arc<Subscription<std_msgs::String>>, mut stream: TcpStream) {
        let request = ConnectionHeader::for_subscription(
            "/listener", &subscription.topic, std_msgs::String::datatype(), std_msgs::String::md5sum(), "", false);
        framing::write_frame(&mut stream, &request.ser_fields()).await.unwrap();
        let reply_frame = framing::read_frame(&mut stream).await.unwrap();
        let reply = ConnectionHeader::try_parse(&reply_frame).unwrap();
        if header::validate_publisher_reply(&reply, std_msgs::String::md5sum()).is_err() {
            return;
        }
        while let Ok(frame) = framing::read_frame(&mut stream).await {
            subscription.spinner.ping(&subscription.spin_id, frame);
        }
    }

    #[tokio::test]
    async fn test_no_messages_after_failed_md5_validation() {
        let (subscription, received) = collecting_subscription("/chatter", Default::default());
        let bad_reply = ConnectionHeader::for_publisher_reply(
            "/talker", std_msgs::String::datatype(), "0000deadbeef", "", false);
        let addr = fake_publisher_socket(bad_reply, vec![frame_of("poison")]).await;

        let sub = subscription.clone();
        tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            drive_handshake_and_stream(&sub, stream).await;
        });

        sleep(Duration::from_millis(300)).await;
        assert!(received.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_undeserializable_frame_dropped_connection_kept() {
        let (subscription, received) = collecting_subscription("/chatter", Default::default());
        // a frame claiming an 8-byte string but carrying none
        let bad_frame = Bytes::from_static(b"\x08\0\0\0");
        let addr = fake_publisher_socket(ok_reply(), vec![bad_frame, frame_of("good")]).await;

        let sub = subscription.clone();
        tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            drive_handshake_and_stream(&sub, stream).await;
        });

        wait_for(|| received.lock().unwrap().len() == 1).await;
        assert_eq!(received.lock().unwrap().as_slice(), &["good".to_string()]);
    }

    #[tokio::test]
    async fn test_update_publishers_reconciles() {
        let (subscription, _received) = collecting_subscription("/chatter", Default::default());

        subscription.update_publishers(vec!["http://a:1/".to_string()]);
        assert_eq!(subscription.links.read().unwrap().len(), 1);

        // U1 kept, U2 added
        subscription.update_publishers(vec!["http://a:1/".to_string(), "http://b:2/".to_string()]);
        {
            let links = subscription.links.read().unwrap();
            assert_eq!(links.len(), 2);
            assert!(links.contains_key("http://a:1/"));
            assert!(links.contains_key("http://b:2/"));
        }
        let id_b = subscription.links.read().unwrap().get("http://b:2/").unwrap().id;

        // U1 dropped, U2 kept with its connection untouched
        subscription.update_publishers(vec!["http://b:2/".to_string()]);
        {
            let links = subscription.links.read().unwrap();
            assert_eq!(links.len(), 1);
            assert_eq!(links.get("http://b:2/").unwrap().id, id_b);
        }
    }

    #[tokio::test]
    async fn test_close_clears_links_and_ignores_updates() {
        let (subscription, _received) = collecting_subscription("/chatter", Default::default());
        subscription.update_publishers(vec!["http://a:1/".to_string()]);

        subscription.close();
        assert!(subscription.links.read().unwrap().is_empty());

        subscription.update_publishers(vec!["http://b:2/".to_string()]);
        assert!(subscription.links.read().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_synchronous_dispatch_without_spinner() {
        let opts = SubscriberOptions { throttle_ms: -1, ..Default::default() };
        let (subscription, received) = collecting_subscription("/chatter", opts);

        subscription.dispatch_one(&frame_of("direct"));
        assert_eq!(received.lock().unwrap().as_slice(), &["direct".to_string()]);
    }
}
