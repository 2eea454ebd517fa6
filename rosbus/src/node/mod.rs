//! The per-process node runtime: identity, the two listen sockets (TCPROS
//! peer listener and XML-RPC slave server), the master call queue, the
//! spinner, and the registries that own every publisher, subscriber and
//! service endpoint by name.

pub mod names;
pub(crate) mod peer_listener;
pub(crate) mod slave_api;

use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{info, warn};

use tcpros::message::{RosMessage, RosService};

use crate::master::MasterClient;
use crate::node::peer_listener::PeerConnectionTarget;
use crate::service::client::{ServiceClient, ServiceClientOptions};
use crate::service::server::{ServiceEndpoint, ServiceServer};
use crate::spinner::{Spinner, DEFAULT_SPIN_RATE_HZ};
use crate::topic::publisher::{Publication, Publisher, PublisherOptions};
use crate::topic::subscriber::{Subscriber, SubscriberOptions, Subscription};

/// How long shutdown waits for each best-effort unregistration before
///  abandoning the attempt.
const UNREGISTER_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Debug)]
pub struct NodeOptions {
    /// global node name, e.g. `/talker`
    pub name: String,
    /// master endpoint; falls back to `ROS_MASTER_URI`
    pub master_uri: Option<String>,
    /// host advertised to peers; falls back to `ROS_HOSTNAME`, then
    ///  `ROS_IP`, then `localhost`
    pub hostname: Option<String>,
    /// inclusive port range for the two listen sockets; ephemeral when unset
    pub port_range: Option<(u16, u16)>,
    pub spin_rate_hz: u32,
}

impl NodeOptions {
    pub fn new(name: &str) -> NodeOptions {
        NodeOptions {
            name: name.to_string(),
            master_uri: None,
            hostname: None,
            port_range: None,
            spin_rate_hz: DEFAULT_SPIN_RATE_HZ,
        }
    }
}

/// Initialize the node: bind both servers, start the master queue and the
///  spinner. Registration with the master happens lazily, per endpoint.
pub async fn init(opts: NodeOptions) -> anyhow::Result<NodeHandle> {
    names::validate_node_name(&opts.name)?;

    let master_uri = opts.master_uri.clone()
        .or_else(|| std::env::var("ROS_MASTER_URI").ok())
        .ok_or_else(|| anyhow!("no master endpoint: set NodeOptions::master_uri or the ROS_MASTER_URI environment variable"))?;
    let host = opts.hostname.clone()
        .or_else(|| std::env::var("ROS_HOSTNAME").ok())
        .or_else(|| std::env::var("ROS_IP").ok())
        .unwrap_or_else(|| "localhost".to_string());

    // both servers are up before anything is announced to the master
    let tcpros_listener = bind_in_range(opts.port_range).await?;
    let slave_listener = bind_in_range(opts.port_range).await?;
    let tcpros_port = tcpros_listener.local_addr()?.port();
    let slave_port = slave_listener.local_addr()?.port();
    let slave_uri = format!("http://{}:{}/", host, slave_port);

    let (master, master_worker) = MasterClient::new(&master_uri, &opts.name)?;
    let spinner = Spinner::start(opts.spin_rate_hz);

    let inner = Arc::new(NodeInner {
        name: opts.name.clone(),
        pid: std::process::id(),
        host,
        master_uri,
        slave_uri,
        tcpros_port,
        master,
        spinner,
        publications: RwLock::new(FxHashMap::default()),
        subscriptions: RwLock::new(FxHashMap::default()),
        services: RwLock::new(FxHashMap::default()),
        shut_down: AtomicBool::new(false),
        tasks: Mutex::new(Vec::new()),
    });

    let listener_task = tokio::spawn(peer_listener::run_peer_listener(tcpros_listener, Arc::downgrade(&inner)));
    let slave_task = tokio::spawn(slave_api::run_slave_server(slave_listener, Arc::downgrade(&inner)));
    inner.track_task(listener_task);
    inner.track_task(slave_task);
    inner.track_task(master_worker);

    info!("node {} is up: slave API at {}, TCPROS on port {}", inner.name, inner.slave_uri, tcpros_port);
    Ok(NodeHandle { inner })
}

async fn bind_in_range(range: Option<(u16, u16)>) -> anyhow::Result<TcpListener> {
    match range {
        None => Ok(TcpListener::bind(("0.0.0.0", 0)).await?),
        Some((lo, hi)) => {
            for port in lo..=hi {
                if let Ok(listener) = TcpListener::bind(("0.0.0.0", port)).await {
                    return Ok(listener);
                }
            }
            bail!("no free port in the configured range {}..={}", lo, hi)
        }
    }
}

/// The user-facing node API. Cloning shares the node.
#[derive(Clone)]
pub struct NodeHandle {
    inner: Arc<NodeInner>,
}

impl NodeHandle {
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// this node's slave API endpoint
    pub fn uri(&self) -> &str {
        &self.inner.slave_uri
    }

    pub fn master_uri(&self) -> &str {
        &self.inner.master_uri
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shut_down.load(Ordering::SeqCst)
    }

    pub async fn advertise<M: RosMessage>(&self, topic: &str, opts: PublisherOptions) -> anyhow::Result<Publisher<M>> {
        self.inner.ensure_running()?;
        let topic = names::resolve(topic)?;

        let publication = {
            let mut publications = self.inner.publications.write().expect("node lock poisoned");
            if publications.contains_key(&topic) {
                bail!("topic {:?} is already advertised by this node", topic);
            }
            let publication = Publication::<M>::new(&topic, &self.inner.name, opts, self.inner.spinner.clone());
            publications.insert(topic.clone(), EndpointEntry {
                datatype: M::datatype().to_string(),
                target: publication.clone(),
            });
            publication
        };

        let master = self.inner.master.clone();
        let slave_uri = self.inner.slave_uri.clone();
        let registering = publication.clone();
        self.inner.track_task(tokio::spawn(async move {
            registering.register(master, slave_uri).await;
        }));

        Ok(Publisher::new(publication))
    }

    pub async fn subscribe<M: RosMessage>(
        &self,
        topic: &str,
        opts: SubscriberOptions,
        callback: impl Fn(M) + Send + Sync + 'static,
    ) -> anyhow::Result<Subscriber<M>> {
        self.inner.ensure_running()?;
        let topic = names::resolve(topic)?;

        let subscription = {
            let mut subscriptions = self.inner.subscriptions.write().expect("node lock poisoned");
            if subscriptions.contains_key(&topic) {
                bail!("this node already subscribes to {:?}", topic);
            }
            let subscription = Subscription::<M>::new(&topic, &self.inner.name, opts, self.inner.spinner.clone(), callback);
            subscriptions.insert(topic.clone(), SubscriptionEntry {
                datatype: M::datatype().to_string(),
                target: subscription.clone(),
            });
            subscription
        };

        let master = self.inner.master.clone();
        let slave_uri = self.inner.slave_uri.clone();
        let registering = subscription.clone();
        self.inner.track_task(tokio::spawn(async move {
            registering.register(master, slave_uri).await;
        }));

        Ok(Subscriber::new(subscription))
    }

    pub async fn advertise_service<S: RosService>(
        &self,
        service: &str,
        handler: impl Fn(S::Request) -> anyhow::Result<S::Response> + Send + Sync + 'static,
    ) -> anyhow::Result<ServiceServer> {
        self.inner.ensure_running()?;
        let service = names::resolve(service)?;

        let endpoint = {
            let mut services = self.inner.services.write().expect("node lock poisoned");
            if services.contains_key(&service) {
                bail!("service {:?} already has a server on this node", service);
            }
            let endpoint = ServiceEndpoint::<S>::new(&service, &self.inner.name, handler);
            services.insert(service.clone(), EndpointEntry {
                datatype: S::datatype().to_string(),
                target: endpoint.clone(),
            });
            endpoint
        };

        let master = self.inner.master.clone();
        let service_uri = self.inner.service_uri();
        let slave_uri = self.inner.slave_uri.clone();
        let registering = endpoint;
        self.inner.track_task(tokio::spawn(async move {
            registering.register(master, service_uri, slave_uri).await;
        }));

        Ok(ServiceServer::new(&service))
    }

    pub fn service_client<S: RosService>(&self, service: &str, opts: ServiceClientOptions) -> anyhow::Result<ServiceClient<S>> {
        self.inner.ensure_running()?;
        let service = names::resolve(service)?;
        Ok(ServiceClient::new(&service, &self.inner.name, opts, self.inner.master.clone()))
    }

    pub async fn unadvertise(&self, topic: &str) -> anyhow::Result<()> {
        let topic = names::resolve(topic)?;
        let entry = self.inner.publications.write().expect("node lock poisoned").remove(&topic)
            .ok_or_else(|| anyhow!("topic {:?} is not advertised by this node", topic))?;
        entry.target.close();
        if let Err(e) = self.inner.master.unregister_publisher(&topic, &self.inner.slave_uri).await {
            warn!("unregistering publisher for {:?} failed: {}", topic, e);
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, topic: &str) -> anyhow::Result<()> {
        let topic = names::resolve(topic)?;
        let entry = self.inner.subscriptions.write().expect("node lock poisoned").remove(&topic)
            .ok_or_else(|| anyhow!("this node does not subscribe to {:?}", topic))?;
        entry.target.close();
        if let Err(e) = self.inner.master.unregister_subscriber(&topic, &self.inner.slave_uri).await {
            warn!("unregistering subscriber for {:?} failed: {}", topic, e);
        }
        Ok(())
    }

    pub async fn unadvertise_service(&self, service: &str) -> anyhow::Result<()> {
        let service = names::resolve(service)?;
        let entry = self.inner.services.write().expect("node lock poisoned").remove(&service)
            .ok_or_else(|| anyhow!("service {:?} has no server on this node", service))?;
        entry.target.close();
        if let Err(e) = self.inner.master.unregister_service(&service, &self.inner.service_uri()).await {
            warn!("unregistering service {:?} failed: {}", service, e);
        }
        Ok(())
    }

    /// Graceful teardown: unregister everything (best-effort, one attempt
    ///  each), close peer sockets, stop both servers and the spinner.
    ///  Idempotent; all later operations fail immediately.
    pub async fn shutdown(&self) {
        self.inner.do_shutdown().await;
    }
}

struct EndpointEntry {
    datatype: String,
    target: Arc<dyn PeerConnectionTarget>,
}

struct SubscriptionEntry {
    datatype: String,
    target: Arc<dyn SubscriptionHandle>,
}

/// What a typed subscription exposes to the node for routing and teardown.
pub(crate) trait SubscriptionHandle: Send + Sync {
    fn update_publishers(&self, uris: Vec<String>);
    fn close(&self);
}

pub(crate) struct NodeInner {
    name: String,
    pub(crate) pid: u32,
    host: String,
    master_uri: String,
    slave_uri: String,
    tcpros_port: u16,
    master: MasterClient,
    spinner: Spinner,
    publications: RwLock<FxHashMap<String, EndpointEntry>>,
    subscriptions: RwLock<FxHashMap<String, SubscriptionEntry>>,
    services: RwLock<FxHashMap<String, EndpointEntry>>,
    shut_down: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl NodeInner {
    fn ensure_running(&self) -> anyhow::Result<()> {
        if self.shut_down.load(Ordering::SeqCst) {
            bail!("node {} is shut down", self.name);
        }
        Ok(())
    }

    fn track_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().expect("node lock poisoned").push(task);
    }

    /// `rosrpc` endpoint shared by all services of this node
    fn service_uri(&self) -> String {
        format!("rosrpc://{}:{}", self.host, self.tcpros_port)
    }

    pub(crate) fn master_uri(&self) -> &str {
        &self.master_uri
    }

    pub(crate) fn advertised_host(&self) -> &str {
        &self.host
    }

    pub(crate) fn tcpros_port(&self) -> u16 {
        self.tcpros_port
    }

    pub(crate) fn publication_target(&self, topic: &str) -> Option<Arc<dyn PeerConnectionTarget>> {
        self.publications.read().expect("node lock poisoned").get(topic).map(|e| e.target.clone())
    }

    pub(crate) fn service_target(&self, service: &str) -> Option<Arc<dyn PeerConnectionTarget>> {
        self.services.read().expect("node lock poisoned").get(service).map(|e| e.target.clone())
    }

    pub(crate) fn has_publication(&self, topic: &str) -> bool {
        self.publications.read().expect("node lock poisoned").contains_key(topic)
    }

    pub(crate) fn publications_info(&self) -> Vec<(String, String)> {
        self.publications.read().expect("node lock poisoned").iter()
            .map(|(topic, entry)| (topic.clone(), entry.datatype.clone()))
            .collect()
    }

    pub(crate) fn subscriptions_info(&self) -> Vec<(String, String)> {
        self.subscriptions.read().expect("node lock poisoned").iter()
            .map(|(topic, entry)| (topic.clone(), entry.datatype.clone()))
            .collect()
    }

    /// Returns false when no subscription owns the topic.
    pub(crate) fn publisher_update(&self, topic: &str, uris: Vec<String>) -> bool {
        let target = self.subscriptions.read().expect("node lock poisoned")
            .get(topic)
            .map(|e| e.target.clone());
        match target {
            Some(target) => {
                target.update_publishers(uris);
                true
            }
            None => {
                warn!("publisherUpdate for {:?}, which this node does not subscribe to", topic);
                false
            }
        }
    }

    /// Entry point for the slave API's `shutdown` method.
    pub(crate) fn trigger_shutdown(self: &Arc<Self>) {
        let node = self.clone();
        tokio::spawn(async move {
            node.do_shutdown().await;
        });
    }

    async fn do_shutdown(self: &Arc<Self>) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutting down node {}", self.name);

        let publications: Vec<(String, EndpointEntry)> =
            self.publications.write().expect("node lock poisoned").drain().collect();
        let subscriptions: Vec<(String, SubscriptionEntry)> =
            self.subscriptions.write().expect("node lock poisoned").drain().collect();
        let services: Vec<(String, EndpointEntry)> =
            self.services.write().expect("node lock poisoned").drain().collect();

        for (topic, entry) in publications {
            entry.target.close();
            let _ = timeout(UNREGISTER_TIMEOUT, self.master.unregister_publisher(&topic, &self.slave_uri)).await;
        }
        for (topic, entry) in subscriptions {
            entry.target.close();
            let _ = timeout(UNREGISTER_TIMEOUT, self.master.unregister_subscriber(&topic, &self.slave_uri)).await;
        }
        let service_uri = self.service_uri();
        for (service, entry) in services {
            entry.target.close();
            let _ = timeout(UNREGISTER_TIMEOUT, self.master.unregister_service(&service, &service_uri)).await;
        }

        self.spinner.shutdown();
        // listeners, the master queue worker and registration tasks; pending
        //  master calls reject their futures when the worker dies
        for task in self.tasks.lock().expect("node lock poisoned").drain(..) {
            task.abort();
        }
        info!("node {} is down", self.name);
    }
}
