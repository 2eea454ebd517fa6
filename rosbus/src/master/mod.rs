//! The client side of the master registry: a serialized, auto-retrying queue
//! of XML-RPC calls to a single master endpoint.
//!
//! Registration traffic is cheap and infrequent, so there is no pipelining:
//! calls execute strictly one at a time, in submission order. When the master
//! endpoint is unavailable (connection refused, unreachable, DNS failure) the
//! head call stays queued and is retried on a saturating backoff schedule;
//! any successful call resets the schedule. Failures of an exchange that did
//! reach the endpoint are definitive and surface to the caller.

pub mod xmlrpc;

use anyhow::anyhow;
use hyper::Uri;
use std::cmp::min;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::master::xmlrpc::XmlRpcValue;

/// Delay in ms before the k-th consecutive retry, saturating at the tail.
pub const RETRY_BACKOFF_MS: [u64; 18] = [1, 2, 2, 4, 4, 4, 4, 8, 8, 8, 8, 16, 32, 64, 128, 256, 512, 1000];

struct QueuedCall {
    method: String,
    params: Vec<XmlRpcValue>,
    reply: oneshot::Sender<anyhow::Result<XmlRpcValue>>,
}

/// Handle to the per-master call queue. Cloning shares the queue.
#[derive(Clone)]
pub struct MasterClient {
    queue: mpsc::UnboundedSender<QueuedCall>,
    caller_id: String,
    master_uri: String,
}

impl MasterClient {
    pub fn new(master_uri: &str, caller_id: &str) -> anyhow::Result<(MasterClient, JoinHandle<()>)> {
        let uri: Uri = master_uri.parse()
            .map_err(|e| anyhow!("invalid master URI {:?}: {}", master_uri, e))?;
        if uri.host().is_none() {
            return Err(anyhow!("master URI {:?} has no host", master_uri));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(run_call_queue(uri, rx));

        let client = MasterClient {
            queue: tx,
            caller_id: caller_id.to_string(),
            master_uri: master_uri.to_string(),
        };
        Ok((client, worker))
    }

    pub fn master_uri(&self) -> &str {
        &self.master_uri
    }

    /// Enqueue a call and await its outcome. Rejected immediately when the
    ///  queue worker is gone (node shut down).
    pub async fn call(&self, method: &str, params: Vec<XmlRpcValue>) -> anyhow::Result<XmlRpcValue> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.queue.send(QueuedCall {
            method: method.to_string(),
            params,
            reply: reply_tx,
        }).map_err(|_| anyhow!("master client is shut down"))?;

        reply_rx.await
            .map_err(|_| anyhow!("master client shut down while the call was pending"))?
    }

    // -- registry operations --------------------------------------------------------------------

    /// Returns the URIs of current subscribers of the topic.
    pub async fn register_publisher(&self, topic: &str, datatype: &str, slave_uri: &str) -> anyhow::Result<Vec<String>> {
        let value = self.call("registerPublisher", vec![
            XmlRpcValue::string(&self.caller_id),
            XmlRpcValue::string(topic),
            XmlRpcValue::string(datatype),
            XmlRpcValue::string(slave_uri),
        ]).await?;
        uri_list(value)
    }

    pub async fn unregister_publisher(&self, topic: &str, slave_uri: &str) -> anyhow::Result<()> {
        self.call("unregisterPublisher", vec![
            XmlRpcValue::string(&self.caller_id),
            XmlRpcValue::string(topic),
            XmlRpcValue::string(slave_uri),
        ]).await?;
        Ok(())
    }

    /// Returns the URIs of current publishers of the topic.
    pub async fn register_subscriber(&self, topic: &str, datatype: &str, slave_uri: &str) -> anyhow::Result<Vec<String>> {
        let value = self.call("registerSubscriber", vec![
            XmlRpcValue::string(&self.caller_id),
            XmlRpcValue::string(topic),
            XmlRpcValue::string(datatype),
            XmlRpcValue::string(slave_uri),
        ]).await?;
        uri_list(value)
    }

    pub async fn unregister_subscriber(&self, topic: &str, slave_uri: &str) -> anyhow::Result<()> {
        self.call("unregisterSubscriber", vec![
            XmlRpcValue::string(&self.caller_id),
            XmlRpcValue::string(topic),
            XmlRpcValue::string(slave_uri),
        ]).await?;
        Ok(())
    }

    pub async fn register_service(&self, service: &str, service_uri: &str, slave_uri: &str) -> anyhow::Result<()> {
        self.call("registerService", vec![
            XmlRpcValue::string(&self.caller_id),
            XmlRpcValue::string(service),
            XmlRpcValue::string(service_uri),
            XmlRpcValue::string(slave_uri),
        ]).await?;
        Ok(())
    }

    pub async fn unregister_service(&self, service: &str, service_uri: &str) -> anyhow::Result<()> {
        self.call("unregisterService", vec![
            XmlRpcValue::string(&self.caller_id),
            XmlRpcValue::string(service),
            XmlRpcValue::string(service_uri),
        ]).await?;
        Ok(())
    }

    /// Resolve a service name to its `rosrpc://host:port` URI.
    pub async fn lookup_service(&self, service: &str) -> anyhow::Result<String> {
        let value = self.call("lookupService", vec![
            XmlRpcValue::string(&self.caller_id),
            XmlRpcValue::string(service),
        ]).await?;
        Ok(value.as_str()?.to_string())
    }

    pub async fn get_uri(&self) -> anyhow::Result<String> {
        let value = self.call("getUri", vec![
            XmlRpcValue::string(&self.caller_id),
        ]).await?;
        Ok(value.as_str()?.to_string())
    }
}

fn uri_list(value: XmlRpcValue) -> anyhow::Result<Vec<String>> {
    value.into_array()?
        .into_iter()
        .map(|v| Ok(v.as_str()?.to_string()))
        .collect()
}

/// Delay before the next attempt, given how many attempts in a row found the
///  endpoint unavailable.
fn backoff_delay(consecutive_failures: usize) -> Duration {
    Duration::from_millis(RETRY_BACKOFF_MS[min(consecutive_failures, RETRY_BACKOFF_MS.len() - 1)])
}

async fn run_call_queue(master_uri: Uri, mut queue: mpsc::UnboundedReceiver<QueuedCall>) {
    // consecutive transport failures; reset by any success, NOT by a
    //  definitive failure
    let mut failures = 0usize;

    while let Some(call) = queue.recv().await {
        let outcome = loop {
            match attempt(&master_uri, &call).await {
                Attempt::Done(result) => break result,
                Attempt::EndpointUnavailable(e) => {
                    let delay = backoff_delay(failures);
                    failures += 1;
                    debug!("master endpoint {} unavailable ({}), retrying {:?} in {:?}", master_uri, e, call.method, delay);
                    sleep(delay).await;
                }
            }
        };

        if outcome.is_ok() {
            failures = 0;
        }
        // the caller may have given up on the future; that doesn't affect the queue
        let _ = call.reply.send(outcome);
    }
    debug!("master call queue for {} closed", master_uri);
}

enum Attempt {
    Done(anyhow::Result<XmlRpcValue>),
    EndpointUnavailable(std::io::Error),
}

async fn attempt(master_uri: &Uri, call: &QueuedCall) -> Attempt {
    // Only the connect phase classifies as retryable: refused, unreachable,
    //  timeout and DNS failures all surface here. Once the exchange reached
    //  the endpoint, failures are definitive.
    let stream = match xmlrpc::connect_http(master_uri).await {
        Ok(stream) => stream,
        Err(e) => return Attempt::EndpointUnavailable(e),
    };

    let body = xmlrpc::encode_request(&call.method, &call.params);
    let result = async {
        let response = xmlrpc::post_xml(stream, master_uri, body).await?;
        let value = xmlrpc::parse_response(&response)?;
        xmlrpc::try_unwrap_status(value)
    }.await;

    if let Err(e) = &result {
        warn!("master call {:?} failed: {}", call.method, e);
    }
    Attempt::Done(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::FakeMaster;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    #[rstest::rstest]
    #[case::first_failure(0, 1)]
    #[case::second_failure(1, 2)]
    #[case::after_seven_failures(7, 8)]
    #[case::last_entry(17, 1000)]
    #[case::saturated(100, 1000)]
    fn test_backoff_delay(#[case] consecutive_failures: usize, #[case] expected_ms: u64) {
        assert_eq!(backoff_delay(consecutive_failures), Duration::from_millis(expected_ms));
    }

    #[test]
    fn test_backoff_schedule_never_shrinks() {
        for window in RETRY_BACKOFF_MS.windows(2) {
            assert!(window[0] <= window[1]);
        }
    }

    /// an address with nothing listening on it, for connection-refused tests
    async fn refused_addr() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        addr
    }

    #[tokio::test]
    async fn test_call_success() {
        let master = FakeMaster::start().await;
        let (client, _worker) = MasterClient::new(&master.uri(), "/test_node").unwrap();

        let subscribers = client.register_publisher("/chatter", "std_msgs/String", "http://localhost:1234/").await.unwrap();
        assert!(subscribers.is_empty());
        master.assert_called("registerPublisher").await;
    }

    #[tokio::test]
    async fn test_definitive_failure_advances_queue() {
        let master = FakeMaster::start().await;
        master.fail_next_with(0, "not today").await;
        let (client, _worker) = MasterClient::new(&master.uri(), "/test_node").unwrap();

        let err = client.lookup_service("/missing").await.unwrap_err();
        assert!(err.to_string().contains("not today"));

        // the queue keeps serving after a definitive failure
        client.register_publisher("/chatter", "std_msgs/String", "http://localhost:1234/").await.unwrap();
    }

    #[tokio::test]
    async fn test_calls_execute_in_submission_order() {
        let master = FakeMaster::start().await;
        let (client, _worker) = MasterClient::new(&master.uri(), "/test_node").unwrap();

        let first = client.call("registerPublisher", vec![]);
        let second = client.call("registerSubscriber", vec![]);
        let third = client.call("getUri", vec![]);
        let _ = tokio::join!(first, second, third);

        assert_eq!(
            master.called_methods().await,
            vec!["registerPublisher".to_string(), "registerSubscriber".to_string(), "getUri".to_string()],
        );
    }

    #[tokio::test]
    async fn test_refused_endpoint_retries_until_master_appears() {
        let addr = refused_addr().await;
        let (client, _worker) = MasterClient::new(&format!("http://{}/", addr), "/test_node").unwrap();

        let pending = tokio::spawn(async move {
            client.get_uri().await
        });

        // with the endpoint down the call keeps backing off and retrying
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pending.is_finished());

        // bring a master up on that exact address; the original call resolves
        let master = FakeMaster::start_on(addr).await;
        let result = timeout(Duration::from_secs(10), pending).await.unwrap().unwrap();
        assert!(result.is_ok());
        master.assert_called("getUri").await;
    }

    #[tokio::test]
    async fn test_shutdown_rejects_pending_calls() {
        let addr = refused_addr().await;
        let (client, worker) = MasterClient::new(&format!("http://{}/", addr), "/test_node").unwrap();

        let pending = {
            let client = client.clone();
            tokio::spawn(async move { client.get_uri().await })
        };
        tokio::task::yield_now().await;

        worker.abort();
        let result = timeout(Duration::from_secs(5), pending).await.unwrap().unwrap();
        assert!(result.is_err());
    }
}
