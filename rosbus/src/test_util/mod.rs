//! Shared test infrastructure: an in-process fake master speaking the real
//! XML-RPC-over-HTTP protocol, with call tracking in the style of a recording
//! mock.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::sleep;

use crate::master::xmlrpc::{self, status_tuple, XmlRpcValue};

#[derive(Default)]
struct FakeMasterState {
    calls: Vec<(String, Vec<XmlRpcValue>)>,
    /// answer for registerSubscriber
    publisher_uris: Vec<String>,
    /// answer for lookupService; also captured from registerService
    service_uri: Option<String>,
    fail_next: Option<(i32, String)>,
}

pub(crate) struct FakeMaster {
    addr: SocketAddr,
    state: Arc<Mutex<FakeMasterState>>,
}

impl FakeMaster {
    pub async fn start() -> FakeMaster {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("binding an ephemeral port");
        FakeMaster::serve(listener)
    }

    /// Bind a specific address, for tests that bring the master up late.
    pub async fn start_on(addr: SocketAddr) -> FakeMaster {
        let listener = TcpListener::bind(addr).await.expect("the caller owns this address");
        FakeMaster::serve(listener)
    }

    fn serve(listener: TcpListener) -> FakeMaster {
        let addr = listener.local_addr().expect("a bound listener has an address");
        let state: Arc<Mutex<FakeMasterState>> = Default::default();

        let accept_state = state.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |request| handle(request, state.clone()));
                    let _ = http1::Builder::new().serve_connection(io, service).await;
                });
            }
        });

        FakeMaster { addr, state }
    }

    pub fn uri(&self) -> String {
        format!("http://{}/", self.addr)
    }

    pub async fn set_publisher_uris(&self, uris: Vec<String>) {
        self.state.lock().unwrap().publisher_uris = uris;
    }

    pub async fn set_service_uri(&self, uri: &str) {
        self.state.lock().unwrap().service_uri = Some(uri.to_string());
    }

    /// The next call gets this failure tuple instead of its regular answer.
    pub async fn fail_next_with(&self, code: i32, message: &str) {
        self.state.lock().unwrap().fail_next = Some((code, message.to_string()));
    }

    pub async fn called_methods(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.iter()
            .map(|(method, _)| method.clone())
            .collect()
    }

    pub async fn assert_called(&self, method: &str) {
        let methods = self.called_methods().await;
        assert!(
            methods.iter().any(|m| m == method),
            "expected a {:?} call, saw {:?}", method, methods,
        );
    }

    pub async fn wait_for_call(&self, method: &str) {
        for _ in 0..250 {
            if self.called_methods().await.iter().any(|m| m == method) {
                return;
            }
            sleep(Duration::from_millis(20)).await;
        }
        panic!("no {:?} call arrived within the deadline, saw {:?}", method, self.called_methods().await);
    }
}

async fn handle(request: Request<Incoming>, state: Arc<Mutex<FakeMasterState>>) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let body = request.into_body().collect().await?.to_bytes();
    let text = String::from_utf8_lossy(&body);

    let result = match xmlrpc::parse_request(&text) {
        Ok((method, params)) => respond(&method, params, &state),
        Err(e) => status_tuple(-1, &format!("malformed request: {}", e), XmlRpcValue::Int(0)),
    };

    let xml = xmlrpc::encode_response(&result);
    Ok(Response::new(Full::new(Bytes::from(xml))))
}

fn respond(method: &str, params: Vec<XmlRpcValue>, state: &Mutex<FakeMasterState>) -> XmlRpcValue {
    let mut state = state.lock().unwrap();
    state.calls.push((method.to_string(), params.clone()));

    if let Some((code, message)) = state.fail_next.take() {
        return status_tuple(code, &message, XmlRpcValue::Int(0));
    }

    match method {
        "registerSubscriber" => {
            let uris = state.publisher_uris.iter()
                .map(|uri| XmlRpcValue::string(uri))
                .collect();
            status_tuple(1, "", XmlRpcValue::Array(uris))
        }
        "registerPublisher" => status_tuple(1, "", XmlRpcValue::Array(vec![])),
        "registerService" => {
            // remember where the service lives so lookupService can answer
            if state.service_uri.is_none() {
                if let Some(uri) = params.get(2).and_then(|p| p.as_str().ok()) {
                    state.service_uri = Some(uri.to_string());
                }
            }
            status_tuple(1, "", XmlRpcValue::Int(1))
        }
        "lookupService" => match &state.service_uri {
            Some(uri) => status_tuple(1, "", XmlRpcValue::string(uri)),
            None => status_tuple(0, "no provider", XmlRpcValue::Int(0)),
        },
        "unregisterPublisher" | "unregisterSubscriber" | "unregisterService" => {
            status_tuple(1, "", XmlRpcValue::Int(1))
        }
        "getUri" => status_tuple(1, "", XmlRpcValue::string("http://fake-master/")),
        _ => status_tuple(1, "", XmlRpcValue::Int(0)),
    }
}

/// Poll until the condition holds; panics after a generous deadline.
pub(crate) async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..250 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within the deadline");
}
