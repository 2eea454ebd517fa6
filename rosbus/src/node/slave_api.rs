//! The node's XML-RPC server ("slave API"): the master calls it to push
//! publisher updates, peers call it to negotiate topic transports, and tools
//! call it for introspection and shutdown.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::sync::{Arc, Weak};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::master::xmlrpc::{self, status_tuple, XmlRpcValue};
use crate::node::NodeInner;

pub(crate) async fn run_slave_server(listener: TcpListener, node: Weak<NodeInner>) {
    loop {
        let (stream, _addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("slave API accept failed: {}", e);
                continue;
            }
        };
        if node.upgrade().is_none() {
            return;
        }
        tokio::spawn(serve_connection(stream, node.clone()));
    }
}

async fn serve_connection(stream: TcpStream, node: Weak<NodeInner>) {
    let io = TokioIo::new(stream);
    let service = service_fn(move |request| handle_request(request, node.clone()));
    if let Err(e) = http1::Builder::new().serve_connection(io, service).await {
        debug!("slave API connection ended with an error: {}", e);
    }
}

async fn handle_request(request: Request<Incoming>, node: Weak<NodeInner>) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let body = request.into_body().collect().await?.to_bytes();

    let result = match node.upgrade() {
        Some(node) => process(&body, &node),
        None => status_tuple(0, "node is shutting down", XmlRpcValue::Int(0)),
    };

    let xml = xmlrpc::encode_response(&result);
    let response = Response::builder()
        .header(hyper::header::CONTENT_TYPE, "text/xml")
        .body(Full::new(Bytes::from(xml)))
        .expect("a response from static parts always builds");
    Ok(response)
}

fn process(body: &[u8], node: &Arc<NodeInner>) -> XmlRpcValue {
    let text = match std::str::from_utf8(body) {
        Ok(text) => text,
        Err(_) => return status_tuple(-1, "request body is not UTF-8", XmlRpcValue::Int(0)),
    };
    let (method, params) = match xmlrpc::parse_request(text) {
        Ok(parsed) => parsed,
        Err(e) => return status_tuple(-1, &format!("malformed XML-RPC request: {}", e), XmlRpcValue::Int(0)),
    };
    debug!("slave API call: {} ({} params)", method, params.len());
    dispatch(node, &method, params)
}

fn dispatch(node: &Arc<NodeInner>, method: &str, params: Vec<XmlRpcValue>) -> XmlRpcValue {
    match method {
        "getPid" => status_tuple(1, "", XmlRpcValue::Int(node.pid as i32)),
        "getMasterUri" => status_tuple(1, "", XmlRpcValue::string(node.master_uri())),
        "getSubscriptions" => status_tuple(1, "", topic_type_list(node.subscriptions_info())),
        "getPublications" => status_tuple(1, "", topic_type_list(node.publications_info())),
        // per-connection statistics are not tracked; the shape is kept so
        //  generic tools don't error out
        "getBusStats" => status_tuple(1, "", XmlRpcValue::Array(vec![
            XmlRpcValue::Array(vec![]),
            XmlRpcValue::Array(vec![]),
            XmlRpcValue::Array(vec![]),
        ])),
        "getBusInfo" => status_tuple(1, "", XmlRpcValue::Array(vec![])),
        "paramUpdate" => status_tuple(1, "parameter updates are ignored by this node", XmlRpcValue::Int(0)),
        "publisherUpdate" => publisher_update(node, params),
        "requestTopic" => request_topic(node, params),
        "shutdown" => {
            let reason = params.get(1)
                .and_then(|p| p.as_str().ok())
                .unwrap_or("(no reason given)");
            info!("shutdown requested over the slave API: {}", reason);
            node.trigger_shutdown();
            status_tuple(1, "", XmlRpcValue::Int(0))
        }
        other => status_tuple(-1, &format!("unknown method {:?}", other), XmlRpcValue::Int(0)),
    }
}

fn topic_type_list(entries: Vec<(String, String)>) -> XmlRpcValue {
    XmlRpcValue::Array(
        entries.into_iter()
            .map(|(topic, datatype)| XmlRpcValue::Array(vec![
                XmlRpcValue::Str(topic),
                XmlRpcValue::Str(datatype),
            ]))
            .collect()
    )
}

/// `publisherUpdate(caller_id, topic, [publisher_uri...])` - the master's push
///  notification; forwarded to the owning subscription for reconciliation.
fn publisher_update(node: &Arc<NodeInner>, params: Vec<XmlRpcValue>) -> XmlRpcValue {
    let parsed = (|| -> anyhow::Result<(String, Vec<String>)> {
        let topic = params.get(1).ok_or_else(|| anyhow::anyhow!("missing topic parameter"))?.as_str()?;
        let uris = params.get(2).ok_or_else(|| anyhow::anyhow!("missing publishers parameter"))?
            .as_array()?
            .iter()
            .map(|uri| Ok(uri.as_str()?.to_string()))
            .collect::<anyhow::Result<Vec<String>>>()?;
        Ok((topic.to_string(), uris))
    })();

    match parsed {
        Ok((topic, uris)) => {
            if node.publisher_update(&topic, uris) {
                status_tuple(1, "", XmlRpcValue::Int(0))
            } else {
                status_tuple(0, &format!("not subscribed to {:?}", topic), XmlRpcValue::Int(0))
            }
        }
        Err(e) => status_tuple(-1, &format!("malformed publisherUpdate: {}", e), XmlRpcValue::Int(0)),
    }
}

/// `requestTopic(caller_id, topic, [[protocol, ...]...])` - a subscriber asks
///  where to connect; the only protocol spoken here is TCPROS.
fn request_topic(node: &Arc<NodeInner>, params: Vec<XmlRpcValue>) -> XmlRpcValue {
    let topic = match params.get(1).and_then(|p| p.as_str().ok()) {
        Some(topic) => topic,
        None => return status_tuple(-1, "missing topic parameter", XmlRpcValue::Int(0)),
    };

    let tcpros_requested = params.get(2)
        .and_then(|p| p.as_array().ok())
        .map(|protocols| {
            protocols.iter().any(|p| {
                p.as_array().ok()
                    .and_then(|fields| fields.first())
                    .and_then(|name| name.as_str().ok())
                    == Some("TCPROS")
            })
        })
        .unwrap_or(false);
    if !tcpros_requested {
        return status_tuple(0, "no supported protocol requested (this node speaks TCPROS)", XmlRpcValue::Int(0));
    }

    if !node.has_publication(topic) {
        return status_tuple(0, &format!("this node does not publish {:?}", topic), XmlRpcValue::Int(0));
    }

    status_tuple(1, "", XmlRpcValue::Array(vec![
        XmlRpcValue::string("TCPROS"),
        XmlRpcValue::string(node.advertised_host()),
        XmlRpcValue::Int(node.tcpros_port() as i32),
    ]))
}
