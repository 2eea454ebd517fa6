//! The RPC protocol spoken with the master and between node slave APIs:
//! XML-RPC over HTTP/1.1. Only the subset the middleware actually uses is
//! implemented (scalar ints, booleans, doubles, strings and arrays); structs
//! and the remaining scalar types never occur in these calls.
//!
//! Every call and response at the middleware level is a 3-tuple
//! `[statusCode, statusMessage, value]` with `statusCode == 1` meaning
//! success; see [status_tuple] / [try_unwrap_status].

use anyhow::{anyhow, bail};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header;
use hyper::{Method, Request, Uri};
use hyper_util::rt::TokioIo;
use std::fmt::Write;
use tokio::net::TcpStream;
use tracing::debug;

#[derive(Clone, Debug, PartialEq)]
pub enum XmlRpcValue {
    Int(i32),
    Bool(bool),
    Double(f64),
    Str(String),
    Array(Vec<XmlRpcValue>),
}

impl XmlRpcValue {
    pub fn string(s: impl Into<String>) -> XmlRpcValue {
        XmlRpcValue::Str(s.into())
    }

    pub fn as_i32(&self) -> anyhow::Result<i32> {
        match self {
            XmlRpcValue::Int(i) => Ok(*i),
            other => Err(anyhow!("expected an int, got {:?}", other)),
        }
    }

    pub fn as_str(&self) -> anyhow::Result<&str> {
        match self {
            XmlRpcValue::Str(s) => Ok(s),
            other => Err(anyhow!("expected a string, got {:?}", other)),
        }
    }

    pub fn as_array(&self) -> anyhow::Result<&[XmlRpcValue]> {
        match self {
            XmlRpcValue::Array(items) => Ok(items),
            other => Err(anyhow!("expected an array, got {:?}", other)),
        }
    }

    pub fn into_array(self) -> anyhow::Result<Vec<XmlRpcValue>> {
        match self {
            XmlRpcValue::Array(items) => Ok(items),
            other => Err(anyhow!("expected an array, got {:?}", other)),
        }
    }

    fn write_xml(&self, out: &mut String) {
        match self {
            XmlRpcValue::Int(i) => { let _ = write!(out, "<value><int>{}</int></value>", i); }
            XmlRpcValue::Bool(b) => { let _ = write!(out, "<value><boolean>{}</boolean></value>", if *b { 1 } else { 0 }); }
            XmlRpcValue::Double(d) => { let _ = write!(out, "<value><double>{}</double></value>", d); }
            XmlRpcValue::Str(s) => { let _ = write!(out, "<value><string>{}</string></value>", escape(s)); }
            XmlRpcValue::Array(items) => {
                out.push_str("<value><array><data>");
                for item in items {
                    item.write_xml(out);
                }
                out.push_str("</data></array></value>");
            }
        }
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> String {
    s.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

pub fn encode_request(method: &str, params: &[XmlRpcValue]) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?><methodCall>");
    let _ = write!(out, "<methodName>{}</methodName><params>", escape(method));
    for param in params {
        out.push_str("<param>");
        param.write_xml(&mut out);
        out.push_str("</param>");
    }
    out.push_str("</params></methodCall>");
    out
}

pub fn encode_response(value: &XmlRpcValue) -> String {
    let mut out = String::from("<?xml version=\"1.0\"?><methodResponse><params><param>");
    value.write_xml(&mut out);
    out.push_str("</param></params></methodResponse>");
    out
}

pub fn parse_response(doc: &str) -> anyhow::Result<XmlRpcValue> {
    let mut cur = Cursor::new(doc);
    cur.expect_open("methodResponse")?;
    if cur.try_open("fault") {
        bail!("XML-RPC fault response: {}", cur.rest.split("</fault>").next().unwrap_or("").trim());
    }
    cur.expect_open("params")?;
    cur.expect_open("param")?;
    let value = parse_value(&mut cur)?;
    cur.expect_close("param")?;
    cur.expect_close("params")?;
    cur.expect_close("methodResponse")?;
    Ok(value)
}

pub fn parse_request(doc: &str) -> anyhow::Result<(String, Vec<XmlRpcValue>)> {
    let mut cur = Cursor::new(doc);
    cur.expect_open("methodCall")?;
    cur.expect_open("methodName")?;
    let method = unescape(cur.text_until_lt().trim());
    cur.expect_close("methodName")?;

    let mut params = Vec::new();
    if cur.try_open("params") {
        while cur.try_open("param") {
            params.push(parse_value(&mut cur)?);
            cur.expect_close("param")?;
        }
        cur.expect_close("params")?;
    }
    cur.expect_close("methodCall")?;
    Ok((method, params))
}

fn parse_value(cur: &mut Cursor) -> anyhow::Result<XmlRpcValue> {
    cur.expect_open("value")?;

    // A value without a type tag is a bare string; anything else may have
    //  whitespace (pretty-printing) before the type tag.
    let text = cur.text_until_lt();
    if cur.try_close("value") {
        return Ok(XmlRpcValue::Str(unescape(text)));
    }
    if !text.trim().is_empty() {
        bail!("malformed XML-RPC value: unexpected text {:?}", text.trim());
    }

    let value = if cur.try_open("int") {
        parse_scalar(cur, "int")?
    } else if cur.try_open("i4") {
        parse_scalar(cur, "i4")?
    } else if cur.try_open("boolean") {
        parse_scalar(cur, "boolean")?
    } else if cur.try_open("double") {
        parse_scalar(cur, "double")?
    } else if cur.try_open("string") {
        let text = unescape(cur.text_until_lt());
        cur.expect_close("string")?;
        XmlRpcValue::Str(text)
    } else if cur.try_open("array") {
        cur.expect_open("data")?;
        let mut items = Vec::new();
        while cur.peek_open("value") {
            items.push(parse_value(cur)?);
        }
        cur.expect_close("data")?;
        cur.expect_close("array")?;
        XmlRpcValue::Array(items)
    } else {
        bail!("unsupported XML-RPC value type at: {:?}", cur.head());
    };

    cur.expect_close("value")?;
    Ok(value)
}

fn parse_scalar(cur: &mut Cursor, tag: &str) -> anyhow::Result<XmlRpcValue> {
    let text = cur.text_until_lt().trim().to_string();
    cur.expect_close(tag)?;
    match tag {
        "int" | "i4" => Ok(XmlRpcValue::Int(text.parse()?)),
        "boolean" => match text.as_str() {
            "1" | "true" => Ok(XmlRpcValue::Bool(true)),
            "0" | "false" => Ok(XmlRpcValue::Bool(false)),
            other => bail!("invalid boolean value: {:?}", other),
        },
        "double" => Ok(XmlRpcValue::Double(text.parse()?)),
        _ => bail!("not a scalar tag: {}", tag),
    }
}

/// Minimal cursor over the XML-RPC subset. No attributes, no CDATA, no
///  comments - none of the implementations this talks to emit them.
struct Cursor<'a> {
    rest: &'a str,
}

impl<'a> Cursor<'a> {
    fn new(doc: &'a str) -> Cursor<'a> {
        let mut cur = Cursor { rest: doc };
        cur.skip_ws();
        if let Some(stripped) = cur.rest.strip_prefix("<?") {
            if let Some(end) = stripped.find("?>") {
                cur.rest = &stripped[end + 2..];
            }
        }
        cur
    }

    fn skip_ws(&mut self) {
        self.rest = self.rest.trim_start();
    }

    fn head(&self) -> &str {
        let mut end = self.rest.len().min(40);
        while !self.rest.is_char_boundary(end) {
            end -= 1;
        }
        &self.rest[..end]
    }

    /// consume `<tag>` if it is next
    fn try_open(&mut self, tag: &str) -> bool {
        self.skip_ws();
        let open = format!("<{}>", tag);
        if let Some(stripped) = self.rest.strip_prefix(&open) {
            self.rest = stripped;
            true
        } else {
            false
        }
    }

    /// check for `<tag>` without consuming
    fn peek_open(&mut self, tag: &str) -> bool {
        self.skip_ws();
        self.rest.starts_with(&format!("<{}>", tag))
    }

    fn expect_open(&mut self, tag: &str) -> anyhow::Result<()> {
        if self.try_open(tag) {
            Ok(())
        } else {
            Err(anyhow!("expected <{}> at: {:?}", tag, self.head()))
        }
    }

    fn try_close(&mut self, tag: &str) -> bool {
        let close = format!("</{}>", tag);
        if let Some(stripped) = self.rest.strip_prefix(&close) {
            self.rest = stripped;
            return true;
        }
        // tolerate whitespace before a closing tag as long as the caller
        //  has already decided the preceding text is not significant
        let trimmed = self.rest.trim_start();
        if let Some(stripped) = trimmed.strip_prefix(&close) {
            self.rest = stripped;
            true
        } else {
            false
        }
    }

    fn expect_close(&mut self, tag: &str) -> anyhow::Result<()> {
        self.skip_ws();
        if self.try_close(tag) {
            Ok(())
        } else {
            Err(anyhow!("expected </{}> at: {:?}", tag, self.head()))
        }
    }

    /// raw text up to (not including) the next '<'
    fn text_until_lt(&mut self) -> &'a str {
        let end = self.rest.find('<').unwrap_or(self.rest.len());
        let text = &self.rest[..end];
        self.rest = &self.rest[end..];
        text
    }
}

// -- middleware status tuples -------------------------------------------------------------------

pub fn status_tuple(code: i32, message: &str, value: XmlRpcValue) -> XmlRpcValue {
    XmlRpcValue::Array(vec![
        XmlRpcValue::Int(code),
        XmlRpcValue::string(message),
        value,
    ])
}

/// Unwrap a `[code, statusMessage, value]` response; any code other than 1 is
///  a failure carrying the status message.
pub fn try_unwrap_status(value: XmlRpcValue) -> anyhow::Result<XmlRpcValue> {
    let mut items = value.into_array()?;
    if items.len() != 3 {
        bail!("malformed status tuple: expected 3 elements, got {}", items.len());
    }
    let payload = items.pop().expect("just checked the length");
    let message = items.pop().expect("just checked the length");
    let code = items.pop().expect("just checked the length").as_i32()?;

    if code != 1 {
        bail!("call failed with status {}: {}", code, message.as_str().unwrap_or("(no message)"));
    }
    Ok(payload)
}

// -- HTTP plumbing ------------------------------------------------------------------------------

/// The connect phase is kept separate from the request phase so the master
///  client can classify "endpoint unavailable" (retryable) apart from
///  failures of an established exchange (definitive).
pub async fn connect_http(uri: &Uri) -> std::io::Result<TcpStream> {
    let host = uri.host().ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("URI has no host: {}", uri))
    })?;
    let port = uri.port_u16().unwrap_or(80);
    TcpStream::connect((host, port)).await
}

pub async fn post_xml(stream: TcpStream, uri: &Uri, body: String) -> anyhow::Result<String> {
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!("HTTP connection ended with an error: {}", e);
        }
    });

    let authority = uri.authority().map(|a| a.as_str().to_string()).unwrap_or_default();
    let request = Request::builder()
        .method(Method::POST)
        .uri(uri.path())
        .header(header::HOST, authority)
        .header(header::CONTENT_TYPE, "text/xml")
        .body(Full::new(Bytes::from(body)))?;

    let response = sender.send_request(request).await?;
    if !response.status().is_success() {
        bail!("HTTP request to {} failed with status {}", uri, response.status());
    }
    let collected = response.collect().await?.to_bytes();
    Ok(String::from_utf8(collected.to_vec())?)
}

/// One-shot XML-RPC call, used for peer slave APIs (`requestTopic`) where the
///  master client's retry queue does not apply.
pub async fn call_xmlrpc(uri: &Uri, method: &str, params: &[XmlRpcValue]) -> anyhow::Result<XmlRpcValue> {
    let stream = connect_http(uri).await?;
    let body = post_xml(stream, uri, encode_request(method, params)).await?;
    parse_response(&body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use XmlRpcValue::*;

    #[rstest]
    #[case::int(Int(42))]
    #[case::negative(Int(-7))]
    #[case::bool_true(Bool(true))]
    #[case::bool_false(Bool(false))]
    #[case::double(Double(1.5))]
    #[case::string(Str("hello".to_string()))]
    #[case::string_escapes(Str("a<b & c>d".to_string()))]
    #[case::empty_string(Str("".to_string()))]
    #[case::empty_array(Array(vec![]))]
    #[case::nested(Array(vec![Int(1), Str("ok".to_string()), Array(vec![Str("http://h:1/".to_string())])]))]
    fn test_response_round_trip(#[case] value: XmlRpcValue) {
        let doc = encode_response(&value);
        assert_eq!(parse_response(&doc).unwrap(), value);
    }

    #[rstest]
    #[case::no_params("registerPublisher", vec![])]
    #[case::scalar_params("registerPublisher", vec![Str("/node".to_string()), Str("/chatter".to_string())])]
    #[case::nested("publisherUpdate", vec![Str("/master".to_string()), Array(vec![Str("http://a:1/".to_string()), Str("http://b:2/".to_string())])])]
    fn test_request_round_trip(#[case] method: &str, #[case] params: Vec<XmlRpcValue>) {
        let doc = encode_request(method, &params);
        let (parsed_method, parsed_params) = parse_request(&doc).unwrap();
        assert_eq!(parsed_method, method);
        assert_eq!(parsed_params, params);
    }

    #[test]
    fn test_parse_pretty_printed_response() {
        let doc = "<?xml version='1.0'?>\n<methodResponse>\n  <params>\n    <param>\n      <value><array><data>\n        <value><int>1</int></value>\n        <value><string>ok</string></value>\n        <value><i4>0</i4></value>\n      </data></array></value>\n    </param>\n  </params>\n</methodResponse>\n";
        let value = parse_response(doc).unwrap();
        assert_eq!(value, Array(vec![Int(1), Str("ok".to_string()), Int(0)]));
    }

    #[test]
    fn test_parse_bare_text_value() {
        let doc = "<methodResponse><params><param><value>plain</value></param></params></methodResponse>";
        assert_eq!(parse_response(doc).unwrap(), Str("plain".to_string()));
    }

    #[test]
    fn test_parse_fault_is_error() {
        let doc = "<methodResponse><fault><value><string>boom</string></value></fault></methodResponse>";
        assert!(parse_response(doc).is_err());
    }

    #[rstest]
    #[case::truncated("<methodResponse><params><param><value><int>1")]
    #[case::wrong_root("<somethingElse></somethingElse>")]
    #[case::unknown_type("<methodResponse><params><param><value><base64>x</base64></value></param></params></methodResponse>")]
    fn test_parse_malformed_is_error(#[case] doc: &str) {
        assert!(parse_response(doc).is_err());
    }

    #[test]
    fn test_unwrap_status_success() {
        let value = status_tuple(1, "ok", Int(7));
        assert_eq!(try_unwrap_status(value).unwrap(), Int(7));
    }

    #[rstest]
    #[case::failure_code(status_tuple(0, "no such topic", Int(0)))]
    #[case::error_code(status_tuple(-1, "not authorized", Int(0)))]
    #[case::not_an_array(Int(1))]
    #[case::wrong_arity(Array(vec![Int(1), Str("ok".to_string())]))]
    fn test_unwrap_status_failure(#[case] value: XmlRpcValue) {
        assert!(try_unwrap_status(value).is_err());
    }

    #[test]
    fn test_unwrap_status_carries_message() {
        let err = try_unwrap_status(status_tuple(0, "no providers", Int(0))).unwrap_err();
        assert!(err.to_string().contains("no providers"));
    }
}
