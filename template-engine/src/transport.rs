//! Network transports: raw HTTP packets over reqwest and raw TCP conversations

use crate::codec;
use crate::error::TransportError;
use crate::generator::{NetworkPlan, PreparedRequest};
use crate::packet::RawPacket;
use async_trait::async_trait;
use dashmap::DashMap;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Per-send options taken from the sequence and the engine configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendOptions {
    pub timeout: Duration,
    pub follow_redirects: bool,
    pub max_redirects: usize,
    /// Truncate response bodies past this many bytes
    pub max_size: Option<usize>,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            follow_redirects: false,
            max_redirects: 3,
            max_size: None,
        }
    }
}

/// A raw HTTP response packet and how long it took
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub packet: Vec<u8>,
    pub duration: Duration,
    /// Final URL after redirects
    pub url: String,
}

/// Sends one prepared HTTP packet
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(
        &self,
        request: &PreparedRequest,
        options: &SendOptions,
    ) -> Result<TransportResponse, TransportError>;
}

/// Default HTTP transport backed by reqwest
///
/// reqwest fixes the redirect policy per client, so one client is kept per
/// distinct policy.
pub struct ReqwestTransport {
    proxy: Option<String>,
    clients: DashMap<(bool, usize), reqwest::Client>,
}

impl ReqwestTransport {
    pub fn new(proxy: Option<String>) -> Self {
        Self {
            proxy,
            clients: DashMap::new(),
        }
    }

    fn client(&self, options: &SendOptions) -> Result<reqwest::Client, TransportError> {
        let key = (options.follow_redirects, options.max_redirects);
        if let Some(client) = self.clients.get(&key) {
            return Ok(client.clone());
        }
        let policy = if options.follow_redirects {
            reqwest::redirect::Policy::limited(options.max_redirects)
        } else {
            reqwest::redirect::Policy::none()
        };
        let mut builder = reqwest::Client::builder()
            .danger_accept_invalid_certs(true)
            .redirect(policy);
        if let Some(proxy) = &self.proxy {
            let proxy = reqwest::Proxy::all(proxy).map_err(|err| TransportError::Connection {
                target: proxy.clone(),
                reason: err.to_string(),
            })?;
            builder = builder.proxy(proxy);
        }
        let client = builder.build().map_err(|err| TransportError::Io {
            reason: err.to_string(),
        })?;
        self.clients.insert(key, client.clone());
        Ok(client)
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Headers reqwest computes itself
const SKIPPED_HEADERS: [&str; 3] = ["content-length", "connection", "transfer-encoding"];

fn target_url(packet: &RawPacket, request: &PreparedRequest) -> Result<url::Url, TransportError> {
    let url = packet
        .request_url(request.is_https)
        .ok_or_else(|| TransportError::MalformedRequest {
            reason: "packet has neither an absolute URL nor a Host header".to_string(),
        })?;
    let mut url = url::Url::parse(&url).map_err(|err| TransportError::MalformedRequest {
        reason: format!("{}: {}", url, err),
    })?;
    if let Some(host) = request.override_host.as_deref().filter(|h| !h.is_empty()) {
        let (name, port) = match host.rsplit_once(':') {
            Some((name, port)) if port.parse::<u16>().is_ok() => (name, port.parse::<u16>().ok()),
            _ => (host, None),
        };
        url.set_host(Some(name)).map_err(|err| TransportError::MalformedRequest {
            reason: format!("override host {}: {}", host, err),
        })?;
        if port.is_some() {
            let _ = url.set_port(port);
        }
    }
    Ok(url)
}

fn reason_phrase(status: reqwest::StatusCode) -> &'static str {
    status.canonical_reason().unwrap_or("")
}

#[async_trait]
impl Transport for ReqwestTransport {
    async fn send(
        &self,
        request: &PreparedRequest,
        options: &SendOptions,
    ) -> Result<TransportResponse, TransportError> {
        let packet = RawPacket::parse(&request.packet);
        let url = target_url(&packet, request)?;
        let method = reqwest::Method::from_bytes(packet.method().as_bytes()).map_err(|err| {
            TransportError::MalformedRequest {
                reason: format!("method {}: {}", packet.method(), err),
            }
        })?;
        if request.sni.is_some() {
            debug!(url = %url, "custom SNI is not supported by the reqwest transport, using the URL host");
        }

        let client = self.client(options)?;
        let timeout = request.timeout.unwrap_or(options.timeout);
        let mut builder = client.request(method, url.clone()).timeout(timeout);
        for (name, value) in &packet.headers {
            if SKIPPED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !packet.body.is_empty() {
            builder = builder.body(packet.body.clone());
        }

        let started = Instant::now();
        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                TransportError::Timeout {
                    duration_ms: timeout.as_millis() as u64,
                }
            } else {
                TransportError::Connection {
                    target: url.to_string(),
                    reason: err.to_string(),
                }
            }
        })?;

        let status = response.status();
        let final_url = response.url().to_string();
        let mut head = format!(
            "{:?} {} {}\r\n",
            response.version(),
            status.as_u16(),
            reason_phrase(status)
        );
        for (name, value) in response.headers() {
            head.push_str(&format!(
                "{}: {}\r\n",
                name,
                codec::from_bytes(value.as_bytes().to_vec())
            ));
        }
        head.push_str("\r\n");

        let mut body = response
            .bytes()
            .await
            .map_err(|err| TransportError::Io {
                reason: err.to_string(),
            })?
            .to_vec();
        if let Some(limit) = options.max_size {
            body.truncate(limit);
        }
        let duration = started.elapsed();

        let mut raw = codec::to_bytes(&head);
        raw.extend_from_slice(&body);
        debug!(url = %final_url, status = status.as_u16(), bytes = raw.len(), "response received");
        Ok(TransportResponse {
            packet: raw,
            duration,
            url: final_url,
        })
    }
}

/// Bytes exchanged during one TCP conversation
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetworkExchange {
    /// Everything written, in order
    pub sent: Vec<u8>,
    /// Everything read, in order
    pub received: Vec<u8>,
    /// Chunks read by named input steps
    pub named: Vec<(String, Vec<u8>)>,
    pub duration: Duration,
}

/// Runs one write/read conversation against an address
#[async_trait]
pub trait NetworkTransport: Send + Sync {
    async fn converse(
        &self,
        address: &str,
        plan: &NetworkPlan,
        timeout: Duration,
    ) -> Result<NetworkExchange, TransportError>;
}

/// Plain TCP over tokio
#[derive(Debug, Default, Clone)]
pub struct TcpNetworkTransport;

async fn read_up_to(stream: &mut TcpStream, limit: usize, timeout: Duration) -> Result<Vec<u8>, TransportError> {
    let mut buffer = vec![0u8; limit];
    match tokio::time::timeout(timeout, stream.read(&mut buffer)).await {
        Ok(Ok(read)) => {
            buffer.truncate(read);
            Ok(buffer)
        }
        Ok(Err(err)) => Err(err.into()),
        // Silence is an empty answer, not a failure
        Err(_) => Ok(Vec::new()),
    }
}

#[async_trait]
impl NetworkTransport for TcpNetworkTransport {
    async fn converse(
        &self,
        address: &str,
        plan: &NetworkPlan,
        timeout: Duration,
    ) -> Result<NetworkExchange, TransportError> {
        if address.starts_with("tls://") {
            return Err(TransportError::Unsupported {
                reason: format!("TLS network targets ({})", address),
            });
        }
        let started = Instant::now();
        let mut stream = tokio::time::timeout(timeout, TcpStream::connect(address))
            .await
            .map_err(|_| TransportError::Timeout {
                duration_ms: timeout.as_millis() as u64,
            })?
            .map_err(|err| TransportError::Connection {
                target: address.to_string(),
                reason: err.to_string(),
            })?;

        let mut exchange = NetworkExchange::default();
        for step in &plan.steps {
            if !step.data.is_empty() {
                stream.write_all(&step.data).await?;
                exchange.sent.extend_from_slice(&step.data);
            }
            if step.read > 0 {
                let chunk = read_up_to(&mut stream, step.read, timeout).await?;
                exchange.received.extend_from_slice(&chunk);
                if let Some(name) = &step.name {
                    exchange.named.push((name.clone(), chunk));
                }
            }
        }
        if plan.read_size > 0 {
            let tail = read_up_to(&mut stream, plan.read_size, timeout).await?;
            exchange.received.extend_from_slice(&tail);
        }
        if let Err(err) = stream.shutdown().await {
            warn!(address = %address, error = %err, "TCP shutdown failed");
        }
        exchange.duration = started.elapsed();
        debug!(address = %address, sent = exchange.sent.len(), received = exchange.received.len(), "conversation finished");
        Ok(exchange)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::NetworkStep;
    use tokio::net::TcpListener;

    fn prepared(packet: &str, override_host: Option<&str>) -> PreparedRequest {
        PreparedRequest {
            sequence_index: 0,
            template_index: 0,
            packet: packet.as_bytes().to_vec(),
            is_https: false,
            sni: None,
            timeout: None,
            override_host: override_host.map(str::to_string),
        }
    }

    #[test]
    fn test_target_url() {
        let request = prepared("GET /a?b=1 HTTP/1.1\r\nHost: example.com:8080\r\n\r\n", None);
        let packet = RawPacket::parse(&request.packet);
        assert_eq!(
            target_url(&packet, &request).map(|u| u.to_string()).ok(),
            Some("http://example.com:8080/a?b=1".to_string())
        );

        let overridden = prepared("GET / HTTP/1.1\r\nHost: example.com\r\n\r\n", Some("127.0.0.1:9000"));
        let packet = RawPacket::parse(&overridden.packet);
        assert_eq!(
            target_url(&packet, &overridden).map(|u| u.to_string()).ok(),
            Some("http://127.0.0.1:9000/".to_string())
        );

        let hostless = prepared("GET / HTTP/1.1\r\n\r\n", None);
        let packet = RawPacket::parse(&hostless.packet);
        assert!(matches!(
            target_url(&packet, &hostless),
            Err(TransportError::MalformedRequest { .. })
        ));
    }

    #[tokio::test]
    async fn test_tcp_conversation() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let address = listener.local_addr().expect("address").to_string();
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let mut buffer = [0u8; 64];
                if let Ok(read) = socket.read(&mut buffer).await {
                    if &buffer[..read] == b"PING\r\n" {
                        let _ = socket.write_all(b"+PONG\r\n").await;
                    }
                }
            }
        });

        let plan = NetworkPlan {
            steps: vec![NetworkStep {
                data: b"PING\r\n".to_vec(),
                read: 7,
                name: Some("reply".into()),
            }],
            read_size: 0,
        };
        let exchange = TcpNetworkTransport
            .converse(&address, &plan, Duration::from_secs(2))
            .await
            .expect("conversation");
        assert_eq!(exchange.sent, b"PING\r\n");
        assert_eq!(exchange.received, b"+PONG\r\n");
        assert_eq!(exchange.named[0].0, "reply");
    }

    #[tokio::test]
    async fn test_tls_addresses_are_unsupported() {
        let plan = NetworkPlan {
            steps: Vec::new(),
            read_size: 16,
        };
        let result = TcpNetworkTransport
            .converse("tls://example.com:443", &plan, Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(TransportError::Unsupported { .. })));
    }
}
