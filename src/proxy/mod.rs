//! Proxy front end
//!
//! The primary TLS listener. The handshake requests (but does not
//! require) a client certificate; every request is then dispatched on
//! the certificate's validity: authorized CONNECTs become tunnels,
//! everything else is forwarded to the configured default site so
//! unauthenticated probes see an ordinary web server.

pub mod tunnel;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use rustls::pki_types::CertificateDer;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::{Config, PerformanceConfig};
use crate::db::StatsDb;
use crate::stats::StatsSender;
use crate::tls::{common_name, IdentityVerifier};
use crate::users::UserGate;

const MAX_HEADER_SIZE: usize = 8192;

/// Minimal HTTP/1.1 response with a plain-text body.
pub(crate) fn simple_response(status: u16, reason: &str, body: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        reason,
        body.len(),
        body
    )
    .into_bytes()
}

/// Parsed request head from the hijacked stream.
#[derive(Debug)]
pub struct RequestHead {
    pub method: String,
    pub target: String,
    pub headers: Vec<(String, String)>,
    pub header_len: usize,
}

/// Parse an HTTP/1.x request head. `Ok(None)` means the head is not
/// complete yet.
pub fn parse_request_head(buf: &[u8]) -> Result<Option<RequestHead>> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(buf) {
        Ok(httparse::Status::Complete(header_len)) => Ok(Some(RequestHead {
            method: req.method.unwrap_or("").to_string(),
            target: req.path.unwrap_or("").to_string(),
            headers: req
                .headers
                .iter()
                .filter(|h| !h.name.is_empty())
                .map(|h| {
                    (
                        h.name.to_string(),
                        String::from_utf8_lossy(h.value).to_string(),
                    )
                })
                .collect(),
            header_len,
        })),
        Ok(httparse::Status::Partial) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub struct ProxyServer {
    inner: Arc<Inner>,
}

struct Inner {
    perf: PerformanceConfig,
    default_site: String,
    acceptor: TlsAcceptor,
    identity: IdentityVerifier,
    gate: Arc<UserGate>,
    stats: Option<StatsSender>,
    db: Option<StatsDb>,
    client: reqwest::Client,
}

impl ProxyServer {
    pub fn new(
        config: &Config,
        acceptor: TlsAcceptor,
        identity: IdentityVerifier,
        gate: Arc<UserGate>,
        stats: Option<StatsSender>,
        db: Option<StatsDb>,
    ) -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Inner {
                perf: config.server.performance.clone(),
                default_site: config.proxy.default_site.clone(),
                acceptor,
                identity,
                gate,
                stats,
                db,
                client: reqwest::Client::builder().build()?,
            }),
        })
    }

    /// Accept loop. Returns after cancellation once every in-flight
    /// connection task has finished.
    pub async fn run(self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let tracker = TaskTracker::new();

        loop {
            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    let inner = self.inner.clone();
                    tracker.spawn(async move {
                        if let Err(e) = inner.handle_connection(stream, peer).await {
                            debug!("Connection error from {}: {}", peer, e);
                        }
                    });
                }
                Err(e) => warn!("Accept error: {}", e),
            }
        }

        // Let in-flight tunnels drain; they end when their peers close
        tracker.close();
        tracker.wait().await;
        Ok(())
    }
}

impl Inner {
    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        tunnel::tune_socket(&stream, &self.perf);
        let mut tls = self.acceptor.accept(stream).await?;

        let peer_certs: Vec<CertificateDer<'static>> = tls
            .get_ref()
            .1
            .peer_certificates()
            .map(|certs| certs.to_vec())
            .unwrap_or_default();

        let mut buf = Vec::with_capacity(2048);
        let head = loop {
            let mut chunk = [0u8; 2048];
            let n = tls.read(&mut chunk).await?;
            if n == 0 {
                // Closed before sending a complete request
                return Ok(());
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(head) = parse_request_head(&buf)? {
                break head;
            }
            if buf.len() > MAX_HEADER_SIZE {
                anyhow::bail!("request head too large");
            }
        };
        let leftover = buf.split_off(head.header_len);

        self.dispatch(tls, peer, head, leftover, peer_certs).await
    }

    async fn dispatch(
        &self,
        mut tls: TlsStream<TcpStream>,
        peer: SocketAddr,
        head: RequestHead,
        leftover: Vec<u8>,
        peer_certs: Vec<CertificateDer<'static>>,
    ) -> Result<()> {
        let is_connect = head.method == "CONNECT";

        if peer_certs.is_empty() {
            debug!("No client certificate: {} {} from {}", head.method, head.target, peer);
            if is_connect {
                tls.write_all(&simple_response(
                    405,
                    "Method Not Allowed",
                    "Client certificate required",
                ))
                .await?;
                return Ok(());
            }
            return self.forward_to_default_site(tls, head, leftover).await;
        }

        let username = common_name(&peer_certs[0]);
        let valid = self.identity.verify(&peer_certs);

        if valid && self.gate.is_disabled(&username).await {
            warn!("Disabled user rejected: {}, CN: {}", peer, username);
            tls.write_all(&simple_response(
                403,
                "Forbidden",
                "Access denied: Your account has been disabled",
            ))
            .await?;
            return Ok(());
        }

        if is_connect {
            if !valid {
                warn!("Unauthorized client: {}, CN: {}", peer, username);
                tls.write_all(&simple_response(
                    405,
                    "Method Not Allowed",
                    "Invalid client certificate",
                ))
                .await?;
                return Ok(());
            }

            info!("Authorized CONNECT {} from {}, CN: {}", head.target, peer, username);
            return tunnel::handle_connect(
                tls,
                &head.target,
                &leftover,
                &self.perf,
                &username,
                self.stats.as_ref(),
            )
            .await;
        }

        // Non-CONNECT under a valid certificate counts as a request;
        // either way the request goes to the decoy site.
        if valid {
            if let Some(db) = self.db.clone() {
                let username = username.clone();
                tokio::spawn(async move {
                    if let Err(e) = db.increment_request_count(&username).await {
                        warn!("Failed to count request for {}: {}", username, e);
                    }
                });
            }
        }
        self.forward_to_default_site(tls, head, leftover).await
    }

    /// Forward a non-CONNECT request to the configured landing page,
    /// carrying the URI and headers through verbatim.
    async fn forward_to_default_site(
        &self,
        mut tls: TlsStream<TcpStream>,
        head: RequestHead,
        leftover: Vec<u8>,
    ) -> Result<()> {
        if self.default_site.is_empty() {
            tls.write_all(&simple_response(404, "Not Found", "Page not found"))
                .await?;
            return Ok(());
        }

        let content_length = head
            .headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-length"))
            .and_then(|(_, value)| value.trim().parse::<usize>().ok())
            .unwrap_or(0);

        let mut body = leftover;
        while body.len() < content_length {
            let mut chunk = vec![0u8; (content_length - body.len()).min(64 * 1024)];
            let n = tls.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }

        let url = format!("{}{}", self.default_site, head.target);
        let method = reqwest::Method::from_bytes(head.method.as_bytes())?;
        let mut request = self.client.request(method, &url);
        for (name, value) in &head.headers {
            // Host belongs to the default site, the length is recomputed
            if name.eq_ignore_ascii_case("host") || name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            request = request.header(name.as_str(), value.as_str());
        }
        if !body.is_empty() {
            request = request.body(body);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("Default site request failed: {}", e);
                tls.write_all(&simple_response(404, "Not Found", "Page not found"))
                    .await?;
                return Ok(());
            }
        };

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.unwrap_or_default();

        let mut out = format!(
            "HTTP/1.1 {} {}\r\n",
            status.as_u16(),
            status.canonical_reason().unwrap_or("")
        )
        .into_bytes();
        for (name, value) in headers.iter() {
            let name = name.as_str();
            if name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("transfer-encoding")
                || name.eq_ignore_ascii_case("connection")
            {
                continue;
            }
            out.extend_from_slice(name.as_bytes());
            out.extend_from_slice(b": ");
            out.extend_from_slice(value.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(
            format!("Content-Length: {}\r\nConnection: close\r\n\r\n", body.len()).as_bytes(),
        );
        out.extend_from_slice(&body);
        tls.write_all(&out).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Certificates, Config};
    use crate::stats::StatsCollector;
    use crate::tls::{self, install_crypto_provider};
    use rcgen::{
        BasicConstraints, CertificateParams, DistinguishedName as RcgenDn, DnType,
        ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose,
    };
    use rustls::pki_types::{PrivatePkcs8KeyDer, ServerName};
    use rustls::RootCertStore;
    use std::time::Duration;
    use tokio_rustls::TlsConnector;

    #[test]
    fn parses_connect_head() {
        let head = parse_request_head(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.method, "CONNECT");
        assert_eq!(head.target, "example.com:443");
        assert_eq!(head.headers.len(), 1);
    }

    #[test]
    fn partial_head_is_none() {
        assert!(parse_request_head(b"GET / HTTP/1.1\r\nHost: exa")
            .unwrap()
            .is_none());
    }

    #[test]
    fn garbage_head_is_an_error() {
        assert!(parse_request_head(b"\x16\x03\x01\x02\x00garbage").is_err());
    }

    #[test]
    fn simple_response_shape() {
        let bytes = simple_response(405, "Method Not Allowed", "Client certificate required");
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 405 Method Not Allowed\r\n"));
        assert!(text.contains("Content-Length: 27\r\n"));
        assert!(text.ends_with("\r\n\r\nClient certificate required"));
    }

    // ---- end-to-end over real TLS ----

    struct TestPki {
        dir: tempfile::TempDir,
        ca_der: rustls::pki_types::CertificateDer<'static>,
        issuer: Issuer<'static, KeyPair>,
    }

    fn make_pki() -> TestPki {
        install_crypto_provider();
        let dir = tempfile::tempdir().unwrap();

        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::default();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];
        let mut dn = RcgenDn::new();
        dn.push(DnType::CommonName, "certproxy test CA");
        ca_params.distinguished_name = dn;
        let ca_cert = ca_params.clone().self_signed(&ca_key).unwrap();

        let server_key = KeyPair::generate().unwrap();
        let mut server_params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
        server_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let issuer = Issuer::new(ca_params, ca_key);
        let server_cert = server_params.signed_by(&server_key, &issuer).unwrap();

        std::fs::write(dir.path().join("ca.pem"), ca_cert.pem()).unwrap();
        std::fs::write(dir.path().join("server.pem"), server_cert.pem()).unwrap();
        std::fs::write(dir.path().join("server.key"), server_key.serialize_pem()).unwrap();

        TestPki {
            dir,
            ca_der: ca_cert.der().clone(),
            issuer,
        }
    }

    fn client_config_with_cert(pki: &TestPki, cn: &str) -> rustls::ClientConfig {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::new(Vec::<String>::new()).unwrap();
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        let mut dn = RcgenDn::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        let cert = params.signed_by(&key, &pki.issuer).unwrap();

        let mut roots = RootCertStore::empty();
        roots.add(pki.ca_der.clone()).unwrap();
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_client_auth_cert(
                vec![cert.der().clone()],
                PrivatePkcs8KeyDer::from(key.serialize_der()).into(),
            )
            .unwrap()
    }

    fn client_config_anonymous(pki: &TestPki) -> rustls::ClientConfig {
        let mut roots = RootCertStore::empty();
        roots.add(pki.ca_der.clone()).unwrap();
        rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    }

    struct TestProxy {
        addr: SocketAddr,
        db: StatsDb,
        gate: Arc<UserGate>,
        collector: Option<StatsCollector>,
        cancel: CancellationToken,
    }

    async fn start_proxy(pki: &TestPki, default_site: &str) -> TestProxy {
        let certs = Certificates {
            cert_path: pki.dir.path().join("server.pem").to_str().unwrap().to_string(),
            key_path: pki.dir.path().join("server.key").to_str().unwrap().to_string(),
            ca_path: pki.dir.path().join("ca.pem").to_str().unwrap().to_string(),
        };
        let roots = tls::load_root_store(&certs.ca_path).unwrap();
        let identity = IdentityVerifier::new(roots.clone()).unwrap();
        let acceptor = tls::proxy_acceptor(&certs, roots).unwrap();

        let db = StatsDb::new(pki.dir.path().join("stats.db").to_str().unwrap())
            .await
            .unwrap();
        let collector = StatsCollector::new(db.clone(), None, 3600);
        let gate = Arc::new(UserGate::new(Some(db.clone())));

        let config_json = format!(
            r#"{{"server": {{"certificates": {{"cert_path": "{}", "key_path": "{}", "ca_path": "{}"}}}}, "proxy": {{"default_site": "{}", "enabled": true}}}}"#,
            certs.cert_path, certs.key_path, certs.ca_path, default_site
        );
        let config_path = pki.dir.path().join("config.json");
        std::fs::write(&config_path, config_json).unwrap();
        let config = Config::load_from(config_path.to_str().unwrap()).unwrap();

        let server = ProxyServer::new(
            &config,
            acceptor,
            identity,
            gate.clone(),
            Some(collector.sender()),
            Some(db.clone()),
        )
        .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let run_cancel = cancel.clone();
        tokio::spawn(async move {
            let _ = server.run(listener, run_cancel).await;
        });

        TestProxy {
            addr,
            db,
            gate,
            collector: Some(collector),
            cancel,
        }
    }

    async fn tls_connect(
        addr: SocketAddr,
        config: rustls::ClientConfig,
    ) -> tokio_rustls::client::TlsStream<TcpStream> {
        let connector = TlsConnector::from(Arc::new(config));
        let tcp = TcpStream::connect(addr).await.unwrap();
        connector
            .connect(ServerName::try_from("localhost").unwrap(), tcp)
            .await
            .unwrap()
    }

    async fn spawn_echo_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = vec![0u8; 1024];
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if socket.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn authorized_connect_tunnels_and_records_traffic() {
        let pki = make_pki();
        let mut proxy = start_proxy(&pki, "").await;
        let echo = spawn_echo_server().await;

        let mut stream = tls_connect(proxy.addr, client_config_with_cert(&pki, "alice")).await;
        let request = format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n", port = echo.port());
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut status = [0u8; tunnel::CONNECT_ESTABLISHED.len()];
        stream.read_exact(&mut status).await.unwrap();
        assert_eq!(&status[..], tunnel::CONNECT_ESTABLISHED);

        stream.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");
        drop(stream);

        // The event is emitted once the tunnel has fully closed
        tokio::time::sleep(Duration::from_millis(300)).await;
        proxy.collector.take().unwrap().stop().await;

        let user = proxy.db.get_user("alice").await.unwrap().unwrap();
        assert_eq!(user.total_upload, 5);
        assert_eq!(user.total_download, 5);
        assert_eq!(user.conn_count, 1);

        proxy.cancel.cancel();
    }

    #[tokio::test]
    async fn connect_without_certificate_is_405() {
        let pki = make_pki();
        let proxy = start_proxy(&pki, "").await;

        let mut stream = tls_connect(proxy.addr, client_config_anonymous(&pki)).await;
        stream
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        let _ = stream.read_to_end(&mut response).await;
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 405 Method Not Allowed"));
        assert!(response.contains("Client certificate required"));

        proxy.cancel.cancel();
    }

    #[tokio::test]
    async fn disabled_user_gets_403_until_reenabled() {
        let pki = make_pki();
        let proxy = start_proxy(&pki, "").await;
        let echo = spawn_echo_server().await;

        proxy.gate.set_disabled("alice", true).await.unwrap();

        let mut stream = tls_connect(proxy.addr, client_config_with_cert(&pki, "alice")).await;
        let request = format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n", port = echo.port());
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = Vec::new();
        let _ = stream.read_to_end(&mut response).await;
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 403 Forbidden"));
        assert!(response.contains("Access denied: Your account has been disabled"));

        proxy.gate.set_disabled("alice", false).await.unwrap();

        let mut stream = tls_connect(proxy.addr, client_config_with_cert(&pki, "alice")).await;
        let request = format!("CONNECT 127.0.0.1:{port} HTTP/1.1\r\nHost: 127.0.0.1:{port}\r\n\r\n", port = echo.port());
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut status = [0u8; tunnel::CONNECT_ESTABLISHED.len()];
        stream.read_exact(&mut status).await.unwrap();
        assert_eq!(&status[..], tunnel::CONNECT_ESTABLISHED);

        proxy.cancel.cancel();
    }

    #[tokio::test]
    async fn non_connect_without_default_site_is_404() {
        let pki = make_pki();
        let proxy = start_proxy(&pki, "").await;

        let mut stream = tls_connect(proxy.addr, client_config_anonymous(&pki)).await;
        stream
            .write_all(b"GET /probe HTTP/1.1\r\nHost: whatever\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        let _ = stream.read_to_end(&mut response).await;
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 404 Not Found"));
        assert!(response.contains("Page not found"));

        proxy.cancel.cancel();
    }

    #[tokio::test]
    async fn valid_non_connect_increments_request_counter() {
        let pki = make_pki();
        let proxy = start_proxy(&pki, "").await;

        let mut stream = tls_connect(proxy.addr, client_config_with_cert(&pki, "bob")).await;
        stream
            .write_all(b"GET / HTTP/1.1\r\nHost: whatever\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        let _ = stream.read_to_end(&mut response).await;

        tokio::time::sleep(Duration::from_millis(300)).await;
        let user = proxy.db.get_user("bob").await.unwrap().unwrap();
        assert_eq!(user.request_count, 1);

        proxy.cancel.cancel();
    }

    /// One-shot plain-HTTP upstream that captures the raw request head
    /// and answers with a fixed response.
    async fn spawn_capturing_site() -> (SocketAddr, tokio::sync::oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (captured_tx, captured_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut raw = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                // Done once the head and any content-length body arrived
                if let Some(pos) = raw.windows(4).position(|w| w == b"\r\n\r\n") {
                    let head = String::from_utf8_lossy(&raw[..pos]).to_ascii_lowercase();
                    let body_len = head
                        .lines()
                        .find_map(|line| line.strip_prefix("content-length:"))
                        .and_then(|value| value.trim().parse::<usize>().ok())
                        .unwrap_or(0);
                    if raw.len() >= pos + 4 + body_len {
                        break;
                    }
                }
                match socket.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => raw.extend_from_slice(&buf[..n]),
                }
            }
            let _ = captured_tx.send(String::from_utf8_lossy(&raw).to_string());
            let _ = socket
                .write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nX-Upstream: yes\r\nContent-Length: 8\r\n\r\nupstream",
                )
                .await;
        });
        (addr, captured_rx)
    }

    #[tokio::test]
    async fn probe_requests_are_forwarded_to_default_site_verbatim() {
        let pki = make_pki();
        let (site_addr, captured_rx) = spawn_capturing_site().await;
        let default_site = format!("http://127.0.0.1:{}", site_addr.port());
        let proxy = start_proxy(&pki, &default_site).await;

        let mut stream = tls_connect(proxy.addr, client_config_anonymous(&pki)).await;
        stream
            .write_all(
                b"GET /landing?q=1 HTTP/1.1\r\nHost: probe.example\r\nX-Probe: abc123\r\nUser-Agent: curl/8.0\r\n\r\n",
            )
            .await
            .unwrap();

        // The client sees the default site's status, headers and body
        let mut response = Vec::new();
        let _ = stream.read_to_end(&mut response).await;
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.to_ascii_lowercase().contains("x-upstream: yes"));
        assert!(response.ends_with("upstream"));

        // The upstream sees the original URI and headers; Host belongs
        // to the default site.
        let captured = captured_rx.await.unwrap();
        assert_eq!(
            captured.lines().next(),
            Some("GET /landing?q=1 HTTP/1.1")
        );
        let captured = captured.to_ascii_lowercase();
        assert!(captured.contains("x-probe: abc123"));
        assert!(captured.contains("user-agent: curl/8.0"));
        assert!(captured.contains(&format!("host: 127.0.0.1:{}", site_addr.port())));
        assert!(!captured.contains("probe.example"));

        proxy.cancel.cancel();
    }

    #[tokio::test]
    async fn forwarded_post_carries_the_request_body() {
        let pki = make_pki();
        let (site_addr, captured_rx) = spawn_capturing_site().await;
        let default_site = format!("http://127.0.0.1:{}", site_addr.port());
        let proxy = start_proxy(&pki, &default_site).await;

        let mut stream = tls_connect(proxy.addr, client_config_anonymous(&pki)).await;
        stream
            .write_all(
                b"POST /login HTTP/1.1\r\nHost: probe.example\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: 9\r\n\r\nuser=root",
            )
            .await
            .unwrap();

        let mut response = Vec::new();
        let _ = stream.read_to_end(&mut response).await;
        let response = String::from_utf8_lossy(&response);
        assert!(response.starts_with("HTTP/1.1 200 OK"));

        let captured = captured_rx.await.unwrap();
        assert_eq!(captured.lines().next(), Some("POST /login HTTP/1.1"));
        let lower = captured.to_ascii_lowercase();
        assert!(lower.contains("content-type: application/x-www-form-urlencoded"));
        assert!(captured.ends_with("user=root"));

        proxy.cancel.cancel();
    }
}
