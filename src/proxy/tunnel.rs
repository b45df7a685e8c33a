//! CONNECT tunnel handling
//!
//! After a CONNECT is authorized the client's TLS stream is taken over
//! entirely: dial the target, confirm with the exact `HTTP/1.0 200`
//! status line, then pump bytes both ways until either side closes.
//! Each direction runs with its own buffer; the totals feed exactly
//! one traffic event when the tunnel ends.

use std::time::Duration;

use anyhow::Result;
use socket2::{SockRef, TcpKeepalive};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use super::simple_response;
use crate::config::PerformanceConfig;
use crate::counter::{ByteCount, CountingReader, CountingWriter};
use crate::stats::{StatsSender, TrafficEvent};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Byte-exact success line; HTTP/1.0 matches what mainstream clients
/// have always been sent here.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.0 200 Connection established\r\n\r\n";

/// Split a CONNECT target into host and port, defaulting to 443.
pub fn parse_target(target: &str) -> (String, u16) {
    if let Some(rest) = target.strip_prefix('[') {
        // Bracketed IPv6 authority
        if let Some((host, after)) = rest.split_once(']') {
            let port = after
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(443);
            return (host.to_string(), port);
        }
    }
    match target.rsplit_once(':') {
        Some((host, port)) => (host.to_string(), port.parse().unwrap_or(443)),
        None => (target.to_string(), 443),
    }
}

/// Apply the configured TCP knobs to one side of a tunnel.
pub fn tune_socket(stream: &TcpStream, perf: &PerformanceConfig) {
    let _ = stream.set_nodelay(perf.no_delay);
    let sock = SockRef::from(stream);
    let keepalive = TcpKeepalive::new()
        .with_time(Duration::from_secs(perf.tcp_keep_alive))
        .with_interval(Duration::from_secs(perf.tcp_keep_alive));
    let _ = sock.set_tcp_keepalive(&keepalive);
    let _ = sock.set_recv_buffer_size(perf.read_buffer_size);
    let _ = sock.set_send_buffer_size(perf.write_buffer_size);
}

/// Relay an authorized CONNECT. `leftover` is whatever the client
/// pipelined after the request head; it belongs to the upstream.
pub async fn handle_connect<S>(
    mut client: S,
    target: &str,
    leftover: &[u8],
    perf: &PerformanceConfig,
    username: &str,
    stats: Option<&StatsSender>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (host, port) = parse_target(target);

    let upstream = match timeout(CONNECT_TIMEOUT, TcpStream::connect((host.as_str(), port))).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            debug!("Dial {}:{} failed: {}", host, port, e);
            let body = format!("failed to connect to target host: {}", e);
            let _ = client
                .write_all(&simple_response(502, "Bad Gateway", &body))
                .await;
            return Ok(());
        }
        Err(_) => {
            debug!("Dial {}:{} timed out", host, port);
            let body = "failed to connect to target host: connection timed out";
            let _ = client
                .write_all(&simple_response(502, "Bad Gateway", body))
                .await;
            return Ok(());
        }
    };

    let target_ip = upstream
        .peer_addr()
        .map(|addr| addr.ip().to_string())
        .unwrap_or_default();
    tune_socket(&upstream, perf);

    // If this write fails the connection is already dead; nothing to
    // answer and no event to emit.
    client.write_all(CONNECT_ESTABLISHED).await?;

    let upload = ByteCount::new();
    let download = ByteCount::new();

    let (client_rd, client_wr) = tokio::io::split(client);
    let (upstream_rd, mut upstream_wr) = upstream.into_split();

    if !leftover.is_empty() {
        upstream_wr.write_all(leftover).await?;
        upload.add(leftover.len() as u64);
    }

    // Each direction owns its buffer; they run concurrently.
    let buffer_size = perf.buffer_size.max(1);
    let upload_count = upload.clone();
    let client_to_server = tokio::spawn(async move {
        let mut reader =
            BufReader::with_capacity(buffer_size, CountingReader::new(client_rd, upload_count));
        let _ = tokio::io::copy_buf(&mut reader, &mut upstream_wr).await;
        // Half-close so the peer direction sees EOF
        let _ = upstream_wr.shutdown().await;
    });

    let mut reader = BufReader::with_capacity(buffer_size, upstream_rd);
    let mut writer = CountingWriter::new(client_wr, download.clone());
    let _ = tokio::io::copy_buf(&mut reader, &mut writer).await;
    let _ = writer.shutdown().await;
    let _ = client_to_server.await;

    debug!(
        "Tunnel to {}:{} closed: up={} down={}",
        host,
        port,
        upload.get(),
        download.get()
    );

    if let Some(stats) = stats {
        stats.record(TrafficEvent::new(
            username.to_string(),
            host,
            target_ip,
            upload.get(),
            download.get(),
        ));
    }
    Ok(())
}
