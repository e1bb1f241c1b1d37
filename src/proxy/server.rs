//! Proxy front-end: listens on an OS-assigned port, dispatches `CONNECT`
//! to the MITM path or the opaque tunnel.

use super::http_io::{read_request_head, respond_with_status, split_host_and_port};
use super::mitm::{self, MitmContext};
use super::tunnel::{self, UpstreamProxy};
use crate::registry;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

/// Accepts connections until the listener is dropped or an unrecoverable
/// accept error occurs. One task is spawned per connection.
pub async fn run_server(listener: TcpListener, ctx: Arc<MitmContext>) -> anyhow::Result<()> {
    loop {
        let (socket, _addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!("accept failed: {err}");
                continue;
            }
        };

        let ctx = ctx.clone();
        tokio::spawn(async move {
            if let Err(err) = handle_connection(socket, ctx).await {
                tracing::debug!("connection closed with error: {err}");
            }
        });
    }
}

async fn handle_connection(mut socket: TcpStream, ctx: Arc<MitmContext>) -> anyhow::Result<()> {
    let (parsed, leftover) = read_request_head(&mut socket).await?;

    if !parsed.method.eq_ignore_ascii_case("CONNECT") {
        respond_with_status(&mut socket, 400, "Bad Request", "only CONNECT is supported").await?;
        return Ok(());
    }

    let (host, port) = split_host_and_port(&parsed.path, 443);

    let kind = registry::registry_kind_for_host(
        &host,
        ctx.pipeline.ecosystem(),
        ctx.pipeline.npm_custom_registries(),
        ctx.pipeline.pip_custom_registries(),
    );

    if kind.is_some() {
        mitm::intercept(socket, host, ctx).await
    } else {
        handle_opaque_tunnel(socket, Vec::from(leftover), host, port, ctx).await
    }
}

async fn handle_opaque_tunnel(
    mut client: TcpStream,
    leftover: Vec<u8>,
    host: String,
    port: u16,
    ctx: Arc<MitmContext>,
) -> anyhow::Result<()> {
    let upstream_proxy = UpstreamProxy::from_env(&host);
    match tunnel::connect_origin(&host, port, upstream_proxy.as_ref(), &ctx.imds_timeouts).await {
        Ok(mut upstream) => {
            client.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n").await?;
            if !leftover.is_empty() {
                upstream.write_all(&leftover).await?;
            }
            tunnel::relay(client, upstream).await
        }
        Err(err) => {
            tracing::warn!("failed to open tunnel to {host}:{port}: {err}");
            client.write_all(b"HTTP/1.1 502 Bad Gateway\r\n\r\n").await?;
            Ok(())
        }
    }
}
