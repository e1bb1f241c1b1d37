//! TLS-terminating registry interception.

use super::http_io::{
    self, read_body, read_request_head, read_response_head, respond_with_status,
    should_keep_alive, write_request_head, write_response,
};
use super::tunnel::{connect_origin, ImdsTimeoutSet, UpstreamProxy};
use crate::blocked::{BlockedRegistry, BlockedRequest};
use crate::certs::CertManager;
use crate::interceptor::InterceptorPipeline;
use crate::registry::npm_rewrite;
use anyhow::Context;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub struct MitmContext {
    pub cert_manager: Arc<CertManager>,
    pub tls_client_config: Arc<rustls::ClientConfig>,
    pub pipeline: Arc<InterceptorPipeline>,
    pub blocked: Arc<BlockedRegistry>,
    pub imds_timeouts: Arc<ImdsTimeoutSet>,
}

/// Handles one `CONNECT host:port` that matched a recognized registry:
/// replies 200, terminates TLS with a minted leaf, and loops over the
/// decrypted HTTP/1.1 requests that follow.
pub async fn intercept(client: TcpStream, host: String, ctx: Arc<MitmContext>) -> anyhow::Result<()> {
    let server_config = ctx
        .cert_manager
        .server_config_for_host(&host)
        .context("failed to mint leaf certificate")?;

    let mut client = client;
    client
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await?;

    let acceptor = TlsAcceptor::from(server_config);
    let mut tls_stream = acceptor.accept(client).await.context("TLS handshake failed")?;

    let mut request_count = 0u32;
    loop {
        request_count += 1;
        let (parsed, mut leftover) = match read_request_head(&mut tls_stream).await {
            Ok(v) => v,
            Err(err) => {
                if request_count == 1 {
                    tracing::warn!("failed to parse HTTPS request from {host}: {err}");
                    let _ = respond_with_status(&mut tls_stream, 400, "Bad Request", "Unable to parse request").await;
                } else {
                    tracing::debug!("keep-alive connection to {host} closed after {} requests", request_count - 1);
                }
                break;
            }
        };

        let keep_alive = should_keep_alive(&parsed.version, &parsed.header_map);
        let body = read_body(&mut tls_stream, &mut leftover, &parsed.framing).await?;

        if let Err(err) = handle_request(&mut tls_stream, &host, parsed, body, &ctx).await {
            tracing::debug!("HTTPS request handling error for {host}: {err}");
            break;
        }

        if !keep_alive {
            break;
        }
    }

    Ok(())
}

async fn handle_request<S>(
    client: &mut S,
    host: &str,
    parsed: http_io::ParsedRequest,
    body: Vec<u8>,
    ctx: &Arc<MitmContext>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (_, path) = http_io::resolve_path_and_authority(&parsed.path);
    let target_url = format!("https://{host}{path}");

    let interceptor = ctx.pipeline.create_interceptor_for_url(&target_url, host);

    if let Some(interceptor) = &interceptor {
        if let Some(block) = &interceptor.block {
            if let Some(pkg) = crate::registry::parsers::parse_npm(&target_url)
                .or_else(|| crate::registry::parsers::parse_pypi(&target_url))
            {
                ctx.blocked.record(BlockedRequest {
                    package_name: pkg.name,
                    version: pkg.version,
                    url: target_url.clone(),
                    timestamp_millis: chrono::Utc::now().timestamp_millis(),
                });
            }
            respond_with_status(client, block.status_code, "Forbidden", &block.message).await?;
            return Ok(());
        }
    }

    let mut headers = parsed.headers.clone();
    if interceptor.as_ref().map(|i| i.rewrite_accept_header).unwrap_or(false) {
        for (name, value) in headers.iter_mut() {
            if name.eq_ignore_ascii_case("accept") {
                if let Some(replacement) = npm_rewrite::rewrite_accept_header(value) {
                    *value = replacement.to_string();
                }
            }
        }
    }
    strip_hop_by_hop_headers(&mut headers);

    let upstream_proxy = UpstreamProxy::from_env(host);
    let origin = connect_origin(host, 443, upstream_proxy.as_ref(), &ctx.imds_timeouts).await;
    let origin = match origin {
        Ok(stream) => stream,
        Err(err) => {
            tracing::warn!("failed to connect to origin {host}: {err}");
            respond_with_status(client, 502, "Bad Gateway", "upstream connection failed").await?;
            return Ok(());
        }
    };

    let connector = TlsConnector::from(ctx.tls_client_config.clone());
    let server_name = rustls::pki_types::ServerName::try_from(host.to_string())
        .map_err(|_| anyhow::anyhow!("invalid DNS name for origin TLS handshake: {host}"))?;
    let mut origin_tls = connector
        .connect(server_name, origin)
        .await
        .context("TLS handshake with origin registry failed")?;

    write_request_head(&mut origin_tls, &parsed.method, &path, &parsed.version, &headers).await?;
    if !body.is_empty() {
        origin_tls.write_all(&body).await?;
    }

    let (response, mut resp_leftover) = read_response_head(&mut origin_tls).await?;
    let response_body = read_body(&mut origin_tls, &mut resp_leftover, &response.framing).await?;

    let final_body = match interceptor.as_ref().and_then(|i| i.npm_rewrite_cutoff_millis) {
        Some(cutoff) => npm_rewrite::rewrite_metadata(&response_body, cutoff).unwrap_or(response_body),
        None => response_body,
    };

    write_response(client, response.status_code, &response.reason, &response.headers, &final_body).await?;
    Ok(())
}

fn strip_hop_by_hop_headers(headers: &mut Vec<(String, String)>) {
    headers.retain(|(name, _)| {
        !name.eq_ignore_ascii_case("proxy-connection")
            && !name.eq_ignore_ascii_case("connection")
            && !name.eq_ignore_ascii_case("keep-alive")
            && !name.eq_ignore_ascii_case("content-length")
            && !name.eq_ignore_ascii_case("transfer-encoding")
    });
    headers.push(("Connection".to_string(), "close".to_string()));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_hop_by_hop_and_forces_connection_close() {
        let mut headers = vec![
            ("Host".to_string(), "registry.npmjs.org".to_string()),
            ("Connection".to_string(), "keep-alive".to_string()),
            ("Content-Length".to_string(), "0".to_string()),
        ];
        strip_hop_by_hop_headers(&mut headers);
        assert!(headers.iter().any(|(k, v)| k == "Connection" && v == "close"));
        assert!(!headers.iter().any(|(k, _)| k == "Content-Length"));
    }
}
