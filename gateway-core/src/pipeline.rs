//! Request pipeline (§4.7): the `ProxyHttp` implementation pingora drives
//! for every inbound connection. Grounded on the `upstream_peer`/`logging`
//! shape in `router-core/src/app/gateway.rs`, generalized from regex path
//! rewriting to host-keyed routing with filters, rate limiting, and
//! weighted backend selection in front of it.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use log::{info, warn};
use pingora::http::ResponseHeader;
use pingora::prelude::HttpPeer;
use pingora::proxy::{ProxyHttp, Session};

use crate::filters::{Decision, FilterEngine, FilterSubject};
use crate::logsink::BufferedLogSink;
use crate::model::{Backend, FilterLogEntry, RequestLogEntry};
use crate::ratelimit::{RateLimiter, Verdict};
use crate::routing::RoutingCache;
use crate::selector::BackendSelector;

/// Administrative paths bypass the rate limiter (§4.4).
const ADMIN_PATH_PREFIX: &str = "/__admin/";

pub struct RequestPipeline {
    routing: Arc<RoutingCache>,
    filters: Arc<FilterEngine>,
    rate_limiter: Arc<RateLimiter>,
    selector: Arc<BackendSelector>,
    log_sink: Arc<BufferedLogSink>,
}

/// Per-request scratch state threaded between pipeline hooks, the pingora
/// equivalent of the unit `()` context the teacher uses when it has nothing
/// to carry -- here there's quite a bit to carry.
#[derive(Default)]
pub struct PipelineCtx {
    client_ip: String,
    host: String,
    path: String,
    started: Option<Instant>,
    backend: Option<Backend>,
    filter_id: i64,
}

impl RequestPipeline {
    pub fn new(
        routing: Arc<RoutingCache>,
        filters: Arc<FilterEngine>,
        rate_limiter: Arc<RateLimiter>,
        selector: Arc<BackendSelector>,
        log_sink: Arc<BufferedLogSink>,
    ) -> Self {
        Self {
            routing,
            filters,
            rate_limiter,
            selector,
            log_sink,
        }
    }

    fn extract_client_ip(&self, session: &Session) -> String {
        if let Some(value) = session.req_header().headers.get("X-Forwarded-For") {
            if let Ok(value) = value.to_str() {
                if let Some(first) = value.split(',').next() {
                    let trimmed = first.trim();
                    if !trimmed.is_empty() {
                        return trimmed.to_string();
                    }
                }
            }
        }
        if let Some(value) = session.req_header().headers.get("X-Real-IP") {
            if let Ok(value) = value.to_str() {
                if !value.trim().is_empty() {
                    return value.trim().to_string();
                }
            }
        }
        session
            .client_addr()
            .map(|addr| strip_port(&addr.to_string()))
            .unwrap_or_else(|| "unknown".to_string())
    }

    async fn write_plain(
        &self,
        session: &mut Session,
        status: u16,
        body: String,
        location: Option<&str>,
    ) -> pingora::Result<()> {
        let mut header = ResponseHeader::build(status, Some(3))?;
        header.insert_header("Content-Length", body.len().to_string())?;
        header.insert_header("Content-Type", "text/plain")?;
        if let Some(location) = location {
            header.insert_header("Location", location)?;
        }
        session.write_response_header(Box::new(header), false).await?;
        session
            .write_response_body(Some(Bytes::from(body)), true)
            .await?;
        Ok(())
    }

    /// Submits a log entry and, if the buffer crossed the batch threshold,
    /// spawns an out-of-band flush rather than blocking the request path.
    fn submit_and_maybe_flush(&self, entry: RequestLogEntry) {
        if self.log_sink.submit(entry) {
            let sink = self.log_sink.clone();
            tokio::spawn(async move { sink.flush().await });
        }
    }

    fn record_immediate(&self, ctx: &PipelineCtx, status: u16, is_success: bool) {
        self.submit_and_maybe_flush(RequestLogEntry {
            timestamp: chrono::Utc::now(),
            client_ip: ctx.client_ip.clone(),
            host: ctx.host.clone(),
            path: ctx.path.clone(),
            backend_id: ctx.backend.as_ref().map(|b| b.id).unwrap_or(0),
            latency_ms: ctx.started.map(|s| s.elapsed().as_millis() as i64).unwrap_or(0),
            status_code: status,
            is_success,
            user_agent: String::new(),
            filter_id: ctx.filter_id,
        });
    }
}

#[async_trait]
impl ProxyHttp for RequestPipeline {
    type CTX = PipelineCtx;

    fn new_ctx(&self) -> Self::CTX {
        PipelineCtx::default()
    }

    async fn request_filter(
        &self,
        session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> pingora::Result<bool> {
        let req = session.req_header();
        let path = req.uri.path().to_string();
        let host = req
            .headers
            .get("Host")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        ctx.client_ip = self.extract_client_ip(session);
        ctx.host = host.clone();
        ctx.path = path.clone();

        let filter_subject = FilterSubject {
            client_ip: &ctx.client_ip,
            path: &ctx.path,
            host: &ctx.host,
        };
        if let Decision::Filtered { rule_id, status, body, redirect_url, match_kind, match_value, action_kind } =
            self.filters.evaluate(&filter_subject)
        {
            ctx.filter_id = rule_id;
            self.write_plain(session, status, body, redirect_url.as_deref())
                .await?;

            self.log_sink.submit_filter_log(&FilterLogEntry {
                timestamp: chrono::Utc::now(),
                client_ip: ctx.client_ip.clone(),
                host: ctx.host.clone(),
                path: ctx.path.clone(),
                user_agent: String::new(),
                filter_id: rule_id,
                match_kind,
                match_value,
                action_kind,
                status_code: status,
            });
            return Ok(true);
        }

        if !path.starts_with(ADMIN_PATH_PREFIX) {
            if let Verdict::Rejected = self.rate_limiter.check(&ctx.client_ip, &ctx.host) {
                self.write_plain(session, 429, "Too Many Requests".to_string(), None)
                    .await?;
                self.record_immediate(ctx, 429, false);
                return Ok(true);
            }
        }

        let Some(rule) = self.routing.lookup(&ctx.host) else {
            self.write_plain(
                session,
                410,
                format!("no backend configured for host {}", ctx.host),
                None,
            )
            .await?;
            self.record_immediate(ctx, 410, false);
            return Ok(true);
        };

        let eligible = rule.eligible_backends();
        if eligible.is_empty() {
            self.write_plain(
                session,
                410,
                format!("no active backend for host {}", ctx.host),
                None,
            )
            .await?;
            self.record_immediate(ctx, 410, false);
            return Ok(true);
        }

        let chosen = self.selector.select(&eligible);
        ctx.backend = Some(chosen.clone());
        ctx.started = Some(Instant::now());
        Ok(false)
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        ctx: &mut Self::CTX,
    ) -> pingora::Result<Box<HttpPeer>> {
        let backend = ctx
            .backend
            .as_ref()
            .expect("request_filter selects a backend before upstream_peer runs");
        let addr = strip_scheme(&backend.url);
        let peer = HttpPeer::new(addr, false, String::new());
        Ok(Box::new(peer))
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut pingora::http::RequestHeader,
        ctx: &mut Self::CTX,
    ) -> pingora::Result<()> {
        if let Some(backend) = &ctx.backend {
            if let Some(host) = strip_scheme(&backend.url).split(':').next() {
                upstream_request.insert_header("Host", host)?;
            }
        }
        Ok(())
    }

    async fn logging(
        &self,
        session: &mut Session,
        e: Option<&pingora::Error>,
        ctx: &mut Self::CTX,
    ) {
        // Filter/limiter/no-route short-circuits already logged themselves
        // and carry no selected backend by this point.
        let Some(backend) = ctx.backend.clone() else {
            return;
        };

        let latency_ms = ctx.started.map(|s| s.elapsed().as_millis() as i64).unwrap_or(0);

        if let Some(err) = e {
            warn!("upstream error for {} via {}: {err}", ctx.host, backend.url);
            self.record_immediate(ctx, 502, false);
            return;
        }

        let status = session
            .response_written()
            .map_or(502, |resp| resp.status.as_u16());

        self.submit_and_maybe_flush(RequestLogEntry {
            timestamp: chrono::Utc::now(),
            client_ip: ctx.client_ip.clone(),
            host: ctx.host.clone(),
            path: ctx.path.clone(),
            backend_id: backend.id,
            latency_ms,
            status_code: status,
            is_success: true,
            user_agent: String::new(),
            filter_id: 0,
        });
        info!(
            "[RPX] |HOST:{}, BACKEND:{}, STATUS:{status}, LAT:{latency_ms}ms|",
            ctx.host, backend.url
        );
    }
}

fn strip_port(addr: &str) -> String {
    addr.rsplit_once(':').map(|(host, _)| host.to_string()).unwrap_or_else(|| addr.to_string())
}

fn strip_scheme(url: &str) -> String {
    url.trim_start_matches("http://")
        .trim_start_matches("https://")
        .trim_end_matches('/')
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_scheme_drops_http_prefix_and_trailing_slash() {
        assert_eq!(strip_scheme("http://127.0.0.1:9001/"), "127.0.0.1:9001");
        assert_eq!(strip_scheme("https://backend.internal:8443"), "backend.internal:8443");
    }

    #[test]
    fn strip_port_keeps_host_only() {
        assert_eq!(strip_port("192.0.2.5:54321"), "192.0.2.5");
        assert_eq!(strip_port("192.0.2.5"), "192.0.2.5");
    }
}
