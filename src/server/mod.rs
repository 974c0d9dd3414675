//! HTTP server: a flat route table dispatched over hyper.
//!
//! Every command is one `(method, path pattern) → handler` row; handlers are
//! plain async functions over `AppContext` + `RequestParts`, so the whole
//! surface is drivable from tests without sockets.

pub mod api;
pub mod response;
pub mod sse;
pub mod stats;

use std::collections::HashMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use anyhow::Context;
use bytes::Bytes;
use futures::future::BoxFuture;
use http::{Method, Request, Response, StatusCode};
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Body, Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

use crate::acme::{AcmeServer, ChallengeValidator};
use crate::error::ApiError;
use crate::issuer::LeafIssuer;
use crate::registry::CaRegistry;
use crate::storage::Store;

use response::{ApiResponse, ResponsePayload};
use stats::RequestStats;

const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Shared handles every handler receives.
#[derive(Clone)]
pub struct AppContext {
    pub store: Arc<Store>,
    pub registry: CaRegistry,
    pub issuer: LeafIssuer,
    pub validator: Arc<ChallengeValidator>,
    pub acme: Arc<AcmeServer>,
    pub stats: Arc<RequestStats>,
}

impl AppContext {
    pub fn new(store: Arc<Store>, base_url: String) -> Self {
        let registry = CaRegistry::new(Arc::clone(&store));
        let issuer = LeafIssuer::new(Arc::clone(&store), registry.clone());
        let validator = Arc::new(ChallengeValidator::new(Arc::clone(&store)));
        let acme = Arc::new(AcmeServer::new(
            Arc::clone(&store),
            registry.clone(),
            Arc::clone(&validator),
            base_url,
        ));
        Self {
            store,
            registry,
            issuer,
            validator,
            acme,
            stats: Arc::new(RequestStats::new()),
        }
    }
}

/// A parsed request as handlers see it.
pub struct RequestParts {
    pub path: String,
    pub query: HashMap<String, String>,
    /// Captured trailing segment for `{}` patterns.
    pub param: Option<String>,
    pub body: Bytes,
}

impl RequestParts {
    pub fn json_body<T: DeserializeOwned>(&self) -> Result<T, ApiError> {
        if self.body.is_empty() {
            return Err(ApiError::BadRequest("missing JSON body".into()));
        }
        Ok(serde_json::from_slice(&self.body)?)
    }

    pub fn require_query(&self, key: &str) -> Result<&str, ApiError> {
        self.query
            .get(key)
            .map(|s| s.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| ApiError::BadRequest(format!("missing query parameter {key:?}")))
    }

    /// The numeric `id` query parameter most leaf commands take.
    pub fn id_param(&self) -> Result<i64, ApiError> {
        let raw = self.require_query("id")?;
        raw.parse()
            .map_err(|_| ApiError::BadRequest(format!("id {raw:?} is not a number")))
    }
}

type Handler = fn(AppContext, RequestParts) -> BoxFuture<'static, Result<ApiResponse, ApiError>>;

struct Route {
    method: Method,
    pattern: &'static str,
    handler: Handler,
}

/// Patterns are exact paths, or a prefix ending in `{}` capturing one final
/// segment.
fn match_pattern(pattern: &str, path: &str) -> Option<Option<String>> {
    if let Some(prefix) = pattern.strip_suffix("{}") {
        let rest = path.strip_prefix(prefix)?;
        if rest.is_empty() || rest.contains('/') {
            return None;
        }
        Some(Some(rest.to_string()))
    } else if pattern == path {
        Some(None)
    } else {
        None
    }
}

static ROUTES: Lazy<Vec<Route>> = Lazy::new(|| {
    vec![
        // Administrative command surface.
        Route {
            method: Method::POST,
            pattern: "/api/ca/setup",
            handler: |c, r| Box::pin(api::ca_setup(c, r)),
        },
        Route {
            method: Method::POST,
            pattern: "/api/ca/activate",
            handler: |c, r| Box::pin(api::ca_activate(c, r)),
        },
        Route {
            method: Method::POST,
            pattern: "/api/ca/intermediate",
            handler: |c, r| Box::pin(api::ca_intermediate_create(c, r)),
        },
        Route {
            method: Method::DELETE,
            pattern: "/api/ca",
            handler: |c, r| Box::pin(api::ca_delete(c, r)),
        },
        Route {
            method: Method::DELETE,
            pattern: "/api/ca/intermediate",
            handler: |c, r| Box::pin(api::ca_intermediate_delete(c, r)),
        },
        Route {
            method: Method::GET,
            pattern: "/api/ca/info",
            handler: |c, r| Box::pin(api::ca_info(c, r)),
        },
        Route {
            method: Method::GET,
            pattern: "/api/ca-cert",
            handler: |c, r| Box::pin(api::ca_cert_download(c, r)),
        },
        Route {
            method: Method::GET,
            pattern: "/api/ca/list",
            handler: |c, r| Box::pin(api::ca_list(c, r)),
        },
        Route {
            method: Method::POST,
            pattern: "/api/cert/create",
            handler: |c, r| Box::pin(api::cert_create(c, r)),
        },
        Route {
            method: Method::POST,
            pattern: "/api/cert/revoke",
            handler: |c, r| Box::pin(api::cert_revoke(c, r)),
        },
        Route {
            method: Method::POST,
            pattern: "/api/cert/renew",
            handler: |c, r| Box::pin(api::cert_renew(c, r)),
        },
        Route {
            method: Method::DELETE,
            pattern: "/api/cert",
            handler: |c, r| Box::pin(api::cert_delete(c, r)),
        },
        Route {
            method: Method::GET,
            pattern: "/api/cert/info",
            handler: |c, r| Box::pin(api::cert_info(c, r)),
        },
        Route {
            method: Method::GET,
            pattern: "/api/cert/download",
            handler: |c, r| Box::pin(api::cert_download(c, r)),
        },
        Route {
            method: Method::GET,
            pattern: "/api/cert/key",
            handler: |c, r| Box::pin(api::cert_key(c, r)),
        },
        Route {
            method: Method::GET,
            pattern: "/api/cert/revocation-status",
            handler: |c, r| Box::pin(api::cert_revocation_status(c, r)),
        },
        Route {
            method: Method::GET,
            pattern: "/api/acme-whitelist",
            handler: |c, r| Box::pin(api::whitelist_list(c, r)),
        },
        Route {
            method: Method::POST,
            pattern: "/api/acme-whitelist",
            handler: |c, r| Box::pin(api::whitelist_create(c, r)),
        },
        Route {
            method: Method::DELETE,
            pattern: "/api/acme-whitelist",
            handler: |c, r| Box::pin(api::whitelist_delete(c, r)),
        },
        Route {
            method: Method::GET,
            pattern: "/api/acme-ca-assignments",
            handler: |c, r| Box::pin(api::assignments_list(c, r)),
        },
        Route {
            method: Method::POST,
            pattern: "/api/acme-ca-assignments",
            handler: |c, r| Box::pin(api::assignments_create(c, r)),
        },
        Route {
            method: Method::DELETE,
            pattern: "/api/acme-ca-assignments",
            handler: |c, r| Box::pin(api::assignments_delete(c, r)),
        },
        Route {
            method: Method::POST,
            pattern: "/api/acme-challenge/accept",
            handler: |c, r| Box::pin(api::acme_challenge_accept(c, r)),
        },
        Route {
            method: Method::POST,
            pattern: "/api/acme-challenge/static",
            handler: |c, r| Box::pin(api::acme_challenge_static(c, r)),
        },
        Route {
            method: Method::GET,
            pattern: "/api/config",
            handler: |c, r| Box::pin(api::config_get(c, r)),
        },
        Route {
            method: Method::POST,
            pattern: "/api/config",
            handler: |c, r| Box::pin(api::config_set(c, r)),
        },
        Route {
            method: Method::GET,
            pattern: "/api/summary",
            handler: |c, r| Box::pin(api::summary(c, r)),
        },
        Route {
            method: Method::GET,
            pattern: "/api/events",
            handler: |c, r| Box::pin(api::events(c, r)),
        },
        // ACME wire protocol.
        Route {
            method: Method::GET,
            pattern: "/acme/directory",
            handler: |c, _r| {
                Box::pin(async move {
                    Ok(ApiResponse::ok_json(&c.acme.directory())
                        .with_header("replay-nonce", c.acme.fresh_nonce()))
                })
            },
        },
        Route {
            method: Method::HEAD,
            pattern: "/acme/new-nonce",
            handler: |c, _r| {
                Box::pin(async move {
                    Ok(ApiResponse::empty(StatusCode::NO_CONTENT)
                        .with_header("replay-nonce", c.acme.fresh_nonce()))
                })
            },
        },
        Route {
            method: Method::POST,
            pattern: "/acme/new-nonce",
            handler: |c, _r| {
                Box::pin(async move {
                    Ok(ApiResponse::empty(StatusCode::NO_CONTENT)
                        .with_header("replay-nonce", c.acme.fresh_nonce()))
                })
            },
        },
        Route {
            method: Method::POST,
            pattern: "/acme/new-account",
            handler: |c, r| Box::pin(async move { c.acme.handle_post(&r.body).await }),
        },
        Route {
            method: Method::POST,
            pattern: "/acme/new-order",
            handler: |c, r| Box::pin(async move { c.acme.handle_post(&r.body).await }),
        },
        Route {
            method: Method::POST,
            pattern: "/acme/chall/{}",
            handler: |c, r| Box::pin(async move { c.acme.handle_post(&r.body).await }),
        },
        Route {
            method: Method::POST,
            pattern: "/acme/finalize/{}",
            handler: |c, r| Box::pin(async move { c.acme.handle_post(&r.body).await }),
        },
        Route {
            method: Method::GET,
            pattern: "/acme/order/{}",
            handler: |c, r| {
                Box::pin(async move {
                    let id = r.param.clone().unwrap_or_default();
                    c.acme.order_json(&id).await
                })
            },
        },
        Route {
            method: Method::GET,
            pattern: "/acme/authz/{}",
            handler: |c, r| {
                Box::pin(async move {
                    let id = r.param.clone().unwrap_or_default();
                    c.acme.authorization_json(&id).await
                })
            },
        },
        Route {
            method: Method::GET,
            pattern: "/acme/cert/{}",
            handler: |c, r| {
                Box::pin(async move {
                    let id = r.param.clone().unwrap_or_default();
                    c.acme.certificate_chain(&id).await
                })
            },
        },
        Route {
            method: Method::GET,
            pattern: "/.well-known/acme-challenge/{}",
            handler: |c, r| {
                Box::pin(async move {
                    let token = r.param.clone().unwrap_or_default();
                    c.acme.well_known_lookup(&token).await
                })
            },
        },
    ]
});

fn parse_query(query: Option<&str>) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(query) = query {
        for pair in query.split('&') {
            let mut parts = pair.splitn(2, '=');
            if let Some(key) = parts.next().filter(|k| !k.is_empty()) {
                map.insert(key.to_string(), parts.next().unwrap_or("").to_string());
            }
        }
    }
    map
}

fn error_response(err: &ApiError, acme_surface: bool) -> ApiResponse {
    if let ApiError::Internal(inner) = err {
        tracing::error!("internal error: {:#}", inner);
    }
    let status = StatusCode::from_u16(err.status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    if acme_surface {
        let mut response = ApiResponse::json(status, &err.acme_body());
        response.content_type = "application/problem+json";
        response
    } else {
        ApiResponse::json(status, &err.admin_body())
    }
}

/// Route a request through the table. Exposed so tests can drive the full
/// command surface without a socket.
pub async fn dispatch(
    ctx: &AppContext,
    method: &Method,
    path: &str,
    query: Option<&str>,
    body: Bytes,
) -> ApiResponse {
    let acme_surface = path.starts_with("/acme") || path.starts_with("/.well-known");
    for route in ROUTES.iter() {
        if route.method != *method {
            continue;
        }
        if let Some(param) = match_pattern(route.pattern, path) {
            let parts = RequestParts {
                path: path.to_string(),
                query: parse_query(query),
                param,
                body,
            };
            return match (route.handler)(ctx.clone(), parts).await {
                Ok(response) => response,
                Err(err) => error_response(&err, acme_surface),
            };
        }
    }
    error_response(
        &ApiError::NotFound(format!("no route for {method} {path}")),
        acme_surface,
    )
}

// ---- hyper glue -----------------------------------------------------------

/// Response body: either buffered bytes or a server-sent event stream.
pub enum ApiBody {
    Full(Full<Bytes>),
    Stream(mpsc::Receiver<Bytes>),
}

impl Body for ApiBody {
    type Data = Bytes;
    type Error = Infallible;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, Infallible>>> {
        match self.get_mut() {
            ApiBody::Full(full) => Pin::new(full).poll_frame(cx),
            ApiBody::Stream(rx) => match rx.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => Poll::Ready(Some(Ok(Frame::data(chunk)))),
                Poll::Ready(None) => Poll::Ready(None),
                Poll::Pending => Poll::Pending,
            },
        }
    }
}

fn into_hyper_response(response: ApiResponse) -> Response<ApiBody> {
    let mut builder = Response::builder()
        .status(response.status)
        .header("content-type", response.content_type);
    for (name, value) in &response.headers {
        builder = builder.header(*name, value);
    }
    let body = match response.payload {
        ResponsePayload::Bytes(bytes) => ApiBody::Full(Full::new(bytes)),
        ResponsePayload::Stream(rx) => ApiBody::Stream(rx),
    };
    builder.body(body).expect("static response headers are valid")
}

async fn handle_request(ctx: AppContext, req: Request<Incoming>) -> Response<ApiBody> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let query = req.uri().query().map(|q| q.to_string());

    let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => {
            let err = ApiError::BadRequest("request body unreadable or too large".into());
            let response = error_response(&err, path.starts_with("/acme"));
            ctx.stats.record(method.as_str(), &path, err.status());
            return into_hyper_response(response);
        }
    };

    let response = dispatch(&ctx, &method, &path, query.as_deref(), body).await;
    ctx.stats
        .record(method.as_str(), &path, response.status.as_u16());
    into_hyper_response(response)
}

/// Accept loop. Runs until ctrl-c.
pub async fn run(ctx: AppContext, host: &str, port: u16) -> anyhow::Result<()> {
    let addr = format!("{host}:{port}");
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    tracing::info!("HTTP server listening on {}", addr);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("shutdown requested");
                break;
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!("connection from {}", peer);
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            let io = TokioIo::new(stream);
                            let service = service_fn(move |req| {
                                let ctx = ctx.clone();
                                async move {
                                    Ok::<_, Infallible>(handle_request(ctx, req).await)
                                }
                            });
                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                tracing::debug!("connection closed: {}", e);
                            }
                        });
                    }
                    Err(e) => tracing::error!("accept error: {}", e),
                }
            }
        }
    }
    Ok(())
}
