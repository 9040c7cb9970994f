//! HTTP routing: admin opnames, JSON calls, and static files.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use rpcserve_core::{serial, ErrorMessage, Protocol, RequestEnvelope};
use tracing::{info, warn};

use super::admin;
use super::server::RpcServer;
use crate::method::MethodHandler;
use crate::network::acceptor::Processed;
use crate::network::connection::ConnectionInfo;
use crate::network::http::{self, HttpRequest, HttpResponse};
use crate::network::shutdown::{HealthState, ShutdownKind};

/// Cap on the `e` and `y` test delays.
const MAX_TEST_DELAY_SECS: u64 = 180;

/// Cache lifetime for static files.
const STATIC_MAX_AGE_SECS: u32 = 3600;

const CGI_PARSE_ERROR: &str = "Unable to parse CGI arguments.";
const MISSING_INPUT_ERROR: &str = "Missing input (q).";
const FORCED_ERROR: &str = "Caller-requested error.";

/// A routed HTTP answer.
enum HttpReply {
    Page(HttpResponse),
    /// Body only, for callers that asked for no HTTP envelope.
    Raw(Vec<u8>),
}

fn text(body: impl Into<Vec<u8>>) -> HttpReply {
    HttpReply::Page(HttpResponse::ok(body, "text/plain"))
}

fn html(body: impl Into<Vec<u8>>) -> HttpReply {
    HttpReply::Page(HttpResponse::ok(body, "text/html"))
}

fn json_error(msg: &str) -> Vec<u8> {
    serial::to_json(&ErrorMessage::new(msg), true)
        .map_or_else(|_| msg.as_bytes().to_vec(), String::into_bytes)
}

/// Parses an integer test-delay argument, capped.
fn delay_secs(value: &str) -> u64 {
    value.trim().parse::<u64>().unwrap_or(0).min(MAX_TEST_DELAY_SECS)
}

/// The request metadata every HTTP-originated call carries.
fn metadata_envelope(req: &HttpRequest, args: BTreeMap<String, String>) -> RequestEnvelope {
    RequestEnvelope {
        referrer: req.referrer().to_string(),
        cookie: req.cookie().to_string(),
        http_header: req.headers.clone(),
        arg_map: args,
        ..RequestEnvelope::default()
    }
}

impl RpcServer {
    pub(super) async fn process_http(&self, bytes: &[u8], conn: &Arc<ConnectionInfo>) -> Processed {
        let Some(req) = HttpRequest::parse(bytes) else {
            info!(conn = conn.id.0, peer = %conn.peer, "unparseable http request");
            return Processed::close();
        };
        if req.opname() != "_usage" {
            info!(conn = conn.id.0, peer = %conn.peer, "{}", req.summary());
        }

        let keep_alive = req.keep_alive();
        match self.route(&req, conn).await {
            HttpReply::Page(response) => {
                Processed::reply(response.with_keep_alive(keep_alive).to_bytes(), keep_alive)
            }
            HttpReply::Raw(body) => Processed::reply(body, false),
        }
    }

    async fn route(&self, req: &HttpRequest, conn: &Arc<ConnectionInfo>) -> HttpReply {
        let args = http::parse_cgi_arguments(&req.cgi_arguments());
        let arg = |key: &str| args.as_ref().and_then(|a| a.get(key)).map(String::as_str);

        match req.opname() {
            "" => html(admin::root_form(&self.registry, arg("mock").unwrap_or_default())),
            "URL" => {
                let target = req.cgi_arguments().trim().to_string();
                if target.is_empty() {
                    HttpReply::Page(HttpResponse::not_found())
                } else {
                    html(admin::redirect_page(&target))
                }
            }
            "_usage" => html(admin::usage_report(&self.tracker, &self.connections)),
            "_status" => text(admin::process_status()),
            "_threads" => text(admin::thread_report()),
            "_param" => text(admin::param_dump(&self.network, &self.config)),
            "_startrecord" => match self.recorder.start().await {
                Ok(()) => text("Recording started"),
                Err(e) => {
                    warn!(error = %e, path = %self.recorder.input_path().display(), "cannot start recording");
                    HttpReply::Page(HttpResponse::server_error())
                }
            },
            "_stoprecord" => {
                self.recorder.stop();
                text("Recording stopped")
            }
            "_shutdown" => {
                self.shutdown.trigger_shutdown(ShutdownKind::Normal);
                text("Preparing to shutdown...\n")
            }
            "_shutdownloop" => {
                self.shutdown.trigger_shutdown(ShutdownKind::Loop);
                text("Preparing to shutdown...\n")
            }
            "_rpc" => {
                let metadata = metadata_envelope(req, BTreeMap::new());
                let reply = self
                    .dispatch_binary(&req.body, conn, Some(&metadata))
                    .await
                    .unwrap_or_default();
                HttpReply::Page(
                    HttpResponse::ok(reply, "").with_content_type("application/octet-stream"),
                )
            }
            "_validate" => {
                let request = metadata_envelope(req, args.clone().unwrap_or_default());
                let env = self.dispatch_env(conn);
                let out = match arg("method") {
                    Some(method) => {
                        let mut out = String::new();
                        self.registry
                            .validate_method(&env, &request, method, &mut out)
                            .await;
                        out
                    }
                    None => self.registry.validate_all(&env, &request).await.text,
                };
                text(out)
            }
            "_health" => {
                if self.shutdown.health_state() != HealthState::Ready {
                    HttpReply::Page(HttpResponse::busy())
                } else if self.health.check().await {
                    text("OK")
                } else {
                    HttpReply::Page(HttpResponse::server_error())
                }
            }
            opname => match self.registry.get(opname) {
                Some(handler) => self.json_call(handler, req, args, conn).await,
                None => self.static_file(opname).await,
            },
        }
    }

    /// The JSON calling convention: input in `q`, output as JSON text.
    async fn json_call(
        &self,
        handler: Arc<dyn MethodHandler>,
        req: &HttpRequest,
        args: Option<BTreeMap<String, String>>,
        conn: &Arc<ConnectionInfo>,
    ) -> HttpReply {
        let Some(args) = args else {
            return json_reply(json_error(CGI_PARSE_ERROR), Vec::new(), None, false);
        };
        let callback = args.get("callback").filter(|c| !c.is_empty()).cloned();
        let raw = args.get("header").is_some_and(|h| h != "1");

        if !args.contains_key("q") && !args.contains_key("no_input") && !handler.allow_empty_request() {
            return json_reply(json_error(MISSING_INPUT_ERROR), Vec::new(), callback, raw);
        }
        if let Some(e) = args.get("e") {
            let secs = delay_secs(e);
            if secs > 0 {
                tokio::time::sleep(Duration::from_secs(secs)).await;
            }
            return json_reply(json_error(FORCED_ERROR), Vec::new(), callback, raw);
        }
        if let Some(y) = args.get("y") {
            let max = delay_secs(y);
            if max > 0 {
                let secs = rand::rng().random_range(0..max);
                tokio::time::sleep(Duration::from_secs(secs)).await;
            }
        }

        let pretty = args.get("d").map_or(self.config.debug_json, |d| d == "1");
        let input = args.get("q").cloned().unwrap_or_else(|| "{}".to_string());
        let name = handler.name().to_string();

        let recording = handler.can_record() && self.recorder.is_recording();
        if recording {
            self.recorder.record_input(&name, &input);
        }
        let call = self.tracker.begin(&name, Protocol::Json, input.clone());

        let mut request = metadata_envelope(req, args);
        request.opname.clone_from(&name);
        request.payload = input.into_bytes();
        let reply = handler
            .process_json(&self.dispatch_env(conn), &request, pretty)
            .await;
        drop(call);

        if recording {
            self.recorder
                .record_output(&name, reply.success, &String::from_utf8_lossy(&reply.payload));
        }
        json_reply(reply.payload, reply.cookies, callback, raw)
    }

    async fn static_file(&self, path: &str) -> HttpReply {
        let Some(file) = http::webroot_path(&self.config.webroot, path) else {
            return HttpReply::Page(HttpResponse::not_found());
        };
        match tokio::fs::read(&file).await {
            Ok(content) => HttpReply::Page(
                HttpResponse::ok(content, http::guess_content_type(path))
                    .with_max_age(STATIC_MAX_AGE_SECS),
            ),
            Err(_) => HttpReply::Page(HttpResponse::not_found()),
        }
    }
}

fn json_reply(body: Vec<u8>, cookies: Vec<String>, callback: Option<String>, raw: bool) -> HttpReply {
    let (body, content_type) = match callback {
        Some(cb) => {
            let mut wrapped = format!("{cb}(").into_bytes();
            wrapped.extend_from_slice(&body);
            wrapped.extend_from_slice(b");");
            (wrapped, "application/javascript")
        }
        None => (body, "application/json"),
    };
    if raw {
        return HttpReply::Raw(body);
    }
    HttpReply::Page(HttpResponse::ok(body, content_type).with_cookies(cookies))
}

