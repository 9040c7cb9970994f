//! Pages behind the underscore-prefixed admin opnames.

use std::fmt::Write as _;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use rand::seq::IndexedRandom;
use tokio::net::TcpStream;
use tracing::warn;

use super::config::{HealthConfig, ServerConfig};
use crate::method::MethodRegistry;
use crate::network::config::NetworkConfig;
use crate::network::connection::ConnectionRegistry;
use crate::network::http::escape_html;
use crate::tracker::CallTracker;

/// Targets a single health check tries at most.
const HEALTH_PROBE_TARGETS: usize = 2;

fn secs(d: Duration) -> String {
    format!("{:.3}s", d.as_secs_f64())
}

/// HTML index of every method with a form preloaded with its sample input.
#[must_use]
pub fn root_form(registry: &MethodRegistry, mock: &str) -> String {
    let names = registry.names();
    let mock = escape_html(mock);
    let mut html = String::from(
        "<html><head><title>RPC Server</title></head>\n<body>\n\
<a href=\"/_usage\">Usage report</a> | <a href=\"/_status\">Process status</a> | \
<a href=\"/_param\">Parameters</a> | <a href=\"/_validate\">Validate</a> | \
<a href=\"/_threads\">Threads</a><p>\n",
    );
    let plural = if names.len() == 1 { "" } else { "s" };
    let _ = writeln!(
        html,
        "This server supports the following {} operation{plural}:<p>",
        names.len()
    );
    for name in &names {
        let _ = writeln!(html, "<a href=\"#{name}\">{name}</a> &nbsp;");
    }
    html.push_str("<p>\n<table>\n");
    for (seq, name) in names.iter().enumerate() {
        let Some(handler) = registry.get(name) else {
            continue;
        };
        let seq = seq + 1;
        let _ = write!(
            html,
            "<tr id=\"{name}\"><form action=\"{name}\" method=\"post\" target=\"result{seq}\">\n\
<td><b>{name}</b></td>\n\
<td><textarea name=\"q\" rows=12 cols=55>\n{}</textarea><br>\n\
<input type=\"hidden\" name=\"d\" value=\"1\">\n\
<input type=\"hidden\" name=\"mock\" value=\"{mock}\">\n</td>\n\
<td><input type=\"submit\" value=\"Submit\"></td>\n\
<td>Result:<br><iframe name=\"result{seq}\" width=390 height=180></iframe></td>\n\
</form></tr>\n",
            escape_html(&handler.sample_input_json()),
        );
    }
    html.push_str("</table>\n</body></html>\n");
    html
}

#[must_use]
pub fn redirect_page(url: &str) -> String {
    let url = escape_html(url);
    format!(
        "<html>\n<head>\n<meta http-equiv=\"Refresh\" content=\"0;url={url}\">\n</head>\n\
<body>\n<a href=\"{url}\">Loading...</a><p>\n</body>\n</html>\n"
    )
}

/// Call statistics, pending calls, and live connections.
#[must_use]
pub fn usage_report(tracker: &CallTracker, connections: &ConnectionRegistry) -> String {
    let mut html = String::from("<html><head><title>Usage Report</title></head>\n<body>\n");
    let _ = writeln!(html, "Server started: {} ago<p>", secs(tracker.uptime()));
    let _ = writeln!(html, "Total number of calls: {}<p>", tracker.total_calls());

    html.push_str(
        "<table border=1><tr align=center><td><i>method</i></td><td><i>calls</i></td>\
<td><i>min. time</i></td><td><i>max. time</i></td><td><i>avg. time</i></td></tr>\n",
    );
    for (name, stat) in tracker.snapshot() {
        let _ = writeln!(
            html,
            "<tr align=center><td>{name}</td><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
            stat.count,
            secs(stat.min),
            secs(stat.max),
            secs(stat.average()),
        );
    }
    html.push_str("</table><p>\n");

    let pending = tracker.pending();
    let _ = writeln!(html, "Number of pending calls: {}<p>", pending.len());
    if !pending.is_empty() {
        html.push_str(
            "<table border=1>\n<tr><td><i>seq. #</i></td><td><i>time elapsed</i></td>\
<td><i>method</i></td><td><i>protocol</i></td><td><i>input</i></td></tr>\n",
        );
        for call in &pending {
            let _ = writeln!(
                html,
                "<tr align=center><td>{}</td><td>{}</td><td>{}</td><td>{}</td>\
<td align=left><pre>{}</pre></td></tr>",
                call.id,
                secs(call.started.elapsed()),
                call.opname,
                call.protocol.as_str(),
                escape_html(&call.input),
            );
        }
        html.push_str("</table>\n");
    }

    let live = connections.connections();
    let _ = writeln!(html, "<p>Open connections: {}<p>", live.len());
    if !live.is_empty() {
        html.push_str("<table border=1>\n<tr><td><i>id</i></td><td><i>peer</i></td><td><i>age</i></td><td><i>requests</i></td></tr>\n");
        for conn in &live {
            let _ = writeln!(
                html,
                "<tr align=center><td>{}</td><td>{}</td><td>{}</td><td>{}</td></tr>",
                conn.id.0,
                conn.peer,
                secs(conn.connected_at.elapsed()),
                conn.requests(),
            );
        }
        html.push_str("</table>\n");
    }
    html.push_str("</body></html>\n");
    html
}

#[must_use]
pub fn process_status() -> String {
    std::fs::read_to_string("/proc/self/status")
        .unwrap_or_else(|_| "Process status is not available on this platform.\n".to_string())
}

/// OS threads of this process plus async runtime counters.
#[must_use]
pub fn thread_report() -> String {
    let mut out = String::new();
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        let metrics = handle.metrics();
        let _ = writeln!(
            out,
            "runtime workers: {}, alive tasks: {}\n",
            metrics.num_workers(),
            metrics.num_alive_tasks()
        );
    }

    let Ok(tasks) = std::fs::read_dir("/proc/self/task") else {
        out.push_str("Thread listing is not available on this platform.\n");
        return out;
    };
    let mut threads: Vec<(u64, String, String)> = tasks
        .filter_map(Result::ok)
        .filter_map(|entry| {
            let tid = entry.file_name().to_str()?.parse().ok()?;
            let comm = std::fs::read_to_string(entry.path().join("comm")).unwrap_or_default();
            let stat = std::fs::read_to_string(entry.path().join("stat")).unwrap_or_default();
            // State is the first field after the parenthesised command name.
            let state = stat
                .rsplit_once(')')
                .and_then(|(_, rest)| rest.split_whitespace().next())
                .unwrap_or("?")
                .to_string();
            Some((tid, comm.trim().to_string(), state))
        })
        .collect();
    threads.sort();
    let _ = writeln!(out, "{} threads", threads.len());
    for (tid, name, state) in threads {
        let _ = writeln!(out, "{tid}\t{state}\t{name}");
    }
    out
}

/// Read-only dump of the effective configuration.
#[must_use]
pub fn param_dump(network: &NetworkConfig, server: &ServerConfig) -> String {
    format!("{network:#?}\n\n{server:#?}\n")
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

/// Decides what `_health` reports.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> bool;
}

/// Healthy when an outbound TCP connection succeeds to one of up to two
/// randomly chosen targets.
pub struct TcpProbe {
    config: HealthConfig,
}

impl TcpProbe {
    #[must_use]
    pub fn new(config: HealthConfig) -> Self {
        Self { config }
    }

    async fn reachable(&self, target: SocketAddr) -> bool {
        matches!(
            tokio::time::timeout(self.config.connect_timeout, TcpStream::connect(target)).await,
            Ok(Ok(_))
        )
    }
}

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn check(&self) -> bool {
        if self.config.targets.is_empty() {
            return true;
        }
        let picks: Vec<SocketAddr> = self
            .config
            .targets
            .choose_multiple(&mut rand::rng(), HEALTH_PROBE_TARGETS)
            .copied()
            .collect();
        for target in picks {
            if self.reachable(target).await {
                return true;
            }
            warn!(%target, "health probe could not connect");
        }
        false
    }
}
