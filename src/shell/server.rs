use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, Query, Request, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use tokio::signal::unix::{signal as unix_signal, SignalKind as UnixSignalKind};

use crate::shell::build_info;
use crate::shell::config::Settings;
use crate::shell::error::ShellError;
use crate::shell::logstore::{LogFilter, LogStore};
use crate::shell::probe::{Probe, ProbeSource, ProcfsProbe};
use crate::shell::shell_event;
use crate::shell::supervisor::{ChildRun, RunState, SignalKind, Supervisor};

const TEXT_CONTENT_TYPE: &str = "text/plain; charset=utf-8";
/// Tail size rendered when `/start` observes the child already terminated.
const START_LOG_TAIL_LINES: usize = 100;

#[derive(Clone)]
pub struct AppState {
    pub supervisor: Arc<Supervisor>,
    pub log_store: Arc<LogStore>,
    pub probe: Arc<dyn ProbeSource>,
    pub restart_timeout_secs: u64,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/start", post(start_handler))
        .route("/status", get(status_handler))
        .route("/kill", post(kill_handler))
        .route("/restart", post(restart_handler))
        .route("/logs", get(logs_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(middleware::from_fn(access_log_middleware))
}

/// Bind, serve until SIGTERM/SIGINT, then terminate the child and drain.
pub async fn run(settings: Settings) -> anyhow::Result<()> {
    shell_event("boot", build_info::banner());

    let log_store = Arc::new(LogStore::new(settings.log_dir.clone()));
    let supervisor = Arc::new(Supervisor::new(Arc::clone(&log_store)));
    let state = AppState {
        supervisor: Arc::clone(&supervisor),
        log_store,
        probe: Arc::new(ProcfsProbe),
        restart_timeout_secs: settings.restart_timeout_secs,
    };
    let app = build_router(state);

    let addr = settings.bind_addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    shell_event("boot", format!("listening on http://{addr}"));

    let shutdown = async {
        let mut term = unix_signal(UnixSignalKind::terminate()).expect("SIGTERM handler");
        let mut int = unix_signal(UnixSignalKind::interrupt()).expect("SIGINT handler");
        tokio::select! {
            _ = term.recv() => {}
            _ = int.recv() => {}
        }
        shell_event("shutdown", "signal received; shutting down");
    };
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;

    supervisor.shutdown().await;
    shell_event("shutdown", "done");
    Ok(())
}

async fn access_log_middleware(req: Request, next: Next) -> Response {
    let client = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_else(|| "-".to_string());
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let resp = next.run(req).await;
    shell_event(
        "access",
        format!("{client} {method} {path} {}", resp.status().as_u16()),
    );
    resp
}

// ---------------- handlers ----------------

async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "healthy" }))
}

async fn start_handler(
    State(st): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let json = wants_json(&params);
    let command = match parse_start_command(&headers, &body) {
        Ok(c) => c,
        Err(e) => return error_response(&e, json),
    };
    match st.supervisor.start(&command).await {
        Ok(run) => {
            let mut payload = build_status_payload(&st, &run);
            if run.state != RunState::Running {
                // The child died inside the settle window; surface its output
                // synchronously so failures like command-not-found are
                // directly readable.
                st.supervisor.drain_pump().await;
                payload.log_tail = st
                    .log_store
                    .read(&run.log_file, LogFilter::LastN(START_LOG_TAIL_LINES))
                    .await
                    .ok()
                    .map(|v| v.content)
                    .filter(|c| !c.is_empty());
            }
            render_status(&payload, json)
        }
        Err(e) => error_response(&e, json),
    }
}

async fn status_handler(
    State(st): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let json = wants_json(&params);
    match st.supervisor.status().await {
        Ok(run) => render_status(&build_status_payload(&st, &run), json),
        Err(e) => error_response(&e, json),
    }
}

async fn kill_handler(
    State(st): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let json = wants_json(&params);
    let kind = match params.get("type") {
        None => SignalKind::GracefulTerminate,
        Some(raw) => match SignalKind::parse(raw) {
            Some(kind) => kind,
            None => {
                let err = ShellError::BadRequest(format!("invalid signal type: {raw}"));
                return error_response(&err, json);
            }
        },
    };
    match st.supervisor.kill(kind).await {
        Ok(run) => render_kill(&run, json),
        Err(e) => error_response(&e, json),
    }
}

async fn restart_handler(
    State(st): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let json = wants_json(&params);
    let timeout_secs = match params.get("timeout") {
        None => st.restart_timeout_secs,
        Some(raw) => match raw.parse::<u64>() {
            Ok(v) => v,
            Err(_) => {
                let err = ShellError::BadRequest(format!("invalid timeout: {raw}"));
                return error_response(&err, json);
            }
        },
    };
    match st
        .supervisor
        .restart(Duration::from_secs(timeout_secs))
        .await
    {
        Ok(run) => render_status(&build_status_payload(&st, &run), json),
        Err(e) => error_response(&e, json),
    }
}

async fn logs_handler(
    State(st): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let json = wants_json(&params);
    let filter = match parse_log_filter(&params) {
        Ok(f) => f,
        Err(e) => return error_response(&e, json),
    };
    let path = match st.supervisor.current_log_file().await {
        Ok(p) => p,
        Err(e) => return error_response(&e, json),
    };
    match st.log_store.read(&path, filter).await {
        Ok(view) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, TEXT_CONTENT_TYPE)],
            view.content,
        )
            .into_response(),
        Err(e) => error_response(&e, json),
    }
}

// ---------------- request parsing ----------------

fn wants_json(params: &HashMap<String, String>) -> bool {
    params.get("format").map(|f| f == "json").unwrap_or(false)
}

/// JSON body `{"command":"..."}` under `application/json`, otherwise the raw
/// body is the command. Empty after trimming is rejected.
fn parse_start_command(headers: &HeaderMap, body: &Bytes) -> Result<String, ShellError> {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let command = if content_type.contains("application/json") {
        #[derive(serde::Deserialize, Default)]
        struct StartBody {
            #[serde(default)]
            command: String,
        }
        serde_json::from_slice::<StartBody>(body)
            .map(|b| b.command)
            .unwrap_or_default()
    } else {
        String::from_utf8_lossy(body).into_owned()
    };
    let command = command.trim().to_string();
    if command.is_empty() {
        return Err(ShellError::BadRequest("command cannot be empty".into()));
    }
    Ok(command)
}

/// At most one of `lines` / `seconds`, both positive integers; neither
/// selects everything.
fn parse_log_filter(params: &HashMap<String, String>) -> Result<LogFilter, ShellError> {
    let lines = params.get("lines");
    let seconds = params.get("seconds");
    if lines.is_some() && seconds.is_some() {
        return Err(ShellError::BadRequest(
            "cannot specify both 'lines' and 'seconds'".into(),
        ));
    }
    if let Some(raw) = lines {
        let n: usize = raw
            .parse()
            .map_err(|_| ShellError::BadRequest(format!("invalid lines: {raw}")))?;
        if n == 0 {
            return Err(ShellError::BadRequest("lines must be positive".into()));
        }
        return Ok(LogFilter::LastN(n));
    }
    if let Some(raw) = seconds {
        let s: u64 = raw
            .parse()
            .map_err(|_| ShellError::BadRequest(format!("invalid seconds: {raw}")))?;
        if s == 0 {
            return Err(ShellError::BadRequest("seconds must be positive".into()));
        }
        return Ok(LogFilter::SinceSeconds(s));
    }
    Ok(LogFilter::All)
}

// ---------------- rendering ----------------

/// Field order doubles as the stable key order of the plain-text rendering.
#[derive(Debug, Serialize)]
struct StatusPayload {
    status: &'static str,
    pid: u32,
    /// Whole seconds while running; absent once terminated.
    uptime: Option<u64>,
    command: String,
    user: Option<String>,
    ports: Option<Vec<u16>>,
    cpu: Option<f64>,
    mem_mb: Option<f64>,
    threads: Option<u32>,
    open_files: Option<usize>,
    connections: Option<usize>,
    children: Option<usize>,
    env_count: Option<usize>,
    log_file: String,
    created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    stopped_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kill_type: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    log_tail: Option<String>,
}

#[derive(Debug, Serialize)]
struct KillPayload {
    status: &'static str,
    r#type: &'static str,
    exit_code: Option<i32>,
    stopped_at: Option<String>,
}

fn iso(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn build_status_payload(st: &AppState, run: &ChildRun) -> StatusPayload {
    let probe = if run.state == RunState::Running {
        st.probe.probe(run.pid)
    } else {
        Probe::default()
    };
    let uptime = match run.state {
        RunState::Running => Some((Utc::now() - run.created_at).num_seconds().max(0) as u64),
        _ => None,
    };
    StatusPayload {
        status: run.state.as_str(),
        pid: run.pid,
        uptime,
        command: run.command.clone(),
        user: probe.user,
        ports: probe.ports,
        cpu: probe.cpu_percent,
        mem_mb: probe.memory_mb,
        threads: probe.threads,
        open_files: probe.open_files,
        connections: probe.connections,
        children: probe.children,
        env_count: probe.env_count,
        log_file: run.log_file.display().to_string(),
        created_at: iso(run.created_at),
        stopped_at: run.stopped_at.map(iso),
        exit_code: run.exit_code,
        kill_type: run.kill_type.map(|k| k.as_str()),
        log_tail: None,
    }
}

fn opt<T: std::fmt::Display>(v: &Option<T>) -> String {
    v.as_ref()
        .map(|x| x.to_string())
        .unwrap_or_else(|| "-".to_string())
}

fn fmt_duration(secs: u64) -> String {
    let days = secs / 86_400;
    let hours = (secs % 86_400) / 3_600;
    let mins = (secs % 3_600) / 60;
    let s = secs % 60;
    if days > 0 {
        format!("{days}d{hours}h")
    } else if hours > 0 {
        format!("{hours}h{mins}m")
    } else if mins > 0 {
        format!("{mins}m{s}s")
    } else {
        format!("{s}s")
    }
}

fn status_text(p: &StatusPayload) -> String {
    let ports = match &p.ports {
        Some(ports) if !ports.is_empty() => ports
            .iter()
            .map(|port| port.to_string())
            .collect::<Vec<_>>()
            .join(","),
        _ => "-".to_string(),
    };
    let mut lines = vec![
        format!("status: {}", p.status),
        format!("pid: {}", p.pid),
        format!(
            "uptime: {}",
            p.uptime.map(fmt_duration).unwrap_or_else(|| "-".to_string())
        ),
        format!("command: {}", p.command),
        format!("user: {}", opt(&p.user)),
        format!("ports: {ports}"),
        format!(
            "cpu: {}",
            p.cpu.map(|v| format!("{v:.1}")).unwrap_or_else(|| "-".to_string())
        ),
        format!(
            "mem_mb: {}",
            p.mem_mb
                .map(|v| format!("{v:.1}"))
                .unwrap_or_else(|| "-".to_string())
        ),
        format!("threads: {}", opt(&p.threads)),
        format!("open_files: {}", opt(&p.open_files)),
        format!("connections: {}", opt(&p.connections)),
        format!("children: {}", opt(&p.children)),
        format!("env_count: {}", opt(&p.env_count)),
        format!("log_file: {}", p.log_file),
    ];
    if let Some(stopped_at) = &p.stopped_at {
        lines.push(format!("stopped_at: {stopped_at}"));
    }
    if let Some(exit_code) = p.exit_code {
        lines.push(format!("exit_code: {exit_code}"));
    }
    if let Some(kill_type) = p.kill_type {
        lines.push(format!("kill_type: {kill_type}"));
    }
    let mut out = lines.join("\n");
    if let Some(tail) = &p.log_tail {
        out.push_str("\n\nLogs:\n");
        out.push_str(tail);
    }
    out
}

fn render_status(p: &StatusPayload, json: bool) -> Response {
    if json {
        Json(p).into_response()
    } else {
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, TEXT_CONTENT_TYPE)],
            status_text(p),
        )
            .into_response()
    }
}

fn render_kill(run: &ChildRun, json: bool) -> Response {
    let payload = KillPayload {
        status: run.state.as_str(),
        r#type: run.kill_type.map(|k| k.as_str()).unwrap_or("-"),
        exit_code: run.exit_code,
        stopped_at: run.stopped_at.map(iso),
    };
    if json {
        Json(&payload).into_response()
    } else {
        let text = format!(
            "status: {}\ntype: {}\nexit_code: {}\nstopped_at: {}",
            payload.status,
            payload.r#type,
            opt(&payload.exit_code),
            opt(&payload.stopped_at),
        );
        (
            StatusCode::OK,
            [(header::CONTENT_TYPE, TEXT_CONTENT_TYPE)],
            text,
        )
            .into_response()
    }
}

fn error_response(err: &ShellError, json: bool) -> Response {
    let status = err.status_code();
    let msg = err.to_string();
    if json {
        (status, Json(serde_json::json!({ "error": msg }))).into_response()
    } else {
        (
            status,
            [(header::CONTENT_TYPE, TEXT_CONTENT_TYPE)],
            format!("error: {msg}"),
        )
            .into_response()
    }
}
