//! REST API of the configurator kernel.
//!
//! The surface a web console or CLI drives: host and process CRUD, cluster
//! policy edits, auto-configuration, tree projections and a system health
//! view. Every mutation runs the same pipeline as the original UI actions:
//! store mutation, tree sync, allocation for new processes, parameter
//! re-derivation, snapshot save.
//!
//! All routes except /health require the x-api-key header, validated against
//! the CLUSTERCONF_API_KEY environment variable.

use crate::alloc;
use crate::autoconf;
use crate::config::KernelConfig;
use crate::models::{
    AppArea, Family, ProbeStatus, ProcessParams, ProcessStatus, RecordId, WriteLoad,
};
use crate::params;
use crate::probe;
use crate::store::{DeploymentStore, Shared};
use crate::trees::{Panel, Trees};
use axum::extract::{Path, Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use tracing::{error, warn};

#[derive(Clone)]
pub struct AppState {
    pub store: DeploymentStore,
    pub trees: Shared<Trees>,
    pub cfg: KernelConfig,
    pub started: Instant,
}

async fn require_api_key(req: Request, next: Next) -> Result<Response, StatusCode> {
    if req.uri().path().starts_with("/health") {
        return Ok(next.run(req).await);
    }

    let expected = std::env::var("CLUSTERCONF_API_KEY").unwrap_or_default();
    if expected.is_empty() {
        warn!("CLUSTERCONF_API_KEY not set, refusing API access");
        return Err(StatusCode::UNAUTHORIZED);
    }

    let ok = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(|v| v == expected)
        .unwrap_or(false);
    if !ok {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(next.run(req).await)
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/hosts", get(get_hosts).post(add_host))
        .route("/hosts/{id}", get(get_host).delete(delete_host))
        .route("/hosts/{id}/probe", post(reprobe_host))
        .route("/processes", get(get_processes).post(add_process))
        .route("/processes/{id}", axum::routing::put(update_process).delete(delete_process))
        .route("/cluster", get(get_cluster).put(update_cluster))
        .route("/autoconfigure", post(autoconfigure))
        .route("/trees", get(get_trees))
        .route("/trees/selection", axum::routing::put(set_selection))
        .with_state(app_state)
        .layer(middleware::from_fn(require_api_key))
}

#[derive(Serialize)]
struct HostView {
    id: RecordId,
    name: String,
    wildcard: bool,
    ram_mb: Option<u64>,
    cores: Option<u32>,
    platform: crate::platform::PlatformFamily,
    os_flavor: Option<String>,
    os_version: Option<String>,
    install_dir: Option<String>,
    data_dir: Option<String>,
    internal_ip: Option<String>,
    fqdn: Option<String>,
    probe_status: ProbeStatus,
    err_msg: Option<String>,
    last_probed: Option<String>,
    repo_url: Option<String>,
}

fn host_view(h: &crate::models::Host) -> HostView {
    let repo_url = match (&h.os_flavor, &h.os_version) {
        (Some(flavor), Some(ver)) => {
            let major = ver.split('.').next().unwrap_or(ver);
            Some(crate::platform::repo_url(flavor, major))
        }
        _ => None,
    };
    HostView {
        id: h.id,
        name: h.name.clone(),
        wildcard: h.wildcard,
        ram_mb: h.ram_mb,
        cores: h.cores,
        platform: h.platform,
        os_flavor: h.os_flavor.clone(),
        os_version: h.os_version.clone(),
        install_dir: h.install_dir.effective().cloned(),
        data_dir: h.data_dir.effective().cloned(),
        internal_ip: h.internal_ip.clone(),
        fqdn: h.fqdn.clone(),
        probe_status: h.probe_status,
        err_msg: h.err_msg.clone(),
        last_probed: h.last_probed.clone(),
        repo_url,
    }
}

#[derive(Serialize)]
struct ProcessView {
    id: RecordId,
    name: String,
    host_id: RecordId,
    ptype: String,
    family: Option<Family>,
    node_id: Option<u64>,
    port: Option<u16>,
    data_dir: Option<String>,
    status: ProcessStatus,
    params: ProcessParams,
}

fn process_view(dep: &crate::store::Deployment, p: &crate::models::Process) -> ProcessView {
    ProcessView {
        id: p.id,
        name: p.name.clone(),
        host_id: p.host_id,
        ptype: dep.ptypes.get(p.ptype_id).map(|t| t.name.clone()).unwrap_or_default(),
        family: dep.family_of(p),
        node_id: p.node_id,
        port: p.port.value(),
        data_dir: p.data_dir.effective().cloned(),
        status: p.status,
        params: p.params.clone(),
    }
}

async fn persist(app: &AppState) -> Result<(), StatusCode> {
    app.store.save().await.map_err(|e| {
        error!("failed to save deployment: {e}");
        StatusCode::INTERNAL_SERVER_ERROR
    })
}

fn spawn_probe(app: &AppState, host_id: RecordId) {
    if app.cfg.probe.command.is_none() {
        return;
    }
    let store = app.store.clone();
    let probe_conf = app.cfg.probe.clone();
    let limits = app.cfg.limits.data_memory();
    tokio::spawn(async move {
        if let Err(e) = probe::run_probe(&store, &probe_conf, &limits, host_id).await {
            warn!(host_id, "probe task failed: {e}");
        }
    });
}

// GET /hosts
async fn get_hosts(State(app): State<AppState>) -> Json<Vec<HostView>> {
    let dep = app.store.lock();
    Json(dep.hosts.iter().map(host_view).collect())
}

// GET /hosts/{id}
async fn get_host(
    State(app): State<AppState>,
    Path(id): Path<RecordId>,
) -> Result<Json<HostView>, StatusCode> {
    let dep = app.store.lock();
    let host = dep.hosts.get(id).ok_or(StatusCode::NOT_FOUND)?;
    Ok(Json(host_view(host)))
}

#[derive(Deserialize)]
struct AddHostIn {
    name: String,
    #[serde(default)]
    wildcard: bool,
}

// POST /hosts
async fn add_host(
    State(app): State<AppState>,
    Json(body): Json<AddHostIn>,
) -> Result<(StatusCode, Json<serde_json::Value>), StatusCode> {
    let id = {
        let mut dep = app.store.lock();
        let id = dep.add_host(&body.name, body.wildcard);
        app.trees.lock().add_host(id, &body.name);
        id
    };
    persist(&app).await?;
    if !body.wildcard {
        spawn_probe(&app, id);
    }
    Ok((StatusCode::CREATED, Json(serde_json::json!({ "id": id }))))
}

// DELETE /hosts/{id} — cascades to the host's processes
async fn delete_host(
    State(app): State<AppState>,
    Path(id): Path<RecordId>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    {
        let mut dep = app.store.lock();
        let removed = dep.delete_host(id).map_err(|_| StatusCode::NOT_FOUND)?;
        let mut trees = app.trees.lock();
        trees.remove_host(id);
        for pid in &removed {
            trees.remove_process(*pid);
        }
        params::derive_defaults(&mut dep, &app.cfg.limits.data_memory());
    }
    persist(&app).await?;
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

// POST /hosts/{id}/probe — re-issue the hardware probe
async fn reprobe_host(
    State(app): State<AppState>,
    Path(id): Path<RecordId>,
) -> Result<(StatusCode, Json<serde_json::Value>), StatusCode> {
    {
        let dep = app.store.lock();
        dep.hosts.get(id).ok_or(StatusCode::NOT_FOUND)?;
    }
    if app.cfg.probe.command.is_none() {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    spawn_probe(&app, id);
    Ok((StatusCode::ACCEPTED, Json(serde_json::json!({ "status": "probing" }))))
}

// GET /processes
async fn get_processes(State(app): State<AppState>) -> Json<Vec<ProcessView>> {
    let dep = app.store.lock();
    Json(dep.processes.iter().map(|p| process_view(&dep, p)).collect())
}

#[derive(Deserialize)]
struct AddProcessIn {
    name: Option<String>,
    host_id: RecordId,
    ptype: String,
}

// POST /processes — create, allocate node id + port, sync trees, re-derive
async fn add_process(
    State(app): State<AppState>,
    Json(body): Json<AddProcessIn>,
) -> Result<(StatusCode, Json<ProcessView>), StatusCode> {
    let view = {
        let mut dep = app.store.lock();
        let ptype_id = dep.ptype_by_name(&body.ptype).ok_or(StatusCode::BAD_REQUEST)?.id;
        let id = alloc::create_process(&mut dep, body.name.as_deref(), body.host_id, ptype_id)
            .map_err(|e| match e {
                alloc::AllocError::Store(_) => StatusCode::NOT_FOUND,
                _ => {
                    warn!("allocation failed: {e}");
                    StatusCode::CONFLICT
                }
            })?;
        let proc = dep.processes.get(id).ok_or(StatusCode::INTERNAL_SERVER_ERROR)?.clone();
        if let Some(family) = dep.family_of(&proc) {
            app.trees.lock().add_process(id, &proc.name, proc.status, proc.host_id, family);
        }
        params::derive_defaults(&mut dep, &app.cfg.limits.data_memory());
        process_view(&dep, dep.processes.get(id).ok_or(StatusCode::INTERNAL_SERVER_ERROR)?)
    };
    persist(&app).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

#[derive(Deserialize)]
struct UpdateProcessIn {
    name: Option<String>,
    /// Explicit port override (user slot).
    port: Option<u16>,
    data_dir: Option<String>,
    status: Option<ProcessStatus>,
}

// PUT /processes/{id} — rename and per-instance overrides
async fn update_process(
    State(app): State<AppState>,
    Path(id): Path<RecordId>,
    Json(body): Json<UpdateProcessIn>,
) -> Result<Json<ProcessView>, StatusCode> {
    let view = {
        let mut dep = app.store.lock();
        let proc = dep.processes.get_mut(id).ok_or(StatusCode::NOT_FOUND)?;
        if let Some(name) = &body.name {
            proc.name = name.clone();
            app.trees.lock().rename_process(id, name);
        }
        if let Some(port) = body.port {
            proc.port.set_user(port);
        }
        if let Some(data_dir) = &body.data_dir {
            proc.data_dir.set_user(data_dir.clone());
        }
        if let Some(status) = body.status {
            proc.status = status;
            app.trees.lock().set_process_status(id, status);
        }
        params::derive_defaults(&mut dep, &app.cfg.limits.data_memory());
        process_view(&dep, dep.processes.get(id).ok_or(StatusCode::NOT_FOUND)?)
    };
    persist(&app).await?;
    Ok(Json(view))
}

// DELETE /processes/{id}
async fn delete_process(
    State(app): State<AppState>,
    Path(id): Path<RecordId>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    {
        let mut dep = app.store.lock();
        dep.delete_process(id).map_err(|_| StatusCode::NOT_FOUND)?;
        app.trees.lock().remove_process(id);
        params::derive_defaults(&mut dep, &app.cfg.limits.data_memory());
    }
    persist(&app).await?;
    Ok(Json(serde_json::json!({ "status": "deleted" })))
}

// GET /cluster
async fn get_cluster(State(app): State<AppState>) -> Json<crate::models::Cluster> {
    Json(app.store.lock().cluster.clone())
}

#[derive(Deserialize)]
struct UpdateClusterIn {
    name: Option<String>,
    app_area: Option<AppArea>,
    write_load: Option<WriteLoad>,
    ssh_user: Option<String>,
    ssh_key_based: Option<bool>,
}

// PUT /cluster — policy edits trigger a full re-derivation
async fn update_cluster(
    State(app): State<AppState>,
    Json(body): Json<UpdateClusterIn>,
) -> Result<Json<crate::models::Cluster>, StatusCode> {
    let cluster = {
        let mut dep = app.store.lock();
        if let Some(name) = body.name {
            dep.cluster.name = name;
        }
        if let Some(area) = body.app_area {
            dep.cluster.app_area = area;
        }
        if let Some(load) = body.write_load {
            dep.cluster.write_load = load;
        }
        if let Some(user) = body.ssh_user {
            dep.cluster.ssh_user = Some(user);
        }
        if let Some(key_based) = body.ssh_key_based {
            dep.cluster.ssh_key_based = key_based;
        }
        params::derive_defaults(&mut dep, &app.cfg.limits.data_memory());
        dep.cluster.clone()
    };
    persist(&app).await?;
    Ok(Json(cluster))
}

// POST /autoconfigure — populate the default topology
async fn autoconfigure(
    State(app): State<AppState>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    let created = {
        let mut dep = app.store.lock();
        let mut trees = app.trees.lock();
        autoconf::auto_configure(&mut dep, &mut trees, &app.cfg.limits.data_memory()).map_err(
            |e| {
                warn!("auto-configuration failed: {e}");
                StatusCode::CONFLICT
            },
        )?
    };
    persist(&app).await?;
    Ok(Json(serde_json::json!({ "created": created })))
}

// GET /trees — both projections plus selections
async fn get_trees(State(app): State<AppState>) -> Json<Trees> {
    Json(app.trees.lock().clone())
}

#[derive(Deserialize)]
struct SetSelectionIn {
    panel: Panel,
    /// Leaf to select; absent clears the panel's selection.
    process_id: Option<RecordId>,
}

// PUT /trees/selection
async fn set_selection(
    State(app): State<AppState>,
    Json(body): Json<SetSelectionIn>,
) -> Result<Json<Trees>, StatusCode> {
    if let Some(id) = body.process_id {
        let dep = app.store.lock();
        dep.processes.get(id).ok_or(StatusCode::NOT_FOUND)?;
    }
    let mut trees = app.trees.lock();
    trees.select(body.panel, body.process_id);
    Ok(Json(trees.clone()))
}

#[derive(Serialize)]
pub struct SystemHealth {
    pub uptime_seconds: u64,
    pub hosts: usize,
    pub processes: usize,
    pub process_types: usize,
    pub memory_usage_mb: f32,
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<SystemHealth> {
    let (hosts, processes, process_types) = {
        let dep = app.store.lock();
        (dep.hosts.len(), dep.processes.len(), dep.ptypes.len())
    };
    Json(SystemHealth {
        uptime_seconds: app.started.elapsed().as_secs(),
        hosts,
        processes,
        process_types,
        memory_usage_mb: get_memory_usage_mb(),
    })
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        let pid = std::process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            for line in status.lines() {
                if line.starts_with("VmRSS:") {
                    if let Some(kb_str) = line.split_whitespace().nth(1) {
                        if let Ok(kb) = kb_str.parse::<u64>() {
                            return (kb as f32) / 1024.0;
                        }
                    }
                }
            }
        }
    }
    0.0
}
