use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

use crate::config::Config;
use crate::error::{DagsError, Result};
use crate::protocol::codec::WireCodec;
use crate::protocol::message::{
    Body, Envelope, GroupMessage, MonitorMessage, MonitorQuery, RequestKind,
};
use crate::protocol::wire;
use crate::sched::state::SchedulingState;
use crate::store::Store;

/// A peer that sends nothing for this long forfeits its exchange.
const READ_TIMEOUT: Duration = Duration::from_secs(300);

/// Everything a handler needs, shared across all connections.
pub struct HandlerContext {
    pub state: Arc<SchedulingState>,
    pub store: Option<Store>,
    pub config: Arc<Config>,
}

impl HandlerContext {
    /// Soft-lease duration, or `None` when redispatch is disabled.
    fn lease(&self) -> Option<Duration> {
        self.config.lease_secs().map(Duration::from_secs)
    }

    /// Page a group's jobs in from the store when low-memory mode evicted
    /// them, persisting whatever the eviction displaced.
    async fn ensure_resident(&self, group_id: i64) -> Result<()> {
        if self.state.jobs_resident(group_id)? {
            return Ok(());
        }
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| DagsError::Internal(format!("group {group_id} paged out with no store")))?;
        let rows = store.load_job_rows(group_id).await?;
        self.state.install_jobs(group_id, rows)?;
        Ok(())
    }

    /// Run the configured flush policy for one group.
    async fn flush_scores(&self, group_id: i64, force: bool) -> Result<()> {
        let Some(store) = self.store.as_ref() else {
            return Ok(());
        };
        let pending = self
            .state
            .drain_unsynced(group_id, self.config.store.sync_percent, force)?;
        store.write_scores(group_id, &pending).await
    }
}

/// Drive one complete exchange: decode, validate, mutate, respond, close.
/// No session state survives the connection.
pub async fn handle_connection(
    ctx: Arc<HandlerContext>,
    stream: TcpStream,
    peer: SocketAddr,
    conn_id: u64,
) {
    let started = Instant::now();
    let mut framed = Framed::new(stream, WireCodec::new(0));

    let request = match tokio::time::timeout(READ_TIMEOUT, framed.next()).await {
        Ok(Some(Ok(envelope))) => envelope,
        Ok(Some(Err(e))) => {
            tracing::warn!(conn_id, %peer, error = %e, "malformed request");
            let reply = error_envelope(&e);
            let _ = framed.send(reply).await;
            return;
        }
        Ok(None) => {
            tracing::debug!(conn_id, %peer, "peer closed before sending a request");
            return;
        }
        Err(_) => {
            tracing::warn!(conn_id, %peer, "request read timed out");
            return;
        }
    };

    let kind = request.kind;
    let response = match dispatch(&ctx, &request, &peer).await {
        Ok(reply) => reply,
        Err(e) => {
            tracing::warn!(
                conn_id,
                %peer,
                operation = %kind,
                error = %e,
                "exchange failed"
            );
            request.reply(e.wire_code(), Body::text(e.to_string()))
        }
    };

    framed.codec_mut().outbound_level = response_level(&ctx.config, &request);
    if let Err(e) = framed.send(response).await {
        tracing::warn!(conn_id, %peer, error = %e, "response send failed");
        return;
    }
    tracing::debug!(
        conn_id,
        %peer,
        operation = %kind,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "exchange complete"
    );
}

/// Compression for the response: the per-class configured level, with -1
/// mirroring whatever the client asked for.
fn response_level(config: &Config, request: &Envelope) -> u32 {
    let configured = match request.kind {
        RequestKind::Group | RequestKind::Terminate => config.compression.group_level,
        RequestKind::Jobs | RequestKind::Reseed => config.compression.subgroup_level,
        _ => 0,
    };
    let level = if configured == -1 {
        request.compression
    } else {
        configured
    };
    level.clamp(0, 9) as u32
}

fn error_envelope(e: &DagsError) -> Envelope {
    Envelope {
        client_id: -1,
        kind: RequestKind::State,
        code: e.wire_code(),
        app_name: String::new(),
        version: String::new(),
        compression: 0,
        group_id: None,
        generation: None,
        body: Body::text(e.to_string()),
    }
}

async fn dispatch(
    ctx: &HandlerContext,
    request: &Envelope,
    peer: &SocketAddr,
) -> Result<Envelope> {
    // Every request except the bootstrap state query must name the one
    // application this server runs.
    if request.kind != RequestKind::State {
        if let Some(expected) = ctx.state.app_name() {
            if request.app_name != expected {
                return Err(DagsError::ApplicationMismatch {
                    expected,
                    got: request.app_name.clone(),
                });
            }
        }
    }

    match request.kind {
        RequestKind::Group => handle_group(ctx, request).await,
        RequestKind::Terminate => handle_terminate(ctx, request).await,
        RequestKind::Jobs => handle_jobs(ctx, request, peer).await,
        RequestKind::Reseed => handle_reseed(ctx, request).await,
        RequestKind::Quit => handle_quit(ctx, request),
        RequestKind::SetEnv => handle_set_env(ctx, request).await,
        RequestKind::Monitor => handle_monitor(ctx, request).await,
        RequestKind::State => handle_state(ctx, request),
    }
}

/// Sequencer traffic: optionally ingest a full group, optionally hand one
/// back for evolution. The request's sentinel code selects the halves.
async fn handle_group(ctx: &HandlerContext, request: &Envelope) -> Result<Envelope> {
    if request.has_upload() {
        let Body::Group(msg) = &request.body else {
            return Err(DagsError::Protocol(
                "group request with upload half carries no group body".into(),
            ));
        };
        submit(ctx, request, msg).await?;
    }

    if !request.wants_download() {
        return Ok(request.reply(wire::NO_ERROR, Body::None));
    }
    match ctx.state.take_group_for_evolution() {
        Ok(group_id) => {
            ctx.ensure_resident(group_id).await?;
            let msg = ctx.state.group_message(group_id)?;
            let mut reply = request.reply(wire::NO_ERROR, Body::Group(msg));
            reply.group_id = Some(group_id);
            Ok(reply)
        }
        Err(DagsError::NoGroupAvailable) => Ok(request.reply(wire::NOTHING_TO_SEND, Body::None)),
        Err(e) => Err(e),
    }
}

/// Operator full replacement; unlike `group` it never hands work back.
async fn handle_terminate(ctx: &HandlerContext, request: &Envelope) -> Result<Envelope> {
    let Body::Group(msg) = &request.body else {
        return Err(DagsError::Protocol("terminate carries no group body".into()));
    };
    submit(ctx, request, msg).await?;
    Ok(request.reply(wire::NO_ERROR, Body::None))
}

async fn submit(ctx: &HandlerContext, request: &Envelope, msg: &GroupMessage) -> Result<()> {
    ctx.state
        .submit_group(msg, &request.app_name, &request.version)?;
    if ctx.config.store.group_sync {
        if let Some(store) = ctx.store.as_ref() {
            store
                .replace_group(msg, &request.app_name, &request.version)
                .await?;
        }
    }
    Ok(())
}

/// Cruncher traffic: optionally ingest scores, optionally hand out a
/// subgroup sized by the load balancer.
async fn handle_jobs(ctx: &HandlerContext, request: &Envelope, peer: &SocketAddr) -> Result<Envelope> {
    let client_id = ensure_client(ctx, request.client_id, peer);

    if request.has_upload() {
        let Body::SubGroup(msg) = &request.body else {
            return Err(DagsError::Protocol(
                "jobs request with upload half carries no subgroup body".into(),
            ));
        };
        let scores: Vec<(i64, String)> = msg
            .jobs
            .iter()
            .filter_map(|j| j.score.clone().map(|s| (j.id, s)))
            .collect();
        match ctx
            .state
            .record_scores(msg.group_id, msg.generation, &scores)
        {
            Ok(outcome) => {
                tracing::debug!(
                    client_id,
                    group_id = msg.group_id,
                    newly = outcome.newly_recorded,
                    remaining = outcome.remaining,
                    "scores recorded"
                );
                ctx.flush_scores(msg.group_id, false).await?;
            }
            // A generation that moved on underneath the client is not its
            // fault; its effort still feeds the throughput estimate and it
            // simply fetches fresh work below.
            Err(DagsError::StaleGeneration { current, got, .. }) => {
                tracing::debug!(
                    client_id,
                    group_id = msg.group_id,
                    current,
                    got,
                    "stale-generation scores dropped"
                );
            }
            Err(e) => return Err(e),
        }
        ctx.state.record_client_contact(
            client_id,
            scores.len(),
            ctx.config.balance.history_size,
        )?;
    }

    if !request.wants_download() {
        let mut reply = request.reply(wire::NO_ERROR, Body::None);
        reply.client_id = client_id;
        return Ok(reply);
    }

    let batch = ctx.state.recommend_batch(client_id, &ctx.config.balance);
    let lease = ctx.lease();
    let dispatched = match ctx.state.take_group_for_evaluation(lease) {
        Ok(group_id) => {
            ctx.ensure_resident(group_id).await?;
            match ctx.state.take_jobs_for_evaluation(group_id, batch, lease) {
                Ok(sub) => Some(sub),
                Err(DagsError::JobsUnavailable(_)) => None,
                Err(e) => return Err(e),
            }
        }
        Err(DagsError::NoGroupAvailable) => None,
        Err(e) => return Err(e),
    };

    match dispatched {
        Some(sub) => {
            ctx.state.note_client_batch(client_id, sub.jobs.len())?;
            let mut reply = request.reply(wire::NO_ERROR, Body::SubGroup(sub));
            reply.client_id = client_id;
            Ok(reply)
        }
        None => {
            let mut reply = request.reply(wire::NOTHING_TO_SEND, Body::None);
            reply.client_id = client_id;
            Ok(reply)
        }
    }
}

/// First contact from an unrecognized id allocates a Distribution record.
fn ensure_client(ctx: &HandlerContext, client_id: i64, peer: &SocketAddr) -> i64 {
    if client_id >= 0 && ctx.state.client_known(client_id) {
        client_id
    } else {
        ctx.state.register_client(&peer.ip().to_string())
    }
}

/// The client abandons its batch: unscored ids go back to the pool, scores
/// it did produce are kept, and its Distribution record is retired.
async fn handle_reseed(ctx: &HandlerContext, request: &Envelope) -> Result<Envelope> {
    let Body::SubGroup(msg) = &request.body else {
        return Err(DagsError::Protocol("reseed carries no subgroup body".into()));
    };

    let scores: Vec<(i64, String)> = msg
        .jobs
        .iter()
        .filter_map(|j| j.score.clone().map(|s| (j.id, s)))
        .collect();
    if !scores.is_empty() {
        match ctx.state.record_scores(msg.group_id, msg.generation, &scores) {
            Ok(_) => {}
            // The batch belongs to a dead generation; nothing to give back.
            Err(DagsError::StaleGeneration { .. }) => {
                return Ok(request.reply(wire::NO_ERROR, Body::None));
            }
            Err(e) => return Err(e),
        }
    }
    let unscored: Vec<i64> = msg
        .jobs
        .iter()
        .filter(|j| j.score.is_none())
        .map(|j| j.id)
        .collect();
    let requeued = match ctx
        .state
        .requeue_unscored(msg.group_id, msg.generation, &unscored)
    {
        Ok(n) => n,
        Err(DagsError::StaleGeneration { .. }) => {
            return Ok(request.reply(wire::NO_ERROR, Body::None));
        }
        Err(e) => return Err(e),
    };
    ctx.flush_scores(msg.group_id, false).await?;

    if ctx.state.client_known(request.client_id) {
        ctx.state.invalidate_client(request.client_id)?;
    }
    tracing::info!(
        client_id = request.client_id,
        group_id = msg.group_id,
        requeued,
        rescued_scores = scores.len(),
        "client reseeded"
    );
    Ok(request.reply(wire::NO_ERROR, Body::None))
}

fn handle_quit(ctx: &HandlerContext, request: &Envelope) -> Result<Envelope> {
    let group_id = request
        .group_id
        .ok_or_else(|| DagsError::InvalidRequest("quit names no group".into()))?;
    ctx.state.release_group(group_id)?;
    Ok(request.reply(wire::NO_ERROR, Body::None))
}

async fn handle_set_env(ctx: &HandlerContext, request: &Envelope) -> Result<Envelope> {
    let group_id = request
        .group_id
        .ok_or_else(|| DagsError::InvalidRequest("set-env names no group".into()))?;
    let generation = request
        .generation
        .ok_or_else(|| DagsError::InvalidRequest("set-env carries no generation".into()))?;
    let Body::Text { text } = &request.body else {
        return Err(DagsError::Protocol("set-env carries no environment body".into()));
    };
    ctx.state.set_environment(group_id, generation, text)?;
    if let Some(store) = ctx.store.as_ref() {
        store.update_environment(group_id, text).await?;
    }
    Ok(request.reply(wire::NO_ERROR, Body::None))
}

/// Read-only administrative queries; never mutates.
async fn handle_monitor(ctx: &HandlerContext, request: &Envelope) -> Result<Envelope> {
    let Body::Monitor(MonitorMessage { query, id }) = &request.body else {
        return Err(DagsError::Protocol("monitor carries no query body".into()));
    };
    let body = match query {
        MonitorQuery::DistributionList => {
            Body::text(serde_json::to_string(&ctx.state.client_snapshots())?)
        }
        MonitorQuery::Distribution => {
            let id = id.ok_or_else(|| DagsError::InvalidRequest("distribution query names no client".into()))?;
            Body::text(serde_json::to_string(&ctx.state.client_snapshot(id)?)?)
        }
        MonitorQuery::EnvironmentList => {
            Body::text(serde_json::to_string(&ctx.state.environment_list())?)
        }
        MonitorQuery::Environment => {
            let id = id.ok_or_else(|| DagsError::InvalidRequest("environment query names no group".into()))?;
            Body::text(ctx.state.environment(id)?)
        }
        MonitorQuery::Group => {
            let id = id.ok_or_else(|| DagsError::InvalidRequest("group query names no group".into()))?;
            ctx.ensure_resident(id).await?;
            Body::Group(ctx.state.group_message(id)?)
        }
        MonitorQuery::States => Body::text(serde_json::to_string(&ctx.state.states_summary())?),
    };
    Ok(request.reply(wire::NO_ERROR, body))
}

/// Application name and group count; answered before any app is known so
/// monitors can bootstrap.
fn handle_state(ctx: &HandlerContext, request: &Envelope) -> Result<Envelope> {
    let reply = serde_json::json!({
        "app_name": ctx.state.app_name(),
        "group_count": ctx.state.group_count(),
    });
    Ok(request.reply(wire::NO_ERROR, Body::text(reply.to_string())))
}
