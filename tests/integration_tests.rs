use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use dags::config::Config;
use dags::protocol::codec::WireCodec;
use dags::protocol::message::{
    Body, Envelope, GroupMessage, JobPayload, MonitorMessage, MonitorQuery, RequestKind,
    SubGroupMessage,
};
use dags::protocol::wire;
use dags::server;
use dags::store::Store;

struct TestServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
    db_path: String,
    _dir: tempfile::TempDir,
}

async fn start_server() -> TestServer {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("universe.db").to_string_lossy().into_owned();
    let mut config = Config::default();
    config.server.port = 0;
    config.store.db_path = db_path.clone();

    let srv = server::bootstrap(Arc::new(config)).await.unwrap();
    let addr = srv.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let token = shutdown.clone();
    let task = tokio::spawn(async move {
        srv.run(token).await.unwrap();
    });
    TestServer {
        addr,
        shutdown,
        task,
        db_path,
        _dir: dir,
    }
}

async fn exchange(addr: SocketAddr, request: Envelope) -> Envelope {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut framed = Framed::new(stream, WireCodec::new(0));
    framed.send(request).await.unwrap();
    framed.next().await.unwrap().unwrap()
}

fn request(kind: RequestKind, code: i32, client_id: i64, body: Body) -> Envelope {
    Envelope {
        client_id,
        kind,
        code,
        app_name: "onemax".to_string(),
        version: "0.1.0".to_string(),
        compression: 0,
        group_id: None,
        generation: None,
        body,
    }
}

fn four_job_group(generation: i64) -> GroupMessage {
    GroupMessage {
        group_id: 0,
        generation,
        environment: "shared".to_string(),
        distribute_env: true,
        jobs: (0..4)
            .map(|i| JobPayload {
                id: i,
                evaluate: true,
                data: Some(format!("genome-{i}")),
                score: None,
            })
            .collect(),
    }
}

async fn submit_group(addr: SocketAddr, msg: GroupMessage) {
    let resp = exchange(
        addr,
        request(
            RequestKind::Group,
            wire::NOTHING_TO_RECEIVE,
            -1,
            Body::Group(msg),
        ),
    )
    .await;
    assert_eq!(resp.code, wire::NO_ERROR);
}

async fn fetch_subgroup(addr: SocketAddr, client_id: i64) -> Envelope {
    exchange(
        addr,
        request(RequestKind::Jobs, wire::NOTHING_TO_SEND, client_id, Body::None),
    )
    .await
}

#[tokio::test]
async fn state_query_before_any_submission() {
    let srv = start_server().await;
    let resp = exchange(
        srv.addr,
        request(RequestKind::State, wire::NO_ERROR, -1, Body::None),
    )
    .await;
    assert_eq!(resp.code, wire::NO_ERROR);
    let Body::Text { text } = resp.body else {
        panic!("state reply is not text");
    };
    let parsed: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(parsed["group_count"], 0);
    assert!(parsed["app_name"].is_null());
    srv.shutdown.cancel();
    srv.task.await.unwrap();
}

#[tokio::test]
async fn empty_server_has_nothing_to_send() {
    let srv = start_server().await;
    let resp = fetch_subgroup(srv.addr, -1).await;
    assert_eq!(resp.code, wire::NOTHING_TO_SEND);
    assert!(resp.client_id >= 0, "first contact still registers");
    srv.shutdown.cancel();
    srv.task.await.unwrap();
}

#[tokio::test]
async fn full_evaluation_cycle_over_tcp() {
    let srv = start_server().await;
    submit_group(srv.addr, four_job_group(1)).await;

    // A fresh cruncher asks for work and gets the whole batch with the
    // distributed environment.
    let resp = fetch_subgroup(srv.addr, -1).await;
    assert_eq!(resp.code, wire::NO_ERROR);
    let client_id = resp.client_id;
    assert!(client_id >= 0);
    let Body::SubGroup(sub) = resp.body else {
        panic!("jobs reply carries no subgroup");
    };
    assert_eq!(sub.jobs.len(), 4);
    assert_eq!(sub.environment.as_deref(), Some("shared"));
    assert!(sub.jobs.iter().all(|j| j.data.is_some() && j.score.is_none()));

    // Scores go back; the client wants no new batch.
    let scored = SubGroupMessage {
        group_id: sub.group_id,
        generation: sub.generation,
        environment: None,
        jobs: sub
            .jobs
            .iter()
            .map(|j| JobPayload {
                id: j.id,
                evaluate: false,
                data: None,
                score: Some(format!("{}.0", j.id)),
            })
            .collect(),
    };
    let resp = exchange(
        srv.addr,
        request(
            RequestKind::Jobs,
            wire::NOTHING_TO_RECEIVE,
            client_id,
            Body::SubGroup(scored),
        ),
    )
    .await;
    assert_eq!(resp.code, wire::NO_ERROR);

    // The fully scored group is available for evolution, scores included.
    let resp = exchange(
        srv.addr,
        request(RequestKind::Group, wire::NOTHING_TO_SEND, -1, Body::None),
    )
    .await;
    assert_eq!(resp.code, wire::NO_ERROR);
    let Body::Group(group) = resp.body else {
        panic!("group reply carries no group");
    };
    assert_eq!(group.jobs.len(), 4);
    assert!(group.jobs.iter().all(|j| j.score.is_some()));

    // Shut down and confirm the scores reached the store.
    srv.shutdown.cancel();
    srv.task.await.unwrap();
    let store = Store::open(&srv.db_path).await.unwrap();
    assert!(store.unscored_ids(0).await.unwrap().is_empty());
    store.close().await;
}

#[tokio::test]
async fn wrong_application_is_rejected() {
    let srv = start_server().await;
    submit_group(srv.addr, four_job_group(1)).await;

    let mut bad = request(RequestKind::Jobs, wire::NOTHING_TO_SEND, -1, Body::None);
    bad.app_name = "someother".to_string();
    let resp = exchange(srv.addr, bad).await;
    assert_eq!(resp.code, wire::UNKNOWN_APPLICATION);

    // The state query works regardless; monitors bootstrap through it.
    let mut state_req = request(RequestKind::State, wire::NO_ERROR, -1, Body::None);
    state_req.app_name = "someother".to_string();
    let resp = exchange(srv.addr, state_req).await;
    assert_eq!(resp.code, wire::NO_ERROR);

    srv.shutdown.cancel();
    srv.task.await.unwrap();
}

#[tokio::test]
async fn reseed_requeues_work_and_retires_the_client() {
    let srv = start_server().await;
    submit_group(srv.addr, four_job_group(1)).await;

    let resp = fetch_subgroup(srv.addr, -1).await;
    let client_id = resp.client_id;
    let Body::SubGroup(sub) = resp.body else {
        panic!("jobs reply carries no subgroup");
    };
    assert_eq!(sub.jobs.len(), 4);

    // The client managed one score, then gives up.
    let reseed = SubGroupMessage {
        group_id: sub.group_id,
        generation: sub.generation,
        environment: None,
        jobs: sub
            .jobs
            .iter()
            .map(|j| JobPayload {
                id: j.id,
                evaluate: false,
                data: None,
                score: (j.id == 0).then(|| "0.0".to_string()),
            })
            .collect(),
    };
    let resp = exchange(
        srv.addr,
        request(
            RequestKind::Reseed,
            wire::NO_ERROR,
            client_id,
            Body::SubGroup(reseed),
        ),
    )
    .await;
    assert_eq!(resp.code, wire::NO_ERROR);

    // The abandoned jobs are immediately dispatchable again. The retired
    // id was freed, so the next first contact re-registers (and may reuse
    // the slot).
    let resp = fetch_subgroup(srv.addr, client_id).await;
    assert!(resp.client_id >= 0);
    let Body::SubGroup(sub) = resp.body else {
        panic!("jobs reply carries no subgroup");
    };
    let mut ids: Vec<i64> = sub.jobs.iter().map(|j| j.id).collect();
    ids.sort_unstable();
    assert_eq!(ids, vec![1, 2, 3]);

    srv.shutdown.cancel();
    srv.task.await.unwrap();
}

#[tokio::test]
async fn monitor_states_and_distribution_list() {
    let srv = start_server().await;
    submit_group(srv.addr, four_job_group(1)).await;
    let _ = fetch_subgroup(srv.addr, -1).await;

    let resp = exchange(
        srv.addr,
        request(
            RequestKind::Monitor,
            wire::NO_ERROR,
            -1,
            Body::Monitor(MonitorMessage {
                query: MonitorQuery::States,
                id: None,
            }),
        ),
    )
    .await;
    assert_eq!(resp.code, wire::NO_ERROR);
    let Body::Text { text } = resp.body else {
        panic!("states reply is not text");
    };
    let states: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(states.as_array().unwrap().len(), 1);
    assert_eq!(states[0]["group_id"], 0);

    let resp = exchange(
        srv.addr,
        request(
            RequestKind::Monitor,
            wire::NO_ERROR,
            -1,
            Body::Monitor(MonitorMessage {
                query: MonitorQuery::DistributionList,
                id: None,
            }),
        ),
    )
    .await;
    assert_eq!(resp.code, wire::NO_ERROR);
    let Body::Text { text } = resp.body else {
        panic!("distribution reply is not text");
    };
    let list: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(list.as_array().unwrap().len(), 1);

    srv.shutdown.cancel();
    srv.task.await.unwrap();
}

#[tokio::test]
async fn set_env_requires_the_current_generation() {
    let srv = start_server().await;
    submit_group(srv.addr, four_job_group(2)).await;

    let mut req = request(RequestKind::SetEnv, wire::NO_ERROR, -1, Body::text("new-env"));
    req.group_id = Some(0);
    req.generation = Some(2);
    let resp = exchange(srv.addr, req).await;
    assert_eq!(resp.code, wire::NO_ERROR);

    let mut stale = request(RequestKind::SetEnv, wire::NO_ERROR, -1, Body::text("older"));
    stale.group_id = Some(0);
    stale.generation = Some(1);
    let resp = exchange(srv.addr, stale).await;
    assert_eq!(resp.code, wire::BAD_GROUP_ATTRIBUTES);

    let resp = exchange(
        srv.addr,
        request(
            RequestKind::Monitor,
            wire::NO_ERROR,
            -1,
            Body::Monitor(MonitorMessage {
                query: MonitorQuery::Environment,
                id: Some(0),
            }),
        ),
    )
    .await;
    let Body::Text { text } = resp.body else {
        panic!("environment reply is not text");
    };
    assert_eq!(text, "new-env");

    srv.shutdown.cancel();
    srv.task.await.unwrap();
}

#[tokio::test]
async fn quit_releases_a_group_taken_for_evolution() {
    let srv = start_server().await;
    // A pre-scored group is Ready straight away.
    let mut msg = four_job_group(1);
    for job in &mut msg.jobs {
        job.evaluate = false;
        job.score = Some("1.0".to_string());
    }
    submit_group(srv.addr, msg).await;

    let resp = exchange(
        srv.addr,
        request(RequestKind::Group, wire::NOTHING_TO_SEND, -1, Body::None),
    )
    .await;
    assert_eq!(resp.code, wire::NO_ERROR);
    assert_eq!(resp.group_id, Some(0));

    // Nothing else is available while it is out.
    let resp = exchange(
        srv.addr,
        request(RequestKind::Group, wire::NOTHING_TO_SEND, -1, Body::None),
    )
    .await;
    assert_eq!(resp.code, wire::NOTHING_TO_SEND);

    let mut quit = request(RequestKind::Quit, wire::NO_ERROR, -1, Body::None);
    quit.group_id = Some(0);
    let resp = exchange(srv.addr, quit).await;
    assert_eq!(resp.code, wire::NO_ERROR);

    let resp = exchange(
        srv.addr,
        request(RequestKind::Group, wire::NOTHING_TO_SEND, -1, Body::None),
    )
    .await;
    assert_eq!(resp.code, wire::NO_ERROR);

    srv.shutdown.cancel();
    srv.task.await.unwrap();
}

#[tokio::test]
async fn malformed_frame_gets_a_structured_error() {
    use tokio::io::AsyncWriteExt;

    let srv = start_server().await;
    let mut stream = TcpStream::connect(srv.addr).await.unwrap();
    // Valid length prefix, stored level, garbage JSON body.
    stream.write_all(&7u32.to_be_bytes()).await.unwrap();
    stream.write_all(&[0u8]).await.unwrap();
    stream.write_all(b"!!!!!!").await.unwrap();
    stream.flush().await.unwrap();

    let mut framed = Framed::new(stream, WireCodec::new(0));
    let resp = framed.next().await.unwrap().unwrap();
    assert_eq!(resp.code, wire::MALFORMED_MESSAGE);

    srv.shutdown.cancel();
    srv.task.await.unwrap();
}
