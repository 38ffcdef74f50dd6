//! End-to-end run lifecycle tests against the local sandbox.
//!
//! These use `sh` as the interpreter binary so the suite runs without a
//! Python or Node installation: the engine stages the snippet verbatim
//! and invokes `<interpreter> <script>`, so shell snippets stand in for
//! Python ones.

use std::time::{Duration, Instant};

use anyhow::Result;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use kiln::{
    Config, Engine, Event, EventKind, ExecuteRequest, RunStatus, SandboxMode,
};

fn test_config() -> Config {
    Config {
        port: 0,
        supabase_url: "http://127.0.0.1:9".to_string(),
        supabase_anon_key: "test-anon-key".to_string(),
        python_bin: "sh".to_string(),
        node_bin: "sh".to_string(),
        sandbox: SandboxMode::Local,
        docker_bin: "docker".to_string(),
        docker_image: "python:3.11-slim".to_string(),
        docker_node_image: "node:20-slim".to_string(),
    }
}

fn request(code: &str) -> ExecuteRequest {
    ExecuteRequest {
        language: "python".to_string(),
        code: code.to_string(),
        stdin: String::new(),
        args: Vec::new(),
        timeout_ms: 0,
    }
}

/// Submit and subscribe before the supervisor task has had a chance to
/// run, so the subscriber sees the run's full event sequence.
fn submit_and_subscribe(
    engine: &Engine,
    req: ExecuteRequest,
) -> (String, mpsc::Receiver<Event>, CancellationToken) {
    let resp = engine.submit(req).expect("submission accepted");
    assert_eq!(resp.status, RunStatus::Queued);
    let entry = engine.get(&resp.run_id).expect("run registered");
    let token = CancellationToken::new();
    let rx = entry.subscribe(token.clone());
    (resp.run_id, rx, token)
}

async fn collect_until_finished(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
    let mut events = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("timed out waiting for events")
            .expect("event stream closed before run.finished");
        let done = event.kind == EventKind::Finished;
        events.push(event);
        if done {
            return events;
        }
    }
}

fn kinds(events: &[Event]) -> Vec<EventKind> {
    events.iter().map(|e| e.kind).collect()
}

fn concat_stream(events: &[Event], kind: EventKind) -> String {
    events
        .iter()
        .filter(|e| e.kind == kind)
        .filter_map(|e| e.data.clone())
        .collect()
}

#[tokio::test]
async fn happy_path_streams_stdout_and_finishes_clean() -> Result<()> {
    let engine = Engine::new(test_config());
    let (run_id, mut rx, _token) = submit_and_subscribe(&engine, request("echo hi"));

    let events = collect_until_finished(&mut rx).await;
    let kinds = kinds(&events);

    assert_eq!(kinds[0], EventKind::Started);
    assert!(kinds.contains(&EventKind::Stdout));
    assert!(kinds.contains(&EventKind::Stats));
    assert_eq!(*kinds.last().unwrap(), EventKind::Finished);
    assert_eq!(events.last().unwrap().exit_code, Some(0));

    // Stdout events precede the terminal event and reproduce the output.
    assert!(concat_stream(&events, EventKind::Stdout).contains("hi\n"));

    let snap = engine.get(&run_id).unwrap().snapshot();
    assert_eq!(snap.status, RunStatus::Finished);
    assert_eq!(snap.exit_code, Some(0));
    assert_eq!(concat_stream(&events, EventKind::Stdout).into_bytes(), snap.stdout);
    assert!(snap.finished_at.unwrap() >= snap.started_at.unwrap());
    Ok(())
}

#[tokio::test]
async fn stderr_is_streamed_separately() -> Result<()> {
    let engine = Engine::new(test_config());
    let (run_id, mut rx, _token) =
        submit_and_subscribe(&engine, request("echo out; echo err 1>&2"));

    let events = collect_until_finished(&mut rx).await;
    assert!(concat_stream(&events, EventKind::Stdout).contains("out\n"));
    assert!(concat_stream(&events, EventKind::Stderr).contains("err\n"));

    let snap = engine.get(&run_id).unwrap().snapshot();
    assert_eq!(concat_stream(&events, EventKind::Stderr).into_bytes(), snap.stderr);
    Ok(())
}

#[tokio::test]
async fn nonzero_exit_is_failed_with_child_code() -> Result<()> {
    let engine = Engine::new(test_config());
    let (run_id, mut rx, _token) = submit_and_subscribe(&engine, request("exit 7"));

    let events = collect_until_finished(&mut rx).await;
    assert_eq!(events.last().unwrap().exit_code, Some(7));
    assert!(!kinds(&events).contains(&EventKind::Error));

    let snap = engine.get(&run_id).unwrap().snapshot();
    assert_eq!(snap.status, RunStatus::Failed);
    assert_eq!(snap.exit_code, Some(7));
    Ok(())
}

#[tokio::test]
async fn timeout_kills_the_child_within_a_second() -> Result<()> {
    let engine = Engine::new(test_config());
    let mut req = request("sleep 5");
    req.timeout_ms = 200;
    let started = Instant::now();
    let (run_id, mut rx, _token) = submit_and_subscribe(&engine, req);

    let events = collect_until_finished(&mut rx).await;
    assert!(started.elapsed() < Duration::from_secs(3));

    let error = events
        .iter()
        .find(|e| e.kind == EventKind::Error)
        .expect("run.error before run.finished");
    assert_eq!(error.code, Some(kiln::ErrorCode::Timeout));
    assert_eq!(error.message.as_deref(), Some("execution timed out"));
    assert_eq!(events.last().unwrap().exit_code, Some(-1));

    let snap = engine.get(&run_id).unwrap().snapshot();
    assert_eq!(snap.status, RunStatus::Timeout);
    assert_eq!(snap.exit_code, Some(-1));
    assert!(snap.started_at.is_some());
    assert!(snap.finished_at.unwrap() >= snap.started_at.unwrap());
    Ok(())
}

#[tokio::test]
async fn cancel_interrupts_a_sleeping_run() -> Result<()> {
    let engine = Engine::new(test_config());
    let mut req = request("sleep 5");
    req.timeout_ms = 60_000;
    let (run_id, mut rx, _token) = submit_and_subscribe(&engine, req);

    let mut events = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(10), rx.recv())
            .await?
            .expect("event stream closed early");
        let kind = event.kind;
        events.push(event);
        if kind == EventKind::Started {
            // The cancel handle is installed before the supervisor runs,
            // so it must be live once any event has been observed.
            assert_eq!(engine.cancel(&run_id), Some(true));
        }
        if kind == EventKind::Finished {
            break;
        }
    }

    let kind_seq = kinds(&events);
    let canceling = kind_seq
        .iter()
        .position(|k| *k == EventKind::Phase)
        .expect("run.phase canceling event");
    assert_eq!(events[canceling].phase, Some(kiln::RunPhase::Canceling));

    let error = events
        .iter()
        .find(|e| e.kind == EventKind::Error)
        .expect("run.error canceled");
    assert_eq!(error.code, Some(kiln::ErrorCode::Canceled));

    let snap = engine.get(&run_id).unwrap().snapshot();
    assert_eq!(snap.status, RunStatus::Canceled);
    assert_eq!(snap.exit_code, Some(-1));
    Ok(())
}

#[tokio::test]
async fn stdin_is_fed_to_the_child() -> Result<()> {
    let engine = Engine::new(test_config());
    let mut req = request("cat -");
    req.stdin = "hello from stdin\n".to_string();
    let (_run_id, mut rx, _token) = submit_and_subscribe(&engine, req);

    let events = collect_until_finished(&mut rx).await;
    assert!(concat_stream(&events, EventKind::Stdout).contains("hello from stdin\n"));
    assert_eq!(events.last().unwrap().exit_code, Some(0));
    Ok(())
}

#[tokio::test]
async fn args_reach_the_script() -> Result<()> {
    let engine = Engine::new(test_config());
    let mut req = request("echo \"$1\"");
    req.args = vec!["world".to_string()];
    let (_run_id, mut rx, _token) = submit_and_subscribe(&engine, req);

    let events = collect_until_finished(&mut rx).await;
    assert!(concat_stream(&events, EventKind::Stdout).contains("world\n"));
    Ok(())
}

#[tokio::test]
async fn run_ids_are_distinct_and_time_sorted() -> Result<()> {
    let engine = Engine::new(test_config());
    let ids: Vec<String> = (0..10)
        .map(|_| engine.submit(request("exit 0")).unwrap().run_id)
        .collect();

    let mut sorted = ids.clone();
    sorted.sort();
    sorted.dedup();
    assert_eq!(sorted, ids);
    Ok(())
}

#[tokio::test]
async fn two_subscribers_see_the_same_event_order() -> Result<()> {
    let engine = Engine::new(test_config());
    let resp = engine.submit(request("echo one; echo two; echo three"))?;
    let entry = engine.get(&resp.run_id).unwrap();
    let token = CancellationToken::new();
    let mut a = entry.subscribe(token.clone());
    let mut b = entry.subscribe(token.clone());

    let events_a = collect_until_finished(&mut a).await;
    let events_b = collect_until_finished(&mut b).await;

    // Neither subscriber fell behind here, so both sequences are the
    // same total order published by the supervisor.
    assert_eq!(kinds(&events_a), kinds(&events_b));
    assert_eq!(
        concat_stream(&events_a, EventKind::Stdout),
        concat_stream(&events_b, EventKind::Stdout)
    );
    Ok(())
}

#[tokio::test]
async fn unreachable_container_runtime_fails_prep_without_starting() -> Result<()> {
    let mut config = test_config();
    config.sandbox = SandboxMode::Docker;
    config.docker_bin = "kiln-test-no-such-runtime".to_string();
    let engine = Engine::new(config);

    let (run_id, mut rx, _token) = submit_and_subscribe(&engine, request("print('hi')"));
    let events = collect_until_finished(&mut rx).await;
    let kind_seq = kinds(&events);

    assert_eq!(
        kind_seq,
        vec![EventKind::Phase, EventKind::Error, EventKind::Finished]
    );
    assert_eq!(events[0].phase, Some(kiln::RunPhase::Preparing));
    assert_eq!(events[1].code, Some(kiln::ErrorCode::Docker));
    assert_eq!(events[2].exit_code, Some(-1));

    let snap = engine.get(&run_id).unwrap().snapshot();
    assert_eq!(snap.status, RunStatus::Failed);
    assert!(snap.started_at.is_none());
    assert!(snap.finished_at.is_some());

    // A retry inside the backoff window gets the cached error without a
    // second probe of the runtime.
    let (_, mut rx2, _token2) = submit_and_subscribe(&engine, request("print('hi')"));
    let events2 = collect_until_finished(&mut rx2).await;
    let second_error = events2
        .iter()
        .find(|e| e.kind == EventKind::Error)
        .expect("cached docker error");
    assert_eq!(second_error.message, events[1].message);
    Ok(())
}

#[tokio::test]
async fn spawn_failure_is_an_internal_error() -> Result<()> {
    let mut config = test_config();
    config.python_bin = "kiln-test-no-such-interpreter".to_string();
    let engine = Engine::new(config);
    let (run_id, mut rx, _token) = submit_and_subscribe(&engine, request("echo hi"));

    let events = collect_until_finished(&mut rx).await;
    let kind_seq = kinds(&events);
    assert!(!kind_seq.contains(&EventKind::Started));
    assert_eq!(kind_seq, vec![EventKind::Error, EventKind::Finished]);
    assert_eq!(events[0].code, Some(kiln::ErrorCode::Internal));

    let snap = engine.get(&run_id).unwrap().snapshot();
    assert_eq!(snap.status, RunStatus::Failed);
    assert_eq!(snap.exit_code, Some(-1));
    assert!(snap.started_at.is_none());
    assert!(snap.finished_at.is_some());
    Ok(())
}
