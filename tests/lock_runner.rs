use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use consul_tools::config::LockConfig;
use consul_tools::kv::memory::{Call, MemoryStore, Operation};
use consul_tools::kv::{KvStore, QueryOptions};
use consul_tools::lock::{CommandSpec, ForwardedSignal, LockRunner};
use tempfile::tempdir;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Instant};

const KEY: &str = "svc/leader";

fn fast_config() -> LockConfig {
    LockConfig {
        session_ttl: Duration::from_secs(2),
        renew_interval: Duration::from_millis(200),
        watch_wait: Duration::from_millis(500),
        contention_delay: Duration::from_millis(100),
        kill_grace: Duration::from_millis(300),
        restart_delay: Duration::from_millis(50),
    }
}

fn sh(script: &str) -> CommandSpec {
    CommandSpec::new("sh", ["-c", script])
}

fn start(
    store: &Arc<MemoryStore>,
    command: CommandSpec,
) -> (mpsc::UnboundedSender<ForwardedSignal>, JoinHandle<i32>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let runner = LockRunner::new(Arc::clone(store), KEY, command, fast_config()).with_signals(rx);
    (tx, tokio::spawn(runner.run()))
}

async fn finish(handle: JoinHandle<i32>) -> i32 {
    timeout(Duration::from_secs(10), handle)
        .await
        .expect("runner finished in time")
        .expect("runner task")
}

async fn holder(store: &MemoryStore) -> Option<String> {
    store
        .get(KEY, QueryOptions::default())
        .await
        .expect("read lock key")
        .value
        .and_then(|entry| entry.session)
}

fn lines(path: &Path) -> Vec<String> {
    std::fs::read_to_string(path)
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

async fn wait_for_lines(path: &Path, count: usize) -> Vec<String> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let current = lines(path);
        if current.len() >= count || Instant::now() >= deadline {
            return current;
        }
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn child_exit_code_is_propagated_and_lock_released() {
    let store = Arc::new(MemoryStore::new("dc1"));
    let (_signals, handle) = start(&store, sh("exit 7"));

    assert_eq!(finish(handle).await, 7);
    assert_eq!(holder(&store).await, None);
    assert!(store.live_sessions().expect("sessions").is_empty());
}

#[tokio::test]
async fn missing_program_exits_127_and_releases() {
    let store = Arc::new(MemoryStore::new("dc1"));
    let command = CommandSpec::new("/nonexistent/consul-tools-child", Vec::<String>::new());
    let (_signals, handle) = start(&store, command);

    assert_eq!(finish(handle).await, 127);
    assert_eq!(holder(&store).await, None);
    assert!(store.live_sessions().expect("sessions").is_empty());
}

#[tokio::test]
async fn only_one_contender_runs_at_a_time() {
    let dir = tempdir().expect("tempdir");
    let runs = dir.path().join("runs");
    let store = Arc::new(MemoryStore::new("dc1"));
    let script = |name: &str| sh(&format!("echo {name} >> '{}'; exec sleep 30", runs.display()));

    let (signals_a, handle_a) = start(&store, script("a"));
    let (signals_b, handle_b) = start(&store, script("b"));

    let first = wait_for_lines(&runs, 1).await;
    sleep(Duration::from_millis(500)).await;
    assert_eq!(lines(&runs), first, "second contender started while the lock was held");
    assert_eq!(first.len(), 1);

    let (winner_signals, winner, loser_signals, loser, loser_name) = if first[0] == "a" {
        (signals_a, handle_a, signals_b, handle_b, "b")
    } else {
        (signals_b, handle_b, signals_a, handle_a, "a")
    };

    winner_signals
        .send(ForwardedSignal::Terminate)
        .expect("signal winner");
    assert_eq!(finish(winner).await, 143);

    let both = wait_for_lines(&runs, 2).await;
    assert_eq!(both.len(), 2);
    assert_eq!(both[1], loser_name);

    loser_signals
        .send(ForwardedSignal::Terminate)
        .expect("signal loser");
    assert_eq!(finish(loser).await, 143);
    assert_eq!(holder(&store).await, None);
}

#[tokio::test]
async fn lost_lock_terminates_child() {
    let store = Arc::new(MemoryStore::new("dc1"));
    let (_signals, handle) = start(&store, sh("exec sleep 30"));

    let deadline = Instant::now() + Duration::from_secs(5);
    let session = loop {
        if let Some(session) = holder(&store).await {
            break session;
        }
        assert!(Instant::now() < deadline, "lock never acquired");
        sleep(Duration::from_millis(20)).await;
    };
    // Let the child start and the loss-watch block.
    sleep(Duration::from_millis(200)).await;
    store.destroy_session(&session).await.expect("destroy");

    assert_eq!(finish(handle).await, 143);
}

#[tokio::test]
async fn stubborn_child_is_killed_after_grace() {
    let dir = tempdir().expect("tempdir");
    let ready = dir.path().join("ready");
    let store = Arc::new(MemoryStore::new("dc1"));
    let script = format!(
        "trap '' TERM; echo up > '{}'; while :; do sleep 0.1; done",
        ready.display()
    );
    let (signals, handle) = start(&store, sh(&script));

    assert_eq!(wait_for_lines(&ready, 1).await.len(), 1);
    signals.send(ForwardedSignal::Terminate).expect("first signal");
    signals.send(ForwardedSignal::Terminate).expect("second signal");

    let started = Instant::now();
    assert_eq!(finish(handle).await, 137);
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert_eq!(holder(&store).await, None);
}

#[tokio::test]
async fn renewal_failure_restarts_with_new_session() {
    let dir = tempdir().expect("tempdir");
    let runs = dir.path().join("runs");
    let store = Arc::new(MemoryStore::new("dc1"));
    store.fail_next(Operation::RenewSession, 1);
    let script = format!("echo run >> '{}'; exec sleep 30", runs.display());
    let (signals, handle) = start(&store, sh(&script));

    assert_eq!(wait_for_lines(&runs, 2).await.len(), 2);

    let sessions: Vec<String> = store
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            Call::CreateSession { id, .. } => id,
            _ => None,
        })
        .collect();
    assert!(sessions.len() >= 2);
    assert_ne!(sessions[0], sessions[1]);
    assert!(store
        .calls()
        .contains(&Call::DestroySession { id: sessions[0].clone() }));

    signals.send(ForwardedSignal::Terminate).expect("signal");
    assert_eq!(finish(handle).await, 143);
}
