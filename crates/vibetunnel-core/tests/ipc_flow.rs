//! IPC-driven flows: clear offsets, concurrent writers, command tracking.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;
use vibetunnel_core::ipc::IpcClient;
use vibetunnel_core::{
    CreateOptions, SessionEvent, SessionManager, SessionStatus, SessionStore,
};

fn manager_in(dir: &TempDir) -> Arc<SessionManager> {
    SessionManager::new(SessionStore::new(dir.path()).unwrap())
}

async fn wait_running(manager: &SessionManager, id: &str) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if manager.get(id).await.unwrap().meta.status == SessionStatus::Running {
            return;
        }
        assert!(Instant::now() < deadline, "session never reached running");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

fn transcript_events(store: &SessionStore, id: &str) -> Vec<serde_json::Value> {
    let raw = std::fs::read_to_string(store.paths(id).transcript).unwrap();
    raw.lines()
        .skip(1)
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn clear_offset_lands_in_metadata() {
    let dir = TempDir::new().unwrap();
    let manager = manager_in(&dir);

    let created = manager
        .create(
            &["/bin/sh".to_string()],
            CreateOptions {
                cols: Some(80),
                rows: Some(24),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    wait_running(&manager, &created.id).await;

    let socket = manager.store().paths(&created.id).socket;
    let mut client = IpcClient::connect(&socket).await.unwrap();
    client.send_stdin("printf 'A'\n").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    client.send_stdin("printf '\\033[3J'\n").await.unwrap();

    // The pruning offset is persisted asynchronously after the write.
    let deadline = Instant::now() + Duration::from_secs(5);
    let offset = loop {
        let meta = manager.store().load(&created.id).await.unwrap();
        if let Some(offset) = meta.last_clear_offset {
            break offset;
        }
        assert!(Instant::now() < deadline, "clear offset never recorded");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    let raw = std::fs::read(manager.store().paths(&created.id).transcript).unwrap();
    assert!((offset as usize) < raw.len());
    let escaped = b"\\u001b[3J";
    assert_eq!(
        &raw[offset as usize - escaped.len()..offset as usize],
        escaped,
        "bytes preceding the offset must contain the sequence"
    );

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn two_ipc_writers_never_interleave_within_a_message() {
    let dir = TempDir::new().unwrap();
    let manager = manager_in(&dir);

    let created = manager
        .create(&["/bin/cat".to_string()], CreateOptions::default())
        .await
        .unwrap();
    wait_running(&manager, &created.id).await;

    let socket = manager.store().paths(&created.id).socket;
    let mut c1 = IpcClient::connect(&socket).await.unwrap();
    let mut c2 = IpcClient::connect(&socket).await.unwrap();

    c1.send_stdin("abc").await.unwrap();
    c2.send_stdin("XYZ").await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    let inputs = loop {
        let inputs: Vec<String> = transcript_events(manager.store(), &created.id)
            .into_iter()
            .filter(|e| e[1] == "i")
            .map(|e| e[2].as_str().unwrap().to_string())
            .collect();
        if inputs.len() >= 2 {
            break inputs;
        }
        assert!(Instant::now() < deadline, "input events never recorded");
        tokio::time::sleep(Duration::from_millis(25)).await;
    };

    // Two distinct entries, order between clients unspecified.
    let mut sorted = inputs.clone();
    sorted.sort();
    assert_eq!(sorted, vec!["XYZ".to_string(), "abc".to_string()], "got {inputs:?}");

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn resize_command_reaches_the_pty() {
    let dir = TempDir::new().unwrap();
    let manager = manager_in(&dir);

    let created = manager
        .create(&["/bin/cat".to_string()], CreateOptions::default())
        .await
        .unwrap();
    wait_running(&manager, &created.id).await;

    manager.resize(&created.id, 123, 45).await.unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let resizes: Vec<String> = transcript_events(manager.store(), &created.id)
            .into_iter()
            .filter(|e| e[1] == "r")
            .map(|e| e[2].as_str().unwrap().to_string())
            .collect();
        if resizes.contains(&"123x45".to_string()) {
            break;
        }
        assert!(Instant::now() < deadline, "resize event never recorded");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    manager.shutdown().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn long_command_reports_finished_short_one_does_not() {
    if !std::path::Path::new("/bin/bash").exists() {
        eprintln!("skipping: no /bin/bash");
        return;
    }

    let dir = TempDir::new().unwrap();
    let manager = manager_in(&dir);
    let mut events = manager.subscribe();

    let created = manager
        .create(
            &["/bin/bash".to_string(), "-i".to_string()],
            CreateOptions {
                cols: Some(80),
                rows: Some(24),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    wait_running(&manager, &created.id).await;
    tokio::time::sleep(Duration::from_secs(1)).await;

    let socket = manager.store().paths(&created.id).socket;
    let mut client = IpcClient::connect(&socket).await.unwrap();
    client.send_stdin("sleep 4\n").await.unwrap();

    let finished = tokio::time::timeout(Duration::from_secs(15), async {
        loop {
            match events.recv().await {
                Ok(SessionEvent::CommandFinished {
                    command,
                    duration_ms,
                    ..
                }) => break (command, duration_ms),
                Ok(_) => continue,
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await
    .expect("no CommandFinished for sleep 4");

    assert!(finished.0.starts_with("sleep"), "command was {:?}", finished.0);
    assert!(finished.1 >= 3500, "duration {}ms too short", finished.1);

    // A short `ls` completes under the floor and stays silent.
    let mut events = manager.subscribe();
    client.send_stdin("ls\n").await.unwrap();
    let extra = tokio::time::timeout(Duration::from_secs(4), async {
        loop {
            if let Ok(SessionEvent::CommandFinished { command, .. }) = events.recv().await {
                break command;
            }
        }
    })
    .await;
    assert!(extra.is_err(), "unexpected CommandFinished: {extra:?}");

    manager.shutdown().await;
}
