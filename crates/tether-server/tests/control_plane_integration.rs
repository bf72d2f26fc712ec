#![allow(clippy::unwrap_used)] // Integration tests use unwrap for brevity

//! Integration tests for the control plane over real TCP connections.
//!
//! Each test starts the agent listener on an ephemeral port and drives it
//! with a scripted agent speaking the NDJSON protocol.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::TcpListener;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tether_core::protocol::{
    AgentMessage, FileChunk, ScriptInputType, ScriptResultReport, ServerMessage, Shell,
    decode_server_line, encode_line,
};
use tether_server::auth::JwtTokenIssuer;
use tether_server::dispatch::{AdHocCommand, FanOutRequest, FanOutStatus};
use tether_server::hub::{self, HubError};
use tether_server::schedule::{CreateSchedule, RepeatInterval};
use tether_server::storage::{Database, NewSavedScript, SavedScriptUpdate, ScriptRunFilter};
use tether_server::{ControlPlane, ControlPlaneOptions, ServiceError};

struct Harness {
    plane: ControlPlane,
    addr: std::net::SocketAddr,
    shutdown: CancellationToken,
    server: JoinHandle<Result<(), HubError>>,
    dir: tempfile::TempDir,
}

async fn start() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_in_memory().await.unwrap();
    let plane = ControlPlane::new(
        db,
        Arc::new(JwtTokenIssuer::new(b"integration-secret")),
        ControlPlaneOptions {
            command_timeout: Duration::from_secs(5),
            token_ttl_secs: 1800,
            transfer_dir: dir.path().join("shared"),
            chunk_size: 4,
            outbound_queue_depth: 64,
        },
    );

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let shutdown = CancellationToken::new();
    let server = tokio::spawn(hub::serve(listener, plane.hub(), shutdown.clone()));

    Harness {
        plane,
        addr,
        shutdown,
        server,
        dir,
    }
}

struct TestAgent {
    device_id: String,
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl TestAgent {
    async fn connect(h: &Harness, device_id: &str, org: &str) -> Self {
        let stream = tokio::net::TcpStream::connect(h.addr).await.unwrap();
        let (read_half, writer) = stream.into_split();
        let mut agent = Self {
            device_id: device_id.to_string(),
            lines: BufReader::new(read_half).lines(),
            writer,
        };
        agent
            .send(&AgentMessage::Hello {
                device_id: device_id.into(),
                organization_id: org.into(),
                device_name: format!("{device_id}.lab"),
                alias: None,
            })
            .await;

        tokio::time::timeout(Duration::from_secs(2), async {
            while !h.plane.registry().is_online(device_id).await {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        agent
    }

    async fn send(&mut self, message: &AgentMessage) {
        let mut line = encode_line(message).unwrap();
        line.push('\n');
        self.writer.write_all(line.as_bytes()).await.unwrap();
    }

    async fn recv(&mut self) -> ServerMessage {
        let line = tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        decode_server_line(&line).unwrap()
    }

    fn report(&self, input: &str, had_errors: bool) -> ScriptResultReport {
        ScriptResultReport {
            device_id: self.device_id.clone(),
            shell: Shell::Bash,
            script_input: input.into(),
            standard_output: vec![format!("{} ok", self.device_id)],
            error_output: Vec::new(),
            had_errors,
            run_time_ms: 5,
            sender_user_name: None,
        }
    }

    /// Answer the next `run_script` frame and return its run id.
    async fn answer_run(&mut self, had_errors: bool) -> i64 {
        let ServerMessage::RunScript {
            script_run_id,
            auth_token,
            content,
            ..
        } = self.recv().await
        else {
            panic!("expected run_script");
        };
        let result = self.report(&content, had_errors);
        self.send(&AgentMessage::ScriptRunResult {
            auth_token,
            script_run_id,
            result,
        })
        .await;
        script_run_id
    }
}

fn saved_script<'a>(id: &'a str, name: &'a str) -> NewSavedScript<'a> {
    NewSavedScript {
        id,
        organization_id: "org",
        name,
        content: "df -h",
        shell: Shell::Bash,
        folder_path: Some("disk"),
        creator_id: "alice",
        is_public: true,
        is_quick_script: false,
        generate_alert_on_error: false,
        send_email_on_error: false,
        send_error_email_to: None,
    }
}

async fn wait_for_counts(plane: &ControlPlane, run_id: i64, total: i64) {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let detail = plane.get_script_run(run_id, "org").await.unwrap();
            if detail.summary.success_count + detail.summary.failure_count >= total {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

// =========================================================================
// Dispatch over the wire
// =========================================================================

#[tokio::test]
async fn ad_hoc_command_round_trip_over_tcp() {
    let h = start().await;
    let mut agent = TestAgent::connect(&h, "pc-1", "org").await;

    let plane = h.plane.clone();
    let caller = tokio::spawn(async move {
        plane
            .run_ad_hoc_command(&AdHocCommand {
                organization_id: "org",
                device_id: "pc-1",
                shell: Shell::Bash,
                command: "uname -a",
                sender: "alice",
                input_type: ScriptInputType::OneTimeScript,
            })
            .await
    });

    let ServerMessage::ExecuteCommand {
        auth_token,
        request_id,
        command,
        sender,
        input_type,
        ..
    } = agent.recv().await
    else {
        panic!("expected execute_command");
    };
    assert_eq!(command, "uname -a");
    assert_eq!(sender, "alice");
    let result = agent.report(&command, false);
    agent
        .send(&AgentMessage::CommandResult {
            auth_token,
            request_id,
            input_type,
            result,
        })
        .await;

    let result = caller.await.unwrap().unwrap();
    assert_eq!(result.device_id, "pc-1");
    assert_eq!(result.script_input, "uname -a");
    assert!(h.plane.dispatcher().correlations().is_empty().await);
}

#[tokio::test]
async fn empty_command_is_rejected_before_dispatch() {
    let h = start().await;
    let _agent = TestAgent::connect(&h, "pc-1", "org").await;
    let err = h
        .plane
        .run_ad_hoc_command(&AdHocCommand {
            organization_id: "org",
            device_id: "pc-1",
            shell: Shell::Bash,
            command: "   ",
            sender: "alice",
            input_type: ScriptInputType::OneTimeScript,
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));
}

#[tokio::test]
async fn fan_out_collects_results_into_run_history() {
    let h = start().await;
    h.plane
        .create_saved_script(&saved_script("s1", "disk usage"))
        .await
        .unwrap();
    let mut a = TestAgent::connect(&h, "pc-1", "org").await;
    let mut b = TestAgent::connect(&h, "pc-2", "org").await;
    let _foreign = TestAgent::connect(&h, "pc-9", "elsewhere").await;

    let targets: Vec<String> = ["pc-1", "pc-2", "pc-9", "pc-404"]
        .iter()
        .map(|s| (*s).to_string())
        .collect();
    let outcome = h
        .plane
        .run_saved_script(&FanOutRequest {
            organization_id: "org",
            saved_script_id: "s1",
            device_ids: &targets,
            initiator: "alice",
            input_type: ScriptInputType::Api,
            run_on_next_connect: false,
        })
        .await
        .unwrap();
    assert_eq!(outcome.status, FanOutStatus::Queued);
    assert_eq!(outcome.device_count, 2);
    let run_id = outcome.run_id.unwrap();

    assert_eq!(a.answer_run(false).await, run_id);
    assert_eq!(b.answer_run(true).await, run_id);
    wait_for_counts(&h.plane, run_id, 2).await;

    let detail = h.plane.get_script_run(run_id, "org").await.unwrap();
    assert_eq!(detail.summary.device_count, 2);
    assert_eq!(detail.summary.success_count, 1);
    assert_eq!(detail.summary.failure_count, 1);
    assert_eq!(detail.summary.saved_script_name.as_deref(), Some("disk usage"));
    assert_eq!(detail.results.len(), 2);

    let history = h
        .plane
        .list_script_runs(
            "org",
            ScriptRunFilter {
                device_id: Some("pc-2".into()),
                ..ScriptRunFilter::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(history.total_count, 1);
}

#[tokio::test]
async fn disconnected_agent_is_no_longer_a_target() {
    let h = start().await;
    h.plane
        .create_saved_script(&saved_script("s1", "disk usage"))
        .await
        .unwrap();
    let agent = TestAgent::connect(&h, "pc-1", "org").await;
    drop(agent);

    tokio::time::timeout(Duration::from_secs(2), async {
        while h.plane.registry().is_online("pc-1").await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();

    let devices = h.plane.list_devices("org").await.unwrap();
    assert_eq!(devices.len(), 1);
    assert!(!devices[0].online);

    let outcome = h
        .plane
        .run_saved_script(&FanOutRequest {
            organization_id: "org",
            saved_script_id: "s1",
            device_ids: &["pc-1".to_string()],
            initiator: "alice",
            input_type: ScriptInputType::Api,
            run_on_next_connect: false,
        })
        .await
        .unwrap();
    assert_eq!(outcome.status, FanOutStatus::NoDevicesAvailable);
    assert!(outcome.run_id.is_none());
}

// =========================================================================
// Schedules
// =========================================================================

#[tokio::test]
async fn due_schedule_reaches_online_and_deferred_devices() {
    let h = start().await;
    h.plane
        .create_saved_script(&saved_script("s1", "disk usage"))
        .await
        .unwrap();
    let mut online = TestAgent::connect(&h, "pc-1", "org").await;
    // Known but offline.
    h.plane
        .database()
        .upsert_device("pc-2", "org", "pc-2.lab", None)
        .await
        .unwrap();

    let created_at = Utc.with_ymd_and_hms(2025, 6, 1, 0, 0, 0).unwrap();
    let targets = vec!["pc-1".to_string(), "pc-2".to_string()];
    let schedule = h
        .plane
        .create_schedule(
            &CreateSchedule {
                organization_id: "org",
                name: "hourly disk check",
                saved_script_id: "s1",
                creator_id: "alice",
                start_at: created_at,
                interval: RepeatInterval::Hourly,
                run_on_next_connect: true,
                device_ids: &targets,
                group_ids: &[],
            },
            created_at,
        )
        .await
        .unwrap();
    assert_eq!(
        schedule.schedule.next_run,
        Utc.with_ymd_and_hms(2025, 6, 1, 1, 0, 0).unwrap().timestamp()
    );

    let now = Utc.with_ymd_and_hms(2025, 6, 1, 1, 30, 0).unwrap();
    assert_eq!(h.plane.list_due_schedules(now).await.unwrap().len(), 1);
    let firings = h.plane.run_due_schedules(now).await.unwrap();
    let outcome = firings[0].outcome.clone().unwrap();
    assert_eq!(outcome.device_count, 1);
    assert_eq!(outcome.deferred_count, 1);
    assert_eq!(
        firings[0].next_run,
        Utc.with_ymd_and_hms(2025, 6, 1, 2, 0, 0).unwrap()
    );

    let run_id = online.answer_run(false).await;
    assert_eq!(Some(run_id), outcome.run_id);

    // The offline device gets the run as soon as it connects.
    let mut late = TestAgent::connect(&h, "pc-2", "org").await;
    assert_eq!(late.answer_run(false).await, run_id);
    wait_for_counts(&h.plane, run_id, 2).await;

    let detail = h.plane.get_script_run(run_id, "org").await.unwrap();
    assert_eq!(detail.summary.device_count, 2);
    assert_eq!(detail.summary.input_type, "ScheduledScript");
}

// =========================================================================
// Saved script management
// =========================================================================

#[tokio::test]
async fn saved_script_limits_and_history_retention() {
    let h = start().await;
    let long_name = "n".repeat(101);
    let err = h
        .plane
        .create_saved_script(&saved_script("s0", &long_name))
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    h.plane
        .create_saved_script(&saved_script("s1", "disk usage"))
        .await
        .unwrap();
    let err = h
        .plane
        .update_saved_script(
            "s1",
            "org",
            SavedScriptUpdate {
                folder_path: Some(Some("f".repeat(201))),
                ..SavedScriptUpdate::default()
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::Validation(_)));

    let mut agent = TestAgent::connect(&h, "pc-1", "org").await;
    let outcome = h
        .plane
        .run_saved_script(&FanOutRequest {
            organization_id: "org",
            saved_script_id: "s1",
            device_ids: &["pc-1".to_string()],
            initiator: "alice",
            input_type: ScriptInputType::Api,
            run_on_next_connect: false,
        })
        .await
        .unwrap();
    let run_id = agent.answer_run(false).await;
    assert_eq!(Some(run_id), outcome.run_id);
    wait_for_counts(&h.plane, run_id, 1).await;

    h.plane.delete_saved_script("s1", "org").await.unwrap();
    assert!(matches!(
        h.plane.delete_saved_script("s1", "org").await,
        Err(ServiceError::NotFound(_))
    ));
    let detail = h.plane.get_script_run(run_id, "org").await.unwrap();
    assert!(detail.summary.saved_script_id.is_none());
    assert_eq!(detail.results.len(), 1);

    assert_eq!(h.plane.clear_script_runs("org").await.unwrap(), 1);
}

// =========================================================================
// File transfer
// =========================================================================

#[tokio::test]
async fn file_sent_to_agent_and_echoed_back_is_identical() {
    let h = start().await;
    let mut agent = TestAgent::connect(&h, "pc-1", "org").await;
    let mut completions = h.plane.receiver().subscribe();

    let source = h.dir.path().join("payload.txt");
    tokio::fs::write(&source, b"the quick brown fox").await.unwrap();

    let plane = h.plane.clone();
    let path = source.clone();
    let sending = tokio::spawn(async move {
        plane
            .send_file("pc-1", &path, |_| {}, &CancellationToken::new())
            .await
    });

    // Echo every chunk straight back under a new transfer id.
    loop {
        let ServerMessage::FileChunk(chunk) = agent.recv().await else {
            panic!("expected file_chunk");
        };
        let end = chunk.end_of_file;
        agent
            .send(&AgentMessage::FileChunk(FileChunk {
                transfer_id: format!("echo-{}", chunk.transfer_id),
                ..chunk
            }))
            .await;
        if end {
            break;
        }
    }
    sending.await.unwrap().unwrap();

    let done = tokio::time::timeout(Duration::from_secs(2), completions.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.path.file_name().unwrap(), "payload.txt");
    assert_eq!(
        tokio::fs::read(&done.path).await.unwrap(),
        b"the quick brown fox"
    );
}

#[tokio::test]
async fn listener_stops_on_shutdown() {
    let h = start().await;
    h.shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), h.server)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
