//! Tests for the agent connection handler, driven over in-memory pipes.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf};
use tokio::task::JoinHandle;

use tether_core::protocol::{
    AgentMessage, FileChunk, ScriptInputType, ScriptResultReport, ServerMessage, Shell,
    decode_server_line, encode_line,
};

use super::frame::MAX_FRAME_BYTES;
use super::{AgentHub, HubError};
use crate::auth::JwtTokenIssuer;
use crate::dispatch::{AdHocCommand, Dispatcher, FanOutRequest};
use crate::registry::SessionRegistry;
use crate::storage::{Database, NewSavedScript};
use crate::transfer::ChunkReceiver;

struct Fixture {
    db: Database,
    registry: SessionRegistry,
    dispatcher: Dispatcher,
    receiver: Arc<ChunkReceiver>,
    hub: AgentHub,
    _dir: tempfile::TempDir,
}

async fn setup() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let db = Database::open_in_memory().await.unwrap();
    let registry = SessionRegistry::new();
    let dispatcher = Dispatcher::new(
        db.clone(),
        registry.clone(),
        Arc::new(JwtTokenIssuer::new(b"hub-test-secret")),
        Duration::from_secs(5),
        1800,
    );
    let receiver = Arc::new(ChunkReceiver::new(dir.path().join("shared")));
    let hub = AgentHub::new(
        db.clone(),
        registry.clone(),
        dispatcher.clone(),
        Arc::clone(&receiver),
        16,
    );
    Fixture {
        db,
        registry,
        dispatcher,
        receiver,
        hub,
        _dir: dir,
    }
}

struct Agent {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
    task: JoinHandle<Result<(), HubError>>,
}

impl Agent {
    fn connect(hub: &AgentHub) -> Self {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let hub = hub.clone();
        let task = tokio::spawn(async move { hub.handle_connection(server, "test-peer").await });
        let (read_half, writer) = tokio::io::split(client);
        Self {
            lines: BufReader::new(read_half).lines(),
            writer,
            task,
        }
    }

    async fn send(&mut self, message: &AgentMessage) {
        self.send_raw(&encode_line(message).unwrap()).await;
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
    }

    async fn hello(&mut self, device: &str, org: &str) {
        self.send(&AgentMessage::Hello {
            device_id: device.into(),
            organization_id: org.into(),
            device_name: format!("{device}-host"),
            alias: None,
        })
        .await;
    }

    async fn recv(&mut self) -> ServerMessage {
        let line = tokio::time::timeout(Duration::from_secs(2), self.lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        decode_server_line(&line).unwrap()
    }

    async fn close(self) -> Result<(), HubError> {
        drop(self.writer);
        drop(self.lines);
        self.task.await.unwrap()
    }
}

async fn wait_online(registry: &SessionRegistry, device: &str, online: bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while registry.is_online(device).await != online {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

fn report(device: &str) -> ScriptResultReport {
    ScriptResultReport {
        device_id: device.into(),
        shell: Shell::Bash,
        script_input: "hostname".into(),
        standard_output: vec!["lab-01".into()],
        error_output: Vec::new(),
        had_errors: false,
        run_time_ms: 7,
        sender_user_name: None,
    }
}

fn chunk(transfer_id: &str, data: &[u8], start: bool, end: bool) -> AgentMessage {
    AgentMessage::FileChunk(FileChunk {
        transfer_id: transfer_id.into(),
        file_name: "capture.log".into(),
        data: data.to_vec(),
        start_of_file: start,
        end_of_file: end,
    })
}

/// Run one ad-hoc command through `agent` and check the stored result.
async fn assert_command_round_trip(f: &Fixture, agent: &mut Agent, device: &'static str) {
    let dispatcher = f.dispatcher.clone();
    let waiter = tokio::spawn(async move {
        dispatcher
            .run_ad_hoc_command(&AdHocCommand {
                organization_id: "org",
                device_id: device,
                shell: Shell::Bash,
                command: "hostname",
                sender: "alice",
                input_type: ScriptInputType::Api,
            })
            .await
    });

    let ServerMessage::ExecuteCommand {
        auth_token,
        request_id,
        input_type,
        ..
    } = agent.recv().await
    else {
        panic!("expected execute_command");
    };
    agent
        .send(&AgentMessage::CommandResult {
            auth_token,
            request_id,
            input_type,
            result: report(device),
        })
        .await;

    let result = waiter.await.unwrap().unwrap();
    assert_eq!(result.device_id, device);
    assert_eq!(result.input_type, "Api");
    assert_eq!(result.standard_output_lines(), vec!["lab-01".to_string()]);
}

async fn wait_active(f: &Fixture, transfer_id: &str) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !f.receiver.is_active(transfer_id).await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn hello_registers_and_disconnect_unregisters() {
    let f = setup().await;
    let mut agent = Agent::connect(&f.hub);
    agent.hello("d1", "org").await;
    wait_online(&f.registry, "d1", true).await;

    let device = f.db.get_device("d1").await.unwrap();
    assert_eq!(device.organization_id, "org");
    assert_eq!(device.device_name, "d1-host");

    agent.close().await.unwrap();
    assert!(!f.registry.is_online("d1").await);
}

#[tokio::test]
async fn first_frame_must_be_hello() {
    let f = setup().await;
    let mut agent = Agent::connect(&f.hub);
    agent.send(&AgentMessage::Heartbeat).await;

    let err = agent.task.await.unwrap().unwrap_err();
    assert!(matches!(err, HubError::Handshake(_)));
    assert_eq!(f.registry.count().await, 0);
}

#[tokio::test]
async fn malformed_frames_do_not_end_the_session() {
    let f = setup().await;
    let mut agent = Agent::connect(&f.hub);
    agent.hello("d1", "org").await;
    wait_online(&f.registry, "d1", true).await;

    agent.send_raw("{ this is not json").await;
    agent.send_raw(r#"{"type":"reboot"}"#).await;
    agent.send(&AgentMessage::Heartbeat).await;

    // Still reachable: a command makes the full trip.
    assert_command_round_trip(&f, &mut agent, "d1").await;
}

#[tokio::test]
async fn unreadable_lines_do_not_end_the_session() {
    let f = setup().await;
    let mut agent = Agent::connect(&f.hub);
    agent.hello("d1", "org").await;
    wait_online(&f.registry, "d1", true).await;

    agent.writer.write_all(b"\xff\xfe garbage\n").await.unwrap();
    agent.send_raw(&"x".repeat(MAX_FRAME_BYTES + 10)).await;
    agent.send(&AgentMessage::Heartbeat).await;

    assert_command_round_trip(&f, &mut agent, "d1").await;
    assert!(f.registry.is_online("d1").await);
}

#[tokio::test]
async fn unreadable_hello_is_a_handshake_error() {
    let f = setup().await;
    let mut agent = Agent::connect(&f.hub);
    agent.writer.write_all(b"\xc3\x28\n").await.unwrap();

    let err = agent.task.await.unwrap().unwrap_err();
    assert!(matches!(err, HubError::Handshake(_)));
    assert_eq!(f.registry.count().await, 0);
}

#[tokio::test]
async fn deferred_runs_are_pushed_on_connect() {
    let f = setup().await;
    f.db.upsert_device("d1", "org", "d1-host", None).await.unwrap();
    f.db.create_saved_script(&NewSavedScript {
        id: "s1",
        organization_id: "org",
        name: "patch",
        content: "apt-get upgrade -y",
        shell: Shell::Bash,
        folder_path: None,
        creator_id: "alice",
        is_public: true,
        is_quick_script: false,
        generate_alert_on_error: false,
        send_email_on_error: false,
        send_error_email_to: None,
    })
    .await
    .unwrap();

    let targets = vec!["d1".to_string()];
    let outcome = f
        .dispatcher
        .run_saved_script(&FanOutRequest {
            organization_id: "org",
            saved_script_id: "s1",
            device_ids: &targets,
            initiator: "alice",
            input_type: ScriptInputType::OneTimeScript,
            run_on_next_connect: true,
        })
        .await
        .unwrap();
    let run_id = outcome.run_id.unwrap();
    assert_eq!(outcome.deferred_count, 1);

    let mut agent = Agent::connect(&f.hub);
    agent.hello("d1", "org").await;
    let ServerMessage::RunScript {
        script_run_id,
        auth_token,
        ..
    } = agent.recv().await
    else {
        panic!("expected run_script");
    };
    assert_eq!(script_run_id, run_id);

    agent
        .send(&AgentMessage::ScriptRunResult {
            auth_token,
            script_run_id,
            result: report("d1"),
        })
        .await;
    tokio::time::timeout(Duration::from_secs(2), async {
        while f.db.get_script_run(run_id, "org").await.unwrap().success_count == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    // Frames are read only after the replay finished.
    assert!(f.db.deferred_runs_for_device("d1").await.unwrap().is_empty());
    assert_eq!(f.db.run_device_ids(run_id).await.unwrap(), targets);
}

#[tokio::test]
async fn results_naming_another_device_are_dropped() {
    let f = setup().await;
    let mut agent = Agent::connect(&f.hub);
    agent.hello("d1", "org").await;
    wait_online(&f.registry, "d1", true).await;

    let dispatcher = f.dispatcher.clone();
    let waiter = tokio::spawn(async move {
        dispatcher
            .run_ad_hoc_command(&AdHocCommand {
                organization_id: "org",
                device_id: "d1",
                shell: Shell::Bash,
                command: "hostname",
                sender: "alice",
                input_type: ScriptInputType::OneTimeScript,
            })
            .await
    });
    let ServerMessage::ExecuteCommand {
        auth_token,
        request_id,
        ..
    } = agent.recv().await
    else {
        panic!("expected execute_command");
    };

    agent
        .send(&AgentMessage::CommandResult {
            auth_token: auth_token.clone(),
            request_id: request_id.clone(),
            input_type: ScriptInputType::OneTimeScript,
            result: report("d2"),
        })
        .await;
    agent
        .send(&AgentMessage::CommandResult {
            auth_token,
            request_id,
            input_type: ScriptInputType::OneTimeScript,
            result: report("d1"),
        })
        .await;

    let result = waiter.await.unwrap().unwrap();
    assert_eq!(result.device_id, "d1");
}

#[tokio::test]
async fn inbound_file_chunks_are_reassembled() {
    let f = setup().await;
    let mut events = f.receiver.subscribe();

    let mut agent = Agent::connect(&f.hub);
    agent.hello("d1", "org").await;
    for (data, start, end) in [(&b"abc"[..], true, false), (&b"def"[..], false, true)] {
        agent
            .send(&AgentMessage::FileChunk(FileChunk {
                transfer_id: "t1".into(),
                file_name: "capture.log".into(),
                data: data.to_vec(),
                start_of_file: start,
                end_of_file: end,
            }))
            .await;
    }

    let done = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.transfer_id, "t1");
    assert_eq!(done.path, f.receiver.base_dir().join("capture.log"));
    assert_eq!(tokio::fs::read(&done.path).await.unwrap(), b"abcdef");
    agent.close().await.unwrap();
}

#[tokio::test]
async fn another_agent_cannot_write_into_a_transfer() {
    let f = setup().await;
    let mut events = f.receiver.subscribe();

    let mut owner = Agent::connect(&f.hub);
    owner.hello("d1", "org").await;
    owner.send(&chunk("t1", b"AAA", true, false)).await;
    wait_active(&f, "t1").await;

    let mut intruder = Agent::connect(&f.hub);
    intruder.hello("d2", "org-b").await;
    intruder.send(&chunk("t1", b"EVIL", false, true)).await;
    intruder.close().await.unwrap();

    // The intruder's frames and its disconnect left t1 alone.
    assert!(f.receiver.is_active("t1").await);
    assert!(events.try_recv().is_err());

    owner.send(&chunk("t1", b"BBB", false, true)).await;
    let done = tokio::time::timeout(Duration::from_secs(2), events.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(done.bytes, 6);
    assert_eq!(tokio::fs::read(&done.path).await.unwrap(), b"AAABBB");
    owner.close().await.unwrap();
}

#[tokio::test]
async fn disconnect_abandons_open_transfers() {
    let f = setup().await;
    let mut agent = Agent::connect(&f.hub);
    agent.hello("d1", "org").await;
    agent.send(&chunk("t1", b"partial", true, false)).await;
    wait_active(&f, "t1").await;

    agent.close().await.unwrap();

    assert_eq!(f.receiver.active_count().await, 0);
    let partial = f.receiver.base_dir().join("capture.log");
    assert_eq!(tokio::fs::read(&partial).await.unwrap(), b"partial");
}
