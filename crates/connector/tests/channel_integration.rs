//! Channel engine tests against a scripted robot.
//!
//! The transport hands every outbound frame to a robot task which answers
//! through the engine's inbound handlers, so the whole exchange runs
//! asynchronously the way it does over a real data channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use connector::channel::{ChannelEngine, ChannelTransport, EngineConfig};
use protocol::crypto::validation_response;
use protocol::error::ChannelError;
use protocol::framing::{encode_frame, Calibration, DecompressError, FrameDecoder, VoxelMesh};
use protocol::messages::{ChannelMessage, MessageType, VALIDATION_OK};
use protocol::validation::ValidationState;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;

const CHALLENGE: &str = "d2a1c5f0";
const WAIT: Duration = Duration::from_secs(5);
const IDLE: Duration = Duration::from_millis(20);

struct PipeTransport {
    open: AtomicBool,
    outbound: mpsc::UnboundedSender<String>,
}

impl ChannelTransport for PipeTransport {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send_text(&self, text: String) -> Result<(), ChannelError> {
        self.outbound.send(text).map_err(|_| ChannelError::NotOpen)
    }
}

/// What the scripted robot saw.
#[derive(Debug, Default)]
struct RobotLog {
    heartbeats: Vec<Value>,
    requests: Vec<ChannelMessage>,
    others: Vec<ChannelMessage>,
}

/// Plays the robot side: challenges once, confirms a correct answer and
/// replies to every request with its own identity.
fn spawn_robot(
    engine: ChannelEngine,
    mut outbound: mpsc::UnboundedReceiver<String>,
    confirm: bool,
) -> tokio::task::JoinHandle<RobotLog> {
    engine.handle_text(&frame("validation", "", json!(CHALLENGE)));

    tokio::spawn(async move {
        let mut log = RobotLog::default();
        loop {
            // Exits once the engine is closed and the pipe has drained.
            let text = match timeout(IDLE, outbound.recv()).await {
                Ok(Some(text)) => text,
                Ok(None) => break,
                Err(_) if engine.is_closed() => break,
                Err(_) => continue,
            };
            let message = ChannelMessage::from_json(&text).unwrap();
            match message.message_type {
                MessageType::Validation => {
                    let expected = validation_response(CHALLENGE);
                    if confirm && message.data_str() == Some(expected.as_str()) {
                        engine.handle_text(&frame("validation", "", json!(VALIDATION_OK)));
                    }
                }
                MessageType::Request => {
                    let identity = message.data["header"]["identity"].clone();
                    engine.handle_text(&frame(
                        "res",
                        &message.topic,
                        json!({"header": {"identity": identity, "status": {"code": 0}}, "data": "ok"}),
                    ));
                    log.requests.push(message);
                }
                MessageType::Heartbeat => log.heartbeats.push(message.data),
                _ => log.others.push(message),
            }
        }
        log
    })
}

fn frame(ty: &str, topic: &str, data: Value) -> String {
    json!({"type": ty, "topic": topic, "data": data}).to_string()
}

fn setup(config: EngineConfig) -> (ChannelEngine, Arc<PipeTransport>, mpsc::UnboundedReceiver<String>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let transport = Arc::new(PipeTransport {
        open: AtomicBool::new(true),
        outbound: tx,
    });
    let engine = ChannelEngine::with_config(transport.clone(), FrameDecoder::default(), config);
    (engine, transport, rx)
}

fn quick_heartbeat() -> EngineConfig {
    EngineConfig {
        heartbeat_interval: Duration::from_millis(50),
    }
}

#[tokio::test]
async fn test_validation_against_robot() {
    let (engine, _transport, rx) = setup(EngineConfig::default());
    let robot = spawn_robot(engine.clone(), rx, true);

    timeout(WAIT, engine.wait_validated()).await.unwrap().unwrap();
    assert_eq!(engine.validation_state(), ValidationState::Validated);

    engine.close();
    drop(engine);
    let log = timeout(WAIT, robot).await.unwrap().unwrap();
    assert!(log.requests.is_empty());
}

#[tokio::test]
async fn test_unconfirmed_answer_keeps_waiting() {
    let (engine, _transport, rx) = setup(EngineConfig::default());
    let _robot = spawn_robot(engine.clone(), rx, false);

    // The robot receives the answer but never confirms it.
    let result = timeout(Duration::from_millis(300), engine.wait_validated()).await;
    assert!(result.is_err());
    assert_eq!(engine.validation_state(), ValidationState::Challenged);

    engine.close();
}

#[tokio::test]
async fn test_close_interrupts_validation_wait() {
    let (engine, _transport, _rx) = setup(EngineConfig::default());

    let waiter = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.wait_validated().await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    engine.close();

    let result = timeout(WAIT, waiter).await.unwrap().unwrap();
    assert_eq!(result, Err(ChannelError::Closed));
}

#[tokio::test]
async fn test_concurrent_requests_resolve_independently() {
    let (engine, _transport, rx) = setup(EngineConfig::default());
    let _robot = spawn_robot(engine.clone(), rx, true);
    timeout(WAIT, engine.wait_validated()).await.unwrap().unwrap();

    let mut futures = Vec::new();
    for api_id in [1001u32, 1002, 1008, 1016] {
        futures.push((
            api_id,
            engine
                .request("rt/api/sport/request", api_id, Some(&json!({"x": 0.1})))
                .unwrap(),
        ));
    }

    for (api_id, future) in futures {
        let id = future.key().id.clone();
        let reply = timeout(WAIT, future).await.unwrap().unwrap();
        assert_eq!(reply.message_type, MessageType::Response);
        assert_eq!(reply.topic, "rt/api/sport/request");
        assert_eq!(reply.data["header"]["identity"]["api_id"], json!(api_id));
        assert_eq!(reply.correlation_id(), id);
    }
    assert_eq!(engine.pending_count(), 0);

    engine.close();
}

#[tokio::test]
async fn test_heartbeats_flow_after_open() {
    let (engine, _transport, rx) = setup(quick_heartbeat());
    let robot = spawn_robot(engine.clone(), rx, true);
    timeout(WAIT, engine.wait_validated()).await.unwrap().unwrap();

    engine.handle_open();
    engine.handle_open();
    tokio::time::sleep(Duration::from_millis(275)).await;
    engine.close();
    drop(engine);

    let log = timeout(WAIT, robot).await.unwrap().unwrap();
    assert!(
        (3..=6).contains(&log.heartbeats.len()),
        "unexpected heartbeat count {}",
        log.heartbeats.len()
    );
    for beat in &log.heartbeats {
        let text = beat["timeInStr"].as_str().unwrap();
        assert_eq!(text.len(), "2026-01-01 00:00:00".len());
        assert!(beat["timeInNum"].as_i64().unwrap() > 0);
    }
}

#[tokio::test]
async fn test_heartbeat_skipped_while_transport_closed() {
    let (engine, transport, rx) = setup(quick_heartbeat());
    let robot = spawn_robot(engine.clone(), rx, true);
    timeout(WAIT, engine.wait_validated()).await.unwrap().unwrap();

    transport.open.store(false, Ordering::SeqCst);
    engine.handle_open();
    tokio::time::sleep(Duration::from_millis(200)).await;
    engine.close();
    drop(engine);

    let log = timeout(WAIT, robot).await.unwrap().unwrap();
    assert!(log.heartbeats.is_empty());
}

#[tokio::test]
async fn test_close_fails_outstanding_requests() {
    let (engine, _transport, _rx) = setup(EngineConfig::default());

    // Nobody answers, so the requests stay pending.
    let first = engine.request("rt/api/sport/request", 1001, None).unwrap();
    let second = engine.request("rt/api/vui/request", 1002, None).unwrap();
    assert_eq!(engine.pending_count(), 2);

    engine.close();

    assert_eq!(timeout(WAIT, first).await.unwrap(), Err(ChannelError::Closed));
    assert_eq!(timeout(WAIT, second).await.unwrap(), Err(ChannelError::Closed));
    assert_eq!(
        engine.request("rt/api/sport/request", 1003, None).err(),
        Some(ChannelError::NotOpen)
    );
}

#[tokio::test]
async fn test_subscription_streams_topic_traffic() {
    let (engine, _transport, rx) = setup(EngineConfig::default());
    let robot = spawn_robot(engine.clone(), rx, true);
    timeout(WAIT, engine.wait_validated()).await.unwrap().unwrap();

    let mut lowstate = engine.subscribe("rt/lf/lowstate").unwrap();
    for tick in 0..3 {
        engine.handle_text(&frame("msg", "rt/lf/lowstate", json!({"tick": tick})));
    }
    engine.handle_text(&frame("msg", "rt/multiplestate", json!({"volume": 3})));

    for tick in 0..3 {
        let message = timeout(WAIT, lowstate.recv()).await.unwrap().unwrap();
        assert_eq!(message.data["tick"], json!(tick));
    }

    engine.unsubscribe("rt/lf/lowstate").unwrap();
    assert!(timeout(WAIT, lowstate.recv()).await.unwrap().is_none());

    engine.close();
    drop(engine);
    let log = timeout(WAIT, robot).await.unwrap().unwrap();
    let kinds: Vec<_> = log.others.iter().map(|m| m.message_type.clone()).collect();
    assert_eq!(kinds, vec![MessageType::Subscribe, MessageType::Unsubscribe]);
}

#[tokio::test]
async fn test_binary_frames_reach_observer() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let transport = Arc::new(PipeTransport {
        open: AtomicBool::new(true),
        outbound: tx,
    });
    let decoder = FrameDecoder::new(Arc::new(
        |payload: &[u8], calibration: &Calibration| -> Result<VoxelMesh, DecompressError> {
            Ok(VoxelMesh {
                point_count: payload.len() as u32,
                face_count: calibration.resolution as u32,
                ..VoxelMesh::default()
            })
        },
    ));
    let engine = ChannelEngine::new(transport, decoder);
    let mut observer = engine.observe();

    let header = json!({
        "type": "msg",
        "topic": "rt/utlidar/voxel_map_compressed",
        "data": {"origin": [0.0, 0.0, 0.0], "resolution": 2.0, "width": [128, 128, 38]},
    });
    engine.handle_binary(&encode_frame(&header, &[7u8; 12]).unwrap());

    let message = timeout(WAIT, observer.recv()).await.unwrap().unwrap();
    assert_eq!(message.topic, "rt/utlidar/voxel_map_compressed");
    assert_eq!(message.data["data"]["point_count"], json!(12));
    assert_eq!(message.data["data"]["face_count"], json!(2));
    assert_eq!(message.data["width"], json!([128, 128, 38]));

    engine.close();
}
