use futures_util::future::BoxFuture;
use futures_util::{stream, Sink};
use serde_json::{json, Value};
use skiff_helm::{ActuatorDriver, Channel, CommandLog, DriverError, Helm, HelmLimits};
use skiff_link::{
    CommandDispatcher, ConnectError, Connector, Link, LinkError, LinkState, Supervisor, SupervisorConfig,
    SupervisorHandle,
};
use skiff_nav::{FusionEngine, Sensors, TelemetryConfig};
use skiff_video::{UnavailableEngine, VideoSessions, VideoSource, VideoSourceProvider};
use std::collections::VecDeque;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Clone, Copy)]
enum Step {
    Accept,
    /// Accept, but fail the first send with a transport error.
    AcceptFlaky,
    AcceptThenClose,
    Refuse,
}

/// Relay side of an in-memory link.
struct Remote {
    to_device: mpsc::UnboundedSender<String>,
    from_device: mpsc::UnboundedReceiver<String>,
}

impl Remote {
    fn send(&self, v: Value) {
        self.to_device.send(v.to_string()).unwrap();
    }

    /// Next record from the device that is not telemetry.
    async fn next_reply(&mut self) -> Value {
        loop {
            let text = tokio::time::timeout(Duration::from_secs(30), self.from_device.recv())
                .await
                .expect("no reply within 30s")
                .expect("device closed the link");
            let v: Value = serde_json::from_str(&text).unwrap();
            if v["type"] != "telemetry" {
                return v;
            }
        }
    }
}

#[derive(Default)]
struct ScriptedConnector {
    plan: Mutex<VecDeque<Step>>,
    attempts: Mutex<Vec<Instant>>,
    remotes: Mutex<Vec<Remote>>,
}

impl ScriptedConnector {
    fn new(plan: &[Step]) -> Arc<Self> {
        Arc::new(Self { plan: Mutex::new(plan.iter().copied().collect()), ..Default::default() })
    }

    fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }

    fn take_remote(&self) -> Option<Remote> {
        self.remotes.lock().unwrap().pop()
    }
}

/// Device side of an in-memory link. Can fail its first record once.
struct DeviceSink {
    tx: mpsc::UnboundedSender<String>,
    fail_next: bool,
}

impl Sink<String> for DeviceSink {
    type Error = LinkError;

    fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), LinkError>> {
        Poll::Ready(Ok(()))
    }

    fn start_send(mut self: Pin<&mut Self>, text: String) -> Result<(), LinkError> {
        if std::mem::take(&mut self.fail_next) {
            return Err(LinkError::Transport("send buffer full".into()));
        }
        self.tx.send(text).map_err(|_| LinkError::Closed)
    }

    fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), LinkError>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), LinkError>> {
        Poll::Ready(Ok(()))
    }
}

fn memory_link(close_at_once: bool, flaky: bool) -> (Link, Remote) {
    let (to_device, device_rx) = mpsc::unbounded_channel::<String>();
    let (device_tx, from_device) = mpsc::unbounded_channel::<String>();

    let tx = DeviceSink { tx: device_tx, fail_next: flaky };
    let rx: skiff_link::transport::LinkStream = if close_at_once {
        Box::pin(stream::empty())
    } else {
        Box::pin(stream::unfold(device_rx, |mut rx| async move { rx.recv().await.map(|t| (Ok(t), rx)) }))
    };
    (Link { tx: Box::pin(tx), rx }, Remote { to_device, from_device })
}

impl Connector for ScriptedConnector {
    fn connect<'a>(&'a self, url: &'a str) -> BoxFuture<'a, Result<Link, ConnectError>> {
        Box::pin(async move {
            self.attempts.lock().unwrap().push(Instant::now());
            let step = self.plan.lock().unwrap().pop_front().unwrap_or(Step::Refuse);
            let (close_at_once, flaky) = match step {
                Step::Refuse => return Err(ConnectError::Failed { url: url.into(), reason: "connection refused".into() }),
                Step::Accept => (false, false),
                Step::AcceptFlaky => (false, true),
                Step::AcceptThenClose => (true, false),
            };
            let (link, remote) = memory_link(close_at_once, flaky);
            self.remotes.lock().unwrap().push(remote);
            Ok(link)
        })
    }
}

struct BenchCamera;

impl VideoSourceProvider for BenchCamera {
    fn acquire(&self) -> anyhow::Result<VideoSource> {
        Ok(VideoSource { device: PathBuf::from("/dev/video0"), width: 640, height: 480, fps: 30 })
    }
}

/// Thrust values the helm wrote, normalized to [-1, 1].
#[derive(Clone, Default)]
struct ThrustLog(Arc<Mutex<Vec<f64>>>);

impl ThrustLog {
    fn peak(&self) -> f64 {
        self.0.lock().unwrap().iter().copied().fold(0.0, f64::max)
    }
}

impl ActuatorDriver for ThrustLog {
    fn set_angle(&mut self, channel: Channel, value: f64) -> Result<(), DriverError> {
        if channel == Channel::Thrust {
            self.0.lock().unwrap().push(value);
        }
        Ok(())
    }
}

fn bench_helm() -> (Arc<Helm>, ThrustLog) {
    let thrust = ThrustLog::default();
    let helm = Arc::new(Helm::new(Box::new(thrust.clone()), HelmLimits::default()));
    helm.initialize().unwrap();
    (helm, thrust)
}

type Running = (SupervisorHandle, Arc<FusionEngine>, JoinHandle<anyhow::Result<()>>);

fn start(connector: Arc<ScriptedConnector>) -> Running {
    start_with(connector, None)
}

fn start_with(connector: Arc<ScriptedConnector>, helm: Option<Arc<Helm>>) -> Running {
    let motors = helm.as_ref().map(|h| h.subscribe());
    let fusion = Arc::new(FusionEngine::new(Sensors::default(), motors, &TelemetryConfig::default()));
    let (dispatcher, acks) = CommandDispatcher::new(helm, fusion.clone(), CommandLog::disabled());
    let (outbox, outbox_rx) = mpsc::unbounded_channel();
    let video = VideoSessions::new("boat-1", Arc::new(UnavailableEngine), Arc::new(BenchCamera), outbox);
    let cfg = SupervisorConfig {
        url: "ws://relay.test/ws/device/boat-1".into(),
        telemetry_interval: Duration::from_secs(1),
        idle_timeout: None,
        policy: Default::default(),
    };
    let sup = Supervisor::new(cfg, connector, fusion.clone(), dispatcher, acks, video, outbox_rx);
    let handle = sup.handle();
    (handle, fusion, tokio::spawn(sup.run()))
}

async fn wait_for(handle: &SupervisorHandle, state: LinkState) {
    let mut rx = handle.subscribe();
    tokio::time::timeout(Duration::from_secs(120), rx.wait_for(|s| *s == state))
        .await
        .expect("state not reached")
        .unwrap();
}

fn gaps(attempts: &[Instant]) -> Vec<f64> {
    attempts.windows(2).map(|w| (w[1] - w[0]).as_secs_f64()).collect()
}

#[tokio::test(start_paused = true)]
async fn lost_link_backs_off_until_reconnected() {
    let connector = ScriptedConnector::new(&[
        Step::AcceptThenClose,
        Step::Refuse,
        Step::Refuse,
        Step::Refuse,
        Step::Accept,
    ]);
    let (handle, _, run) = start(connector.clone());

    tokio::time::sleep(Duration::from_secs(45)).await;
    assert_eq!(handle.state(), LinkState::Connected);

    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 5);
    let expected = [5.0, 7.5, 11.25, 16.875];
    for (got, want) in gaps(&attempts).iter().zip(expected) {
        assert!((got - want).abs() < 0.01, "gap {} expected {}", got, want);
    }

    handle.shutdown();
    run.await.unwrap().unwrap();
    assert_eq!(handle.state(), LinkState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn backoff_resets_after_successful_connect() {
    let connector = ScriptedConnector::new(&[Step::Refuse, Step::Refuse, Step::AcceptThenClose, Step::Refuse]);
    let (handle, _, run) = start(connector.clone());

    tokio::time::sleep(Duration::from_secs(30)).await;
    let g = gaps(&connector.attempts());
    // refused, refused, connected then lost, refused
    assert!((g[0] - 5.0).abs() < 0.01);
    assert!((g[1] - 7.5).abs() < 0.01);
    assert!((g[2] - 5.0).abs() < 0.01, "interval not reset: {:?}", g);
    assert!((g[3] - 7.5).abs() < 0.01);

    handle.shutdown();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn every_command_gets_one_ack_and_pings_are_answered() {
    let connector = ScriptedConnector::new(&[Step::Accept]);
    let (handle, _, run) = start(connector.clone());
    wait_for(&handle, LinkState::Connected).await;
    let mut relay = connector.take_remote().unwrap();

    relay.send(json!({"type": "command", "command_id": "c-1", "command": "set_rudder", "data": {"position": 20}}));
    relay.send(json!({"type": "ping"}));
    relay.send(json!({"type": "command", "command": "get_status"}));
    relay.send(json!({"type": "mystery"}));
    relay.send(json!({"type": "command", "command_id": 9, "command": "emergency_stop"}));

    let ack = relay.next_reply().await;
    assert_eq!(ack["type"], "command_ack");
    assert_eq!(ack["command_id"], "c-1");
    assert_eq!(ack["status"], "rejected");

    let pong = relay.next_reply().await;
    assert_eq!(pong["type"], "pong");
    assert!(pong["timestamp"].as_i64().unwrap() > 0);

    let ack = relay.next_reply().await;
    assert_eq!(ack["status"], "accepted");
    assert!(ack["command_id"].as_str().unwrap().starts_with("unassigned-"));

    let ack = relay.next_reply().await;
    assert_eq!(ack["command_id"], "9");
    assert_eq!(ack["status"], "accepted");

    handle.shutdown();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn telemetry_sequence_advances_per_sent_frame() {
    let connector = ScriptedConnector::new(&[Step::Accept]);
    let (handle, fusion, run) = start(connector.clone());
    wait_for(&handle, LinkState::Connected).await;
    let mut relay = connector.take_remote().unwrap();

    let mut seqs = Vec::new();
    while seqs.len() < 3 {
        let text = relay.from_device.recv().await.unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["type"], "telemetry");
        assert_eq!(v["subtype"], "sensor_data");
        seqs.push(v["sequence"].as_u64().unwrap());
    }
    assert_eq!(seqs, vec![0, 1, 2]);
    assert!(fusion.sequence() >= 2);

    handle.shutdown();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn signaling_errors_reach_the_viewer() {
    let connector = ScriptedConnector::new(&[Step::Accept]);
    let (handle, _, run) = start(connector.clone());
    wait_for(&handle, LinkState::Connected).await;
    let mut relay = connector.take_remote().unwrap();

    relay.send(json!({"type": "webrtc", "subtype": "request_offer", "clientId": "viewer-1"}));
    let err = relay.next_reply().await;
    assert_eq!(err["type"], "webrtc");
    assert_eq!(err["subtype"], "error");
    assert_eq!(err["clientId"], "viewer-1");
    assert_eq!(err["error"], "negotiation_failed");

    handle.shutdown();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn forced_reconnect_drops_and_reopens_the_link() {
    let connector = ScriptedConnector::new(&[Step::Accept, Step::Accept]);
    let (handle, _, run) = start(connector.clone());
    wait_for(&handle, LinkState::Connected).await;
    let _first = connector.take_remote().unwrap();

    handle.force_reconnect();
    wait_for(&handle, LinkState::Reconnecting).await;
    wait_for(&handle, LinkState::Connected).await;

    let attempts = connector.attempts();
    assert_eq!(attempts.len(), 2);
    assert!((gaps(&attempts)[0] - 5.0).abs() < 0.01);

    handle.shutdown();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn malformed_command_is_rejected_not_dropped() {
    let connector = ScriptedConnector::new(&[Step::Accept]);
    let (handle, _, run) = start(connector.clone());
    wait_for(&handle, LinkState::Connected).await;
    let mut relay = connector.take_remote().unwrap();

    relay.send(json!({"type": "command", "command_id": "m-1", "command": 5}));
    relay.send(json!({"type": "command", "command": ["set_rudder"], "data": 7}));

    let ack = relay.next_reply().await;
    assert_eq!(ack["type"], "command_ack");
    assert_eq!(ack["command_id"], "m-1");
    assert_eq!(ack["status"], "rejected");
    assert!(ack["message"].as_str().unwrap().contains("'command' must be a string"));

    let ack = relay.next_reply().await;
    assert_eq!(ack["status"], "rejected");
    assert!(ack["command_id"].as_str().unwrap().starts_with("unassigned-"));

    handle.shutdown();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn ramp_does_not_hold_up_other_records() {
    let (helm, thrust) = bench_helm();
    let connector = ScriptedConnector::new(&[Step::Accept]);
    let (handle, _, run) = start_with(connector.clone(), Some(helm.clone()));
    wait_for(&handle, LinkState::Connected).await;
    let mut relay = connector.take_remote().unwrap();

    let sent = Instant::now();
    relay.send(json!({"type": "command", "command_id": "t", "command": "set_throttle", "data": {"throttle": 40, "ramp_time": 4}}));
    relay.send(json!({"type": "ping"}));
    relay.send(json!({"type": "command", "command_id": "r", "command": "set_rudder", "data": {"position": -50}}));

    let pong = relay.next_reply().await;
    assert_eq!(pong["type"], "pong");
    let ack = relay.next_reply().await;
    assert_eq!((ack["command_id"].as_str(), ack["status"].as_str()), (Some("r"), Some("accepted")));
    assert!(Instant::now() - sent < Duration::from_secs(1));
    assert_eq!(helm.state().rudder_deg, -22.5);

    let ack = relay.next_reply().await;
    assert_eq!((ack["command_id"].as_str(), ack["status"].as_str()), (Some("t"), Some("accepted")));
    // 20 steps of 2%, the first one immediate
    assert!(Instant::now() - sent >= Duration::from_millis(3_800));
    assert!((thrust.peak() - 0.4).abs() < 1e-9);

    handle.shutdown();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn emergency_stop_overtakes_a_running_ramp() {
    let (helm, thrust) = bench_helm();
    let connector = ScriptedConnector::new(&[Step::Accept]);
    let (handle, _, run) = start_with(connector.clone(), Some(helm.clone()));
    wait_for(&handle, LinkState::Connected).await;
    let mut relay = connector.take_remote().unwrap();

    relay.send(json!({"type": "command", "command_id": "t", "command": "set_throttle", "data": {"throttle": 80, "ramp_time": 10}}));
    tokio::time::sleep(Duration::from_millis(200)).await;
    let sent = Instant::now();
    relay.send(json!({"type": "command", "command_id": "e", "command": "emergency_stop"}));

    let ack = relay.next_reply().await;
    assert_eq!((ack["command_id"].as_str(), ack["status"].as_str()), (Some("e"), Some("accepted")));
    assert!(Instant::now() - sent < Duration::from_secs(1));

    let ack = relay.next_reply().await;
    assert_eq!(ack["command_id"], "t");
    assert_eq!(ack["status"], "rejected");
    assert_eq!(ack["message"], "motion cancelled");

    assert_eq!(helm.state().throttle_pct, 0.0);
    assert!(thrust.peak() < 0.1, "ramp kept going: {}", thrust.peak());
    assert_eq!(*thrust.0.lock().unwrap().last().unwrap(), 0.0);

    // nothing moves the throttle afterwards
    tokio::time::sleep(Duration::from_secs(12)).await;
    assert_eq!(helm.state().throttle_pct, 0.0);

    handle.shutdown();
    run.await.unwrap().unwrap();
}

#[tokio::test(start_paused = true)]
async fn failed_telemetry_send_retries_the_same_sample() {
    let connector = ScriptedConnector::new(&[Step::AcceptFlaky]);
    let (handle, fusion, run) = start(connector.clone());
    wait_for(&handle, LinkState::Connected).await;
    let mut relay = connector.take_remote().unwrap();

    let text = relay.from_device.recv().await.unwrap();
    let v: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(v["sequence"], 0);
    // one fusion cycle of battery drain, not one per attempt
    let pct = v["data"]["battery"]["percentage"].as_f64().unwrap();
    assert!((pct - 99.99).abs() < 1e-9, "battery {}", pct);
    assert_eq!(handle.state(), LinkState::Connected);
    assert!(fusion.sequence() <= 1);

    handle.shutdown();
    run.await.unwrap().unwrap();
}
