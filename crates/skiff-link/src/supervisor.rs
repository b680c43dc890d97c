//! Connection supervisor.
//!
//! Each connection runs as a phase of three tasks: telemetry emission,
//! inbound dispatch (which also forwards deferred command acks and the video
//! signaling outbox) and a reconnect trigger. The first task to finish ends the phase; the others
//! are aborted and joined before the next connect attempt. Helm, fusion and
//! video sessions live outside the phase and survive reconnects.

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use skiff_nav::FusionEngine;
use skiff_proto::{Inbound, Outbound, SignalMessage};
use skiff_video::VideoSessions;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backoff::{LinkState, ReconnectPolicy};
use crate::commands::{CommandDispatcher, DeferredAcks};
use crate::transport::{Connector, Link, LinkError, LinkSink, LinkStream};
use crate::LinkConfig;

const RETRY_AFTER_ERROR: Duration = Duration::from_secs(1);
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);
const SENSOR_STOP_TIMEOUT: Duration = Duration::from_secs(2);

type SharedSink = Arc<Mutex<LinkSink>>;
type SharedOutbox = Arc<Mutex<mpsc::UnboundedReceiver<SignalMessage>>>;
type SharedAcks = Arc<Mutex<DeferredAcks>>;

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub url: String,
    pub telemetry_interval: Duration,
    pub idle_timeout: Option<Duration>,
    pub policy: ReconnectPolicy,
}

impl SupervisorConfig {
    pub fn new(link: &LinkConfig, telemetry_interval: Duration) -> Self {
        Self {
            url: link.url(),
            telemetry_interval,
            idle_timeout: link.idle_timeout_s.and_then(|s| Duration::try_from_secs_f64(s).ok()),
            policy: ReconnectPolicy::default(),
        }
    }
}

enum PhaseEnd {
    LinkLost(String),
    Reconnect(&'static str),
    Shutdown,
}

/// Control surface for a running [`Supervisor`].
#[derive(Clone)]
pub struct SupervisorHandle {
    cancel: CancellationToken,
    reconnect: Arc<watch::Sender<u64>>,
    state: watch::Receiver<LinkState>,
}

impl SupervisorHandle {
    /// Drop the current connection and go through the reconnect path.
    pub fn force_reconnect(&self) {
        self.reconnect.send_modify(|n| *n = n.wrapping_add(1));
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkState> {
        self.state.clone()
    }
}

pub struct Supervisor {
    cfg: SupervisorConfig,
    connector: Arc<dyn Connector>,
    fusion: Arc<FusionEngine>,
    dispatcher: Arc<CommandDispatcher>,
    acks: SharedAcks,
    video: Arc<Mutex<VideoSessions>>,
    outbox: SharedOutbox,
    cancel: CancellationToken,
    reconnect: Arc<watch::Sender<u64>>,
    state: watch::Sender<LinkState>,
}

impl Supervisor {
    /// `acks` comes with `dispatcher`; `outbox` is the receiving end of the
    /// channel `video` queues its signaling replies on.
    pub fn new(
        cfg: SupervisorConfig,
        connector: Arc<dyn Connector>,
        fusion: Arc<FusionEngine>,
        dispatcher: CommandDispatcher,
        acks: DeferredAcks,
        video: VideoSessions,
        outbox: mpsc::UnboundedReceiver<SignalMessage>,
    ) -> Self {
        let (state, _) = watch::channel(LinkState::Disconnected);
        let (reconnect, _) = watch::channel(0);
        Self {
            cfg,
            connector,
            fusion,
            dispatcher: Arc::new(dispatcher),
            acks: Arc::new(Mutex::new(acks)),
            video: Arc::new(Mutex::new(video)),
            outbox: Arc::new(Mutex::new(outbox)),
            cancel: CancellationToken::new(),
            reconnect: Arc::new(reconnect),
            state,
        }
    }

    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle {
            cancel: self.cancel.clone(),
            reconnect: self.reconnect.clone(),
            state: self.state.subscribe(),
        }
    }

    /// Connect, run phases and reconnect until shut down, then close every
    /// video session and stop the sensor threads.
    pub async fn run(mut self) -> Result<()> {
        info!("link: supervising {}", self.cfg.url);
        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            self.state.send_replace(LinkState::Connecting);
            let attempt = tokio::select! {
                _ = self.cancel.cancelled() => break,
                res = self.connector.connect(&self.cfg.url) => res,
            };
            let link = match attempt {
                Ok(link) => link,
                Err(e) => {
                    let delay = self.cfg.policy.next_delay();
                    self.state.send_replace(LinkState::Disconnected);
                    warn!("link: {}; retrying in {:.2}s", e, delay.as_secs_f64());
                    if self.pause(delay).await {
                        break;
                    }
                    continue;
                }
            };

            self.cfg.policy.reset();
            self.state.send_replace(LinkState::Connected);
            info!("link: connected to {}", self.cfg.url);

            let delay = match self.run_phase(link).await {
                PhaseEnd::Shutdown => break,
                PhaseEnd::LinkLost(why) => {
                    let delay = self.cfg.policy.next_delay();
                    warn!("link: lost ({}); reconnecting in {:.2}s", why, delay.as_secs_f64());
                    delay
                }
                PhaseEnd::Reconnect(why) => {
                    let delay = self.cfg.policy.next_delay();
                    info!("link: {}; reconnecting in {:.2}s", why, delay.as_secs_f64());
                    delay
                }
            };
            self.state.send_replace(LinkState::Reconnecting);
            if self.pause(delay).await {
                break;
            }
        }

        self.state.send_replace(LinkState::Disconnected);
        let closed = self.video.lock().await.close_all().await;
        info!("link: shut down ({} video session(s) closed)", closed);
        let fusion = self.fusion.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || fusion.stop_sensors(SENSOR_STOP_TIMEOUT)).await {
            warn!("link: sensor shutdown task failed: {}", e);
        }
        Ok(())
    }

    /// Returns true when cancelled during the wait.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => true,
            _ = tokio::time::sleep(delay) => false,
        }
    }

    async fn run_phase(&self, link: Link) -> PhaseEnd {
        let stale = drain(&mut *self.outbox.lock().await);
        if stale > 0 {
            debug!("link: dropped {} stale signaling message(s)", stale);
        }

        let tx: SharedSink = Arc::new(Mutex::new(link.tx));
        let activity = Arc::new(Notify::new());
        let mut tasks = JoinSet::new();
        tasks.spawn(telemetry_loop(tx.clone(), self.fusion.clone(), self.cfg.telemetry_interval));
        tasks.spawn(dispatch_loop(
            tx.clone(),
            link.rx,
            self.dispatcher.clone(),
            self.acks.clone(),
            self.video.clone(),
            self.outbox.clone(),
            activity.clone(),
        ));
        tasks.spawn(reconnect_trigger(self.reconnect.subscribe(), activity, self.cfg.idle_timeout));

        let end = tokio::select! {
            _ = self.cancel.cancelled() => PhaseEnd::Shutdown,
            done = tasks.join_next() => match done {
                Some(Ok(end)) => end,
                Some(Err(e)) => PhaseEnd::LinkLost(format!("link task failed: {}", e)),
                None => PhaseEnd::LinkLost("no link tasks".into()),
            },
        };
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}

        let mut sink = tx.lock().await;
        match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
            Ok(Ok(())) => debug!("link: transport closed"),
            Ok(Err(e)) => debug!("link: close: {}", e),
            Err(_) => debug!("link: close timed out"),
        }
        end
    }
}

fn drain<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> usize {
    let mut n = 0;
    while rx.try_recv().is_ok() {
        n += 1;
    }
    n
}

async fn send(tx: &SharedSink, msg: &Outbound) -> Result<(), LinkError> {
    let text = msg.encode().map_err(|e| LinkError::Transport(format!("encode {}: {}", msg.kind(), e)))?;
    tx.lock().await.send(text).await
}

async fn telemetry_loop(tx: SharedSink, fusion: Arc<FusionEngine>, interval: Duration) -> PhaseEnd {
    // A failed send is retried with the same sample so filters and battery
    // decay advance once per delivered frame.
    let mut unsent = None;
    loop {
        let sample = unsent.take().unwrap_or_else(|| fusion.next_sample());
        match send(&tx, &Outbound::Telemetry(sample.to_wire())).await {
            Ok(()) => {
                fusion.commit(&sample);
                debug!("link: telemetry #{} sent", sample.sequence);
                tokio::time::sleep(interval).await;
            }
            Err(LinkError::Closed) => return PhaseEnd::LinkLost("telemetry send on closed link".into()),
            Err(e) => {
                warn!("link: telemetry #{} send failed: {}", sample.sequence, e);
                unsent = Some(sample);
                tokio::time::sleep(RETRY_AFTER_ERROR).await;
            }
        }
    }
}

async fn dispatch_loop(
    tx: SharedSink,
    mut rx: LinkStream,
    dispatcher: Arc<CommandDispatcher>,
    acks: SharedAcks,
    video: Arc<Mutex<VideoSessions>>,
    outbox: SharedOutbox,
    activity: Arc<Notify>,
) -> PhaseEnd {
    let mut acks = acks.lock().await;
    let mut outbox = outbox.lock().await;
    loop {
        tokio::select! {
            frame = rx.next() => {
                let text = match frame {
                    None | Some(Err(LinkError::Closed)) => return PhaseEnd::LinkLost("closed by relay".into()),
                    Some(Err(e)) => {
                        warn!("link: receive failed: {}", e);
                        tokio::time::sleep(RETRY_AFTER_ERROR).await;
                        continue;
                    }
                    Some(Ok(text)) => text,
                };
                activity.notify_one();
                let Some(reply) = handle_frame(&text, &dispatcher, &video).await else {
                    continue;
                };
                match send(&tx, &reply).await {
                    Ok(()) => debug!("link: {} sent", reply.kind()),
                    Err(LinkError::Closed) => return PhaseEnd::LinkLost(format!("{} send on closed link", reply.kind())),
                    Err(e) => warn!("link: {} send failed: {}", reply.kind(), e),
                }
            }
            Some(ack) = acks.recv() => {
                match send(&tx, &Outbound::CommandAck(ack)).await {
                    Ok(()) => debug!("link: deferred command_ack sent"),
                    Err(LinkError::Closed) => return PhaseEnd::LinkLost("command_ack send on closed link".into()),
                    Err(e) => warn!("link: command_ack send failed: {}", e),
                }
            }
            Some(msg) = outbox.recv() => {
                match send(&tx, &Outbound::Webrtc(msg)).await {
                    Ok(()) => debug!("link: signaling sent"),
                    Err(LinkError::Closed) => return PhaseEnd::LinkLost("signaling send on closed link".into()),
                    Err(e) => warn!("link: signaling send failed: {}", e),
                }
            }
        }
    }
}

async fn handle_frame(text: &str, dispatcher: &CommandDispatcher, video: &Mutex<VideoSessions>) -> Option<Outbound> {
    match Inbound::decode(text) {
        Ok(Inbound::Command { envelope, raw }) => dispatcher.dispatch(envelope, &raw).await.map(Outbound::CommandAck),
        Ok(Inbound::Ping) => Some(Outbound::Pong { timestamp: unix_ms() }),
        Ok(Inbound::Webrtc(msg)) => {
            video.lock().await.handle(msg).await;
            None
        }
        Ok(Inbound::Unknown(kind)) => {
            debug!("link: ignoring '{}' record", kind);
            None
        }
        Err(e) => {
            warn!("link: undecodable record: {}", e);
            None
        }
    }
}

async fn reconnect_trigger(
    mut requests: watch::Receiver<u64>,
    activity: Arc<Notify>,
    idle_timeout: Option<Duration>,
) -> PhaseEnd {
    loop {
        let Some(idle) = idle_timeout else {
            return match requests.changed().await {
                Ok(()) => PhaseEnd::Reconnect("reconnect requested"),
                // sender lives as long as the supervisor
                Err(_) => std::future::pending().await,
            };
        };
        tokio::select! {
            res = requests.changed() => {
                if res.is_ok() {
                    return PhaseEnd::Reconnect("reconnect requested");
                }
            }
            _ = activity.notified() => {}
            _ = tokio::time::sleep(idle) => return PhaseEnd::Reconnect("idle timeout"),
        }
    }
}

fn unix_ms() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
