use serde_json::Value;
use skiff_helm::{CommandError, CommandLog, Helm, HelmCommand};
use skiff_nav::FusionEngine;
use skiff_proto::{CommandAck, CommandEnvelope};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Acks of commands that ran on the motion worker, in completion order.
pub type DeferredAcks = mpsc::UnboundedReceiver<CommandAck>;

struct MotionJob {
    id: String,
    name: String,
    cmd: HelmCommand,
    epoch: u64,
}

/// Turns inbound `command` records into exactly one ack each.
///
/// Throttle ramps and `stop` run one at a time on a motion worker, in arrival
/// order, so reading the link never waits for a ramp; their acks come back
/// through [`DeferredAcks`]. `emergency_stop` is applied at once and discards
/// the queued and running motion, as does `stop` before it is queued.
pub struct CommandDispatcher {
    helm: Option<Arc<Helm>>,
    fusion: Arc<FusionEngine>,
    journal: CommandLog,
    motion: Option<mpsc::UnboundedSender<MotionJob>>,
    // Bumped to discard every job queued before it.
    epoch: Arc<AtomicU64>,
}

impl CommandDispatcher {
    /// With a helm attached this spawns the motion worker, so it must be
    /// called inside a tokio runtime.
    pub fn new(helm: Option<Arc<Helm>>, fusion: Arc<FusionEngine>, journal: CommandLog) -> (Self, DeferredAcks) {
        let (acks, deferred) = mpsc::unbounded_channel();
        let epoch = Arc::new(AtomicU64::new(0));
        let motion = helm.as_ref().map(|helm| {
            let (jobs, queue) = mpsc::unbounded_channel();
            tokio::spawn(motion_worker(helm.clone(), queue, epoch.clone(), acks.clone()));
            jobs
        });
        (Self { helm, fusion, journal, motion, epoch }, deferred)
    }

    /// The ack, or None when the command was queued on the motion worker and
    /// its ack will arrive on [`DeferredAcks`].
    pub async fn dispatch(&self, envelope: CommandEnvelope, raw: &Value) -> Option<CommandAck> {
        self.journal.record(raw);

        let id = envelope.command_id.unwrap_or_else(|| {
            let id = generated_id();
            warn!("link: command without command_id, acking as {}", id);
            id
        });
        let name = envelope.command.as_deref().unwrap_or("<none>").to_string();

        let parsed = match (&envelope.command, raw.get("command")) {
            (None, Some(v)) if !v.is_null() => {
                Err(CommandError::InvalidField { field: "command", reason: format!("must be a string, got {}", v) })
            }
            (command, _) => HelmCommand::parse(command.as_deref(), &envelope.data),
        };
        let cmd = match parsed {
            Ok(cmd) => cmd,
            Err(e) => return Some(settle(&name, id, Err(e))),
        };

        let queued = matches!(cmd, HelmCommand::SetThrottle { .. } | HelmCommand::Stop);
        if let (true, Some(helm), Some(motion)) = (queued, &self.helm, &self.motion) {
            if cmd == HelmCommand::Stop {
                self.discard_motion(helm);
            }
            let job = MotionJob { id, name, cmd, epoch: self.epoch.load(Ordering::SeqCst) };
            debug!("link: {} [{}] queued", job.name, job.id);
            return match motion.send(job) {
                Ok(()) => None,
                Err(mpsc::error::SendError(job)) => {
                    warn!("link: motion worker gone");
                    Some(settle(&job.name, job.id, Err(CommandError::NotAttached)))
                }
            };
        }
        if let (HelmCommand::EmergencyStop, Some(helm)) = (&cmd, &self.helm) {
            self.discard_motion(helm);
        }
        Some(settle(&name, id, self.apply(&cmd).await))
    }

    fn discard_motion(&self, helm: &Helm) {
        // epoch first: a job that takes its motion token after the interrupt
        // must already see the new epoch
        self.epoch.fetch_add(1, Ordering::SeqCst);
        helm.interrupt_motion();
    }

    async fn apply(&self, cmd: &HelmCommand) -> Result<String, CommandError> {
        match cmd {
            HelmCommand::GetStatus => Ok(self.fusion.status().to_string()),
            HelmCommand::SetWaypoints { count } => Ok(format!("{} waypoint(s) recorded; no autonomous navigation", count)),
            HelmCommand::Unknown(name) => Err(CommandError::Unknown(name.clone())),
            _ => match &self.helm {
                Some(helm) => helm.execute(cmd).await,
                None if cmd.is_actuating() => Err(CommandError::NotAttached),
                None => Ok("emergency stop acknowledged; no actuator layer attached".into()),
            },
        }
    }
}

async fn motion_worker(
    helm: Arc<Helm>,
    mut queue: mpsc::UnboundedReceiver<MotionJob>,
    epoch: Arc<AtomicU64>,
    acks: mpsc::UnboundedSender<CommandAck>,
) {
    while let Some(job) = queue.recv().await {
        let motion = helm.motion();
        let outcome = if job.epoch == epoch.load(Ordering::SeqCst) {
            helm.execute_with(&job.cmd, motion).await
        } else {
            Err(CommandError::Cancelled)
        };
        if acks.send(settle(&job.name, job.id, outcome)).is_err() {
            break;
        }
    }
    debug!("link: motion worker stopped");
}

fn settle(name: &str, id: String, outcome: Result<String, CommandError>) -> CommandAck {
    match outcome {
        Ok(message) => {
            info!("link: {} [{}] accepted: {}", name, id, message);
            CommandAck::accepted(id, Some(message))
        }
        Err(e) => {
            warn!("link: {} [{}] rejected: {}", name, id, e);
            CommandAck::rejected(id, e.to_string())
        }
    }
}

fn generated_id() -> String {
    format!("unassigned-{:016x}", rand::random::<u64>())
}
