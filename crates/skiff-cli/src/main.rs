mod config;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use skiff_helm::{doctor as helm_doctor, ActuatorRegistry, CommandLog, Helm, HelmConfig, HelmLimits, SysfsPwm};
use skiff_link::{doctor as link_doctor, CommandDispatcher, Supervisor, SupervisorConfig, WsConnector};
use skiff_nav::{doctor as nav_doctor, FusionEngine};
use skiff_video::{camera, UnavailableEngine, V4lCameras, VideoSessions};

use config::{load_config, Config};

#[derive(Debug, Parser)]
#[command(name = "skiff", version, about = "Skiff - onboard control core for a remotely reporting boat")]
struct Cli {
    /// TOML configuration; built-in defaults and SKIFF_* variables otherwise.
    #[arg(long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Validate the configuration and list missing devices.
    Doctor,
    /// Connect to the relay and serve telemetry, commands and video signaling.
    Run,
    Helm {
        #[command(subcommand)]
        cmd: HelmCmd,
    },
}

#[derive(Debug, Subcommand)]
enum HelmCmd {
    /// Drive rudder and thrust to neutral, then release the outputs.
    Center,
    /// Walk the rudder port/center/starboard and ramp thrust through a short profile.
    Sweep,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let cfg = load_config(cli.config.as_deref())?;

    match cli.cmd {
        Command::Doctor => doctor(&cfg)?,
        Command::Run => run(cfg).await?,
        Command::Helm { cmd } => helm_cmd(&cfg.helm, cmd).await?,
    }
    Ok(())
}

fn doctor(cfg: &Config) -> Result<()> {
    info!("doctor: starting");

    link_doctor::check_link(&cfg.link)?;
    nav_doctor::check_telemetry(&cfg.telemetry)?;
    nav_doctor::check_gnss(&cfg.gnss)?;
    nav_doctor::check_compass(&cfg.compass)?;
    helm_doctor::check_helm(&cfg.helm)?;
    skiff_video::check_video(&cfg.video)?;

    let mut missing = nav_doctor::missing_devices(&cfg.gnss, &cfg.compass);
    missing.extend(helm_doctor::missing_pwm_chip(&cfg.helm));
    match &cfg.video.device {
        Some(dev) if !std::path::Path::new(dev).exists() => missing.push(format!("camera {}", dev)),
        Some(_) => {}
        None => {
            if camera::list_devices(std::path::Path::new("/dev")).map_or(true, |d| d.is_empty()) {
                missing.push("camera /dev/video*".into());
            }
        }
    }
    for m in &missing {
        warn!("doctor: missing {}", m);
    }

    info!("doctor: OK (relay {}, {} missing device(s))", cfg.link.url(), missing.len());
    Ok(())
}

fn open_helm(cfg: &HelmConfig) -> Result<Arc<Helm>> {
    let driver = SysfsPwm::open(cfg).context("open pwm outputs")?;
    let helm = Arc::new(Helm::new(Box::new(driver), HelmLimits::from_config(cfg)));
    helm.initialize().context("initialize helm")?;
    Ok(helm)
}

async fn run(cfg: Config) -> Result<()> {
    info!("run: starting as {}", cfg.link.device_id);

    let registry = ActuatorRegistry::new();
    registry.install_panic_hook();

    let (journal, journal_task) = match &cfg.helm.command_log {
        Some(path) => {
            let (log, task) = CommandLog::spawn(path);
            (log, Some(task))
        }
        None => (CommandLog::disabled(), None),
    };

    let helm = if cfg.helm.enable {
        match open_helm(&cfg.helm) {
            Ok(h) => Some(h),
            Err(e) => {
                warn!("helm: not attached: {:#}", e);
                None
            }
        }
    } else {
        info!("helm: disabled; actuating commands will be rejected");
        None
    };
    let _registration = helm.as_ref().map(|h| registry.register(h.clone()));

    let interval = Duration::try_from_secs_f64(cfg.telemetry.interval_s).context("telemetry.interval_s")?;
    let sensors = skiff_nav::start_sensors(&cfg.gnss, &cfg.compass, interval);
    let fusion = Arc::new(FusionEngine::new(sensors, helm.as_ref().map(|h| h.subscribe()), &cfg.telemetry));

    let (dispatcher, acks) = CommandDispatcher::new(helm.clone(), fusion.clone(), journal);
    let (outbox, outbox_rx) = mpsc::unbounded_channel();
    let video = VideoSessions::new(
        cfg.link.device_id.clone(),
        Arc::new(UnavailableEngine),
        Arc::new(V4lCameras::new(&cfg.video)),
        outbox,
    );

    let supervisor = Supervisor::new(
        SupervisorConfig::new(&cfg.link, interval),
        Arc::new(WsConnector::new()),
        fusion,
        dispatcher,
        acks,
        video,
        outbox_rx,
    );
    let handle = supervisor.handle();
    let mut task = tokio::spawn(supervisor.run());

    tokio::select! {
        res = &mut task => res??,
        sig = shutdown_signal() => {
            match sig {
                Ok(()) => info!("run: shutdown signal received"),
                Err(e) => warn!("run: signal handler failed: {:#}", e),
            }
            handle.shutdown();
            task.await??;
        }
    }

    let n = registry.make_all_safe();
    info!("run: {} actuator(s) made safe", n);

    if let Some(t) = journal_task {
        if tokio::time::timeout(Duration::from_secs(2), t).await.is_err() {
            warn!("run: command log did not flush in time");
        }
    }
    info!("run: stopped");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let mut term = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = term.recv() => {}
    }
    Ok(())
}

async fn helm_cmd(cfg: &HelmConfig, cmd: HelmCmd) -> Result<()> {
    let helm = open_helm(cfg)?;
    let registry = ActuatorRegistry::new();
    registry.install_panic_hook();
    let _registration = registry.register(helm.clone());

    match cmd {
        HelmCmd::Center => info!("helm: outputs at neutral"),
        HelmCmd::Sweep => {
            for position in [-100.0, 0.0, 100.0, 0.0] {
                let deg = helm.set_rudder(position)?;
                info!("helm: rudder position {:+.0} -> {:.1}°", position, deg);
                tokio::time::sleep(Duration::from_secs(1)).await;
            }
            for (target, ramp_s) in [(20.0, 2.0), (0.0, 1.0), (-20.0, 2.0), (0.0, 1.0)] {
                helm.set_throttle(target, Some(Duration::from_secs_f64(ramp_s))).await?;
                info!("helm: throttle {:+.0}%", target);
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        }
    }

    helm.release()?;
    Ok(())
}
