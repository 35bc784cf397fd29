//! Plant activator
//!
//! Builds a small boiler-room object tree and runs it until a termination
//! signal arrives. A thermometer samples on a timer and pushes readings to a
//! controller through the directory; the controller raises alarms above a
//! limit.
//!
//! Usage:
//!   plant-activator --config services/activator/config/activator.toml
//!   plant-activator --log-level debug --json-logs

use anyhow::{Context, Result};
use clap::Parser;
use plant_actors::{
    Manager, NoopBehavior, ObjectBehavior, ObjectKey, ProcessRuntime, RuntimeContext,
    RuntimeObject, Signal,
};
use plant_config::RuntimeConfig;
use plant_types::{
    Message, ObjectId, Priority, SensorUpdate, SystemCommand, SystemMessage, TimerFired, TimerId,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const ROOT_ID: ObjectId = ObjectId(1);
const BOILER_ID: ObjectId = ObjectId(10);
const THERMOMETER_ID: ObjectId = ObjectId(11);
const CONTROLLER_ID: ObjectId = ObjectId(12);

const SAMPLE_TIMER: TimerId = TimerId(1);
const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);
const TEMPERATURE_LIMIT: i64 = 95;

#[derive(Parser, Debug)]
#[command(name = "plant-activator")]
#[command(about = "Runs the plant object tree")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); overrides the config
    #[arg(short, long)]
    log_level: Option<String>,

    /// Enable JSON logging format
    #[arg(long)]
    json_logs: bool,

    /// Run the RPC dispatch loop on the main thread
    #[arg(long)]
    inline: bool,
}

/// Samples a temperature and sends it to the controller
struct Thermometer {
    controller: ObjectKey,
    reading: i64,
}

impl ObjectBehavior for Thermometer {
    fn activate_object(&mut self, obj: &RuntimeObject) -> anyhow::Result<()> {
        let interval = obj.ask_timer(SAMPLE_TIMER, SAMPLE_INTERVAL, None, Priority::Medium);
        info!(object = %obj.name(), interval_ms = interval.as_millis() as u64, "Sampling started");
        Ok(())
    }

    fn timer_info(&mut self, obj: &RuntimeObject, timer: &TimerFired) -> anyhow::Result<()> {
        if timer.timer != SAMPLE_TIMER {
            return Ok(());
        }
        self.reading = (self.reading + 7) % 120;

        let controller = obj
            .context()
            .directory()
            .resolve(self.controller)
            .context("controller is not registered")?;
        controller.push(
            Message::sensor(SensorUpdate::new(obj.id(), self.reading))
                .to(self.controller.id)
                .from(obj.id(), obj.context().node()),
        )?;
        Ok(())
    }

    fn deactivate_object(&mut self, obj: &RuntimeObject) -> anyhow::Result<()> {
        obj.ask_timer(SAMPLE_TIMER, Duration::ZERO, None, Priority::Medium);
        Ok(())
    }
}

/// Watches readings and counts limit violations
#[derive(Default)]
struct Controller {
    alarms: u64,
}

impl ObjectBehavior for Controller {
    fn sensor_info(&mut self, obj: &RuntimeObject, update: &SensorUpdate) -> anyhow::Result<()> {
        if update.value > TEMPERATURE_LIMIT {
            self.alarms += 1;
            warn!(
                object = %obj.name(),
                sensor = %update.sensor,
                value = update.value,
                limit = TEMPERATURE_LIMIT,
                alarms = self.alarms,
                "Temperature above limit"
            );
        } else {
            debug!(object = %obj.name(), sensor = %update.sensor, value = update.value, "Reading");
        }
        Ok(())
    }

    fn sys_command(&mut self, obj: &RuntimeObject, cmd: &SystemMessage) -> anyhow::Result<()> {
        info!(object = %obj.name(), command = ?cmd.command, "System command");
        Ok(())
    }

    fn sigterm(&mut self, obj: &RuntimeObject, signal: Signal) -> anyhow::Result<()> {
        info!(object = %obj.name(), signal = ?signal, alarms = self.alarms, "Controller stopping");
        Ok(())
    }
}

fn build_tree(ctx: &RuntimeContext) -> Result<Arc<Manager>> {
    let root = Manager::new(ctx, ROOT_ID, "Plant", NoopBehavior)?;
    let boiler = Manager::new(ctx, BOILER_ID, "Boiler", NoopBehavior)?;

    let controller_key = ObjectKey::new(CONTROLLER_ID, ctx.node());
    boiler.add_object(RuntimeObject::new(
        ctx,
        CONTROLLER_ID,
        "Controller",
        Controller::default(),
    )?)?;
    boiler.add_object(RuntimeObject::new(
        ctx,
        THERMOMETER_ID,
        "Thermometer",
        Thermometer {
            controller: controller_key,
            reading: 60,
        },
    )?)?;
    root.add_manager(boiler)?;
    Ok(root)
}

fn init_logging(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = RuntimeConfig::load(args.config.as_deref())
        .context("Failed to load runtime configuration")?;
    if let Some(level) = args.log_level {
        config.log_level = level;
    }
    init_logging(&config.log_level, args.json_logs);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        node = config.node_id,
        inline = args.inline,
        "Starting plant activator"
    );

    let ctx = RuntimeContext::local(config)?;
    let root = build_tree(&ctx)?;
    root.broadcast(&Message::system(SystemCommand::StartUp));

    let runtime = ProcessRuntime::new(ctx, root);
    runtime.run(!args.inline)?;
    runtime.join();

    info!("Plant activator exited");
    Ok(())
}
