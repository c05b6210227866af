//! Mode controller
//!
//! One state machine per mode, tying the arbiter, supervisor, parsers and
//! broadcaster together:
//!
//! ```text
//! Idle --start--> Starting --output check passed--> Running --stop--> Stopping --> Idle
//!                    |                                    |
//!                    +--launch failure--> Error <--crash--+
//!                                             |
//!                                             +--reset / kill-all--> Idle
//! ```
//!
//! Start, stop and reset of one mode are serialised by that mode's operation
//! lock and run on their own task, so a caller that goes away mid-request
//! cannot leave a mode half started. Different modes never wait on each other,
//! except during kill-all, which holds every operation lock until all device
//! locks are released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::arbiter::{ArbiterError, DeviceStatus, Grant, ResourceArbiter};
use crate::broadcast::{BroadcastReport, EventBroadcaster, Subscriber};
use crate::config::Config;
use crate::device::{DeviceClass, DeviceRegistry};
use crate::event::{Event, EventPayload, InterfaceRenamed, ModeStateChange};
use crate::mode::{build_command, ModeKind, ModeParams, ModeState, ParamError, ValidatedParams};
use crate::parser::{parse, EventDecoder, ParseStats};
use crate::supervisor::{ExitInfo, LaunchError, ProcessHandle, ProcessOutput, Supervisor};

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("{class} device is busy (held by {holder})")]
    DeviceBusy { class: DeviceClass, holder: ModeKind },

    #[error("no {0} device available")]
    NoDevice(DeviceClass),

    #[error(transparent)]
    InvalidParameter(#[from] ParamError),

    #[error("{0} is already active")]
    AlreadyActive(ModeKind),

    #[error("{0} is still stopping")]
    Stopping(ModeKind),

    #[error("{0} is in error; reset it first")]
    InError(ModeKind),

    #[error("{mode} failed to launch: {message}")]
    LaunchFailure { mode: ModeKind, message: String },

    #[error("{mode} cannot launch: {message}")]
    ResourceExhausted { mode: ModeKind, message: String },
}

impl ControlError {
    /// Stable machine-readable name
    pub fn kind(&self) -> &'static str {
        match self {
            ControlError::DeviceBusy { .. } => "device_busy",
            ControlError::NoDevice(_) => "no_device",
            ControlError::InvalidParameter(_) => "invalid_parameter",
            ControlError::AlreadyActive(_) => "already_active",
            ControlError::Stopping(_) => "stopping",
            ControlError::InError(_) => "in_error",
            ControlError::LaunchFailure { .. } => "launch_failure",
            ControlError::ResourceExhausted { .. } => "resource_exhausted",
        }
    }

    fn from_arbiter(mode: ModeKind, err: ArbiterError) -> Self {
        match err {
            ArbiterError::Busy { class, holder } => ControlError::DeviceBusy { class, holder },
            ArbiterError::NoDevice(class) => ControlError::NoDevice(class),
            other => ControlError::LaunchFailure {
                mode,
                message: other.to_string(),
            },
        }
    }

    fn from_launch(mode: ModeKind, err: LaunchError) -> Self {
        let message = err.to_string();
        if err.is_platform_fatal() {
            ControlError::ResourceExhausted { mode, message }
        } else {
            ControlError::LaunchFailure { mode, message }
        }
    }
}

/// Numbers one run's events. Publishing under the lock keeps delivery order
/// equal to `seq` order even with the parser and controller both emitting.
#[derive(Debug)]
struct Sequencer {
    mode: ModeKind,
    last: Mutex<u64>,
}

impl Sequencer {
    fn new(mode: ModeKind) -> Arc<Self> {
        Arc::new(Self {
            mode,
            last: Mutex::new(0),
        })
    }

    fn emit(&self, hub: &EventBroadcaster, payload: EventPayload) {
        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        *last += 1;
        hub.publish(Event::new(self.mode, *last, payload));
    }
}

/// Everything a run owns that must be given back when it ends
#[derive(Default)]
struct RunResources {
    held: Option<DeviceClass>,
    handle: Option<Arc<ProcessHandle>>,
    pump: Option<JoinHandle<()>>,
}

struct ModeSlot {
    state: ModeState,
    generation: u64,
    cause: Option<String>,
    grant: Option<Grant>,
    /// Set for a run fed by a network SDR instead of local hardware
    remote: Option<String>,
    run: RunResources,
    command: Option<String>,
    started_at: Option<DateTime<Utc>>,
    stats: Arc<ParseStats>,
    sequencer: Arc<Sequencer>,
}

impl ModeSlot {
    fn new(mode: ModeKind) -> Self {
        Self {
            state: ModeState::Idle,
            generation: 0,
            cause: None,
            grant: None,
            remote: None,
            run: RunResources::default(),
            command: None,
            started_at: None,
            stats: Arc::new(ParseStats::new()),
            sequencer: Sequencer::new(mode),
        }
    }

    fn begin_run(&mut self, mode: ModeKind) {
        self.generation += 1;
        self.state = ModeState::Starting;
        self.cause = None;
        self.grant = None;
        self.command = None;
        self.started_at = None;
        self.stats = Arc::new(ParseStats::new());
        self.sequencer = Sequencer::new(mode);
    }

    fn take_run(&mut self) -> RunResources {
        self.grant = None;
        self.remote = None;
        std::mem::take(&mut self.run)
    }
}

/// Externally visible state of one mode
#[derive(Debug, Clone, Serialize)]
pub struct ModeStatus {
    pub mode: ModeKind,
    pub description: &'static str,
    /// Local device class the mode occupies; `None` while a run is fed by a
    /// network SDR, which holds no local device
    pub device_class: Option<DeviceClass>,
    /// `host:port` of the network SDR feeding the current run
    pub remote: Option<String>,
    pub state: ModeState,
    pub cause: Option<String>,
    pub command: Option<String>,
    pub interface: Option<String>,
    pub pids: Vec<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_activity: Option<DateTime<Utc>>,
    pub events: u64,
    pub parse_anomalies: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    /// "ok", or "degraded" while any mode sits in Error
    pub status: &'static str,
    pub timestamp: DateTime<Utc>,
    pub modes: Vec<ModeStatus>,
    pub devices: Vec<DeviceStatus>,
    pub broadcast: BroadcastReport,
    pub live_processes: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct KillAllReport {
    /// Modes that had a run (or an error) to clear
    pub stopped: Vec<ModeKind>,
    pub live_processes: usize,
}

struct Inner {
    config: Config,
    arbiter: Arc<ResourceArbiter>,
    broadcaster: Arc<EventBroadcaster>,
    supervisor: Supervisor,
    /// Indexed by `ModeKind as usize`
    slots: [Mutex<ModeSlot>; 6],
    ops: [tokio::sync::Mutex<()>; 6],
    killing: AtomicBool,
}

#[derive(Clone)]
pub struct ModeController {
    inner: Arc<Inner>,
}

impl ModeController {
    pub fn new(config: Config, arbiter: Arc<ResourceArbiter>, broadcaster: Arc<EventBroadcaster>) -> Self {
        let supervisor = Supervisor::new(config.supervisor.crash_drain());
        Self {
            inner: Arc::new(Inner {
                config,
                arbiter,
                broadcaster,
                supervisor,
                slots: ModeKind::ALL.map(|mode| Mutex::new(ModeSlot::new(mode))),
                ops: ModeKind::ALL.map(|_| tokio::sync::Mutex::new(())),
                killing: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe(&self) -> Subscriber {
        self.inner.broadcaster.subscribe()
    }

    pub fn broadcaster(&self) -> &Arc<EventBroadcaster> {
        &self.inner.broadcaster
    }

    /// Validate, claim the device, launch and wait out the startup check. Returns once the mode is
    /// Running, or with the reason it is not.
    pub async fn start(&self, mode: ModeKind, params: &ModeParams) -> Result<ModeStatus, ControlError> {
        let params = params.validate(mode)?;
        let inner = self.inner.clone();

        let task = tokio::spawn(async move {
            let Ok(_op) = inner.ops[mode as usize].try_lock() else {
                if inner.killing.load(Ordering::SeqCst) {
                    return Err(ControlError::Stopping(mode));
                }
                return Err(match inner.slot(mode).state {
                    ModeState::Stopping => ControlError::Stopping(mode),
                    ModeState::Error => ControlError::InError(mode),
                    _ => ControlError::AlreadyActive(mode),
                });
            };
            inner.start_run(mode, params).await
        });

        match task.await {
            Ok(result) => result.map(|()| self.status(mode)),
            Err(e) => Err(ControlError::LaunchFailure {
                mode,
                message: format!("start task failed: {}", e),
            }),
        }
    }

    /// Stop a Starting/Running mode. No-op for Idle, Error and Stopping.
    pub async fn stop(&self, mode: ModeKind) -> ModeStatus {
        if self.inner.slot(mode).state == ModeState::Stopping {
            return self.status(mode);
        }

        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let _op = inner.ops[mode as usize].lock().await;
            inner.stop_locked(mode).await;
        });
        if let Err(e) = task.await {
            error!("[{}] Stop task failed: {}", mode, e);
        }
        self.status(mode)
    }

    /// Acknowledge an Error, returning the mode to Idle
    pub async fn reset(&self, mode: ModeKind) -> ModeStatus {
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            let _op = inner.ops[mode as usize].lock().await;
            inner.reset_locked(mode).await;
        });
        if let Err(e) = task.await {
            error!("[{}] Reset task failed: {}", mode, e);
        }
        self.status(mode)
    }

    /// Stop every mode, clear every error and release every device lock.
    /// No mode can start until the last lock is released.
    pub async fn kill_all(&self) -> KillAllReport {
        let inner = self.inner.clone();
        let task = tokio::spawn(async move {
            warn!("Kill-all requested");
            inner.killing.store(true, Ordering::SeqCst);

            // in table order, so concurrent kill-alls cannot deadlock
            let mut guards = Vec::with_capacity(inner.ops.len());
            for op in &inner.ops {
                guards.push(op.lock().await);
            }

            let per_mode = ModeKind::ALL.map(|mode| {
                let inner = &inner;
                async move {
                    let stopped = inner.stop_locked(mode).await;
                    let reset = inner.reset_locked(mode).await;
                    (mode, stopped || reset)
                }
            });
            let results = futures_util::future::join_all(per_mode).await;
            inner.arbiter.release_all().await;

            inner.killing.store(false, Ordering::SeqCst);
            drop(guards);

            results
                .into_iter()
                .filter_map(|(mode, touched)| touched.then_some(mode))
                .collect::<Vec<_>>()
        });

        let stopped = match task.await {
            Ok(stopped) => stopped,
            Err(e) => {
                error!("Kill-all task failed: {}", e);
                Vec::new()
            }
        };
        let live_processes = self.inner.supervisor.live_processes();
        info!("Kill-all done: {} mode(s) cleared, {} live pipelines", stopped.len(), live_processes);
        KillAllReport {
            stopped,
            live_processes,
        }
    }

    pub fn status(&self, mode: ModeKind) -> ModeStatus {
        self.inner.status(mode)
    }

    pub fn modes(&self) -> Vec<ModeStatus> {
        ModeKind::ALL.iter().map(|m| self.status(*m)).collect()
    }

    pub fn devices(&self) -> Vec<DeviceStatus> {
        self.inner.arbiter.snapshot()
    }

    /// Apply a device rescan
    pub fn refresh_devices(&self, registry: &DeviceRegistry) {
        self.inner.arbiter.refresh(registry);
    }

    pub fn health(&self) -> HealthReport {
        let modes = self.modes();
        let degraded = modes.iter().any(|m| m.state == ModeState::Error);
        HealthReport {
            status: if degraded { "degraded" } else { "ok" },
            timestamp: Utc::now(),
            modes,
            devices: self.devices(),
            broadcast: self.inner.broadcaster.report(),
            live_processes: self.inner.supervisor.live_processes(),
        }
    }
}

impl Inner {
    fn slot(&self, mode: ModeKind) -> MutexGuard<'_, ModeSlot> {
        self.slots[mode as usize]
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    fn status(&self, mode: ModeKind) -> ModeStatus {
        let slot = self.slot(mode);
        let definition = mode.definition();
        let handle = slot.run.handle.as_ref();
        ModeStatus {
            mode,
            description: definition.description,
            device_class: match slot.remote {
                Some(_) => None,
                None => Some(definition.device_class),
            },
            remote: slot.remote.clone(),
            state: slot.state,
            cause: slot.cause.clone(),
            command: slot.command.clone(),
            interface: slot.grant.as_ref().and_then(|g| g.interface.clone()),
            pids: handle.map(|h| h.pids().to_vec()).unwrap_or_default(),
            started_at: slot.started_at,
            last_activity: handle.map(|h| h.last_activity()),
            events: slot.stats.get_events(),
            parse_anomalies: slot.stats.get_anomalies(),
        }
    }

    fn emit_state(&self, seq: &Sequencer, mode: ModeKind, state: ModeState, cause: Option<String>) {
        match &cause {
            Some(cause) => info!("[{}] -> {} ({})", mode, state, cause),
            None => info!("[{}] -> {}", mode, state),
        }
        seq.emit(&self.broadcaster, EventPayload::ModeState(ModeStateChange { state, cause }));
    }

    async fn start_run(self: &Arc<Self>, mode: ModeKind, params: ValidatedParams) -> Result<(), ControlError> {
        let seq = {
            let mut slot = self.slot(mode);
            match slot.state {
                ModeState::Starting | ModeState::Running => return Err(ControlError::AlreadyActive(mode)),
                ModeState::Stopping => return Err(ControlError::Stopping(mode)),
                ModeState::Error => return Err(ControlError::InError(mode)),
                ModeState::Idle => {}
            }
            slot.begin_run(mode);
            slot.remote = params.remote.as_ref().map(|r| format!("{}:{}", r.host, r.port));
            slot.sequencer.clone()
        };
        self.emit_state(&seq, mode, ModeState::Starting, None);

        // a remote rtl_tcp source needs no local hardware and is reported
        // without a device class
        let grant = if params.remote.is_none() {
            let class = mode.device_class();
            match self.arbiter.acquire(class, mode).await {
                Ok(grant) => {
                    let mut slot = self.slot(mode);
                    slot.run.held = Some(class);
                    slot.grant = Some(grant.clone());
                    Some(grant)
                }
                Err(e) => {
                    let err = ControlError::from_arbiter(mode, e);
                    let next = match err {
                        ControlError::LaunchFailure { .. } => ModeState::Error,
                        _ => ModeState::Idle,
                    };
                    self.settle(mode, next, Some(err.to_string())).await;
                    return Err(err);
                }
            }
        } else {
            None
        };

        if let Some(Grant {
            renamed_from: Some(from),
            interface: Some(to),
            ..
        }) = &grant
        {
            seq.emit(
                &self.broadcaster,
                EventPayload::InterfaceRenamed(InterfaceRenamed {
                    from: from.clone(),
                    to: to.clone(),
                }),
            );
        }

        let spec = match build_command(mode, &params, grant.as_ref(), &self.config.tools) {
            Ok(spec) => spec,
            Err(e) => {
                self.settle(mode, ModeState::Idle, Some(e.to_string())).await;
                return Err(e.into());
            }
        };

        let mut handle = match self.supervisor.start(mode.as_str(), &spec) {
            Ok(handle) => handle,
            Err(e) => {
                let err = ControlError::from_launch(mode, e);
                self.settle(mode, ModeState::Error, Some(err.to_string())).await;
                return Err(err);
            }
        };
        let output = handle.take_output();
        let handle = Arc::new(handle);

        let stats = {
            let mut slot = self.slot(mode);
            slot.run.handle = Some(handle.clone());
            slot.command = Some(spec.to_string());
            slot.started_at = Some(handle.started_at());
            slot.stats.clone()
        };

        // parse from the first byte so the pipe never backs up during the startup check
        if let Some(output) = output {
            let decoder = EventDecoder::new(mode.as_str(), mode.definition().parser, stats);
            let pump = tokio::spawn(pump_events(output, decoder, seq.clone(), self.broadcaster.clone()));
            self.slot(mode).run.pump = Some(pump);
        }

        let startup = self.config.supervisor.startup_check();
        if let Ok(exit) = tokio::time::timeout(startup, handle.wait()).await {
            let err = ControlError::from_launch(
                mode,
                LaunchError::ExitedEarly {
                    status: exit,
                    stderr: handle.stderr_tail(),
                },
            );
            self.settle(mode, ModeState::Error, Some(err.to_string())).await;
            return Err(err);
        }

        let generation = {
            let mut slot = self.slot(mode);
            slot.state = ModeState::Running;
            slot.generation
        };
        self.emit_state(&seq, mode, ModeState::Running, None);

        let inner = self.clone();
        tokio::spawn(async move {
            let exit = handle.wait().await;
            inner.on_exit(mode, generation, exit, &handle).await;
        });
        Ok(())
    }

    /// The pipeline of a run ended; only an unrequested end of the current
    /// Running run is a crash.
    async fn on_exit(&self, mode: ModeKind, generation: u64, exit: ExitInfo, handle: &ProcessHandle) {
        let _op = self.ops[mode as usize].lock().await;
        {
            let slot = self.slot(mode);
            if exit.requested || slot.generation != generation || slot.state != ModeState::Running {
                return;
            }
        }

        let cause = match handle.stderr_tail().last() {
            Some(line) => format!("decoder exited unexpectedly ({}): {}", exit, line),
            None => format!("decoder exited unexpectedly ({})", exit),
        };
        error!("[{}] {}", mode, cause);
        self.settle(mode, ModeState::Error, Some(cause)).await;
    }

    /// Returns whether there was a run to stop
    async fn stop_locked(&self, mode: ModeKind) -> bool {
        let seq = {
            let mut slot = self.slot(mode);
            if !matches!(slot.state, ModeState::Starting | ModeState::Running) {
                return false;
            }
            slot.state = ModeState::Stopping;
            slot.sequencer.clone()
        };
        self.emit_state(&seq, mode, ModeState::Stopping, None);
        self.settle(mode, ModeState::Idle, None).await;
        true
    }

    /// Returns whether there was an error to clear
    async fn reset_locked(&self, mode: ModeKind) -> bool {
        if self.slot(mode).state != ModeState::Error {
            return false;
        }
        self.settle(mode, ModeState::Idle, None).await;
        true
    }

    /// Tear down whatever the run still owns, then enter `state`
    async fn settle(&self, mode: ModeKind, state: ModeState, cause: Option<String>) {
        let (run, seq) = {
            let mut slot = self.slot(mode);
            (slot.take_run(), slot.sequencer.clone())
        };
        self.teardown(mode, run).await;

        {
            let mut slot = self.slot(mode);
            slot.state = state;
            slot.cause = cause.clone();
        }
        self.emit_state(&seq, mode, state, cause);
    }

    async fn teardown(&self, mode: ModeKind, run: RunResources) {
        if let Some(handle) = run.handle {
            let outcome = handle.stop(self.config.supervisor.grace_period()).await;
            debug!("[{}] Pipeline ended: {:?}", mode, outcome);
        }

        // let the parser flush what the decoder wrote before exiting
        if let Some(pump) = run.pump {
            let abort = pump.abort_handle();
            if tokio::time::timeout(self.config.supervisor.crash_drain(), pump).await.is_err() {
                warn!("[{}] Output parser did not drain in time", mode);
                abort.abort();
            }
        }

        if let Some(class) = run.held {
            if let Err(e) = self.arbiter.release(class, mode).await {
                warn!("[{}] Failed to release {} device: {}", mode, class, e);
            }
        }
    }
}

async fn pump_events(
    output: ProcessOutput,
    decoder: EventDecoder,
    seq: Arc<Sequencer>,
    hub: Arc<EventBroadcaster>,
) {
    let mut events = Box::pin(parse(output, decoder));
    while let Some(payload) = events.next().await {
        seq.emit(&hub, payload);
    }
    debug!("[{}] Output closed", seq.mode);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::arbiter::{MonitorControl, MonitorError};
    use crate::broadcast::Received;
    use crate::config::{SupervisorConfig, ToolCommand, ToolPaths};
    use crate::device::Device;
    use crate::mode::{GainInput, NumberInput};

    struct RenamingMonitor;

    #[async_trait::async_trait]
    impl MonitorControl for RenamingMonitor {
        async fn enable(&self, iface: &str) -> Result<String, MonitorError> {
            Ok(format!("{}mon", iface))
        }

        async fn disable(&self, iface: &str) -> Result<String, MonitorError> {
            Ok(iface.trim_end_matches("mon").to_string())
        }
    }

    fn tool(script: &str, name: &str) -> ToolCommand {
        ToolCommand::with_args("sh", ["-c", script, name])
    }

    const LONG_RUNNING: &str = "exec sleep 30";

    fn controller(tools: ToolPaths) -> ModeController {
        let config = Config {
            tools,
            supervisor: SupervisorConfig {
                grace_period_ms: 500,
                startup_check_ms: 200,
                crash_drain_ms: 300,
            },
            ..Default::default()
        };
        let registry = DeviceRegistry::new(vec![
            Device::new(DeviceClass::Sdr, "1-1").with_index(0),
            Device::new(DeviceClass::Wifi, "wlan0").with_monitor_mode(true),
            Device::new(DeviceClass::Bluetooth, "hci0"),
        ]);
        let arbiter = Arc::new(ResourceArbiter::new(&registry, Arc::new(RenamingMonitor)));
        ModeController::new(config, arbiter, Arc::new(EventBroadcaster::new(64)))
    }

    async fn next_event(sub: &mut Subscriber) -> Arc<Event> {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), sub.recv()).await {
                Ok(Some(Received::Event(event))) => return event,
                Ok(Some(Received::Overrun(n))) => panic!("overrun by {}", n),
                Ok(None) => panic!("broadcaster closed"),
                Err(_) => panic!("no event within 5s"),
            }
        }
    }

    async fn wait_for_state(ctl: &ModeController, mode: ModeKind, state: ModeState) -> ModeStatus {
        for _ in 0..100 {
            let status = ctl.status(mode);
            if status.state == state {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        panic!("{} never reached {}", mode, state);
    }

    #[tokio::test]
    async fn test_start_publishes_sequenced_events() {
        let ctl = controller(ToolPaths {
            rtl_433: tool(
                r#"echo '{"model":"Acurite-Tower","id":7,"temperature_C":21.5}'; exec sleep 30"#,
                "rtl_433",
            ),
            ..Default::default()
        });
        let mut sub = ctl.subscribe();

        let status = ctl.start(ModeKind::Sensor, &ModeParams::default()).await.unwrap();
        assert_eq!(status.state, ModeState::Running);
        assert_eq!(status.pids.len(), 1);
        assert!(status.command.unwrap().contains("433.92M"));

        let first = next_event(&mut sub).await;
        assert_eq!(first.seq, 1);
        assert_eq!(
            first.payload,
            EventPayload::ModeState(ModeStateChange {
                state: ModeState::Starting,
                cause: None
            })
        );

        let mut last_seq = first.seq;
        let mut saw_reading = false;
        let mut saw_running = false;
        while !(saw_reading && saw_running) {
            let event = next_event(&mut sub).await;
            assert_eq!(event.mode, ModeKind::Sensor);
            assert_eq!(event.seq, last_seq + 1);
            last_seq = event.seq;
            match &event.payload {
                EventPayload::SensorReading(r) => {
                    assert_eq!(r.model, "Acurite-Tower");
                    saw_reading = true;
                }
                EventPayload::ModeState(s) if s.state == ModeState::Running => saw_running = true,
                other => panic!("unexpected {:?}", other),
            }
        }

        ctl.stop(ModeKind::Sensor).await;
    }

    #[tokio::test]
    async fn test_second_sdr_mode_is_busy() {
        let ctl = controller(ToolPaths {
            rtl_433: tool(LONG_RUNNING, "rtl_433"),
            ..Default::default()
        });
        ctl.start(ModeKind::Sensor, &ModeParams::default()).await.unwrap();

        match ctl.start(ModeKind::Adsb, &ModeParams::default()).await {
            Err(ControlError::DeviceBusy { class, holder }) => {
                assert_eq!(class, DeviceClass::Sdr);
                assert_eq!(holder, ModeKind::Sensor);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(ctl.status(ModeKind::Adsb).state, ModeState::Idle);

        assert!(matches!(
            ctl.start(ModeKind::Sensor, &ModeParams::default()).await,
            Err(ControlError::AlreadyActive(ModeKind::Sensor))
        ));

        ctl.kill_all().await;
    }

    #[tokio::test]
    async fn test_exit_during_startup_check_is_launch_failure() {
        let ctl = controller(ToolPaths {
            rtl_433: tool("echo 'usb_claim_interface error -6' >&2; exit 1", "rtl_433"),
            dump1090: tool(LONG_RUNNING, "dump1090"),
            ..Default::default()
        });

        match ctl.start(ModeKind::Sensor, &ModeParams::default()).await {
            Err(ControlError::LaunchFailure { message, .. }) => {
                assert!(message.contains("exit code 1"), "{}", message);
                assert!(message.contains("usb_claim_interface"), "{}", message);
            }
            other => panic!("unexpected {:?}", other),
        }
        let status = ctl.status(ModeKind::Sensor);
        assert_eq!(status.state, ModeState::Error);
        assert!(status.cause.is_some());

        // the device went back to the pool
        ctl.start(ModeKind::Adsb, &ModeParams::default()).await.unwrap();
        ctl.kill_all().await;
    }

    #[tokio::test]
    async fn test_missing_decoder_is_launch_failure() {
        let ctl = controller(ToolPaths {
            rtl_433: ToolCommand::new("/nonexistent/rtl_433"),
            ..Default::default()
        });
        assert!(matches!(
            ctl.start(ModeKind::Sensor, &ModeParams::default()).await,
            Err(ControlError::LaunchFailure { .. })
        ));
        assert_eq!(ctl.health().status, "degraded");
    }

    #[tokio::test]
    async fn test_crash_after_start_moves_to_error_and_releases() {
        let ctl = controller(ToolPaths {
            rtl_433: tool("sleep 0.6; echo 'device lost' >&2; exit 3", "rtl_433"),
            ..Default::default()
        });
        let mut sub = ctl.subscribe();
        ctl.start(ModeKind::Sensor, &ModeParams::default()).await.unwrap();

        let status = wait_for_state(&ctl, ModeKind::Sensor, ModeState::Error).await;
        let cause = status.cause.unwrap();
        assert!(cause.contains("exit code 3"), "{}", cause);
        assert!(cause.contains("device lost"), "{}", cause);

        let sdr = ctl.devices().into_iter().find(|d| d.class == DeviceClass::Sdr).unwrap();
        assert_eq!(sdr.holder, None);

        // the Error transition is published
        loop {
            let event = next_event(&mut sub).await;
            if let EventPayload::ModeState(s) = &event.payload {
                if s.state == ModeState::Error {
                    assert!(s.cause.is_some());
                    break;
                }
            }
        }

        // stop acknowledges nothing and start is refused; reset does
        assert_eq!(ctl.stop(ModeKind::Sensor).await.state, ModeState::Error);
        match ctl.start(ModeKind::Sensor, &ModeParams::default()).await {
            Err(e @ ControlError::InError(ModeKind::Sensor)) => assert_eq!(e.kind(), "in_error"),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(ctl.status(ModeKind::Sensor).state, ModeState::Error);

        assert_eq!(ctl.reset(ModeKind::Sensor).await.state, ModeState::Idle);
        let status = ctl.start(ModeKind::Sensor, &ModeParams::default()).await.unwrap();
        assert_eq!(status.state, ModeState::Running);
        assert_eq!(status.cause, None);
        ctl.kill_all().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_leaves_nothing_running() {
        let ctl = controller(ToolPaths {
            bluetoothctl: tool(LONG_RUNNING, "bluetoothctl"),
            ..Default::default()
        });
        ctl.start(ModeKind::BluetoothScan, &ModeParams::default()).await.unwrap();
        assert_eq!(ctl.health().live_processes, 1);

        assert_eq!(ctl.stop(ModeKind::BluetoothScan).await.state, ModeState::Idle);
        assert_eq!(ctl.stop(ModeKind::BluetoothScan).await.state, ModeState::Idle);
        assert_eq!(ctl.stop(ModeKind::Pager).await.state, ModeState::Idle);
        assert_eq!(ctl.health().live_processes, 0);

        // and can be started again
        ctl.start(ModeKind::BluetoothScan, &ModeParams::default()).await.unwrap();
        ctl.stop(ModeKind::BluetoothScan).await;
    }

    #[tokio::test]
    async fn test_repeated_start_stop_leaks_nothing() {
        let ctl = controller(ToolPaths {
            dump1090: tool("echo 'Mode S decoder ready' >&2; exec sleep 30", "dump1090"),
            ..Default::default()
        });
        for _ in 0..5 {
            ctl.start(ModeKind::Adsb, &ModeParams::default()).await.unwrap();
            let pids = ctl.status(ModeKind::Adsb).pids;
            ctl.stop(ModeKind::Adsb).await;

            assert_eq!(ctl.health().live_processes, 0);
            for pid in pids {
                assert!(!crate::supervisor::pid_alive(pid), "pid {} survived", pid);
            }
        }
    }

    #[tokio::test]
    async fn test_start_while_stopping_is_rejected() {
        let ctl = controller(ToolPaths {
            rtl_433: tool("trap '' INT; exec sleep 30", "rtl_433"),
            ..Default::default()
        });
        ctl.start(ModeKind::Sensor, &ModeParams::default()).await.unwrap();

        let stopper = {
            let ctl = ctl.clone();
            tokio::spawn(async move { ctl.stop(ModeKind::Sensor).await })
        };
        wait_for_state(&ctl, ModeKind::Sensor, ModeState::Stopping).await;

        assert!(matches!(
            ctl.start(ModeKind::Sensor, &ModeParams::default()).await,
            Err(ControlError::Stopping(ModeKind::Sensor))
        ));
        // a second stop while stopping is a no-op
        assert_eq!(ctl.stop(ModeKind::Sensor).await.state, ModeState::Stopping);

        assert_eq!(stopper.await.unwrap().state, ModeState::Idle);
    }

    #[tokio::test]
    async fn test_invalid_parameters_leave_mode_idle() {
        let ctl = controller(ToolPaths::default());
        let params = ModeParams {
            gain: Some(GainInput::Number(75.0)),
            ..Default::default()
        };
        assert!(matches!(
            ctl.start(ModeKind::Pager, &params).await,
            Err(ControlError::InvalidParameter(_))
        ));
        assert_eq!(ctl.status(ModeKind::Pager).state, ModeState::Idle);
        assert_eq!(ctl.health().live_processes, 0);
    }

    #[tokio::test]
    async fn test_wifi_rename_is_surfaced() {
        let ctl = controller(ToolPaths {
            tshark: tool(LONG_RUNNING, "tshark"),
            ..Default::default()
        });
        let mut sub = ctl.subscribe();

        let status = ctl.start(ModeKind::WifiScan, &ModeParams::default()).await.unwrap();
        assert_eq!(status.interface.as_deref(), Some("wlan0mon"));
        assert!(status.command.unwrap().contains("-i wlan0mon"));

        let _starting = next_event(&mut sub).await;
        let renamed = next_event(&mut sub).await;
        assert_eq!(
            renamed.payload,
            EventPayload::InterfaceRenamed(InterfaceRenamed {
                from: "wlan0".into(),
                to: "wlan0mon".into(),
            })
        );

        ctl.stop(ModeKind::WifiScan).await;
    }

    #[tokio::test]
    async fn test_kill_all_clears_everything() {
        let ctl = controller(ToolPaths {
            rtl_433: tool(LONG_RUNNING, "rtl_433"),
            bluetoothctl: tool("trap '' INT; exec sleep 30", "bluetoothctl"),
            tshark: tool("exit 2", "tshark"),
            ..Default::default()
        });
        ctl.start(ModeKind::Sensor, &ModeParams::default()).await.unwrap();
        ctl.start(ModeKind::BluetoothScan, &ModeParams::default()).await.unwrap();
        assert!(ctl.start(ModeKind::WifiScan, &ModeParams::default()).await.is_err());

        let report = ctl.kill_all().await;
        assert_eq!(report.live_processes, 0);
        assert_eq!(
            report.stopped,
            vec![ModeKind::Sensor, ModeKind::WifiScan, ModeKind::BluetoothScan]
        );

        let health = ctl.health();
        assert_eq!(health.status, "ok");
        assert!(health.modes.iter().all(|m| m.state == ModeState::Idle));
        assert!(health.devices.iter().all(|d| d.holder.is_none()));
    }

    /// Running modes per local device class, checked against the arbiter
    fn assert_one_holder_per_class(ctl: &ModeController) {
        let modes = ctl.modes();
        let devices = ctl.devices();
        for class in DeviceClass::ALL {
            let running: Vec<ModeKind> = modes
                .iter()
                .filter(|m| m.state == ModeState::Running && m.device_class == Some(class))
                .map(|m| m.mode)
                .collect();
            assert!(running.len() <= 1, "{} held by {:?}", class, running);

            let holder = devices.iter().find(|d| d.class == class).and_then(|d| d.holder);
            assert_eq!(holder, running.first().copied(), "{} holder out of step", class);
        }
    }

    #[tokio::test]
    async fn test_remote_sensor_holds_no_local_sdr() {
        let ctl = controller(ToolPaths {
            rtl_433: tool(LONG_RUNNING, "rtl_433"),
            dump1090: tool(LONG_RUNNING, "dump1090"),
            ..Default::default()
        });
        let remote = ModeParams {
            rtl_tcp_host: Some("10.0.0.5".into()),
            rtl_tcp_port: Some(NumberInput::Number(1234.0)),
            ..Default::default()
        };

        let sensor = ctl.start(ModeKind::Sensor, &remote).await.unwrap();
        assert_eq!(sensor.state, ModeState::Running);
        assert_eq!(sensor.device_class, None);
        assert_eq!(sensor.remote.as_deref(), Some("10.0.0.5:1234"));
        assert!(sensor.command.unwrap().contains("rtl_tcp:10.0.0.5:1234"));

        let adsb = ctl.start(ModeKind::Adsb, &ModeParams::default()).await.unwrap();
        assert_eq!(adsb.device_class, Some(DeviceClass::Sdr));
        assert_one_holder_per_class(&ctl);

        let sensor = ctl.stop(ModeKind::Sensor).await;
        assert_eq!(sensor.device_class, Some(DeviceClass::Sdr));
        assert_eq!(sensor.remote, None);

        // a local run of the same mode now competes for the SDR as usual
        assert!(matches!(
            ctl.start(ModeKind::Sensor, &ModeParams::default()).await,
            Err(ControlError::DeviceBusy { holder: ModeKind::Adsb, .. })
        ));
        ctl.kill_all().await;
    }

    #[tokio::test]
    async fn test_start_during_kill_all_is_refused() {
        let ctl = controller(ToolPaths {
            rtl_433: tool("trap '' INT; exec sleep 30", "rtl_433"),
            dump1090: tool(LONG_RUNNING, "dump1090"),
            ..Default::default()
        });
        ctl.start(ModeKind::Sensor, &ModeParams::default()).await.unwrap();

        let killer = {
            let ctl = ctl.clone();
            tokio::spawn(async move { ctl.kill_all().await })
        };
        wait_for_state(&ctl, ModeKind::Sensor, ModeState::Stopping).await;

        assert!(matches!(
            ctl.start(ModeKind::Adsb, &ModeParams::default()).await,
            Err(ControlError::Stopping(ModeKind::Adsb))
        ));

        let report = killer.await.unwrap();
        assert_eq!(report.stopped, vec![ModeKind::Sensor]);
        assert_one_holder_per_class(&ctl);

        // nothing is left blocked afterwards
        ctl.start(ModeKind::Adsb, &ModeParams::default()).await.unwrap();
        assert_one_holder_per_class(&ctl);
        ctl.kill_all().await;
    }

    #[tokio::test]
    async fn test_kill_all_racing_starts_keeps_locks_consistent() {
        let ctl = controller(ToolPaths {
            rtl_433: tool(LONG_RUNNING, "rtl_433"),
            dump1090: tool(LONG_RUNNING, "dump1090"),
            ..Default::default()
        });

        for _ in 0..4 {
            ctl.start(ModeKind::Sensor, &ModeParams::default()).await.unwrap();

            let mut tasks = Vec::new();
            for mode in [ModeKind::Adsb, ModeKind::Sensor, ModeKind::Adsb] {
                let ctl = ctl.clone();
                tasks.push(tokio::spawn(async move {
                    let _ = ctl.start(mode, &ModeParams::default()).await;
                }));
            }
            let killer = {
                let ctl = ctl.clone();
                tokio::spawn(async move {
                    ctl.kill_all().await;
                })
            };
            for mode in [ModeKind::Adsb, ModeKind::Sensor] {
                let ctl = ctl.clone();
                tasks.push(tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    let _ = ctl.start(mode, &ModeParams::default()).await;
                }));
            }

            killer.await.unwrap();
            for task in tasks {
                task.await.unwrap();
            }

            assert_one_holder_per_class(&ctl);
            let running = ctl.modes().iter().filter(|m| m.state == ModeState::Running).count();
            assert_eq!(ctl.health().live_processes, running);

            ctl.kill_all().await;
            assert_one_holder_per_class(&ctl);
            assert_eq!(ctl.health().live_processes, 0);
        }
    }
}
