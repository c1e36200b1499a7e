//! [`Bridge`] – the Device Bridge fast loop.
//!
//! One task owns the bus connection, the device link and the device driver.
//! Every tick runs the same five steps, strictly in order:
//!
//! 1. **Reconnect gate** – reconnect the bus (skip the rest of the tick while
//!    it is down) and the device (a dead device does not stop publishing).
//! 2. **Command scan** – read the whole command window in one request.
//! 3. **Execute** – admit, run and acknowledge a new command by zeroing the
//!    whole window.
//! 4. **Device poll** – every `poll_divider`-th tick.
//! 5. **Status publish** – exactly one multi-register write of the status
//!    window.
//!
//! # Command admission
//!
//! | Situation | Result |
//! |---|---|
//! | `command_id == 0` | nothing pending |
//! | `command_id` equals the last consumed id | window cleared, nothing run |
//! | opcode 0 | window cleared, no device I/O |
//! | device down | fails with `NoDevice` |
//! | inside `command_delay` after a command | deferred, except stop / emergency stop |
//! | bridge in `Error` | only 2, 6, 7 run; others fail with `FaultActive` |
//! | opcode or param invalid | fails with `IllegalOpcode` / `ParamOutOfRange` |
//! | required param still zero | deferred up to `torn_command_ticks`, then `TornCommand` |
//!
//! Every consumed command is cleared, whatever its outcome; the client reads
//! the result from `last_error_code`.  Because commands are scanned before
//! the poll, an emergency stop sent during a motion is the next device I/O.

use std::time::Duration;

use m1cell_bus::{Backoff, BusConnector, RegisterIo, TcpConnector};
use m1cell_hal::{Device, DeviceLink, LinkOpener, Verdict, build_device, build_opener, check_command, opcode_name};
use m1cell_types::config::ModuleConfig;
use m1cell_types::layout::{RegisterWindow, opcode};
use m1cell_types::{CellError, CommandRecord, ErrorCode, StatusWindow};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::state::{BridgePhase, Counters};
use crate::watchdog::{LinkHealth, Watchdog};

/// Consecutive device failures that mark the device as lost.
pub const DEVICE_FAILURE_THRESHOLD: u32 = 3;
/// Ticks a command may wait for its required params before it is rejected.
pub const TORN_COMMAND_TICKS: u32 = 3;

const DEVICE_LINK: &str = "device";
const MIN_WATCHDOG: Duration = Duration::from_secs(1);

// ────────────────────────────────────────────────────────────────────────────
// Configuration and reports
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub module_id: String,
    pub status: RegisterWindow,
    pub command: RegisterWindow,
    pub loop_interval: Duration,
    pub poll_divider: u32,
    pub command_delay: Duration,
    pub device_failure_threshold: u32,
    pub torn_command_ticks: u32,
    /// A device with no successful transaction for this long is reopened.
    /// Always longer than `command_delay`, during which polls are held.
    pub watchdog_timeout: Duration,
}

impl BridgeConfig {
    pub fn from_module(cfg: &ModuleConfig) -> Self {
        let loop_interval = Duration::from_millis(cfg.timing.fast_loop_interval_ms);
        let poll_divider = cfg.timing.poll_divider();
        let poll_period = loop_interval * poll_divider;
        Self {
            module_id: cfg.module_id.clone(),
            status: cfg.status_window(),
            command: cfg.command_window(),
            loop_interval,
            poll_divider,
            command_delay: Duration::from_millis(cfg.timing.command_delay_ms),
            device_failure_threshold: DEVICE_FAILURE_THRESHOLD,
            torn_command_ticks: TORN_COMMAND_TICKS,
            watchdog_timeout: (poll_period * 3).max(MIN_WATCHDOG)
                + Duration::from_millis(cfg.timing.command_delay_ms),
        }
    }
}

/// Why a pending command was left in the window for a later tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeferReason {
    /// A required param still reads zero.
    Torn,
    /// Inside `command_delay` after the previous command.
    CommandDelay,
}

/// What happened to the command window during one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Completed { cid: u16, opcode: u16 },
    Failed { cid: u16, opcode: u16, code: ErrorCode },
    Deferred { cid: u16, reason: DeferReason },
    /// The id was already consumed; the window was cleared again.
    Duplicate { cid: u16 },
}

/// Summary of one [`Bridge::tick`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub bus_up: bool,
    pub device_online: bool,
    pub command: Option<CommandOutcome>,
    pub polled: bool,
    pub published: bool,
}

enum Admission {
    Nop,
    Execute,
    Reject(CellError),
    Defer(DeferReason),
}

// ────────────────────────────────────────────────────────────────────────────
// Bridge
// ────────────────────────────────────────────────────────────────────────────

pub struct Bridge {
    cfg: BridgeConfig,
    connector: Box<dyn BusConnector>,
    opener: Box<dyn LinkOpener>,
    device: Box<dyn Device>,

    bus: Option<Box<dyn RegisterIo>>,
    link: Option<Box<dyn DeviceLink>>,
    bus_backoff: Backoff,
    device_backoff: Backoff,
    watchdog: Watchdog,

    phase: BridgePhase,
    counters: Counters,
    executing: bool,
    last_seen: Option<u16>,
    torn: Option<(u16, u32)>,
    device_failures: u32,
    quiet_until: Option<Instant>,
    ticks: u64,

    status_tx: watch::Sender<StatusWindow>,
}

impl Bridge {
    pub fn new(
        cfg: BridgeConfig,
        connector: Box<dyn BusConnector>,
        opener: Box<dyn LinkOpener>,
        device: Box<dyn Device>,
    ) -> Self {
        let (status_tx, _) = watch::channel(StatusWindow::new());
        Self {
            cfg,
            connector,
            opener,
            device,
            bus: None,
            link: None,
            bus_backoff: Backoff::default(),
            device_backoff: Backoff::default(),
            watchdog: Watchdog::new(),
            phase: BridgePhase::Init,
            counters: Counters::default(),
            executing: false,
            last_seen: None,
            torn: None,
            device_failures: 0,
            quiet_until: None,
            ticks: 0,
            status_tx,
        }
    }

    /// Build a bridge for a validated module configuration: Modbus TCP to
    /// `bus.host:bus.port`, the family driver, and a serial or simulated
    /// device link.
    pub fn from_config(cfg: &ModuleConfig) -> Result<Self, CellError> {
        cfg.validate()?;
        let connector = TcpConnector::new(
            &cfg.bus.host,
            cfg.bus.port,
            cfg.bus.slave_id,
            Duration::from_millis(cfg.bus.timeout_ms),
        );
        Ok(Self::new(
            BridgeConfig::from_module(cfg),
            Box::new(connector),
            build_opener(cfg)?,
            build_device(&cfg.device)?,
        ))
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.cfg
    }

    pub fn phase(&self) -> BridgePhase {
        self.phase
    }

    pub fn counters(&self) -> &Counters {
        &self.counters
    }

    pub fn is_bus_up(&self) -> bool {
        self.bus.is_some()
    }

    pub fn is_device_online(&self) -> bool {
        self.link.is_some()
    }

    /// Latest published status snapshot, for in-process observers.
    pub fn subscribe(&self) -> watch::Receiver<StatusWindow> {
        self.status_tx.subscribe()
    }

    /// Drive the loop until `shutdown` flips to `true` (or its sender is
    /// dropped), then publish a final offline snapshot.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            module = %self.cfg.module_id,
            kind = %self.device.kind(),
            bus = %self.connector.describe(),
            device = %self.opener.describe(),
            status = %self.cfg.status,
            command = %self.cfg.command,
            interval_ms = self.cfg.loop_interval.as_millis() as u64,
            poll_divider = self.cfg.poll_divider,
            "fast loop started"
        );
        let mut interval = tokio::time::interval(self.cfg.loop_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let report = self.tick().await;
                    trace!(module = %self.cfg.module_id, ?report, "tick");
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.stop().await;
    }

    /// Run one tick.
    pub async fn tick(&mut self) -> TickReport {
        let now = Instant::now();
        let mut report = TickReport::default();

        if self.ensure_bus(now).await {
            self.ensure_device(now).await;
            report.command = self.scan_and_execute(now).await;
            if self.bus.is_some() {
                report.polled = self.maybe_poll(now).await;
                self.check_watchdog(Instant::now());
                report.published = self.publish().await;
            }
        }

        report.bus_up = self.bus.is_some();
        report.device_online = self.link.is_some();
        self.ticks = self.ticks.wrapping_add(1);
        report
    }

    async fn stop(&mut self) {
        self.link = None;
        self.watchdog.disarm(DEVICE_LINK);
        self.phase = BridgePhase::DeviceDown;
        self.publish().await;
        info!(module = %self.cfg.module_id, "fast loop stopped");
    }

    // ── Step 1: reconnect gate ────────────────────────────────────────────────

    async fn ensure_bus(&mut self, now: Instant) -> bool {
        if self.bus.is_some() {
            return true;
        }
        if !self.bus_backoff.ready(now) {
            return false;
        }
        match self.connector.connect().await {
            Ok(io) => {
                info!(module = %self.cfg.module_id, bus = %self.connector.describe(), "bus connected");
                self.bus = Some(io);
                self.bus_backoff.succeeded();
                if self.phase == BridgePhase::Init {
                    self.phase = BridgePhase::BusReady;
                }
                true
            }
            Err(e) => {
                let wait = self.bus_backoff.failed(now);
                if self.bus_backoff.failures() == 1 {
                    warn!(module = %self.cfg.module_id, error = %e, "bus unreachable");
                } else {
                    debug!(module = %self.cfg.module_id, error = %e, retry_ms = wait.as_millis() as u64, "bus still unreachable");
                }
                false
            }
        }
    }

    async fn ensure_device(&mut self, now: Instant) {
        if self.link.is_some() || !self.device_backoff.ready(now) {
            return;
        }
        let opened = match self.opener.open().await {
            Ok(mut link) => self.device.connect(link.as_mut()).await.map(|()| link),
            Err(e) => Err(e),
        };
        match opened {
            Ok(link) => {
                info!(module = %self.cfg.module_id, device = %self.opener.describe(), "device connected");
                self.link = Some(link);
                self.device_backoff.succeeded();
                self.device_failures = 0;
                self.watchdog.arm(DEVICE_LINK, self.cfg.watchdog_timeout, Instant::now());
                self.phase = BridgePhase::Ready;
                self.observe_fault();
            }
            Err(e) => {
                let wait = self.device_backoff.failed(now);
                if self.phase != BridgePhase::DeviceDown {
                    warn!(module = %self.cfg.module_id, error = %e, "device unreachable");
                } else {
                    debug!(module = %self.cfg.module_id, error = %e, retry_ms = wait.as_millis() as u64, "device still unreachable");
                }
                self.phase = BridgePhase::DeviceDown;
            }
        }
    }

    // ── Steps 2 and 3: command scan and execute ───────────────────────────────

    async fn scan_and_execute(&mut self, now: Instant) -> Option<CommandOutcome> {
        let raw = self.bus_read(self.cfg.command.base, self.cfg.command.len).await?;
        let cmd = CommandRecord::from_registers(&raw)?;
        if !cmd.is_pending() {
            self.torn = None;
            return None;
        }
        let cid = cmd.command_id;
        if self.last_seen == Some(cid) {
            debug!(module = %self.cfg.module_id, cid, "command id already consumed");
            self.clear_command_window().await;
            return Some(CommandOutcome::Duplicate { cid });
        }

        let result = match self.admit(&cmd, now) {
            Admission::Defer(reason) => {
                debug!(module = %self.cfg.module_id, cid, ?reason, "command deferred");
                return Some(CommandOutcome::Deferred { cid, reason });
            }
            Admission::Nop => {
                self.counters.record_success(cid, false);
                Ok(())
            }
            Admission::Reject(e) => Err(e),
            Admission::Execute => self.execute(&cmd).await,
        };

        self.torn = None;
        self.last_seen = Some(cid);
        let name = opcode_name(self.device.opcodes(), cmd.opcode);
        let outcome = match result {
            Ok(()) => {
                info!(module = %self.cfg.module_id, cid, opcode = cmd.opcode, name, "command completed");
                CommandOutcome::Completed { cid, opcode: cmd.opcode }
            }
            Err(e) => {
                warn!(module = %self.cfg.module_id, cid, opcode = cmd.opcode, name, error = %e, "command failed");
                self.counters.record_failure(cid, &e);
                CommandOutcome::Failed {
                    cid,
                    opcode: cmd.opcode,
                    code: e.code(),
                }
            }
        };
        self.clear_command_window().await;
        Some(outcome)
    }

    fn admit(&mut self, cmd: &CommandRecord, now: Instant) -> Admission {
        if cmd.opcode == opcode::NOP {
            return Admission::Nop;
        }
        if self.link.is_none() {
            return Admission::Reject(CellError::DeviceUnreachable(format!(
                "{} device offline",
                self.cfg.module_id
            )));
        }
        let urgent = matches!(cmd.opcode, opcode::STOP | opcode::EMERGENCY_STOP);
        if !urgent && self.quiet_until.is_some_and(|t| now < t) {
            return Admission::Defer(DeferReason::CommandDelay);
        }
        if self.phase == BridgePhase::Error && !urgent && cmd.opcode != opcode::RESET_ERROR {
            let code = self.device.status().fault().unwrap_or(0);
            return Admission::Reject(CellError::FaultActive(code));
        }
        match check_command(self.device.opcodes(), cmd) {
            Ok(Verdict::Ready) => Admission::Execute,
            Ok(Verdict::Unsettled) => {
                let seen = match self.torn {
                    Some((cid, n)) if cid == cmd.command_id => n + 1,
                    _ => 1,
                };
                self.torn = Some((cmd.command_id, seen));
                if seen > self.cfg.torn_command_ticks {
                    Admission::Reject(CellError::TornCommand(cmd.command_id))
                } else {
                    Admission::Defer(DeferReason::Torn)
                }
            }
            Err(e) => Admission::Reject(e),
        }
    }

    async fn execute(&mut self, cmd: &CommandRecord) -> Result<(), CellError> {
        let Some(link) = self.link.as_mut() else {
            return Err(CellError::DeviceUnreachable("device offline".into()));
        };
        let was = self.phase;
        self.phase = BridgePhase::Executing;
        self.executing = true;
        let result = self.device.execute(link.as_mut(), cmd).await;
        self.executing = false;
        self.phase = match (was, cmd.opcode, &result) {
            (BridgePhase::Error, opcode::RESET_ERROR, Ok(())) => {
                info!(module = %self.cfg.module_id, "device fault reset");
                BridgePhase::Ready
            }
            (BridgePhase::Error, _, _) => BridgePhase::Error,
            _ => BridgePhase::Ready,
        };

        let done = Instant::now();
        match &result {
            Ok(()) => {
                self.device_ok(done);
                self.counters.record_success(cmd.command_id, true);
                if !self.cfg.command_delay.is_zero() {
                    self.quiet_until = Some(done + self.cfg.command_delay);
                }
            }
            Err(e) => self.device_failed(e, done),
        }
        result
    }

    async fn clear_command_window(&mut self) {
        let zeros = vec![0u16; usize::from(self.cfg.command.len)];
        self.bus_write(self.cfg.command.base, &zeros).await;
    }

    // ── Step 4: device poll ───────────────────────────────────────────────────

    async fn maybe_poll(&mut self, now: Instant) -> bool {
        if self.quiet_until.is_some_and(|t| now < t) {
            return false;
        }
        if self.ticks % u64::from(self.cfg.poll_divider.max(1)) != 0 {
            return false;
        }
        let Some(link) = self.link.as_mut() else {
            return false;
        };
        match self.device.poll(link.as_mut()).await {
            Ok(()) => {
                self.device_ok(Instant::now());
                self.observe_fault();
                true
            }
            Err(e) => {
                debug!(module = %self.cfg.module_id, error = %e, "device poll failed");
                self.device_failed(&e, Instant::now());
                false
            }
        }
    }

    fn observe_fault(&mut self) {
        if let Some(code) = self.device.status().fault()
            && self.phase != BridgePhase::Error
        {
            warn!(module = %self.cfg.module_id, fault = code, "device reports fault");
            self.phase = BridgePhase::Error;
        }
    }

    fn device_ok(&mut self, now: Instant) {
        self.device_failures = 0;
        self.watchdog.heartbeat(DEVICE_LINK, now);
    }

    fn device_failed(&mut self, err: &CellError, now: Instant) {
        if !err.is_link_failure() {
            return;
        }
        self.device_failures += 1;
        if self.device_failures >= self.cfg.device_failure_threshold {
            self.drop_device(now, "repeated device failures");
        }
    }

    fn check_watchdog(&mut self, now: Instant) {
        if self.link.is_some() && self.watchdog.health(DEVICE_LINK, now) == LinkHealth::Silent {
            self.drop_device(now, "device silent");
        }
    }

    fn drop_device(&mut self, now: Instant, reason: &str) {
        warn!(module = %self.cfg.module_id, reason, failures = self.device_failures, "device lost");
        self.link = None;
        self.watchdog.disarm(DEVICE_LINK);
        self.device_failures = 0;
        self.device_backoff.failed(now);
        self.phase = BridgePhase::DeviceDown;
    }

    // ── Step 5: status publish ────────────────────────────────────────────────

    fn compose(&self) -> StatusWindow {
        let device = self.device.status();
        let online = self.link.is_some();
        let mut window = StatusWindow::new();
        device.encode(&mut window);
        window.set_module_state(self.phase.module_state(online && device.in_motion()));
        window.set_device_online(online);
        window.set_error_count(self.counters.error_count);
        window.set_executing(self.executing);
        window.set_last_error_code(self.counters.last_error_code.as_u16());
        window.set_op_count(self.counters.op_count);
        window.set_last_command_id(self.counters.last_command_id);
        window.set_timestamp_lo(timestamp_lo());
        window
    }

    async fn publish(&mut self) -> bool {
        let window = self.compose();
        if self.bus_write(self.cfg.status.base, window.registers()).await {
            self.status_tx.send_replace(window);
            true
        } else {
            false
        }
    }

    // ── Bus helpers ───────────────────────────────────────────────────────────

    async fn bus_read(&mut self, addr: u16, count: u16) -> Option<Vec<u16>> {
        let bus = self.bus.as_mut()?;
        match bus.read(addr, count).await {
            Ok(values) => Some(values),
            Err(e) => {
                self.bus_failed(&e);
                None
            }
        }
    }

    async fn bus_write(&mut self, addr: u16, values: &[u16]) -> bool {
        let Some(bus) = self.bus.as_mut() else {
            return false;
        };
        match bus.write(addr, values).await {
            Ok(()) => true,
            Err(e) => {
                self.bus_failed(&e);
                false
            }
        }
    }

    fn bus_failed(&mut self, err: &CellError) {
        if matches!(err, CellError::BusUnreachable(_)) {
            warn!(module = %self.cfg.module_id, error = %err, "bus connection lost");
            self.bus = None;
            self.bus_backoff.failed(Instant::now());
        } else {
            warn!(module = %self.cfg.module_id, error = %err, "bus rejected request");
        }
    }
}

/// Wall-clock seconds modulo 2^16.
pub fn timestamp_lo() -> u16 {
    chrono::Utc::now().timestamp().rem_euclid(1 << 16) as u16
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use async_trait::async_trait;
    use m1cell_bus::{LocalConnector, RegisterBank};
    use m1cell_hal::led::{self, LedController, LedOptions};
    use m1cell_hal::{SimLink, SimOpener};
    use m1cell_types::layout::led as led_status;
    use m1cell_types::{DeviceKind, ModuleState};

    use super::*;

    // ── Test doubles ─────────────────────────────────────────────────────────

    /// Local bus that can be unplugged and counts status-window writes.
    #[derive(Clone)]
    struct TestBus {
        bank: Arc<RegisterBank>,
        up: Arc<AtomicBool>,
        status_writes: Arc<AtomicUsize>,
        status_base: u16,
    }

    struct TestIo {
        inner: Box<dyn RegisterIo>,
        bus: TestBus,
    }

    impl TestIo {
        fn check(&self) -> Result<(), CellError> {
            if self.bus.up.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(CellError::BusUnreachable("unplugged".into()))
            }
        }
    }

    #[async_trait]
    impl RegisterIo for TestIo {
        async fn read(&mut self, addr: u16, count: u16) -> Result<Vec<u16>, CellError> {
            self.check()?;
            self.inner.read(addr, count).await
        }

        async fn write(&mut self, addr: u16, values: &[u16]) -> Result<(), CellError> {
            self.check()?;
            if addr == self.bus.status_base {
                self.bus.status_writes.fetch_add(1, Ordering::SeqCst);
            }
            self.inner.write(addr, values).await
        }

        async fn write_single(&mut self, addr: u16, value: u16) -> Result<(), CellError> {
            self.write(addr, &[value]).await
        }
    }

    #[async_trait]
    impl BusConnector for TestBus {
        async fn connect(&self) -> Result<Box<dyn RegisterIo>, CellError> {
            if !self.up.load(Ordering::SeqCst) {
                return Err(CellError::BusUnreachable("unplugged".into()));
            }
            let inner = LocalConnector::new(Arc::clone(&self.bank)).connect().await?;
            Ok(Box::new(TestIo {
                inner,
                bus: self.clone(),
            }))
        }

        fn describe(&self) -> String {
            "test".into()
        }
    }

    struct Rig {
        bridge: Bridge,
        bus: TestBus,
        link: SimLink,
    }

    impl Rig {
        fn led() -> Self {
            let mut module = ModuleConfig::new("led", DeviceKind::LedController, 500);
            module.timing.device_poll_divider = Some(1000);
            Self::with_config(BridgeConfig::from_module(&module))
        }

        fn with_config(cfg: BridgeConfig) -> Self {
            let bus = TestBus {
                bank: Arc::new(RegisterBank::new(1000)),
                up: Arc::new(AtomicBool::new(true)),
                status_writes: Arc::new(AtomicUsize::new(0)),
                status_base: cfg.status.base,
            };
            let link = led::sim_link();
            let bridge = Bridge::new(
                cfg,
                Box::new(bus.clone()),
                Box::new(SimOpener::new(link.clone())),
                Box::new(LedController::new(LedOptions::default())),
            );
            Self { bridge, bus, link }
        }

        fn submit(&self, regs: &[u16]) {
            self.bus.bank.write(520, regs).expect("command write");
        }

        fn command_window(&self) -> Vec<u16> {
            self.bus.bank.read(520, 5).expect("command read")
        }

        fn status(&self) -> StatusWindow {
            let raw = self.bus.bank.read(500, 20).expect("status read");
            StatusWindow::from_registers(&raw).expect("status window")
        }
    }

    // ── Tests ────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn first_tick_connects_and_publishes() {
        let mut rig = Rig::led();
        let report = rig.bridge.tick().await;
        assert!(report.bus_up && report.device_online && report.published);
        assert!(report.polled);
        let status = rig.status();
        assert_eq!(status.module_state(), Some(ModuleState::Idle));
        assert!(status.device_online());
        assert_eq!(rig.bridge.phase(), BridgePhase::Ready);
    }

    #[tokio::test]
    async fn command_executes_and_window_is_cleared() {
        let mut rig = Rig::led();
        rig.bridge.tick().await;
        rig.submit(&[4, 2, 300, 1234, 0]);
        let report = rig.bridge.tick().await;
        assert_eq!(
            report.command,
            Some(CommandOutcome::Completed { cid: 1234, opcode: 4 })
        );
        assert_eq!(rig.command_window(), vec![0; 5]);
        let status = rig.status();
        assert_eq!(status.device(led_status::CHANNEL_BRIGHTNESS + 1), 300);
        assert_eq!(status.op_count(), 1);
        assert_eq!(status.last_command_id(), 1234);
        assert!(!status.executing());
    }

    #[tokio::test]
    async fn exactly_one_status_write_per_tick() {
        let mut rig = Rig::led();
        for i in 1..=5u16 {
            rig.submit(&[5, 1, i * 10, i, 0]);
            rig.bridge.tick().await;
        }
        assert_eq!(rig.bus.status_writes.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn nop_clears_without_device_io() {
        let mut rig = Rig::led();
        rig.bridge.tick().await;
        let (reads, writes) = (rig.link.reads(), rig.link.writes());
        rig.submit(&[0, 0, 0, 77, 0]);
        let report = rig.bridge.tick().await;
        assert_eq!(report.command, Some(CommandOutcome::Completed { cid: 77, opcode: 0 }));
        assert_eq!(rig.command_window(), vec![0; 5]);
        assert_eq!((rig.link.reads(), rig.link.writes()), (reads, writes));
        assert_eq!(rig.status().op_count(), 0);
    }

    #[tokio::test]
    async fn repeated_command_id_is_not_executed_twice() {
        let mut rig = Rig::led();
        rig.submit(&[5, 1, 100, 9, 0]);
        rig.bridge.tick().await;
        let writes = rig.link.writes();
        rig.submit(&[5, 1, 100, 9, 0]);
        let report = rig.bridge.tick().await;
        assert_eq!(report.command, Some(CommandOutcome::Duplicate { cid: 9 }));
        assert_eq!(rig.link.writes(), writes);
        assert_eq!(rig.command_window(), vec![0; 5]);
        assert_eq!(rig.status().op_count(), 1);
    }

    #[tokio::test]
    async fn illegal_commands_are_cleared_and_counted() {
        let mut rig = Rig::led();
        rig.submit(&[42, 0, 0, 1, 0]);
        rig.bridge.tick().await;
        assert_eq!(rig.command_window(), vec![0; 5]);
        assert_eq!(rig.status().last_error_code(), ErrorCode::IllegalOpcode.as_u16());

        rig.submit(&[4, 2, 5000, 2, 0]);
        rig.bridge.tick().await;
        let status = rig.status();
        assert_eq!(status.last_error_code(), ErrorCode::ParamOutOfRange.as_u16());
        assert_eq!(status.error_count(), 2);
    }

    #[tokio::test]
    async fn torn_command_waits_for_its_params() {
        let mut rig = Rig::led();
        rig.bridge.tick().await;
        rig.submit(&[4, 0, 300, 55, 0]);
        let report = rig.bridge.tick().await;
        assert_eq!(
            report.command,
            Some(CommandOutcome::Deferred { cid: 55, reason: DeferReason::Torn })
        );
        assert_eq!(rig.command_window(), vec![4, 0, 300, 55, 0]);

        rig.submit(&[4, 3, 300, 55, 0]);
        let report = rig.bridge.tick().await;
        assert_eq!(report.command, Some(CommandOutcome::Completed { cid: 55, opcode: 4 }));
        assert_eq!(rig.status().error_count(), 0);
    }

    #[tokio::test]
    async fn torn_command_is_rejected_after_grace_ticks() {
        let mut rig = Rig::led();
        rig.submit(&[4, 0, 300, 56, 0]);
        for _ in 0..TORN_COMMAND_TICKS {
            let report = rig.bridge.tick().await;
            assert!(matches!(report.command, Some(CommandOutcome::Deferred { .. })));
        }
        let report = rig.bridge.tick().await;
        assert_eq!(
            report.command,
            Some(CommandOutcome::Failed {
                cid: 56,
                opcode: 4,
                code: ErrorCode::TornCommand
            })
        );
        assert_eq!(rig.command_window(), vec![0; 5]);
        assert_eq!(rig.status().error_count(), 1);
    }

    #[tokio::test]
    async fn device_fault_gates_commands_until_reset() {
        let mut rig = Rig::led();
        rig.link.preset(led::REG_FAULT, 3);
        rig.bridge.tick().await;
        assert_eq!(rig.bridge.phase(), BridgePhase::Error);
        assert_eq!(rig.status().module_state(), Some(ModuleState::Error));

        rig.submit(&[4, 1, 100, 1, 0]);
        rig.bridge.tick().await;
        assert_eq!(rig.status().last_error_code(), ErrorCode::FaultActive.as_u16());

        rig.submit(&[2, 0, 0, 2, 0]);
        let report = rig.bridge.tick().await;
        assert_eq!(report.command, Some(CommandOutcome::Completed { cid: 2, opcode: 2 }));
        assert_eq!(rig.bridge.phase(), BridgePhase::Error);

        rig.submit(&[7, 0, 0, 3, 0]);
        rig.bridge.tick().await;
        assert_eq!(rig.bridge.phase(), BridgePhase::Ready);
        assert_eq!(rig.link.register(led::REG_FAULT), 0);
        assert_eq!(rig.status().module_state(), Some(ModuleState::Idle));
    }

    #[tokio::test]
    async fn device_loss_after_repeated_failures_and_recovery() {
        let mut module = ModuleConfig::new("led", DeviceKind::LedController, 500);
        module.timing.device_poll_divider = Some(1);
        let mut rig = Rig::with_config(BridgeConfig::from_module(&module));
        rig.bridge.tick().await;
        rig.link.set_online(false);
        for _ in 0..DEVICE_FAILURE_THRESHOLD {
            rig.bridge.tick().await;
        }
        assert!(!rig.bridge.is_device_online());
        assert_eq!(rig.bridge.phase(), BridgePhase::DeviceDown);
        let status = rig.status();
        assert!(!status.device_online());
        assert_eq!(status.module_state(), Some(ModuleState::Offline));
        assert_eq!(status.error_count(), 0);

        rig.submit(&[2, 0, 0, 40, 0]);
        rig.bridge.tick().await;
        assert_eq!(rig.command_window(), vec![0; 5]);
        assert_eq!(rig.status().last_error_code(), ErrorCode::NoDevice.as_u16());
        assert_eq!(rig.status().error_count(), 1);

        rig.link.set_online(true);
        let deadline = Instant::now() + Duration::from_secs(3);
        while !rig.bridge.is_device_online() && Instant::now() < deadline {
            rig.bridge.tick().await;
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(rig.bridge.is_device_online());
        assert_eq!(rig.bridge.phase(), BridgePhase::Ready);
    }

    #[tokio::test]
    async fn bus_loss_skips_the_tick_and_reconnects() {
        let mut rig = Rig::led();
        rig.bridge.tick().await;
        rig.bus.up.store(false, Ordering::SeqCst);
        let report = rig.bridge.tick().await;
        assert!(!report.bus_up);
        assert!(!report.published);
        assert!(!rig.bridge.is_bus_up());

        rig.bus.up.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + Duration::from_secs(3);
        let mut report = rig.bridge.tick().await;
        while !report.published && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
            report = rig.bridge.tick().await;
        }
        assert!(report.published);
    }

    #[tokio::test]
    async fn command_delay_defers_all_but_stop() {
        let mut module = ModuleConfig::new("led", DeviceKind::LedController, 500);
        module.timing.command_delay_ms = 10_000;
        let mut rig = Rig::with_config(BridgeConfig::from_module(&module));
        rig.submit(&[5, 1, 100, 1, 0]);
        rig.bridge.tick().await;

        rig.submit(&[5, 2, 100, 2, 0]);
        let report = rig.bridge.tick().await;
        assert_eq!(
            report.command,
            Some(CommandOutcome::Deferred { cid: 2, reason: DeferReason::CommandDelay })
        );

        rig.submit(&[2, 0, 0, 3, 0]);
        let report = rig.bridge.tick().await;
        assert_eq!(report.command, Some(CommandOutcome::Completed { cid: 3, opcode: 2 }));
    }

    #[test]
    fn watchdog_outlasts_the_command_delay() {
        let mut module = ModuleConfig::new("led", DeviceKind::LedController, 500);
        module.timing.command_delay_ms = 1500;
        let cfg = BridgeConfig::from_module(&module);
        assert!(cfg.watchdog_timeout > cfg.command_delay + MIN_WATCHDOG / 2);
    }

    #[tokio::test]
    async fn long_command_delay_keeps_a_healthy_device() {
        let mut module = ModuleConfig::new("led", DeviceKind::LedController, 500);
        module.timing.command_delay_ms = 1500;
        module.timing.device_poll_divider = Some(1);
        let mut rig = Rig::with_config(BridgeConfig::from_module(&module));
        rig.bridge.tick().await;
        rig.submit(&[5, 1, 100, 1, 0]);
        let report = rig.bridge.tick().await;
        assert_eq!(report.command, Some(CommandOutcome::Completed { cid: 1, opcode: 5 }));

        let started = Instant::now();
        let mut polled_after_delay = false;
        while started.elapsed() < Duration::from_millis(2200) {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let report = rig.bridge.tick().await;
            assert!(report.device_online, "device dropped after {:?}", started.elapsed());
            assert_ne!(rig.bridge.phase(), BridgePhase::DeviceDown);
            polled_after_delay |= report.polled;
        }
        assert!(polled_after_delay);
        assert_eq!(rig.status().module_state(), Some(ModuleState::Idle));
    }

    #[tokio::test]
    async fn published_snapshots_reach_subscribers() {
        let mut rig = Rig::led();
        let mut rx = rig.bridge.subscribe();
        rig.submit(&[4, 1, 700, 5, 0]);
        rig.bridge.tick().await;
        assert!(rx.has_changed().unwrap_or(false));
        let seen = *rx.borrow_and_update();
        assert_eq!(seen.device(led_status::CHANNEL_BRIGHTNESS), 700);
        assert_eq!(seen, rig.status());
    }

    #[tokio::test]
    async fn run_stops_on_shutdown_and_publishes_offline() -> Result<(), Box<dyn std::error::Error>> {
        let rig = Rig::led();
        let bank = Arc::clone(&rig.bus.bank);
        let mut rx = rig.bridge.subscribe();
        let (tx, shutdown) = watch::channel(false);
        let task = tokio::spawn(rig.bridge.run(shutdown));
        tokio::time::timeout(Duration::from_secs(2), rx.changed()).await??;
        assert_eq!(bank.read(501, 1).map_err(|e| format!("{e:?}"))?, vec![1]);

        tx.send(true)?;
        tokio::time::timeout(Duration::from_secs(2), task).await??;
        assert_eq!(bank.read(500, 2).map_err(|e| format!("{e:?}"))?, vec![0, 0]);
        Ok(())
    }
}
