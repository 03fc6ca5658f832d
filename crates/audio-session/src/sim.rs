//! In-memory hardware driver.
//!
//! Records every driver call, lets callers inject failures per use case and
//! drives the period timer either by hand ([`SimDriver::tick`]) or
//! automatically once per write (`auto_tick`). Used by the unit tests and by
//! the `session-out` null sink.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crossbeam_channel::{Receiver, Sender, unbounded};

use crate::error::HwError;
use crate::format::DeviceMask;
use crate::hw::{
    CaptureHandle, HandleParams, HardwareDriver, PcmHandle, PeriodTick, UseCase, UseCaseSlot,
    VERB_INACTIVE,
};
use crate::queues::lock;

/// One recorded driver call.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum HwOp {
    Open {
        use_case: UseCase,
        slot: UseCaseSlot,
        devices: DeviceMask,
        sample_rate: u32,
        channels: u32,
    },
    Write { use_case: UseCase, bytes: usize },
    Start(UseCase),
    Pause { use_case: UseCase, paused: bool },
    Prepare(UseCase),
    Standby(UseCase),
    Reopen(UseCase),
    Close(UseCase),
    Route { use_case: UseCase, devices: DeviceMask },
    SpdifStatus(u32),
    CodecParams { use_case: UseCase, bytes: usize },
    Volume { use_case: UseCase, value: u32 },
    ProxyOpen,
    ProxyClose,
}

#[derive(Default)]
struct Faults {
    write: VecDeque<(UseCase, HwError)>,
    open: VecDeque<UseCase>,
    reopen: VecDeque<UseCase>,
    prepare: VecDeque<UseCase>,
}

struct SimState {
    period_bytes: usize,
    latency_us: u32,
    auto_tick: bool,
    ops: Mutex<Vec<HwOp>>,
    verb: Mutex<Option<String>>,
    faults: Mutex<Faults>,
    tickers: Mutex<HashMap<UseCase, Sender<PeriodTick>>>,
    written: Mutex<HashMap<UseCase, usize>>,
}

impl SimState {
    fn record(&self, op: HwOp) {
        tracing::trace!(?op, "sim driver call");
        lock(&self.ops).push(op);
    }
}

/// Simulated driver. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SimDriver {
    state: Arc<SimState>,
}

impl SimDriver {
    /// Driver whose handles negotiate `period_bytes` sized periods.
    pub fn new(period_bytes: usize) -> Self {
        Self::build(period_bytes, false)
    }

    /// Driver that fires one period tick for every write it receives.
    pub fn with_auto_tick(period_bytes: usize) -> Self {
        Self::build(period_bytes, true)
    }

    fn build(period_bytes: usize, auto_tick: bool) -> Self {
        Self {
            state: Arc::new(SimState {
                period_bytes,
                latency_us: 42_500,
                auto_tick,
                ops: Mutex::new(Vec::new()),
                verb: Mutex::new(None),
                faults: Mutex::new(Faults::default()),
                tickers: Mutex::new(HashMap::new()),
                written: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn ops(&self) -> Vec<HwOp> {
        lock(&self.state.ops).clone()
    }

    pub fn clear_ops(&self) {
        lock(&self.state.ops).clear();
    }

    /// Number of recorded calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&HwOp) -> bool) -> usize {
        lock(&self.state.ops).iter().filter(|op| pred(op)).count()
    }

    /// Total bytes accepted by handles of `use_case`.
    pub fn written_bytes(&self, use_case: UseCase) -> usize {
        lock(&self.state.written).get(&use_case).copied().unwrap_or(0)
    }

    /// Fail the next write on a `use_case` handle with `err`.
    pub fn fail_next_write(&self, use_case: UseCase, err: HwError) {
        lock(&self.state.faults).write.push_back((use_case, err));
    }

    pub fn fail_next_open(&self, use_case: UseCase) {
        lock(&self.state.faults).open.push_back(use_case);
    }

    pub fn fail_next_reopen(&self, use_case: UseCase) {
        lock(&self.state.faults).reopen.push_back(use_case);
    }

    pub fn fail_next_prepare(&self, use_case: UseCase) {
        lock(&self.state.faults).prepare.push_back(use_case);
    }

    /// Pretend another stream owns the active verb.
    pub fn set_active_verb(&self, verb: Option<&str>) {
        *lock(&self.state.verb) = verb.map(str::to_string);
    }

    /// Fire one period tick on the latest `use_case` handle. Returns false if
    /// no handle of that use case was ever opened.
    pub fn tick(&self, use_case: UseCase) -> bool {
        match lock(&self.state.tickers).get(&use_case) {
            Some(tx) => tx.send(PeriodTick).is_ok(),
            None => false,
        }
    }
}

fn take_fault<T>(queue: &mut VecDeque<T>, matches: impl Fn(&T) -> bool) -> Option<T> {
    let idx = queue.iter().position(matches)?;
    queue.remove(idx)
}

impl HardwareDriver for SimDriver {
    fn open(&self, params: &HandleParams) -> Result<Box<dyn PcmHandle>, HwError> {
        let state = &self.state;
        state.record(HwOp::Open {
            use_case: params.use_case,
            slot: params.slot,
            devices: params.devices,
            sample_rate: params.sample_rate,
            channels: params.channels,
        });
        if take_fault(&mut lock(&state.faults).open, |u| *u == params.use_case).is_some() {
            return Err(HwError::Failed(-19));
        }
        if params.slot == UseCaseSlot::Verb {
            *lock(&state.verb) = Some(params.use_case.verb().to_string());
        }

        let (tick_tx, tick_rx) = unbounded();
        lock(&state.tickers).insert(params.use_case, tick_tx.clone());
        Ok(Box::new(SimHandle {
            params: params.clone(),
            state: self.state.clone(),
            started: false,
            closed: false,
            tick_tx,
            tick_rx,
        }))
    }

    fn current_verb(&self) -> Option<String> {
        lock(&self.state.verb).clone()
    }

    fn route(&self, handle: &mut dyn PcmHandle, devices: DeviceMask) -> Result<(), HwError> {
        self.state.record(HwOp::Route {
            use_case: handle.params().use_case,
            devices,
        });
        handle.set_devices(devices);
        Ok(())
    }

    fn set_spdif_channel_status(&self, sample_rate: u32) -> Result<(), HwError> {
        self.state.record(HwOp::SpdifStatus(sample_rate));
        Ok(())
    }

    fn open_proxy_capture(&self, period_bytes: usize) -> Result<Box<dyn CaptureHandle>, HwError> {
        self.state.record(HwOp::ProxyOpen);
        Ok(Box::new(SimCapture {
            period_bytes,
            state: self.state.clone(),
        }))
    }
}

struct SimHandle {
    params: HandleParams,
    state: Arc<SimState>,
    started: bool,
    closed: bool,
    tick_tx: Sender<PeriodTick>,
    tick_rx: Receiver<PeriodTick>,
}

impl SimHandle {
    fn use_case(&self) -> UseCase {
        self.params.use_case
    }
}

impl PcmHandle for SimHandle {
    fn params(&self) -> &HandleParams {
        &self.params
    }

    fn period_bytes(&self) -> usize {
        self.state.period_bytes
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, HwError> {
        let use_case = self.use_case();
        self.state.record(HwOp::Write {
            use_case,
            bytes: data.len(),
        });
        if self.closed {
            return Err(HwError::Closed);
        }
        let fault = take_fault(&mut lock(&self.state.faults).write, |(u, _)| *u == use_case);
        if let Some((_, err)) = fault {
            return Err(err);
        }
        *lock(&self.state.written).entry(use_case).or_default() += data.len();
        if self.state.auto_tick {
            let _ = self.tick_tx.send(PeriodTick);
        }
        Ok(data.len())
    }

    fn start(&mut self) -> Result<(), HwError> {
        self.state.record(HwOp::Start(self.use_case()));
        self.started = true;
        Ok(())
    }

    fn is_started(&self) -> bool {
        self.started
    }

    fn pause(&mut self, paused: bool) -> Result<(), HwError> {
        self.state.record(HwOp::Pause {
            use_case: self.use_case(),
            paused,
        });
        Ok(())
    }

    fn prepare(&mut self) -> Result<(), HwError> {
        let use_case = self.use_case();
        self.state.record(HwOp::Prepare(use_case));
        if take_fault(&mut lock(&self.state.faults).prepare, |u| *u == use_case).is_some() {
            return Err(HwError::Failed(-32));
        }
        self.started = false;
        Ok(())
    }

    fn standby(&mut self) -> Result<(), HwError> {
        self.state.record(HwOp::Standby(self.use_case()));
        self.started = false;
        Ok(())
    }

    fn reopen(&mut self) -> Result<(), HwError> {
        let use_case = self.use_case();
        self.state.record(HwOp::Reopen(use_case));
        if take_fault(&mut lock(&self.state.faults).reopen, |u| *u == use_case).is_some() {
            return Err(HwError::Failed(-19));
        }
        self.started = false;
        self.closed = false;
        Ok(())
    }

    fn close(&mut self) -> Result<(), HwError> {
        self.state.record(HwOp::Close(self.use_case()));
        if self.params.slot == UseCaseSlot::Verb {
            *lock(&self.state.verb) = Some(VERB_INACTIVE.to_string());
        }
        self.closed = true;
        Ok(())
    }

    fn latency_micros(&self) -> u32 {
        self.state.latency_us
    }

    fn period_timer(&self) -> Option<Receiver<PeriodTick>> {
        Some(self.tick_rx.clone())
    }

    fn set_devices(&mut self, devices: DeviceMask) {
        self.params.devices = devices;
    }

    fn set_volume(&mut self, volume: u32) -> Result<(), HwError> {
        self.state.record(HwOp::Volume {
            use_case: self.use_case(),
            value: volume,
        });
        Ok(())
    }

    fn set_codec_params(&mut self, config: &[u8]) -> Result<(), HwError> {
        self.state.record(HwOp::CodecParams {
            use_case: self.use_case(),
            bytes: config.len(),
        });
        Ok(())
    }

    fn timestamp(&self) -> Result<u64, HwError> {
        let written = lock(&self.state.written)
            .get(&self.use_case())
            .copied()
            .unwrap_or(0) as u64;
        // Rough position assuming 16-bit stereo at the handle's rate.
        let frames = written / 4;
        Ok(frames.saturating_mul(1_000_000) / u64::from(self.params.sample_rate.max(1)))
    }
}

struct SimCapture {
    period_bytes: usize,
    state: Arc<SimState>,
}

impl CaptureHandle for SimCapture {
    fn period_bytes(&self) -> usize {
        self.period_bytes
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, HwError> {
        buf.fill(0);
        std::thread::sleep(std::time::Duration::from_millis(1));
        Ok(buf.len())
    }

    fn close(&mut self) {
        self.state.record(HwOp::ProxyClose);
    }
}
