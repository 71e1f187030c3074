//! Engine runtime.
//!
//! A single thread owns the accumulator. Ingestion requests arrive over a channel;
//! between requests the thread sleeps until the earliest debounce deadline, so
//! every mutation of batch state, timers and fallback lineage happens on one thread.
//!
//! Finalized batches go to exactly one `CompletionSink`, in finalization order.
//! A sink error is logged and the batch is dropped; the engine keeps running.

use anyhow::{anyhow, Result};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::accumulator::BatchAccumulator;
use crate::{duration_ms, AggregatorConfig, FinalizedBatch, RawInspectionEvent};

/// Millisecond time source for deadlines and timestamps.
///
/// Debounce deadlines are relative delays, so readings are expected to be
/// monotonic. The engine never lets time run backwards even if a clock does.
pub trait Clock: Send + 'static {
    fn now_ms(&self) -> Result<u64>;
}

/// Monotonic clock anchored to the wall clock once, when it is created.
///
/// Readings are `epoch_base_ms + elapsed`, so they look like epoch milliseconds in
/// output timestamps but do not jump when the system clock is stepped.
#[derive(Clone, Copy, Debug)]
pub struct SystemClock {
    epoch_base_ms: u64,
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Result<Self> {
        Ok(Self::anchored(crate::now_ms()?))
    }

    pub fn anchored(epoch_base_ms: u64) -> Self {
        Self {
            epoch_base_ms,
            started: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> Result<u64> {
        Ok(self
            .epoch_base_ms
            .saturating_add(duration_ms(self.started.elapsed())))
    }
}

/// Last good clock reading. A failed read reuses it instead of stopping the engine.
struct Ticker<'a, C> {
    clock: &'a C,
    last_ms: u64,
}

impl<'a, C: Clock> Ticker<'a, C> {
    fn new(clock: &'a C) -> Self {
        let mut ticker = Self { clock, last_ms: 0 };
        ticker.read();
        ticker
    }

    fn read(&mut self) -> u64 {
        match self.clock.now_ms() {
            Ok(now) if now < self.last_ms => {
                log::debug!("clock went backwards by {} ms", self.last_ms - now);
            }
            Ok(now) => self.last_ms = now,
            Err(err) => log::warn!("clock read failed, reusing {} ms: {}", self.last_ms, err),
        }
        self.last_ms
    }
}

/// Consumer of finalized batches.
pub trait CompletionSink: Send + 'static {
    fn deliver(&mut self, batch: FinalizedBatch) -> Result<()>;
}

impl CompletionSink for Sender<FinalizedBatch> {
    fn deliver(&mut self, batch: FinalizedBatch) -> Result<()> {
        self.send(batch)
            .map_err(|_| anyhow!("completion subscriber disconnected"))
    }
}

enum EngineCommand {
    Ingest(RawInspectionEvent),
    Shutdown,
}

/// Cloneable ingestion endpoint for producer threads.
#[derive(Clone, Debug)]
pub struct EventIngestor {
    tx: Sender<EngineCommand>,
}

impl EventIngestor {
    pub fn ingest(&self, event: RawInspectionEvent) -> Result<()> {
        self.tx
            .send(EngineCommand::Ingest(event))
            .map_err(|_| anyhow!("batch engine is not running"))
    }
}

#[derive(Debug)]
pub struct EngineHandle {
    ingestor: EventIngestor,
    join: Option<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn ingest(&self, event: RawInspectionEvent) -> Result<()> {
        self.ingestor.ingest(event)
    }

    pub fn ingestor(&self) -> EventIngestor {
        self.ingestor.clone()
    }

    /// Flushes open batches to the sink and joins the engine thread.
    pub fn stop(mut self) -> Result<()> {
        let _ = self.ingestor.tx.send(EngineCommand::Shutdown);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("batch engine thread panicked"))?;
        }
        Ok(())
    }
}

pub struct BatchEngine {
    cfg: AggregatorConfig,
}

impl BatchEngine {
    pub fn new(cfg: AggregatorConfig) -> Self {
        Self { cfg }
    }

    pub fn spawn<S: CompletionSink>(self, sink: S) -> Result<EngineHandle> {
        let clock = SystemClock::new()?;
        self.spawn_with_clock(sink, clock)
    }

    /// Spawns the engine with a channel subscription as its sink.
    pub fn spawn_with_channel(self) -> Result<(EngineHandle, Receiver<FinalizedBatch>)> {
        let (batch_tx, batch_rx) = mpsc::channel();
        let handle = self.spawn(batch_tx)?;
        Ok((handle, batch_rx))
    }

    pub fn spawn_with_clock<S: CompletionSink, C: Clock>(
        self,
        mut sink: S,
        clock: C,
    ) -> Result<EngineHandle> {
        let accumulator = BatchAccumulator::from_config(&self.cfg);
        let (tx, rx) = mpsc::channel();
        log::info!(
            "batch engine starting (debounce {} ms)",
            self.cfg.debounce_window.as_millis()
        );
        let join = std::thread::Builder::new()
            .name("batch-engine".to_string())
            .spawn(move || run_engine(rx, accumulator, &mut sink, &clock))?;
        Ok(EngineHandle {
            ingestor: EventIngestor { tx },
            join: Some(join),
        })
    }
}

fn run_engine<S: CompletionSink, C: Clock>(
    rx: Receiver<EngineCommand>,
    mut accumulator: BatchAccumulator,
    sink: &mut S,
    clock: &C,
) {
    let mut ticker = Ticker::new(clock);
    loop {
        let now = ticker.read();
        deliver_all(sink, accumulator.expire_due(now));

        let next = match accumulator.next_deadline() {
            Some(deadline) => {
                let wait = Duration::from_millis(deadline.saturating_sub(now).max(1));
                rx.recv_timeout(wait)
            }
            None => rx.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };

        match next {
            Ok(EngineCommand::Ingest(event)) => {
                // batches whose window passed while we waited close before the
                // event is keyed
                let now = ticker.read();
                deliver_all(sink, accumulator.expire_due(now));
                let outcome = accumulator.ingest(event, now);
                log::debug!(
                    "camera {} -> batch {} ({:?})",
                    outcome.camera_id,
                    outcome.batch_id,
                    outcome.status
                );
            }
            Err(RecvTimeoutError::Timeout) => {}
            Ok(EngineCommand::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                let pending = accumulator.flush_all(ticker.read());
                if !pending.is_empty() {
                    log::info!("flushing {} open batch(es) on shutdown", pending.len());
                }
                deliver_all(sink, pending);
                log::info!("batch engine stopped");
                return;
            }
        }
    }
}

fn deliver_all<S: CompletionSink>(sink: &mut S, batches: Vec<FinalizedBatch>) {
    for batch in batches {
        let id = batch.id.clone();
        if let Err(err) = sink.deliver(batch) {
            log::warn!("dropping finalized batch {}: {}", id, err);
        }
    }
}
