use crate::peaks::{CwndPeakTracker, CwndPeaks};

/// Something that can be sampled periodically, typically a socket's TCP counters.
pub trait Probe: Send + 'static {
    type Sample: Send + 'static;

    /// Takes one sample; `None` skips this tick.
    fn sample(&mut self) -> Option<Self::Sample>;

    /// Congestion window carried by a sample, if any.
    fn cwnd(sample: &Self::Sample) -> Option<u64>;
}

/// Receives every sample taken, e.g. to persist a snapshot log.
pub trait SampleLog<S>: Send {
    fn record(&mut self, sample: &S);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LatchState {
    Idle,
    Active,
    Stopped,
}

/// Start/stop gate shared between a transfer and its sampler.
#[derive(Debug)]
pub struct Latch {
    tx: tokio::sync::watch::Sender<LatchState>,
}

impl Latch {
    fn new() -> (Self, tokio::sync::watch::Receiver<LatchState>) {
        let (tx, rx) = tokio::sync::watch::channel(LatchState::Idle);
        (Self { tx }, rx)
    }

    pub fn open(&self) {
        self.tx.send_replace(LatchState::Active);
    }

    pub fn close(&self) {
        self.tx.send_replace(LatchState::Stopped);
    }

    pub fn is_open(&self) -> bool {
        *self.tx.borrow() == LatchState::Active
    }
}

/// What a sampler hands back once stopped.
pub struct SamplerReport<P: Probe> {
    pub peaks: CwndPeaks,
    pub samples: usize,
    pub last: Option<P::Sample>,
    /// The probe itself, with whatever it accumulated.
    pub probe: P,
}

impl<P: Probe> std::fmt::Debug for SamplerReport<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamplerReport")
            .field("peaks", &self.peaks)
            .field("samples", &self.samples)
            .field("has_last", &self.last.is_some())
            .finish()
    }
}

/// Periodic sampler running as its own task.
pub struct Sampler<P: Probe> {
    latch: Latch,
    handle: tokio::task::JoinHandle<SamplerReport<P>>,
}

impl<P: Probe> std::fmt::Debug for Sampler<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sampler").field("latch", &self.latch).finish()
    }
}

impl<P: Probe> Sampler<P> {
    /// Spawns the sampler task; it stays idle until [`Sampler::start`].
    pub fn spawn(
        probe: P,
        interval: std::time::Duration,
        log: Option<Box<dyn SampleLog<P::Sample>>>,
    ) -> Self {
        let (latch, rx) = Latch::new();
        let handle = tokio::spawn(run(probe, interval, log, rx));
        Self { latch, handle }
    }

    pub fn start(&self) {
        tracing::debug!("sampler started");
        self.latch.open();
    }

    pub fn latch(&self) -> &Latch {
        &self.latch
    }

    /// Closes the latch and waits for the task to hand back its report.
    pub async fn stop(self) -> Result<SamplerReport<P>, tokio::task::JoinError> {
        self.latch.close();
        let report = self.handle.await?;
        tracing::debug!(
            "sampler stopped after {} samples, peaks: {:?}",
            report.samples,
            report.peaks
        );
        Ok(report)
    }
}

async fn run<P: Probe>(
    mut probe: P,
    interval: std::time::Duration,
    mut log: Option<Box<dyn SampleLog<P::Sample>>>,
    mut state: tokio::sync::watch::Receiver<LatchState>,
) -> SamplerReport<P> {
    let mut tracker = CwndPeakTracker::new();
    let mut samples = 0;
    let mut last = None;
    let mut active = false;
    loop {
        match *state.borrow_and_update() {
            LatchState::Active => {
                active = true;
                break;
            }
            LatchState::Stopped => break,
            LatchState::Idle => {}
        }
        if state.changed().await.is_err() {
            break;
        }
    }
    if active {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                biased;
                changed = state.changed() => {
                    if changed.is_err() || *state.borrow_and_update() == LatchState::Stopped {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    let Some(sample) = probe.sample() else {
                        continue;
                    };
                    if let Some(cwnd) = P::cwnd(&sample) {
                        tracker.observe(cwnd);
                    }
                    if let Some(log) = log.as_mut() {
                        log.record(&sample);
                    }
                    samples += 1;
                    last = Some(sample);
                }
            }
        }
    }
    SamplerReport {
        peaks: tracker.finish(),
        samples,
        last,
        probe,
    }
}
