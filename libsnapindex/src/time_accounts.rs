//! Per-stage wall-clock accounting, one instance per worker. Diagnostics
//! only; nothing downstream depends on these numbers.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    WaitFile,
    LoadImage,
    Filter,
    ResolutionMask,
    PeakSearch,
    Indexing,
    PredictionParams,
    Integration,
    StreamWrite,
    Finalise,
}

impl Stage {
    pub fn label(&self) -> &'static str {
        match self {
            Stage::WaitFile => "wait for file",
            Stage::LoadImage => "load image",
            Stage::Filter => "image filter",
            Stage::ResolutionMask => "resolution mask",
            Stage::PeakSearch => "peak search",
            Stage::Indexing => "indexing",
            Stage::PredictionParams => "prediction params",
            Stage::Integration => "integration",
            Stage::StreamWrite => "stream write",
            Stage::Finalise => "finalisation",
        }
    }
}

#[derive(Debug, Default)]
pub struct TimeAccounts {
    current: Option<(Stage, Instant)>,
    totals: Vec<(Stage, Duration)>,
}

impl TimeAccounts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Close the running account and start timing `stage`
    pub fn set(&mut self, stage: Stage) {
        let now = Instant::now();
        if let Some((prev, since)) = self.current.take() {
            self.add(prev, now - since);
        }
        self.current = Some((stage, now));
    }

    /// Close the running account without starting a new one
    pub fn stop(&mut self) {
        let now = Instant::now();
        if let Some((prev, since)) = self.current.take() {
            self.add(prev, now - since);
        }
    }

    fn add(&mut self, stage: Stage, d: Duration) {
        for (s, total) in self.totals.iter_mut() {
            if *s == stage {
                *total += d;
                return;
            }
        }
        self.totals.push((stage, d));
    }

    pub fn total(&self, stage: Stage) -> Duration {
        self.totals
            .iter()
            .find(|(s, _)| *s == stage)
            .map(|(_, d)| *d)
            .unwrap_or_default()
    }

    /// One-line summary in first-use order
    pub fn report(&self) -> String {
        let mut parts = Vec::with_capacity(self.totals.len());
        for (stage, d) in &self.totals {
            parts.push(format!("{}: {:.3}s", stage.label(), d.as_secs_f64()));
        }
        parts.join(", ")
    }
}
