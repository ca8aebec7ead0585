//! Program scheduler.
//!
//! A program maps operations to periods. Each scheduler tick advances the
//! model's global tick counter once and fires, in program order, every
//! operation whose period divides the new tick. The budget is checked between
//! ticks only, so a slow operation can overrun it by its own duration.
//!
//! Core operations (sampling, fitting, stepping) stop the run on error.
//! Diagnostic operations are logged and skipped.

use crate::checkpoint::CheckpointStore;
use crate::error::{EngineError, Result};
use crate::model::Model;
use crate::traits::{Operation, OperationKind};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

/// Parses an `HH:MM:SS` wall-clock budget. Hours are unbounded; minutes and
/// seconds must be below 60.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let malformed = || EngineError::Config(format!("duration '{text}' is not in HH:MM:SS format"));
    let parts: Vec<&str> = text.trim().split(':').collect();
    if parts.len() != 3 {
        return Err(malformed());
    }
    let mut fields = [0u64; 3];
    for (field, part) in fields.iter_mut().zip(&parts) {
        if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
            return Err(malformed());
        }
        *field = part.parse().map_err(|_| malformed())?;
    }
    let [hours, minutes, seconds] = fields;
    if minutes >= 60 || seconds >= 60 {
        return Err(EngineError::Config(format!(
            "duration '{text}' has minutes or seconds out of range"
        )));
    }
    hours
        .checked_mul(3600)
        .and_then(|h| h.checked_add(minutes * 60 + seconds))
        .map(Duration::from_secs)
        .ok_or_else(malformed)
}

/// Wraps a side-effecting check so the scheduler treats its failures as
/// non-fatal.
pub struct Diagnostic<F> {
    name: String,
    check: F,
}

impl<F> Diagnostic<F>
where
    F: FnMut(&Model) -> anyhow::Result<()>,
{
    pub fn new(name: impl Into<String>, check: F) -> Self {
        Self {
            name: name.into(),
            check,
        }
    }
}

impl<F> Operation for Diagnostic<F>
where
    F: FnMut(&Model) -> anyhow::Result<()>,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> OperationKind {
        OperationKind::Diagnostic
    }

    fn run(&mut self, model: &mut Model) -> Result<()> {
        (self.check)(model).map_err(|e| EngineError::Diagnostic(format!("{e:#}")))
    }
}

struct Entry {
    operation: Box<dyn Operation>,
    period: u64,
}

/// Ordered operations with their periods ("fire every N ticks").
#[derive(Default)]
pub struct Program {
    entries: Vec<Entry>,
}

impl Program {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(mut self, operation: impl Operation + 'static, period: u64) -> Result<Self> {
        self.push(Box::new(operation), period)?;
        Ok(self)
    }

    pub fn push(&mut self, operation: Box<dyn Operation>, period: u64) -> Result<()> {
        if period == 0 {
            return Err(EngineError::Config(format!(
                "operation '{}' needs a positive frequency",
                operation.name()
            )));
        }
        self.entries.push(Entry { operation, period });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn operations(&self) -> impl Iterator<Item = (&str, u64)> {
        self.entries.iter().map(|e| (e.operation.name(), e.period))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Budget {
    WallClock(Duration),
    Ticks(u64),
}

impl Budget {
    pub fn parse(text: &str) -> Result<Self> {
        parse_duration(text).map(Budget::WallClock)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Running,
    /// A core operation failed. Terminal.
    Stopped,
    Checkpointed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// Ticks executed by this run.
    pub ticks: u64,
    /// Global tick counter when the run ended.
    pub final_tick: u64,
    pub elapsed: Duration,
    /// Times each program entry fired, in program order.
    pub fired: Vec<(String, u64)>,
    pub diagnostic_failures: u64,
}

impl RunReport {
    pub fn fired(&self, name: &str) -> u64 {
        self.fired
            .iter()
            .filter(|(n, _)| n == name)
            .map(|(_, count)| count)
            .sum()
    }
}

#[derive(Debug)]
pub struct Scheduler {
    state: SchedulerState,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub fn new() -> Self {
        Self {
            state: SchedulerState::Idle,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Runs `program` for a wall-clock budget given as `HH:MM:SS`.
    pub fn iterate(
        &mut self,
        model: &mut Model,
        program: &mut Program,
        duration: &str,
    ) -> Result<RunReport> {
        let budget = Budget::parse(duration)?;
        self.run(model, program, budget)
    }

    pub fn run(
        &mut self,
        model: &mut Model,
        program: &mut Program,
        budget: Budget,
    ) -> Result<RunReport> {
        if self.state == SchedulerState::Stopped {
            return Err(EngineError::Stopped);
        }
        if program.is_empty() {
            return Err(EngineError::Config("program has no operations".to_string()));
        }
        if !model.is_launched() {
            return Err(EngineError::Config(
                "model must be launched before running a program".to_string(),
            ));
        }

        self.state = SchedulerState::Running;
        let start = Instant::now();
        let mut fired = vec![0u64; program.len()];
        let mut ticks = 0u64;
        let mut diagnostic_failures = 0u64;
        info!(operations = program.len(), ?budget, start_tick = model.ticks(), "Run started");

        loop {
            let within_budget = match budget {
                Budget::WallClock(limit) => start.elapsed() < limit,
                Budget::Ticks(limit) => ticks < limit,
            };
            if !within_budget {
                break;
            }

            let tick = model.advance_tick();
            ticks += 1;
            for (entry, count) in program.entries.iter_mut().zip(fired.iter_mut()) {
                if tick % entry.period != 0 {
                    continue;
                }
                *count += 1;
                let Err(err) = entry.operation.run(model) else {
                    continue;
                };
                let name = entry.operation.name().to_string();
                if entry.operation.kind() == OperationKind::Diagnostic {
                    diagnostic_failures += 1;
                    warn!(operation = %name, tick, error = %err, "Diagnostic failed, skipping");
                    continue;
                }
                self.state = SchedulerState::Stopped;
                error!(operation = %name, tick, error = %err, "Run stopped");
                return Err(EngineError::OperationFailed {
                    operation: name,
                    tick,
                    source: Box::new(err),
                });
            }
        }

        self.state = SchedulerState::Idle;
        let report = RunReport {
            ticks,
            final_tick: model.ticks(),
            elapsed: start.elapsed(),
            fired: program
                .entries
                .iter()
                .zip(fired)
                .map(|(entry, count)| (entry.operation.name().to_string(), count))
                .collect(),
            diagnostic_failures,
        };
        info!(
            ticks = report.ticks,
            final_tick = report.final_tick,
            elapsed_ms = report.elapsed.as_millis() as u64,
            diagnostic_failures,
            "Run finished"
        );
        Ok(report)
    }

    /// Persists the model. Refused after a fatal error.
    pub fn save(&mut self, model: &Model, store: &CheckpointStore) -> Result<PathBuf> {
        if self.state == SchedulerState::Stopped {
            return Err(EngineError::Stopped);
        }
        let path = store.save(model)?;
        self.state = SchedulerState::Checkpointed;
        Ok(path)
    }
}
