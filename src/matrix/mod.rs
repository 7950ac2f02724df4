//! Build matrix expansion and fan-out.
//!
//! [`expand`] turns the platform and runtime axes into one [`MatrixCell`] per
//! combination, platform-major, in the order the axes were given. [`run_cells`]
//! then runs a job for every cell on a fixed pool of worker threads:
//!
//! - a failing cell never stops its siblings;
//! - results come back in expansion order regardless of completion order;
//! - a set [`CancelFlag`] keeps workers from starting new cells, while cells
//!   already running finish normally;
//! - a job that panics fails its own cell and the report is still returned.

use std::any::Any;
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::{CellPanic, ConfigError};
use crate::identity::validate_segment;

/// Target platform of one build, e.g. `linux`, `macos`, `macosm1`, `win`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Platform(String);

impl Platform {
    pub fn new(name: &str) -> Result<Self, ConfigError> {
        validate_segment("platform", name)?;
        Ok(Self(name.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Platform {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Platform> for String {
    fn from(value: Platform) -> Self {
        value.0
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Python runtime version written without dots, e.g. `311`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RuntimeVersion(String);

impl RuntimeVersion {
    pub fn new(version: &str) -> Result<Self, ConfigError> {
        let compact = version.trim().trim_start_matches("py").replace('.', "");
        if compact.is_empty() || !compact.chars().all(|c| c.is_ascii_digit()) {
            return Err(ConfigError::InvalidComponent {
                field: "runtime version",
                value: version.to_string(),
                reason: "expected digits such as 311 or 3.11",
            });
        }
        Ok(Self(compact))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Runtime tag used in file names and build strings, e.g. `py311`.
    pub fn tag(&self) -> String {
        format!("py{}", self.0)
    }
}

impl TryFrom<String> for RuntimeVersion {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<RuntimeVersion> for String {
    fn from(value: RuntimeVersion) -> Self {
        value.0
    }
}

impl fmt::Display for RuntimeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MatrixCell {
    pub platform: Platform,
    pub runtime: RuntimeVersion,
}

impl MatrixCell {
    /// Stable identifier of the cell, e.g. `linux-py311`.
    pub fn job_id(&self) -> String {
        format!("{}-{}", self.platform, self.runtime.tag())
    }
}

impl fmt::Display for MatrixCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.job_id())
    }
}

/// Cartesian product of `platforms` × `runtimes`, platform-major.
pub fn expand(
    platforms: &[Platform],
    runtimes: &[RuntimeVersion],
) -> Result<Vec<MatrixCell>, ConfigError> {
    if platforms.is_empty() {
        return Err(ConfigError::EmptyMatrix("no platforms"));
    }
    if runtimes.is_empty() {
        return Err(ConfigError::EmptyMatrix("no runtime versions"));
    }
    reject_duplicates("platform", platforms.iter().map(Platform::as_str))?;
    reject_duplicates("runtime", runtimes.iter().map(RuntimeVersion::as_str))?;

    let mut cells = Vec::with_capacity(platforms.len() * runtimes.len());
    for platform in platforms {
        for runtime in runtimes {
            cells.push(MatrixCell {
                platform: platform.clone(),
                runtime: runtime.clone(),
            });
        }
    }
    Ok(cells)
}

fn reject_duplicates<'a>(
    axis: &'static str,
    values: impl Iterator<Item = &'a str>,
) -> Result<(), ConfigError> {
    let mut seen = BTreeSet::new();
    for value in values {
        if !seen.insert(value) {
            return Err(ConfigError::DuplicateAxisValue {
                axis,
                value: value.to_string(),
            });
        }
    }
    Ok(())
}

/// Shared flag that stops a run from starting further cells.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// How one cell ended.
#[derive(Debug)]
pub enum CellResult<T, E> {
    Succeeded(T),
    Failed(E),
    /// The run was cancelled before this cell started.
    Cancelled,
}

#[derive(Debug)]
pub struct CellOutcome<T, E> {
    pub cell: MatrixCell,
    pub result: CellResult<T, E>,
    pub elapsed: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    /// Some cells failed and partial failure was tolerated.
    PartiallyFailed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_success(self) -> bool {
        matches!(self, RunStatus::Succeeded | RunStatus::PartiallyFailed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Succeeded => "success",
            RunStatus::PartiallyFailed => "partial",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// Outcomes of every cell of a run, in expansion order.
#[derive(Debug)]
pub struct MatrixReport<T, E> {
    pub outcomes: Vec<CellOutcome<T, E>>,
}

impl<T, E> MatrixReport<T, E> {
    pub fn succeeded(&self) -> impl Iterator<Item = (&MatrixCell, &T)> {
        self.outcomes.iter().filter_map(|o| match &o.result {
            CellResult::Succeeded(value) => Some((&o.cell, value)),
            _ => None,
        })
    }

    pub fn failed(&self) -> impl Iterator<Item = (&MatrixCell, &E)> {
        self.outcomes.iter().filter_map(|o| match &o.result {
            CellResult::Failed(err) => Some((&o.cell, err)),
            _ => None,
        })
    }

    pub fn not_started(&self) -> impl Iterator<Item = &MatrixCell> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.result, CellResult::Cancelled))
            .map(|o| &o.cell)
    }

    /// Overall status. Any failed cell fails the run unless
    /// `tolerate_partial` is set and at least one cell succeeded.
    pub fn status(&self, tolerate_partial: bool) -> RunStatus {
        let failed = self.failed().count();
        let succeeded = self.succeeded().count();
        if self.not_started().next().is_some() {
            return RunStatus::Cancelled;
        }
        match failed {
            0 => RunStatus::Succeeded,
            _ if tolerate_partial && succeeded > 0 => RunStatus::PartiallyFailed,
            _ => RunStatus::Failed,
        }
    }
}

/// Run `job` once per cell on up to `workers` threads.
///
/// Every cell gets an outcome. Cells are handed out in expansion order; the
/// report lists them in that order too. A job that panics is recorded as a
/// failure of its own cell.
pub fn run_cells<T, E, F>(
    cells: &[MatrixCell],
    workers: usize,
    cancel: &CancelFlag,
    job: F,
) -> MatrixReport<T, E>
where
    T: Send,
    E: Send + From<CellPanic>,
    F: Fn(&MatrixCell) -> Result<T, E> + Sync,
{
    let workers = workers.clamp(1, cells.len().max(1));
    let queue: Mutex<VecDeque<usize>> = Mutex::new((0..cells.len()).collect());
    let (tx, rx) = mpsc::channel::<(usize, CellResult<T, E>, Duration)>();

    std::thread::scope(|scope| {
        for _ in 0..workers {
            let tx = tx.clone();
            let queue = &queue;
            let job = &job;
            scope.spawn(move || loop {
                let next = match queue.lock() {
                    Ok(mut pending) => pending.pop_front(),
                    Err(poisoned) => poisoned.into_inner().pop_front(),
                };
                let Some(index) = next else {
                    break;
                };
                let cell = &cells[index];
                if cancel.is_cancelled() {
                    tracing::warn!(job = %cell, "run cancelled; cell not started");
                    let _ = tx.send((index, CellResult::Cancelled, Duration::ZERO));
                    continue;
                }

                tracing::info!(job = %cell, "cell started");
                let start = Instant::now();
                let result = match panic::catch_unwind(AssertUnwindSafe(|| job(cell))) {
                    Ok(Ok(value)) => CellResult::Succeeded(value),
                    Ok(Err(err)) => CellResult::Failed(err),
                    Err(payload) => CellResult::Failed(E::from(CellPanic {
                        job_id: cell.job_id(),
                        message: panic_message(payload.as_ref()),
                    })),
                };
                let elapsed = start.elapsed();
                let elapsed_ms = elapsed.as_millis() as u64;
                if matches!(result, CellResult::Succeeded(_)) {
                    tracing::info!(job = %cell, elapsed_ms, "cell succeeded");
                } else {
                    tracing::error!(job = %cell, elapsed_ms, "cell failed");
                }
                if tx.send((index, result, elapsed)).is_err() {
                    break;
                }
            });
        }
    });
    drop(tx);

    let mut slots: Vec<Option<(CellResult<T, E>, Duration)>> =
        (0..cells.len()).map(|_| None).collect();
    for (index, result, elapsed) in rx {
        slots[index] = Some((result, elapsed));
    }

    let outcomes = cells
        .iter()
        .zip(slots)
        .map(|(cell, slot)| {
            let (result, elapsed) = slot.unwrap_or((CellResult::Cancelled, Duration::ZERO));
            CellOutcome {
                cell: cell.clone(),
                result,
                elapsed,
            }
        })
        .collect();
    MatrixReport { outcomes }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
