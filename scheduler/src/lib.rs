//! The control loop that keeps the run queue healthy.
//!
//! On every tick the scheduler runs three independent sub-passes
//! concurrently: enqueue new runs for packages whose delay has elapsed,
//! reset runs whose worker has gone silent, and delete runs no worker will
//! ever take. A sub-pass error is logged and never stops the others or the
//! loop.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
    time::Duration,
};

use chrono::{DateTime, TimeDelta, Utc};
use rand::{Rng as _, seq::SliceRandom as _};
use results_db::ResultsDb;
use tokio::sync::broadcast;
use tracing::{error, info};
use types::{Package, Run, RunOption};

/// Default minimum delay between two scheduler-created runs of a package.
pub const DEFAULT_RUN_DELAY: Duration = Duration::from_secs(5 * 60);

/// Default age after which a started run is considered stale and reset.
pub const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Never-started runs older than this are garbage-collected. A package may
/// be deconfigured while runs for it sit in the queue; this bounds queue
/// growth.
const UNPROCESSABLE_RUN_AGE: Duration = Duration::from_secs(24 * 60 * 60);

/// Upper bound (exclusive) on the randomised seconds between ticks.
const MAX_TICK_WAIT_SECS: u64 = 10;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Started runs older than this are reset for another worker to claim.
    pub run_timeout: Duration,
    /// Scheduler-wide minimum delay between runs of a package, unless the
    /// package declares its own.
    pub run_delay: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            run_timeout: DEFAULT_RUN_TIMEOUT,
            run_delay: DEFAULT_RUN_DELAY,
        }
    }
}

/// Errors from manually scheduling a run.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("unknown package: {0}")]
    UnknownPackage(String),

    #[error("unknown option {option:?} for package {package}")]
    UnknownOption { package: String, option: String },

    #[error("malformed option override {0:?}, expected name=value")]
    MalformedOverride(String),

    #[error("scheduling package: {0}")]
    Db(#[from] results_db::Error),
}

/// Schedules runs for the configured package set.
pub struct Scheduler {
    db: ResultsDb,
    packages: Arc<[Package]>,
    config: SchedulerConfig,
    // Written only from the scheduler task.
    last_scheduled: HashMap<String, DateTime<Utc>>,
}

impl Scheduler {
    pub fn new(db: ResultsDb, packages: Arc<[Package]>, config: SchedulerConfig) -> Self {
        Self {
            db,
            packages,
            config,
            last_scheduled: HashMap::new(),
        }
    }

    /// Run the scheduler until `shutdown` fires.
    ///
    /// Ticks are spaced a random integer number of seconds in
    /// [0, 10) apart to desynchronise replicas.
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut wait = Duration::ZERO;
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("scheduler stopping");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }
            wait = Duration::from_secs(rand::rng().random_range(0..MAX_TICK_WAIT_SECS));

            self.tick().await;
        }
    }

    /// Run the three sub-passes of a single tick concurrently.
    pub async fn tick(&mut self) {
        let Self {
            db,
            packages,
            config,
            last_scheduled,
        } = self;

        let (schedule, reset, cleanup) = tokio::join!(
            schedule_due_runs(db, packages, config.run_delay, last_scheduled),
            reset_stale_runs(db, config.run_timeout),
            cleanup_unprocessable_runs(db),
        );
        if let Err(err) = schedule {
            error!(error = %err, "failed to schedule runs");
        }
        if let Err(err) = reset {
            error!(error = %err, "failed to reset stale runs");
        }
        if let Err(err) = cleanup {
            error!(error = %err, "failed to clean up unprocessable runs");
        }
    }
}

/// Enqueue a run for every configured package that has no pending run and
/// whose delay has elapsed.
async fn schedule_due_runs(
    db: &ResultsDb,
    packages: &[Package],
    default_run_delay: Duration,
    last_scheduled: &mut HashMap<String, DateTime<Utc>>,
) -> Result<(), results_db::Error> {
    let pending = db.list_pending_runs().await?;
    let pending_packages: HashSet<&str> = pending.iter().map(|run| run.package.as_str()).collect();

    // Shuffle so later-listed packages are not starved when the enqueue
    // rate is bounded.
    let mut due: Vec<&Package> = packages
        .iter()
        .filter(|pkg| !pending_packages.contains(pkg.name.as_str()))
        .collect();
    due.shuffle(&mut rand::rng());

    for pkg in due {
        let run_delay = pkg
            .run_delay
            .map(|delay| delay.as_duration())
            .unwrap_or(default_run_delay);
        let now = Utc::now();
        if let Some(last) = last_scheduled.get(&pkg.name) {
            if now.signed_duration_since(*last) < as_time_delta(run_delay) {
                continue;
            }
        }

        let run = Run::new(&pkg.name, pkg.default_args());
        db.enqueue_run(&run).await?;
        last_scheduled.insert(pkg.name.clone(), now);
        info!(package = %pkg.name, run = %run.id, "scheduled run");
    }

    Ok(())
}

/// Reset started runs whose worker has been silent for longer than
/// `run_timeout`. The reset does not cancel the worker; it only unbinds the
/// run so another worker may claim it.
async fn reset_stale_runs(db: &ResultsDb, run_timeout: Duration) -> Result<(), results_db::Error> {
    let cutoff = as_time_delta(run_timeout);
    for run in db.list_pending_runs().await? {
        let Some(started_at) = run.started_at else {
            continue;
        };

        if Utc::now().signed_duration_since(started_at) > cutoff {
            match db.reset_run(run.id).await {
                Ok(()) => info!(package = %run.package, run = %run.id, "reset stale run"),
                // The run finished between listing and resetting.
                Err(results_db::Error::NotFound) => {}
                Err(err) => return Err(err),
            }
        }
    }
    Ok(())
}

/// Delete runs that were never started and have sat in the queue for longer
/// than [`UNPROCESSABLE_RUN_AGE`].
async fn cleanup_unprocessable_runs(db: &ResultsDb) -> Result<(), results_db::Error> {
    let cutoff = as_time_delta(UNPROCESSABLE_RUN_AGE);
    for run in db.list_pending_runs().await? {
        if run.started_at.is_some() {
            continue;
        }

        if Utc::now().signed_duration_since(run.enqueued_at) > cutoff {
            db.delete_run(run.id).await?;
            info!(package = %run.package, run = %run.id, "deleted unprocessable run");
        }
    }
    Ok(())
}

/// Manually enqueue a run for a single named package, with caller-supplied
/// option overrides of the form `name=value` (a leading `-` is accepted).
///
/// Unknown packages and unknown options fail without enqueueing anything.
/// Returns the created run.
pub async fn schedule(
    db: &ResultsDb,
    packages: &[Package],
    package_name: &str,
    overrides: &[String],
) -> Result<Run, ScheduleError> {
    let pkg = packages
        .iter()
        .find(|pkg| pkg.name == package_name)
        .ok_or_else(|| ScheduleError::UnknownPackage(package_name.to_owned()))?;

    let args = materialize_args(pkg, overrides)?;
    let run = Run::new(&pkg.name, args);
    db.enqueue_run(&run).await?;

    info!(package = %pkg.name, run = %run.id, args = ?run.args, "manually scheduled run");
    Ok(run)
}

/// Resolve overrides against the package's declared options and produce the
/// concrete argument list: the override value when given, else the declared
/// default; options resolving to nothing are omitted.
fn materialize_args(pkg: &Package, overrides: &[String]) -> Result<Vec<String>, ScheduleError> {
    let mut given: HashMap<&str, &str> = HashMap::new();
    for raw in overrides {
        let (name, value) = raw
            .trim_start_matches('-')
            .split_once('=')
            .ok_or_else(|| ScheduleError::MalformedOverride(raw.clone()))?;
        if !pkg.options.iter().any(|opt| opt.name == name) {
            return Err(ScheduleError::UnknownOption {
                package: pkg.name.clone(),
                option: name.to_owned(),
            });
        }
        given.insert(name, value);
    }

    let args = pkg
        .options
        .iter()
        .filter_map(|opt| {
            let value = given
                .get(opt.name.as_str())
                .copied()
                .or(opt.default.as_deref())
                .filter(|value| !value.is_empty())?;
            Some(
                RunOption {
                    name: opt.name.clone(),
                    value: value.to_owned(),
                }
                .to_string(),
            )
        })
        .collect();
    Ok(args)
}

fn as_time_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}
