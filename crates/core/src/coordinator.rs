use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::command::ScsiExecutor;
use crate::config::{RescanIsolation, RescanOptions, WaitTimeout};
use crate::error::{RescanError, TopologyError};
use crate::model::{PredicateResult, RescanOutcome};
use crate::predicates::Predicate;
use crate::process::{ProcessSpec, RescanProcess};
use crate::service::TopologyService;

const RETRY_ARG: &str = "--retry";

/// Drives one rescan-and-poll loop at a time. Independent callers each use
/// their own coordinator; nothing here is shared between instances except the
/// topology service.
pub struct RescanCoordinator {
    topology: Arc<TopologyService>,
    executor: Arc<dyn ScsiExecutor>,
    worker: Option<RescanProcess>,
    terminate_timeout: Duration,
}

impl RescanCoordinator {
    pub fn new(topology: Arc<TopologyService>, executor: Arc<dyn ScsiExecutor>) -> Self {
        Self {
            topology,
            executor,
            worker: None,
            terminate_timeout: RescanOptions::default().terminate_timeout(),
        }
    }

    pub fn topology(&self) -> &Arc<TopologyService> {
        &self.topology
    }

    /// Rescans, then polls until `predicate` holds or `timeout` runs out.
    /// Without a predicate the call succeeds right after the first rescan.
    ///
    /// The timeout bounds the polling loop only. A blocking in-process
    /// rescan may itself run past it.
    pub fn rescan_and_wait_for(
        &mut self,
        predicate: Option<&dyn Predicate>,
        timeout: WaitTimeout,
        options: &RescanOptions,
    ) -> Result<RescanOutcome, RescanError> {
        options.validate()?;
        self.terminate_timeout = options.terminate_timeout();
        let started = Instant::now();

        self.topology.invalidate();
        self.initial_rescan(options);
        let polling_started = Instant::now();

        let Some(predicate) = predicate else {
            info!("rescan finished, no predicate to wait for");
            return Ok(outcome(true, started, 0, PredicateResult::True));
        };
        info!("waiting for {} ({:?})", predicate, timeout);

        let mut iterations = 0u32;
        loop {
            iterations = iterations.saturating_add(1);
            let result = match self.evaluate(predicate) {
                Ok(result) => result,
                Err(err) if err.is_recoverable() => {
                    debug!("{} is indeterminate: {}", predicate, err);
                    PredicateResult::Indeterminate
                }
                Err(err) => {
                    warn!("aborting wait for {}: {}", predicate, err);
                    return Err(err.into());
                }
            };
            debug!("iteration {}: {} -> {:?}", iterations, predicate, result);

            if result == PredicateResult::True {
                info!(
                    "{} after {} iterations ({:.1}s)",
                    predicate,
                    iterations,
                    started.elapsed().as_secs_f64()
                );
                return Ok(outcome(true, started, iterations, result));
            }
            if timeout.is_exceeded(polling_started.elapsed()) {
                let outcome = outcome(false, started, iterations, result);
                warn!(
                    "timed out waiting for {} after {} iterations",
                    predicate, iterations
                );
                return Err(RescanError::Timeout {
                    predicate: predicate.to_string(),
                    outcome,
                });
            }

            self.retry_rescan(options);
            thread::sleep(options.poll_interval());
        }
    }

    fn evaluate(&self, predicate: &dyn Predicate) -> Result<PredicateResult, TopologyError> {
        let snapshot = self.topology.refresh()?;
        predicate.evaluate(&snapshot, self.executor.as_ref())
    }

    fn initial_rescan(&mut self, options: &RescanOptions) {
        let wait = options.wait_for_initial_rescan;
        let result = match &options.isolation {
            RescanIsolation::InProcess => self.topology.provider().initiate_rescan(wait),
            RescanIsolation::Subprocess(spec) => self.run_worker(spec, wait, options),
        };
        if let Err(err) = result {
            warn!("initial rescan failed: {}", err);
        }
    }

    fn retry_rescan(&mut self, options: &RescanOptions) {
        let result = match &options.isolation {
            RescanIsolation::InProcess => self.topology.provider().retry_rescan(),
            RescanIsolation::Subprocess(spec) => {
                let retry = spec.clone().with_arg(RETRY_ARG);
                self.run_worker(&retry, false, options)
            }
        };
        if let Err(err) = result {
            warn!("retry rescan failed: {}", err);
        }
    }

    /// Starts a worker process, keeping at most one alive. A previous worker
    /// still inside its time budget is left alone and no new one starts; one
    /// past its budget is terminated first.
    fn run_worker(
        &mut self,
        spec: &ProcessSpec,
        wait: bool,
        options: &RescanOptions,
    ) -> Result<(), TopologyError> {
        if let Some(mut previous) = self.worker.take() {
            let finished = previous.try_finished().unwrap_or_else(|err| {
                warn!("{}", err);
                None
            });
            match finished {
                Some(status) => debug!("rescan worker {} exited with {}", previous.label(), status),
                None if !wait && previous.elapsed() < options.rescan_process_timeout() => {
                    debug!("rescan worker {} still running", previous.label());
                    self.worker = Some(previous);
                    return Ok(());
                }
                None => {
                    info!("terminating rescan worker {}", previous.label());
                    previous.terminate(options.terminate_timeout());
                }
            }
        }

        let mut process = RescanProcess::spawn(spec)?;
        if !wait {
            self.worker = Some(process);
            return Ok(());
        }

        match process.wait_with_deadline(options.rescan_process_timeout())? {
            Some(status) if status.success() => Ok(()),
            Some(status) => Err(TopologyError::Rescan(format!(
                "{} exited with {}",
                process.label(),
                status
            ))),
            None => {
                let label = process.label().to_string();
                process.terminate(options.terminate_timeout());
                Err(TopologyError::Rescan(format!(
                    "{} did not finish within {:?}",
                    label,
                    options.rescan_process_timeout()
                )))
            }
        }
    }
}

impl Drop for RescanCoordinator {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.terminate(self.terminate_timeout);
        }
    }
}

fn outcome(
    converged: bool,
    started: Instant,
    iterations: u32,
    last_predicate_result: PredicateResult,
) -> RescanOutcome {
    RescanOutcome {
        converged,
        elapsed_nanos: u64::try_from(started.elapsed().as_nanos()).unwrap_or(u64::MAX),
        iterations,
        last_predicate_result,
    }
}
