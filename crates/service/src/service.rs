use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use scsi_rescan_core::{
    build_provider, AllOf, DeviceExists, DeviceGone, DeviceSelector, DevicesReady, LunMapping,
    MappingExists, MappingGone, Predicate, RescanCoordinator, RescanError, RescanOptions,
    RescanOutcome, ScsiExecutor, Sg3UtilsExecutor, TopologyConfig, TopologyProvider,
    TopologyService, TopologySnapshot, WaitTimeout,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

const SESSION_POLL_INTERVAL: Duration = Duration::from_millis(25);

/// One condition of a rescan request, in serializable form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum WaitCondition {
    DeviceExists { device: DeviceSelector },
    DeviceGone { device: DeviceSelector },
    MappingExists { mapping: LunMapping },
    MappingGone { mapping: LunMapping },
    /// Every listed device answers TEST UNIT READY; empty means all of them.
    DevicesReady {
        #[serde(default)]
        devices: Vec<DeviceSelector>,
    },
}

impl WaitCondition {
    fn into_predicate(self) -> Box<dyn Predicate> {
        match self {
            WaitCondition::DeviceExists { device } => Box::new(DeviceExists(device)),
            WaitCondition::DeviceGone { device } => Box::new(DeviceGone(device)),
            WaitCondition::MappingExists { mapping } => Box::new(MappingExists(mapping)),
            WaitCondition::MappingGone { mapping } => Box::new(MappingGone(mapping)),
            WaitCondition::DevicesReady { devices } => Box::new(DevicesReady(devices)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescanRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub conditions: Vec<WaitCondition>,
    /// Seconds to wait for the conditions; 0 waits forever.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Overrides the service's configured rescan options.
    #[serde(default)]
    pub options: Option<RescanOptions>,
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for RescanRequest {
    fn default() -> Self {
        Self {
            session_id: None,
            conditions: Vec::new(),
            timeout_secs: default_timeout_secs(),
            options: None,
        }
    }
}

impl RescanRequest {
    fn predicate(&self) -> Option<Box<dyn Predicate>> {
        let mut predicates = self
            .conditions
            .iter()
            .cloned()
            .map(WaitCondition::into_predicate)
            .collect::<Vec<_>>();
        match predicates.len() {
            0 => None,
            1 => predicates.pop(),
            _ => Some(Box::new(AllOf(predicates))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RescanSessionStatus {
    Running,
    Converged,
    TimedOut,
    Failed,
}

impl RescanSessionStatus {
    pub fn is_finished(&self) -> bool {
        !matches!(self, RescanSessionStatus::Running)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RescanSessionSnapshot {
    pub session_id: String,
    pub status: RescanSessionStatus,
    pub predicate: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<RescanOutcome>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
struct RescanSession {
    status: RescanSessionStatus,
    predicate: Option<String>,
    started_at: DateTime<Utc>,
    finished_at: Option<DateTime<Utc>>,
    outcome: Option<RescanOutcome>,
    error: Option<String>,
}

impl RescanSession {
    fn snapshot(&self, session_id: &str) -> RescanSessionSnapshot {
        RescanSessionSnapshot {
            session_id: session_id.to_string(),
            status: self.status.clone(),
            predicate: self.predicate.clone(),
            started_at: self.started_at,
            finished_at: self.finished_at,
            outcome: self.outcome.clone(),
            error: self.error.clone(),
        }
    }

    fn finish(&mut self, result: Result<RescanOutcome, RescanError>) {
        self.finished_at = Some(Utc::now());
        match result {
            Ok(outcome) => {
                self.status = RescanSessionStatus::Converged;
                self.outcome = Some(outcome);
            }
            Err(RescanError::Timeout { predicate, outcome }) => {
                self.status = RescanSessionStatus::TimedOut;
                self.error = Some(format!("timed out waiting for {predicate}"));
                self.outcome = Some(outcome);
            }
            Err(err) => {
                self.status = RescanSessionStatus::Failed;
                self.error = Some(err.to_string());
            }
        }
    }
}

type SessionMap = Arc<Mutex<HashMap<String, RescanSession>>>;

/// Runs rescan-and-wait sessions for independent callers. Each session gets
/// its own coordinator on its own thread; they share one topology service.
pub struct RescanService {
    options: RescanOptions,
    topology: Arc<TopologyService>,
    executor: Arc<dyn ScsiExecutor>,
    sessions: SessionMap,
}

impl RescanService {
    pub fn new(config: TopologyConfig) -> Result<Self> {
        let executor: Arc<dyn ScsiExecutor> = Arc::new(Sg3UtilsExecutor::new());
        let provider = build_provider(&config, Arc::clone(&executor))
            .context("failed to set up topology provider")?;
        Ok(Self::with_provider(config.rescan, provider, executor))
    }

    pub fn with_provider(
        options: RescanOptions,
        provider: Arc<dyn TopologyProvider>,
        executor: Arc<dyn ScsiExecutor>,
    ) -> Self {
        Self {
            options,
            topology: Arc::new(TopologyService::new(provider)),
            executor,
            sessions: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn start_rescan(&self, request: RescanRequest) -> Result<String> {
        let options = request.options.clone().unwrap_or_else(|| self.options.clone());
        options.validate().context("invalid rescan options")?;

        let session_id = request
            .session_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let predicate = request.predicate();
        let timeout = WaitTimeout::from_legacy_seconds(request.timeout_secs);

        {
            let mut sessions = lock_sessions(&self.sessions)?;
            if sessions
                .get(&session_id)
                .is_some_and(|session| !session.status.is_finished())
            {
                return Err(anyhow!("rescan session already running: {session_id}"));
            }
            sessions.insert(
                session_id.clone(),
                RescanSession {
                    status: RescanSessionStatus::Running,
                    predicate: predicate.as_ref().map(ToString::to_string),
                    started_at: Utc::now(),
                    finished_at: None,
                    outcome: None,
                    error: None,
                },
            );
        }

        let sessions = Arc::clone(&self.sessions);
        let mut coordinator =
            RescanCoordinator::new(Arc::clone(&self.topology), Arc::clone(&self.executor));
        let thread_session_id = session_id.clone();
        let spawned = thread::Builder::new()
            .name(format!("rescan-{session_id}"))
            .spawn(move || {
                info!("rescan session {thread_session_id} started");
                let result =
                    coordinator.rescan_and_wait_for(predicate.as_deref(), timeout, &options);
                if let Err(err) = &result {
                    warn!("rescan session {thread_session_id} ended: {err}");
                }
                match lock_sessions(&sessions) {
                    Ok(mut sessions) => {
                        if let Some(session) = sessions.get_mut(&thread_session_id) {
                            session.finish(result);
                        }
                    }
                    Err(err) => warn!("could not record rescan session {thread_session_id}: {err}"),
                }
            });

        if let Err(err) = spawned {
            let mut sessions = lock_sessions(&self.sessions)?;
            sessions.remove(&session_id);
            return Err(err).context("failed to spawn rescan session thread");
        }
        Ok(session_id)
    }

    pub fn get_rescan_session(&self, session_id: &str) -> Result<RescanSessionSnapshot> {
        let sessions = lock_sessions(&self.sessions)?;
        let session = sessions
            .get(session_id)
            .ok_or_else(|| anyhow!("rescan session not found: {session_id}"))?;
        Ok(session.snapshot(session_id))
    }

    pub fn list_rescan_sessions(&self) -> Result<Vec<RescanSessionSnapshot>> {
        let sessions = lock_sessions(&self.sessions)?;
        let mut snapshots = sessions
            .iter()
            .map(|(id, session)| session.snapshot(id))
            .collect::<Vec<_>>();
        snapshots.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        Ok(snapshots)
    }

    /// Blocks until the session finished or `timeout` elapsed, and returns
    /// its latest state either way.
    pub fn wait_for_session(
        &self,
        session_id: &str,
        timeout: Duration,
    ) -> Result<RescanSessionSnapshot> {
        let started = Instant::now();
        loop {
            let snapshot = self.get_rescan_session(session_id)?;
            if snapshot.status.is_finished() || started.elapsed() >= timeout {
                return Ok(snapshot);
            }
            thread::sleep(SESSION_POLL_INTERVAL);
        }
    }

    /// The current topology, from cache when available.
    pub fn topology(&self) -> Result<Arc<TopologySnapshot>> {
        self.topology.snapshot().context("failed to read topology")
    }

    pub fn refresh(&self) -> Result<Arc<TopologySnapshot>> {
        self.topology.refresh().context("failed to refresh topology")
    }
}

fn lock_sessions(sessions: &SessionMap) -> Result<MutexGuard<'_, HashMap<String, RescanSession>>> {
    sessions
        .lock()
        .map_err(|_| anyhow!("rescan session registry lock poisoned"))
}
