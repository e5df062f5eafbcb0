use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::JoinSet;
use tokio::time::Instant;

use super::client::ControlPlane;
use super::protocol::{ActionRequest, ActionResponse, AgentRegistration, Heartbeat, Identity};
use super::scheduler::PollingScheduler;
use super::state::AgentState;
use crate::auth::Authenticator;
use crate::modules::ModuleRegistry;
use crate::store::Store;

/// Lowest accepted poll interval
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(5);

pub const EXPIRED_MESSAGE: &str = "Action expired";

#[derive(Debug, Clone)]
pub struct PollerSettings {
    pub poll_interval: Duration,
    /// Used for actions that arrive with a zero timeout
    pub default_timeout: Duration,
    pub max_concurrent: usize,
    pub heartbeat_interval: Duration,
    /// Consecutive immediate re-polls allowed while the server reports more work
    pub max_drain_polls: u32,
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            default_timeout: Duration::from_secs(30),
            max_concurrent: 1,
            heartbeat_interval: Duration::from_secs(300),
            max_drain_polls: 10,
        }
    }
}

/// Result of one poll cycle
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// No usable session
    Skipped,
    /// The poll request failed
    Failed,
    Polled { processed: usize, has_more: bool },
}

/// Executes single actions and reports their outcome
#[derive(Clone)]
struct Dispatcher {
    client: Arc<dyn ControlPlane>,
    registry: Arc<ModuleRegistry>,
    default_timeout: Duration,
}

impl Dispatcher {
    fn deadline_for(&self, action: &ActionRequest, now: chrono::DateTime<Utc>) -> Instant {
        let timeout = match action.timeout {
            0 => self.default_timeout,
            secs => Duration::from_secs(secs),
        };
        let until_expiry = (action.expires_at - now).to_std().unwrap_or(Duration::ZERO);
        Instant::now() + timeout.min(until_expiry)
    }

    async fn execute(&self, action: ActionRequest) -> ActionResponse {
        let now = Utc::now();
        if action.is_expired_at(now) {
            tracing::warn!(
                action_id = %action.id,
                expires_at = %action.expires_at,
                "Skipping expired action"
            );
            return ActionResponse::failure(&action.id, EXPIRED_MESSAGE, 0);
        }

        let deadline = self.deadline_for(&action, now);
        let started = Instant::now();
        let outcome = self
            .registry
            .execute_action(deadline, &action.module_name, &action.action, action.parameters)
            .await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(result) => {
                tracing::info!(
                    action_id = %action.id,
                    module = %action.module_name,
                    action = %action.action,
                    duration_ms,
                    "Action succeeded"
                );
                ActionResponse::success(&action.id, result, duration_ms)
            }
            Err(e) => {
                tracing::warn!(
                    action_id = %action.id,
                    module = %action.module_name,
                    action = %action.action,
                    duration_ms,
                    "Action failed: {}",
                    e
                );
                ActionResponse::failure(&action.id, e.to_string(), duration_ms)
            }
        }
    }

    async fn execute_and_report(&self, identity: &Identity, action: ActionRequest) {
        let response = self.execute(action).await;
        if let Err(e) = self.client.submit_result(identity, &response).await {
            tracing::error!(action_id = %response.id, "Failed to submit action result: {:#}", e);
        }
    }
}

/// Polls the control plane and feeds actions to the module registry
pub struct Poller {
    auth: Arc<Authenticator>,
    store: Store,
    dispatcher: Dispatcher,
    settings: PollerSettings,
    scheduler: PollingScheduler,
    state: Mutex<AgentState>,
    registered: AtomicBool,
    started: Instant,
}

impl Poller {
    pub fn new(
        client: Arc<dyn ControlPlane>,
        auth: Arc<Authenticator>,
        registry: Arc<ModuleRegistry>,
        store: Store,
        settings: PollerSettings,
    ) -> anyhow::Result<Self> {
        let state = AgentState::load_or_new(&store)?;
        tracing::debug!(machine_id = %state.machine_id, "Agent state loaded");

        Ok(Self {
            auth,
            store,
            dispatcher: Dispatcher {
                client,
                registry,
                default_timeout: settings.default_timeout,
            },
            scheduler: PollingScheduler::new(settings.poll_interval, MIN_POLL_INTERVAL),
            settings,
            state: Mutex::new(state),
            registered: AtomicBool::new(false),
            started: Instant::now(),
        })
    }

    /// Change the poll interval without restarting the loop; returns the effective seconds
    pub fn update_poll_interval(&self, seconds: u64) -> u64 {
        self.scheduler.set_interval(Duration::from_secs(seconds)).as_secs()
    }

    pub fn poll_interval(&self) -> Duration {
        self.scheduler.interval()
    }

    pub async fn state(&self) -> AgentState {
        self.state.lock().await.clone()
    }

    /// Run poll cycles until `shutdown` turns true or its sender is dropped
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            interval_secs = self.poll_interval().as_secs(),
            max_concurrent = self.settings.max_concurrent,
            "Poller started"
        );

        let mut drained = 0;
        let mut last_heartbeat = Instant::now();

        while !*shutdown.borrow() {
            let outcome = self.tick().await;

            if last_heartbeat.elapsed() >= self.settings.heartbeat_interval {
                self.heartbeat().await;
                last_heartbeat = Instant::now();
            }

            if let TickOutcome::Polled { has_more: true, .. } = outcome {
                if drained < self.settings.max_drain_polls {
                    drained += 1;
                    tracing::debug!(drained, "More actions pending, polling again");
                    continue;
                }
                tracing::debug!("Drain limit reached, waiting for next interval");
            }
            drained = 0;

            tracing::debug!(
                "Next poll at: {}",
                self.scheduler.next_poll_time().format("%Y-%m-%d %H:%M:%S %Z")
            );
            tokio::select! {
                _ = self.scheduler.sleep_until_next_poll() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        self.unregister().await;
        tracing::info!("Poller stopped");
    }

    /// One poll/execute/report cycle
    pub async fn tick(&self) -> TickOutcome {
        let session = match self.auth.get_current_session().await {
            Ok(session) => session,
            Err(e) => {
                tracing::info!("Skipping poll: {}", e);
                return TickOutcome::Skipped;
            }
        };
        let identity = Identity::from(&session);

        let last_poll = {
            let mut state = self.state.lock().await;
            let last_poll = state.last_successful_poll;
            state.record_attempt();
            last_poll
        };

        let response = match self.dispatcher.client.poll(&identity, last_poll).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!("Poll failed: {:#}", e);
                self.persist_state().await;
                return TickOutcome::Failed;
            }
        };

        self.state.lock().await.record_success();
        if let Some(next_poll) = response.next_poll {
            tracing::debug!(%next_poll, "Server suggested next poll time");
        }

        self.announce(&identity).await;

        let has_more = response.has_more;
        let processed = response.actions.len();
        if processed > 0 {
            tracing::info!(count = processed, "Processing actions");
            self.process_batch(&identity, response.actions).await;
        }

        self.state.lock().await.record_processed(processed);
        self.persist_state().await;

        TickOutcome::Polled { processed, has_more }
    }

    async fn process_batch(&self, identity: &Identity, actions: Vec<ActionRequest>) {
        if self.settings.max_concurrent <= 1 {
            for action in actions {
                self.dispatcher.execute_and_report(identity, action).await;
            }
            return;
        }

        let permits = Arc::new(Semaphore::new(self.settings.max_concurrent));
        let mut tasks = JoinSet::new();
        for action in actions {
            let dispatcher = self.dispatcher.clone();
            let identity = identity.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let Ok(_permit) = permits.acquire_owned().await else {
                    return;
                };
                dispatcher.execute_and_report(&identity, action).await;
            });
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                tracing::error!("Action task failed: {}", e);
            }
        }
    }

    async fn announce(&self, identity: &Identity) {
        if self.registered.load(Ordering::SeqCst) {
            return;
        }

        let modules = self
            .dispatcher
            .registry
            .get_module_infos()
            .await
            .into_iter()
            .map(|m| m.name)
            .collect();
        let registration = AgentRegistration {
            machine_id: self.state.lock().await.machine_id.clone(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            hostname: std::env::var("HOSTNAME").ok(),
            modules,
        };

        match self.dispatcher.client.register(identity, &registration).await {
            Ok(_) => {
                self.registered.store(true, Ordering::SeqCst);
                self.state.lock().await.record_registered();
                tracing::info!(machine_id = %registration.machine_id, "Agent registered with control plane");
                match self.dispatcher.client.info(identity).await {
                    Ok(info) => tracing::debug!(%info, "Control plane info"),
                    Err(e) => tracing::debug!("Control plane info unavailable: {:#}", e),
                }
            }
            Err(e) => tracing::warn!("Agent registration failed: {:#}", e),
        }
    }

    async fn heartbeat(&self) {
        if !self.registered.load(Ordering::SeqCst) {
            return;
        }
        let Ok(session) = self.auth.get_current_session().await else {
            return;
        };

        let heartbeat = {
            let state = self.state.lock().await;
            Heartbeat {
                machine_id: state.machine_id.clone(),
                timestamp: Utc::now(),
                uptime_secs: self.started.elapsed().as_secs(),
                poll_count: state.poll_count,
                actions_processed: state.actions_processed,
            }
        };

        match self.dispatcher.client.heartbeat(&Identity::from(&session), &heartbeat).await {
            Ok(_) => tracing::debug!("Heartbeat sent"),
            Err(e) => tracing::warn!("Heartbeat failed: {:#}", e),
        }
    }

    async fn unregister(&self) {
        if !self.registered.swap(false, Ordering::SeqCst) {
            return;
        }
        let Ok(session) = self.auth.get_current_session().await else {
            return;
        };

        match self.dispatcher.client.unregister(&Identity::from(&session)).await {
            Ok(_) => tracing::info!("Agent unregistered from control plane"),
            Err(e) => tracing::warn!("Agent unregistration failed: {:#}", e),
        }
    }

    async fn persist_state(&self) {
        let state = self.state.lock().await;
        if let Err(e) = state.save(&self.store) {
            tracing::error!("Failed to persist agent state: {:#}", e);
        }
    }
}
