use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_ports::notify_quietly;
use analysis_core::AgentRecord;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, StreamExt};
use risk_manager::{AgentRiskState, CircuitBreakerConfig, CircuitBreakerConfigUpdate};
use serde::Serialize;
use tokio::sync::{watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::config::AgentConfig;
use crate::metrics::{AgentMetrics, MetricsSnapshot};
use crate::pipeline::{AgentOutcome, AgentPipeline, MonitorReport};

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub interval: Duration,
    /// Delay after each agent run, per worker
    pub pacing: Duration,
    pub max_concurrent: usize,
    pub min_agent_balance: f64,
    pub metrics_log_interval_cycles: u64,
}

impl From<&AgentConfig> for SchedulerSettings {
    fn from(config: &AgentConfig) -> Self {
        Self {
            interval: config.cycle_interval(),
            pacing: config.agent_pacing(),
            max_concurrent: config.max_concurrent_agents,
            min_agent_balance: config.min_agent_balance,
            metrics_log_interval_cycles: config.metrics_log_interval_cycles,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentRun {
    pub agent_id: String,
    pub agent_name: String,
    pub symbol: String,
    pub outcome: AgentOutcome,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleSummary {
    pub cycle: u64,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub emergency_stopped: bool,
    pub agents_total: usize,
    pub agents_run: usize,
    pub agents_skipped: usize,
    pub executed: usize,
    pub held: usize,
    pub rejected: usize,
    pub critical_rejections: usize,
    pub failed: usize,
    /// Positions closed by the monitor and by signals
    pub closed: usize,
    pub realized_pnl: Vec<f64>,
    pub monitor: MonitorReport,
    pub runs: Vec<AgentRun>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub cycles_completed: u64,
    pub emergency_stopped: bool,
    pub metrics: MetricsSnapshot,
    /// Breaker state of every agent seen this process
    pub agents: Vec<AgentRiskState>,
    pub last_summary: Option<CycleSummary>,
}

/// Drives trading cycles on a fixed interval. A cycle never overlaps with
/// itself: timer ticks that land on a running cycle are skipped, explicit
/// `run_cycle_once` calls queue behind it.
pub struct CycleScheduler {
    pipeline: Arc<AgentPipeline>,
    settings: SchedulerSettings,
    metrics: Arc<AgentMetrics>,
    cycle_lock: Mutex<()>,
    cycle_counter: AtomicU64,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    last_summary: RwLock<Option<CycleSummary>>,
}

impl CycleScheduler {
    pub fn new(pipeline: Arc<AgentPipeline>, settings: SchedulerSettings) -> Self {
        let (stop_tx, _) = watch::channel(false);
        let metrics = Arc::new(AgentMetrics::new(settings.metrics_log_interval_cycles));
        Self {
            pipeline,
            settings,
            metrics,
            cycle_lock: Mutex::new(()),
            cycle_counter: AtomicU64::new(0),
            running: AtomicBool::new(false),
            stop_tx,
            task: Mutex::new(None),
            last_summary: RwLock::new(None),
        }
    }

    pub fn metrics(&self) -> &Arc<AgentMetrics> {
        &self.metrics
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Spawn the periodic task. Returns false if it is already running.
    pub async fn start(self: &Arc<Self>) -> bool {
        if self.running.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.stop_tx.send_replace(false);
        let mut stop_rx = self.stop_tx.subscribe();
        let this = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut interval = time::interval(this.settings.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        this.try_run_cycle().await;
                    }
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!("Cycle scheduler loop exited");
        });

        *self.task.lock().await = Some(handle);
        tracing::info!(
            "Cycle scheduler started: every {}s, {} worker(s), {}ms pacing",
            self.settings.interval.as_secs(),
            self.settings.max_concurrent,
            self.settings.pacing.as_millis()
        );
        true
    }

    /// Stop the periodic task, letting an in-flight cycle finish.
    pub async fn stop(&self) {
        self.stop_tx.send_replace(true);
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::error!("Scheduler task ended abnormally: {}", e);
            }
        }
        self.running.store(false, Ordering::SeqCst);
    }

    pub async fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.is_running(),
            cycles_completed: self.metrics.cycles_completed(),
            emergency_stopped: self.pipeline.registry().is_emergency_stopped(),
            metrics: self.metrics.snapshot(),
            agents: self.pipeline.registry().all_statuses().await,
            last_summary: self.last_summary.read().await.clone(),
        }
    }

    /// Run a cycle now, waiting for any in-flight cycle to finish first.
    pub async fn run_cycle_once(&self) -> CycleSummary {
        let _guard = self.cycle_lock.lock().await;
        self.execute_cycle().await
    }

    async fn try_run_cycle(&self) -> Option<CycleSummary> {
        let Ok(_guard) = self.cycle_lock.try_lock() else {
            tracing::warn!("Previous cycle still running, skipping this tick");
            self.metrics.record_skipped_cycle();
            return None;
        };
        Some(self.execute_cycle().await)
    }

    async fn execute_cycle(&self) -> CycleSummary {
        let cycle = self.cycle_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let timer = Instant::now();
        tracing::info!(cycle, "Starting trading cycle");

        let mut summary = CycleSummary {
            cycle,
            started_at: Utc::now(),
            ..CycleSummary::default()
        };

        // Exits first so freed balance and risk state are visible below
        summary.monitor = self.pipeline.monitor_positions().await;
        summary.closed = summary.monitor.closed;
        summary.realized_pnl = summary.monitor.realized_pnl.clone();

        let agents = match self.pipeline.store().load_agents().await {
            Ok(agents) => agents,
            Err(e) => {
                tracing::error!("Could not load agents: {}", e);
                summary.failed += 1;
                Vec::new()
            }
        };
        summary.agents_total = agents.len();
        summary.emergency_stopped = self.pipeline.registry().is_emergency_stopped();

        let eligible: Vec<AgentRecord> = if summary.emergency_stopped {
            tracing::warn!("Emergency stop active, no agent runs this cycle");
            Vec::new()
        } else {
            agents
                .into_iter()
                .filter(|agent| self.is_eligible(agent))
                .collect()
        };
        summary.agents_run = eligible.len();
        summary.agents_skipped = summary.agents_total - eligible.len();

        let total = eligible.len();
        let pacing = self.settings.pacing;
        let pipeline = Arc::clone(&self.pipeline);
        let mut runs: Vec<AgentRun> = stream::iter(eligible.into_iter().enumerate())
            .map(move |(i, agent)| {
                let pipeline = Arc::clone(&pipeline);
                async move {
                    let outcome = pipeline.run_agent(&agent).await;
                    if i + 1 < total && !pacing.is_zero() {
                        time::sleep(pacing).await;
                    }
                    AgentRun {
                        agent_id: agent.id,
                        agent_name: agent.name,
                        symbol: agent.symbol,
                        outcome,
                    }
                }
            })
            .buffer_unordered(self.settings.max_concurrent.max(1))
            .collect()
            .await;
        runs.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));

        for run in &runs {
            match &run.outcome {
                AgentOutcome::Executed { .. } => summary.executed += 1,
                AgentOutcome::Closed { realized_pnl, .. } => {
                    summary.closed += 1;
                    summary.realized_pnl.push(*realized_pnl);
                }
                AgentOutcome::Held { .. } => summary.held += 1,
                AgentOutcome::Rejected { critical, .. } => {
                    summary.rejected += 1;
                    if *critical {
                        summary.critical_rejections += 1;
                    }
                }
                AgentOutcome::Failed { .. } => summary.failed += 1,
            }
        }
        summary.runs = runs;
        summary.duration_ms = timer.elapsed().as_millis() as u64;

        tracing::info!(
            cycle = summary.cycle,
            duration_ms = summary.duration_ms,
            agents = summary.agents_run,
            skipped = summary.agents_skipped,
            executed = summary.executed,
            held = summary.held,
            rejected = summary.rejected,
            failed = summary.failed,
            closed = summary.closed,
            monitored = summary.monitor.checked,
            "Cycle complete"
        );

        self.metrics.record_cycle(&summary);
        *self.last_summary.write().await = Some(summary.clone());
        summary
    }

    fn is_eligible(&self, agent: &AgentRecord) -> bool {
        if !agent.is_active {
            return false;
        }
        if agent.balance < self.settings.min_agent_balance {
            tracing::debug!(
                "{}: balance ${:.2} below ${:.2}, skipped",
                agent.name,
                agent.balance,
                self.settings.min_agent_balance
            );
            return false;
        }
        true
    }

    // ----- operator controls -----

    pub async fn agent_risk_status(&self, agent_id: &str) -> Option<AgentRiskState> {
        self.pipeline.registry().agent_status(agent_id).await
    }

    pub async fn update_circuit_breaker_config(
        &self,
        update: CircuitBreakerConfigUpdate,
    ) -> CircuitBreakerConfig {
        let stop_requested = update.emergency_stop;
        let config = self.pipeline.registry().update_config(update).await;
        match stop_requested {
            Some(true) => self.alert("**EMERGENCY STOP** activated via config update").await,
            Some(false) => self.alert("**Trading resumed** via config update").await,
            None => {}
        }
        config
    }

    /// Halt one agent until it is reset. Works before the agent has ever
    /// traded: its breaker state is seeded from the store first. Returns
    /// false when the store does not know the agent.
    pub async fn trip_agent(&self, agent_id: &str, reason: &str) -> bool {
        let agent = match self.pipeline.store().load_agent(agent_id).await {
            Ok(Some(agent)) => agent,
            Ok(None) => {
                tracing::warn!(agent_id, "Trip requested for unknown agent");
                return false;
            }
            Err(e) => {
                tracing::error!(agent_id, "Could not load agent to trip: {}", e);
                return false;
            }
        };
        if let Err(e) = self.pipeline.hydrate_risk(&agent).await {
            tracing::warn!(agent_id, "Tripping without trade history: {}", e);
        }

        self.pipeline
            .registry()
            .trip_agent(agent_id, reason, agent.balance)
            .await;
        self.alert(&format!("**Agent {} tripped** by operator: {}", agent_id, reason))
            .await;
        true
    }

    pub async fn reset_agent(&self, agent_id: &str) -> bool {
        let reset = self.pipeline.registry().reset_agent(agent_id).await;
        if reset {
            self.alert(&format!("**Agent {} reset**, trading re-enabled", agent_id))
                .await;
        }
        reset
    }

    pub async fn emergency_stop_all(&self) {
        self.pipeline.registry().emergency_stop_all();
        self.alert("**EMERGENCY STOP** activated for all agents").await;
    }

    pub async fn resume(&self) {
        self.pipeline.registry().resume();
        self.alert("**Trading resumed** after emergency stop").await;
    }

    async fn alert(&self, message: &str) {
        notify_quietly(self.pipeline.alerts().as_ref(), message).await;
    }
}
