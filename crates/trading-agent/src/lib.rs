//! Autonomous multi-agent trading loop: per-agent analysis and arbitration,
//! Kelly sizing, circuit-breaker gating, execution and position monitoring,
//! driven by a fixed-interval cycle scheduler.

pub mod adapters;
pub mod config;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod monitor;
pub mod notifier;
pub mod pipeline;
pub mod scheduler;
pub mod store;


pub use config::AgentConfig;
pub use error::{TradingError, TradingResult};
pub use executor::TradeExecutor;
pub use metrics::{AgentMetrics, MetricsSnapshot};
pub use monitor::{ExitReason, ExitRules, PositionMonitor};
pub use pipeline::{standard_arbitrator, AgentOutcome, AgentPipeline, Collaborators, MonitorReport};
pub use scheduler::{AgentRun, CycleScheduler, CycleSummary, SchedulerSettings, SchedulerStatus};
