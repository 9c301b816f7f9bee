use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;

use crate::scheduler::CycleSummary;

const RECENT_WINDOW: usize = 20;

/// Aggregate counters across cycles. Shared between the scheduler task and
/// status readers, so everything is atomic or behind a short lock.
pub struct AgentMetrics {
    cycles_completed: AtomicU64,
    cycles_skipped: AtomicU64,
    agents_processed: AtomicU64,
    trades_executed: AtomicU64,
    trades_failed: AtomicU64,
    holds: AtomicU64,
    rejections: AtomicU64,
    critical_rejections: AtomicU64,
    positions_closed: AtomicU64,
    winning_trades: AtomicU64,
    losing_trades: AtomicU64,
    last_cycle_ms: AtomicU64,
    // Rolling 20-trade window plus the running P&L total
    pnl: Mutex<PnlWindow>,
    log_interval_cycles: u64,
}

#[derive(Default)]
struct PnlWindow {
    total: f64,
    recent: VecDeque<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub cycles_completed: u64,
    pub cycles_skipped: u64,
    pub agents_processed: u64,
    pub trades_executed: u64,
    pub trades_failed: u64,
    pub holds: u64,
    pub rejections: u64,
    pub critical_rejections: u64,
    pub positions_closed: u64,
    pub winning_trades: u64,
    pub losing_trades: u64,
    pub total_pnl: f64,
    pub recent_win_rate: f64,
    pub recent_avg_pnl: f64,
    pub last_cycle_ms: u64,
}

impl AgentMetrics {
    pub fn new(log_interval_cycles: u64) -> Self {
        Self {
            cycles_completed: AtomicU64::new(0),
            cycles_skipped: AtomicU64::new(0),
            agents_processed: AtomicU64::new(0),
            trades_executed: AtomicU64::new(0),
            trades_failed: AtomicU64::new(0),
            holds: AtomicU64::new(0),
            rejections: AtomicU64::new(0),
            critical_rejections: AtomicU64::new(0),
            positions_closed: AtomicU64::new(0),
            winning_trades: AtomicU64::new(0),
            losing_trades: AtomicU64::new(0),
            last_cycle_ms: AtomicU64::new(0),
            pnl: Mutex::new(PnlWindow::default()),
            log_interval_cycles,
        }
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed.load(Ordering::Relaxed)
    }

    pub fn record_skipped_cycle(&self) {
        self.cycles_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_trade_result(&self, pnl: f64) {
        if pnl > 0.0 {
            self.winning_trades.fetch_add(1, Ordering::Relaxed);
        } else {
            self.losing_trades.fetch_add(1, Ordering::Relaxed);
        }
        if let Ok(mut window) = self.pnl.lock() {
            window.total += pnl;
            window.recent.push_back(pnl);
            if window.recent.len() > RECENT_WINDOW {
                window.recent.pop_front();
            }
        }
    }

    /// Fold a finished cycle into the counters. Emits the full metrics
    /// summary every `log_interval_cycles` cycles.
    pub fn record_cycle(&self, summary: &CycleSummary) {
        self.agents_processed
            .fetch_add(summary.agents_run as u64, Ordering::Relaxed);
        self.trades_executed
            .fetch_add(summary.executed as u64, Ordering::Relaxed);
        self.trades_failed
            .fetch_add(summary.failed as u64, Ordering::Relaxed);
        self.holds.fetch_add(summary.held as u64, Ordering::Relaxed);
        self.rejections
            .fetch_add(summary.rejected as u64, Ordering::Relaxed);
        self.critical_rejections
            .fetch_add(summary.critical_rejections as u64, Ordering::Relaxed);
        self.positions_closed
            .fetch_add(summary.closed as u64, Ordering::Relaxed);
        for pnl in &summary.realized_pnl {
            self.record_trade_result(*pnl);
        }
        self.last_cycle_ms.store(summary.duration_ms, Ordering::Relaxed);

        let cycles = self.cycles_completed.fetch_add(1, Ordering::Relaxed) + 1;
        if self.log_interval_cycles > 0 && cycles % self.log_interval_cycles == 0 {
            self.log_metrics();
        }
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let (total_pnl, recent_win_rate, recent_avg_pnl) = match self.pnl.lock() {
            Ok(window) if !window.recent.is_empty() => {
                let n = window.recent.len() as f64;
                let wins = window.recent.iter().filter(|p| **p > 0.0).count() as f64;
                (
                    window.total,
                    wins / n * 100.0,
                    window.recent.iter().sum::<f64>() / n,
                )
            }
            Ok(window) => (window.total, 0.0, 0.0),
            Err(_) => (0.0, 0.0, 0.0),
        };

        MetricsSnapshot {
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed),
            cycles_skipped: self.cycles_skipped.load(Ordering::Relaxed),
            agents_processed: self.agents_processed.load(Ordering::Relaxed),
            trades_executed: self.trades_executed.load(Ordering::Relaxed),
            trades_failed: self.trades_failed.load(Ordering::Relaxed),
            holds: self.holds.load(Ordering::Relaxed),
            rejections: self.rejections.load(Ordering::Relaxed),
            critical_rejections: self.critical_rejections.load(Ordering::Relaxed),
            positions_closed: self.positions_closed.load(Ordering::Relaxed),
            winning_trades: self.winning_trades.load(Ordering::Relaxed),
            losing_trades: self.losing_trades.load(Ordering::Relaxed),
            total_pnl,
            recent_win_rate,
            recent_avg_pnl,
            last_cycle_ms: self.last_cycle_ms.load(Ordering::Relaxed),
        }
    }

    /// Emit structured telemetry via tracing
    pub fn log_metrics(&self) {
        let m = self.snapshot();
        tracing::info!(
            cycles = m.cycles_completed,
            cycles_skipped = m.cycles_skipped,
            agents_processed = m.agents_processed,
            trades_executed = m.trades_executed,
            trades_failed = m.trades_failed,
            holds = m.holds,
            rejections = m.rejections,
            critical_rejections = m.critical_rejections,
            positions_closed = m.positions_closed,
            total_pnl = format!("{:.2}", m.total_pnl),
            recent_win_rate = format!("{:.1}%", m.recent_win_rate),
            recent_avg_pnl = format!("{:.2}", m.recent_avg_pnl),
            last_cycle_ms = m.last_cycle_ms,
            "Agent metrics summary"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn rolling_window_keeps_last_twenty() {
        let metrics = AgentMetrics::new(0);
        for _ in 0..5 {
            metrics.record_trade_result(-1.0);
        }
        for _ in 0..20 {
            metrics.record_trade_result(2.0);
        }

        let snap = metrics.snapshot();
        assert_eq!(snap.winning_trades, 20);
        assert_eq!(snap.losing_trades, 5);
        assert_relative_eq!(snap.total_pnl, 35.0);
        assert_relative_eq!(snap.recent_win_rate, 100.0);
        assert_relative_eq!(snap.recent_avg_pnl, 2.0);
    }

    #[test]
    fn cycles_fold_into_counters() {
        let metrics = AgentMetrics::new(1);
        let summary = CycleSummary {
            cycle: 1,
            agents_run: 3,
            executed: 1,
            held: 1,
            failed: 1,
            closed: 2,
            realized_pnl: vec![4.0, -1.0],
            duration_ms: 12,
            ..CycleSummary::default()
        };
        metrics.record_cycle(&summary);

        let snap = metrics.snapshot();
        assert_eq!(snap.cycles_completed, 1);
        assert_eq!(snap.agents_processed, 3);
        assert_eq!(snap.trades_executed, 1);
        assert_eq!(snap.positions_closed, 2);
        assert_eq!(snap.winning_trades, 1);
        assert_eq!(snap.losing_trades, 1);
        assert_eq!(snap.last_cycle_ms, 12);
    }
}
