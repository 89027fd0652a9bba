//! Pipeline scheduler: aggregate → promote → sweep, once per cycle
//!
//! The three steps of a cycle run sequentially on one connection, so the
//! aggregator and promoter never see each other's half-written state.

use super::aggregator::{AggregationReport, TransferAggregator};
use super::clock::Clock;
use super::config::{ConfigError, RetentionPolicy};
use super::granularity::PromotionRule;
use super::promoter::{GranularityPromoter, PromotionReport};
use super::retention::{RetentionReport, RetentionSweeper};
use rusqlite::Connection;
use serde::Serialize;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What one scheduler cycle did
#[derive(Debug, Clone, Default, Serialize)]
pub struct CycleReport {
    /// `None` when the aggregation step failed
    pub aggregation: Option<AggregationReport>,
    pub promotions: Vec<PromotionReport>,
    pub retention: Option<RetentionReport>,
    pub errors: Vec<String>,
    /// Set when the stop signal interrupted the cycle between steps
    pub interrupted: bool,
}

pub struct PipelineScheduler {
    conn: Connection,
    aggregator: TransferAggregator,
    promoter: GranularityPromoter,
    sweeper: RetentionSweeper,
    rules: Vec<PromotionRule>,
    interval: Duration,
}

impl PipelineScheduler {
    pub fn new(
        conn: Connection,
        clock: Clock,
        rules: Vec<PromotionRule>,
        retention: RetentionPolicy,
        interval: Duration,
    ) -> Result<Self, ConfigError> {
        PromotionRule::validate_ladder(&rules).map_err(ConfigError::InvalidLadder)?;

        Ok(Self {
            conn,
            aggregator: TransferAggregator::new(clock.clone()),
            promoter: GranularityPromoter::new(clock.clone()),
            sweeper: RetentionSweeper::new(retention, clock),
            rules,
            interval,
        })
    }

    /// Run one full cycle
    pub fn run_cycle(&mut self) -> CycleReport {
        self.cycle(&CancellationToken::new())
    }

    fn cycle(&mut self, cancel: &CancellationToken) -> CycleReport {
        let mut report = CycleReport::default();

        match self.aggregator.run(&mut self.conn) {
            Ok(aggregation) => report.aggregation = Some(aggregation),
            Err(e) => {
                log::error!("❌ Transfer aggregation failed, retrying next cycle: {}", e);
                report.errors.push(format!("aggregation: {}", e));
            }
        }

        for rule in &self.rules {
            if cancel.is_cancelled() {
                report.interrupted = true;
                return report;
            }
            match self.promoter.promote(&mut self.conn, rule) {
                Ok(promotion) => report.promotions.push(promotion),
                Err(e) => {
                    log::error!(
                        "❌ Promotion {}→{} failed, retrying next cycle: {}",
                        rule.from_granularity,
                        rule.to_granularity,
                        e
                    );
                    report.errors.push(format!(
                        "promotion {}→{}: {}",
                        rule.from_granularity, rule.to_granularity, e
                    ));
                }
            }
        }

        if cancel.is_cancelled() {
            report.interrupted = true;
            return report;
        }
        report.retention = Some(self.sweeper.sweep(&self.conn));

        report
    }

    /// Loop cycles until `cancel` fires
    pub async fn run(mut self, cancel: CancellationToken) {
        log::info!(
            "⏰ Starting pipeline scheduler (interval: {:?}, {} promotion rules)",
            self.interval,
            self.rules.len()
        );

        loop {
            let report = self.cycle(&cancel);
            if !report.errors.is_empty() {
                log::warn!("⚠️  Cycle finished with {} errors", report.errors.len());
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }

        log::info!("✅ Pipeline scheduler stopped");
    }
}
