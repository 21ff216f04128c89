use branchforge_common::{Agent, Metric};
use serde::Serialize;

use crate::{Controller, ControllerError};

/// One line of the synthetic log stream. Metrics are the ground truth;
/// supervisor log files are appended when the host still has them.
#[derive(Debug, Clone, Serialize)]
pub struct LogLine {
    pub timestamp: Option<i64>,
    pub source: &'static str,
    pub line: String,
}

impl Controller {
    pub async fn synthesize_logs(
        &self,
        agent: &Agent,
        limit: u32,
    ) -> Result<Vec<LogLine>, ControllerError> {
        let mut lines = Vec::new();

        let metrics = self.store.recent_metrics(agent.id, limit).await?;
        for metric in metrics.iter().rev() {
            lines.push(LogLine {
                timestamp: Some(metric.timestamp),
                source: "metrics",
                line: format_metric(metric),
            });
        }

        // Best-effort: ephemeral hosts lose these files between restarts.
        let log_path = self.supervisor.log_path(&agent.branch_hash.supervisor_name());
        if let Ok(content) = tokio::fs::read_to_string(&log_path).await {
            let tail: Vec<&str> = content.lines().rev().take(limit as usize).collect();
            for line in tail.into_iter().rev() {
                lines.push(LogLine {
                    timestamp: None,
                    source: "process",
                    line: line.to_string(),
                });
            }
        }

        Ok(lines)
    }
}

fn format_metric(metric: &Metric) -> String {
    let mut line = format!("decision={}", metric.decision);
    if let Some(price) = metric.price {
        line.push_str(&format!(" price={price}"));
    }
    if metric.trade_executed {
        line.push_str(" trade=executed");
        if let Some(hash) = &metric.trade_tx_hash {
            line.push_str(&format!(" tx={hash}"));
        }
        if let Some(amount) = metric.trade_amount {
            line.push_str(&format!(" amount={amount}"));
        }
    }
    line
}
