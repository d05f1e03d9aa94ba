//! Threshold evaluation and alert bookkeeping.

use std::collections::HashMap;
use std::collections::VecDeque;

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// How many alerts the recent list retains.
const RECENT_ALERTS: usize = 100;

/// Alert severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Warning,
    Critical,
}

/// What resource an alert is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Cpu,
    Memory,
    Disk,
    ContainerCount,
}

impl std::fmt::Display for AlertKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            AlertKind::Cpu => "cpu",
            AlertKind::Memory => "memory",
            AlertKind::Disk => "disk",
            AlertKind::ContainerCount => "container_count",
        };
        write!(f, "{s}")
    }
}

/// A triggered alert.
#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub kind: AlertKind,
    pub level: AlertLevel,
    pub message: String,
    pub value: f64,
    pub triggered_at: String,
}

/// Warning/critical thresholds for each watched resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertThresholds {
    pub cpu_warning_percent: f64,
    pub cpu_critical_percent: f64,
    pub memory_warning_percent: f64,
    pub memory_critical_percent: f64,
    pub disk_warning_percent: f64,
    pub disk_critical_percent: f64,
    pub container_warning_count: usize,
    pub container_critical_count: usize,
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            cpu_warning_percent: 75.0,
            cpu_critical_percent: 90.0,
            memory_warning_percent: 80.0,
            memory_critical_percent: 95.0,
            disk_warning_percent: 85.0,
            disk_critical_percent: 95.0,
            container_warning_count: 40,
            container_critical_count: 60,
        }
    }
}

/// The values one evaluation pass compares against thresholds.
#[derive(Debug, Clone, Copy)]
pub struct AlertInputs {
    pub cpu_percent: f64,
    pub memory_percent: f64,
    pub disk_percent: f64,
    pub container_count: usize,
}

/// Evaluates thresholds and keeps the deduplicated recent-alert state.
pub struct AlertEngine {
    thresholds: AlertThresholds,
    /// Latest alert per (kind, level); re-triggering replaces the entry.
    current: HashMap<(AlertKind, AlertLevel), Alert>,
    recent: VecDeque<Alert>,
}

impl AlertEngine {
    pub fn new(thresholds: AlertThresholds) -> Self {
        Self {
            thresholds,
            current: HashMap::new(),
            recent: VecDeque::new(),
        }
    }

    /// Compare the latest values against thresholds. Returns the alerts this
    /// pass triggered; clears conditions that recovered.
    pub fn evaluate(&mut self, inputs: AlertInputs) -> Vec<Alert> {
        let t = &self.thresholds;
        let checks = [
            (
                AlertKind::Cpu,
                inputs.cpu_percent,
                t.cpu_warning_percent,
                t.cpu_critical_percent,
                "host CPU",
                "%",
            ),
            (
                AlertKind::Memory,
                inputs.memory_percent,
                t.memory_warning_percent,
                t.memory_critical_percent,
                "host memory",
                "%",
            ),
            (
                AlertKind::Disk,
                inputs.disk_percent,
                t.disk_warning_percent,
                t.disk_critical_percent,
                "disk usage",
                "%",
            ),
            (
                AlertKind::ContainerCount,
                inputs.container_count as f64,
                t.container_warning_count as f64,
                t.container_critical_count as f64,
                "container count",
                "",
            ),
        ];

        let mut triggered = Vec::new();
        for (kind, value, warning, critical, label, unit) in checks {
            let level = if value >= critical {
                Some(AlertLevel::Critical)
            } else if value >= warning {
                Some(AlertLevel::Warning)
            } else {
                None
            };

            match level {
                Some(level) => {
                    let alert = Alert {
                        kind,
                        level,
                        message: format!("{label} at {value:.1}{unit}"),
                        value,
                        triggered_at: Utc::now().to_rfc3339(),
                    };
                    // Dedupe by (kind, level): only the most recent survives.
                    self.current.insert((kind, level), alert.clone());
                    if self.recent.len() == RECENT_ALERTS {
                        self.recent.pop_front();
                    }
                    self.recent.push_back(alert.clone());
                    triggered.push(alert);
                }
                None => {
                    self.current.remove(&(kind, AlertLevel::Warning));
                    self.current.remove(&(kind, AlertLevel::Critical));
                }
            }
        }

        triggered
    }

    /// Currently standing alerts, one per (kind, level).
    pub fn active(&self) -> Vec<Alert> {
        let mut alerts: Vec<Alert> = self.current.values().cloned().collect();
        alerts.sort_by(|a, b| a.triggered_at.cmp(&b.triggered_at));
        alerts
    }

    /// Recent alert history, oldest first, bounded.
    pub fn recent(&self) -> Vec<Alert> {
        self.recent.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quiet() -> AlertInputs {
        AlertInputs {
            cpu_percent: 10.0,
            memory_percent: 20.0,
            disk_percent: 30.0,
            container_count: 2,
        }
    }

    #[test]
    fn test_no_alerts_below_thresholds() {
        let mut engine = AlertEngine::new(AlertThresholds::default());
        assert!(engine.evaluate(quiet()).is_empty());
        assert!(engine.active().is_empty());
    }

    #[test]
    fn test_warning_and_critical_levels() {
        let mut engine = AlertEngine::new(AlertThresholds::default());

        let warn = engine.evaluate(AlertInputs {
            cpu_percent: 80.0,
            ..quiet()
        });
        assert_eq!(warn.len(), 1);
        assert_eq!(warn[0].level, AlertLevel::Warning);
        assert_eq!(warn[0].kind, AlertKind::Cpu);

        let crit = engine.evaluate(AlertInputs {
            cpu_percent: 95.0,
            ..quiet()
        });
        assert_eq!(crit.len(), 1);
        assert_eq!(crit[0].level, AlertLevel::Critical);
    }

    #[test]
    fn test_dedupe_keeps_most_recent() {
        let mut engine = AlertEngine::new(AlertThresholds::default());
        engine.evaluate(AlertInputs {
            memory_percent: 85.0,
            ..quiet()
        });
        engine.evaluate(AlertInputs {
            memory_percent: 88.0,
            ..quiet()
        });

        // Two evaluations, one standing (memory, warning) entry.
        let active = engine.active();
        assert_eq!(active.len(), 1);
        assert!((active[0].value - 88.0).abs() < f64::EPSILON);
        // Both firings are in history.
        assert_eq!(engine.recent().len(), 2);
    }

    #[test]
    fn test_recovery_clears_condition() {
        let mut engine = AlertEngine::new(AlertThresholds::default());
        engine.evaluate(AlertInputs {
            disk_percent: 90.0,
            ..quiet()
        });
        assert_eq!(engine.active().len(), 1);

        engine.evaluate(quiet());
        assert!(engine.active().is_empty());
    }

    #[test]
    fn test_recent_list_bounded() {
        let mut engine = AlertEngine::new(AlertThresholds::default());
        for _ in 0..(RECENT_ALERTS + 20) {
            engine.evaluate(AlertInputs {
                cpu_percent: 95.0,
                ..quiet()
            });
        }
        assert_eq!(engine.recent().len(), RECENT_ALERTS);
    }
}
