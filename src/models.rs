//! Core domain models for the indicator scheduler

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// A monitored indicator definition (formerly "KPI")
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Indicator {
    pub id: i64,
    /// Unique human-readable code
    pub code: String,
    pub name: String,
    /// Minimum spacing between runs
    pub frequency_minutes: i32,
    pub last_run: Option<DateTime<Utc>>,
    pub is_active: bool,
    /// Which numeric series to read
    pub collector_id: i64,
    pub item_name: String,
    /// History window pulled for the comparison baseline
    pub last_minutes: i32,
    /// count / average / sum / min / max, parsed at evaluation time
    pub threshold_type: String,
    pub threshold_field: String,
    /// gt / gte / lt / lte / eq / ne, parsed at evaluation time
    pub threshold_comparison: String,
    pub threshold_value: Decimal,
    /// Volume floor below which breaches are ignored
    pub minimum_threshold: Option<Decimal>,
    pub cooldown_minutes: i32,
    /// 1 = urgent (SMS + email), 2 = email only
    pub priority: i16,
    pub owner_contact_id: Option<i64>,
    pub is_currently_running: bool,
    pub execution_start_time: Option<DateTime<Utc>>,
}

impl Indicator {
    /// Whether the indicator may run at `now`.
    ///
    /// Active, not running, and either never run or last run at least
    /// `frequency_minutes` ago.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        if !self.is_active || self.is_currently_running {
            return false;
        }
        match self.last_run {
            None => true,
            Some(last_run) => {
                last_run <= now - chrono::Duration::minutes(i64::from(self.frequency_minutes))
            }
        }
    }

    /// Parameters handed to the data source for this indicator
    pub fn reading_request(&self, timeout: Duration) -> ReadingRequest {
        ReadingRequest {
            indicator_id: self.id,
            collector_id: self.collector_id,
            item_name: self.item_name.clone(),
            window_minutes: self.last_minutes,
            threshold_type: self.threshold_type.clone(),
            threshold_field: self.threshold_field.clone(),
            timeout,
        }
    }
}

/// Aggregation applied by the collector procedure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdType {
    Count,
    Average,
    Sum,
    Min,
    Max,
}

impl FromStr for ThresholdType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "count" => Ok(Self::Count),
            "average" | "avg" => Ok(Self::Average),
            "sum" => Ok(Self::Sum),
            "min" => Ok(Self::Min),
            "max" => Ok(Self::Max),
            other => Err(format!("unknown threshold type: {other}")),
        }
    }
}

/// Comparison between the current reading and the threshold value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Comparison {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Ne,
}

impl FromStr for Comparison {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gt" | ">" => Ok(Self::Gt),
            "gte" | ">=" => Ok(Self::Gte),
            "lt" | "<" => Ok(Self::Lt),
            "lte" | "<=" => Ok(Self::Lte),
            "eq" | "=" | "==" => Ok(Self::Eq),
            "ne" | "!=" | "<>" => Ok(Self::Ne),
            other => Err(format!("unknown comparison operator: {other}")),
        }
    }
}

impl fmt::Display for Comparison {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Self::Gt => "gt",
            Self::Gte => "gte",
            Self::Lt => "lt",
            Self::Lte => "lte",
            Self::Eq => "eq",
            Self::Ne => "ne",
        };
        f.write_str(op)
    }
}

impl Comparison {
    pub fn check(&self, value: Decimal, threshold: Decimal) -> bool {
        match self {
            Self::Gt => value > threshold,
            Self::Gte => value >= threshold,
            Self::Lt => value < threshold,
            Self::Lte => value <= threshold,
            Self::Eq => value == threshold,
            Self::Ne => value != threshold,
        }
    }
}

/// Alert priority carried on the indicator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Urgent,
    Standard,
}

impl Priority {
    pub fn from_level(level: i16) -> Option<Self> {
        match level {
            1 => Some(Self::Urgent),
            2 => Some(Self::Standard),
            _ => None,
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            Self::Urgent => Severity::Critical,
            Self::Standard => Severity::Warning,
        }
    }
}

/// Severity classification on an alert intent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Warning,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Warning => "warning",
        }
    }

    /// Delivery channels the notification boundary should use
    pub fn channels(&self) -> &'static [&'static str] {
        match self {
            Self::Critical => &["sms", "email"],
            Self::Warning => &["email"],
        }
    }
}

/// Fully parsed and validated threshold rule
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThresholdRule {
    pub threshold_type: ThresholdType,
    pub field: String,
    pub comparison: Comparison,
    pub value: Decimal,
    pub minimum_threshold: Option<Decimal>,
}

/// What triggered an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionContext {
    Scheduled,
    Manual,
}

impl ExecutionContext {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scheduled => "scheduled",
            Self::Manual => "manual",
        }
    }
}

impl FromStr for ExecutionContext {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(Self::Scheduled),
            "manual" => Ok(Self::Manual),
            other => Err(format!("unknown execution context: {other}")),
        }
    }
}

/// Request sent to the data source adapter
#[derive(Debug, Clone)]
pub struct ReadingRequest {
    pub indicator_id: i64,
    pub collector_id: i64,
    pub item_name: String,
    pub window_minutes: i32,
    pub threshold_type: String,
    pub threshold_field: String,
    pub timeout: Duration,
}

/// Numeric reading returned by a collector procedure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSourceReading {
    pub current_value: Decimal,
    pub historical_value: Option<Decimal>,
    /// Sample volume, when the source reports one
    pub volume: Option<Decimal>,
}

/// One row of execution history. Immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    /// Assigned by the history sink; `None` if the write failed
    pub id: Option<i64>,
    pub indicator_id: i64,
    pub executed_at: DateTime<Utc>,
    pub duration_ms: i64,
    pub success: bool,
    pub current_value: Option<Decimal>,
    pub historical_value: Option<Decimal>,
    pub deviation_percent: Option<Decimal>,
    pub should_alert: bool,
    /// Breach detected but emission held back by the cooldown
    pub alert_suppressed: bool,
    pub error_message: Option<String>,
    pub execution_context: ExecutionContext,
}

/// Decision to alert, handed to the notification boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertIntent {
    pub id: Uuid,
    pub indicator_id: i64,
    pub indicator_code: String,
    pub current_value: Decimal,
    pub historical_value: Option<Decimal>,
    pub deviation_percent: Option<Decimal>,
    pub threshold_value: Decimal,
    pub comparison: Comparison,
    pub severity: Severity,
    pub owner_contact_id: Option<i64>,
    pub suppressed: bool,
    pub triggered_at: DateTime<Utc>,
}

impl AlertIntent {
    /// One-line human readable description
    pub fn summary(&self) -> String {
        let deviation = match self.deviation_percent {
            Some(d) => format!(", deviation {d}%"),
            None => String::new(),
        };
        format!(
            "{}: current {} {} threshold {}{}",
            self.indicator_code, self.current_value, self.comparison, self.threshold_value, deviation
        )
    }
}

/// Alert actually delivered; read by the cooldown gate
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertLogEntry {
    pub id: i64,
    pub indicator_id: i64,
    pub trigger_time: DateTime<Utc>,
    pub severity: Severity,
    pub message: String,
}

/// Closed set of events an execution can emit
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    ExecutionCompleted { record: ExecutionRecord },
    ExecutionFailed { record: ExecutionRecord },
    AlertRaised { intent: AlertIntent },
    AlertSuppressed { intent: AlertIntent },
}

impl ExecutionEvent {
    pub fn indicator_id(&self) -> i64 {
        match self {
            Self::ExecutionCompleted { record } | Self::ExecutionFailed { record } => {
                record.indicator_id
            }
            Self::AlertRaised { intent } | Self::AlertSuppressed { intent } => intent.indicator_id,
        }
    }
}
