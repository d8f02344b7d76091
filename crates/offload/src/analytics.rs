//! Workout analytics operations
//!
//! CPU-bound calculations offloaded by the workout host. The same functions
//! back both the `analytics` execution units and the local fallbacks, so a
//! deployment without units still answers every operation.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::config::PoolConfig;
use crate::protocol::UnitRequest;
use crate::scheduler::SchedulerBuilder;
use crate::unit::{UnitContext, UnitFactory, UnitHandler, UnitId, UnitResult};

/// Task type served by this module
pub const TASK_TYPE: &str = "analytics";

pub const OP_CALCULATE_TSS: &str = "calculate_tss";
pub const OP_POWER_ZONES: &str = "power_zones";
pub const OP_SUMMARIZE: &str = "summarize";

const DEFAULT_FTP: f64 = 250.0;

/// Coggan zones as (number, fraction of FTP, name)
const POWER_ZONES: [(u8, f64, &str); 7] = [
    (1, 0.55, "Active Recovery"),
    (2, 0.75, "Endurance"),
    (3, 0.90, "Tempo"),
    (4, 1.05, "Lactate Threshold"),
    (5, 1.20, "VO2 Max"),
    (6, 1.50, "Anaerobic Capacity"),
    (7, 2.50, "Neuromuscular Power"),
];

/// Workout segment with power expressed as a fraction of FTP
#[derive(Debug, Clone, Deserialize)]
pub struct Segment {
    /// Seconds
    pub duration: f64,
    pub power_start: f64,
    #[serde(default)]
    pub power_end: Option<f64>,
}

impl Segment {
    pub fn average_power(&self) -> f64 {
        match self.power_end {
            Some(end) => (self.power_start + end) / 2.0,
            None => self.power_start,
        }
    }

    /// TSS contribution: hours · IF² · 100
    pub fn stress_score(&self) -> f64 {
        let intensity = self.average_power();
        (self.duration / 3600.0) * intensity * intensity * 100.0
    }
}

#[derive(Debug, Deserialize)]
struct TssRequest {
    segments: Vec<Segment>,
    #[serde(default)]
    ftp: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ZonesRequest {
    #[serde(default)]
    ftp: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct SummaryRequest {
    values: Vec<f64>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct PowerRange {
    pub min: u32,
    pub max: u32,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct PowerZone {
    pub name: &'static str,
    pub percentage: f64,
    pub power_range: PowerRange,
}

fn parse<T: for<'de> Deserialize<'de>>(payload: &Value) -> Result<T, String> {
    serde_json::from_value(payload.clone()).map_err(|e| format!("invalid payload: {e}"))
}

fn validate_segments(segments: &[Segment], ftp: f64) -> Result<(), String> {
    if ftp <= 0.0 {
        return Err(format!("ftp must be positive, got {ftp}"));
    }
    if let Some(bad) = segments.iter().position(|s| s.duration < 0.0) {
        return Err(format!("segment {bad} has a negative duration"));
    }
    Ok(())
}

fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Training Stress Score of a workout, rounded to 0.1
pub fn calculate_tss(payload: &Value) -> Result<Value, String> {
    let request: TssRequest = parse(payload)?;
    let ftp = request.ftp.unwrap_or(DEFAULT_FTP);
    validate_segments(&request.segments, ftp)?;

    let total: f64 = request.segments.iter().map(Segment::stress_score).sum();
    Ok(json!({ "tss": round_tenth(total), "segments": request.segments.len() }))
}

/// Power zone boundaries in watts for an FTP
pub fn power_zones(payload: &Value) -> Result<Value, String> {
    let request: ZonesRequest = parse(payload)?;
    let ftp = request.ftp.unwrap_or(DEFAULT_FTP);
    if ftp <= 0.0 {
        return Err(format!("ftp must be positive, got {ftp}"));
    }

    let zones: BTreeMap<String, PowerZone> = POWER_ZONES
        .iter()
        .map(|&(number, percentage, name)| {
            let min = if number > 1 {
                (ftp * (percentage - 0.05)) as u32
            } else {
                0
            };
            let zone = PowerZone {
                name,
                percentage,
                power_range: PowerRange {
                    min,
                    max: (ftp * (percentage + 0.05)) as u32,
                },
            };
            (format!("zone_{number}"), zone)
        })
        .collect();

    serde_json::to_value(zones).map_err(|e| e.to_string())
}

/// Count, min, max and mean of a series
pub fn summarize(payload: &Value) -> Result<Value, String> {
    let request: SummaryRequest = parse(payload)?;
    if request.values.is_empty() {
        return Err("values must not be empty".to_string());
    }

    let count = request.values.len();
    let min = request.values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = request
        .values
        .iter()
        .copied()
        .fold(f64::NEG_INFINITY, f64::max);
    let mean = request.values.iter().sum::<f64>() / count as f64;

    Ok(json!({ "count": count, "min": min, "max": max, "mean": mean }))
}

/// Execution unit for the `analytics` task type
#[derive(Debug, Default)]
pub struct AnalyticsUnit;

impl AnalyticsUnit {
    async fn tss_with_progress(&self, payload: &Value, ctx: &UnitContext) -> UnitResult {
        let request: TssRequest = parse(payload)?;
        let ftp = request.ftp.unwrap_or(DEFAULT_FTP);
        validate_segments(&request.segments, ftp)?;

        let count = request.segments.len();
        let mut total = 0.0;
        for (index, segment) in request.segments.iter().enumerate() {
            total += segment.stress_score();
            ctx.report_progress(json!({
                "segment": index + 1,
                "of": count,
                "tss": round_tenth(total),
            }))
            .await
            .map_err(|e| e.to_string())?;
        }

        Ok(json!({ "tss": round_tenth(total), "segments": count }))
    }
}

#[async_trait]
impl UnitHandler for AnalyticsUnit {
    async fn handle(&self, request: UnitRequest, ctx: UnitContext) -> UnitResult {
        match request.operation.as_str() {
            OP_CALCULATE_TSS => self.tss_with_progress(&request.payload, &ctx).await,
            OP_POWER_ZONES => power_zones(&request.payload),
            OP_SUMMARIZE => summarize(&request.payload),
            other => Err(format!("unknown analytics operation: {other}")),
        }
    }
}

/// Factory creating one [`AnalyticsUnit`] per slot
pub fn factory() -> Arc<dyn UnitFactory> {
    Arc::new(
        |_unit_id: &UnitId| -> anyhow::Result<Arc<dyn UnitHandler>> {
            Ok(Arc::new(AnalyticsUnit))
        },
    )
}

/// Register the analytics pool and its local fallbacks
pub fn register(builder: SchedulerBuilder, pool: PoolConfig) -> SchedulerBuilder {
    builder
        .register_pool(TASK_TYPE, pool, factory())
        .register_fallback(TASK_TYPE, OP_CALCULATE_TSS, Arc::new(calculate_tss))
        .register_fallback(TASK_TYPE, OP_POWER_ZONES, Arc::new(power_zones))
        .register_fallback(TASK_TYPE, OP_SUMMARIZE, Arc::new(summarize))
}
