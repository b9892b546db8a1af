//! Risk aggregation.
//!
//! The score is the raw number of distinct infected peers met, not a
//! percentage, so it can run past 100 in crowded areas. Bucketing applies the
//! fixed thresholds regardless.

use serde::{Deserialize, Serialize};

pub const MEDIUM_RISK_THRESHOLD: u32 = 34;
pub const HIGH_RISK_THRESHOLD: u32 = 67;

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
    Infected,
    Recovered,
}

impl RiskLevel {
    pub fn from_score(score: u32) -> Self {
        if score < MEDIUM_RISK_THRESHOLD {
            RiskLevel::Low
        } else if score < HIGH_RISK_THRESHOLD {
            RiskLevel::Medium
        } else {
            RiskLevel::High
        }
    }

    /// Needle position on a 0..1 meter.
    pub fn position(self) -> f64 {
        match self {
            RiskLevel::Recovered => 0.01,
            RiskLevel::Low => 0.1,
            RiskLevel::Medium => 0.5,
            RiskLevel::High => 0.9,
            RiskLevel::Infected => 1.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SelfReport {
    pub infected: bool,
    pub recovered: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DashboardSnapshot {
    pub risk_score: u32,
    pub met_count: u64,
    pub infected_met_count: u64,
    pub self_reported_infected: bool,
    pub self_reported_recovered: bool,
}

impl DashboardSnapshot {
    pub fn sick_and_not_recovered(&self) -> bool {
        self.self_reported_infected && !self.self_reported_recovered
    }

    pub fn risk_level(&self) -> RiskLevel {
        if self.sick_and_not_recovered() {
            RiskLevel::Infected
        } else if self.self_reported_recovered {
            RiskLevel::Recovered
        } else {
            RiskLevel::from_score(self.risk_score)
        }
    }

    /// Continuous meter value: score/100 inside 1..=100, with the
    /// self-report states pinned to the ends.
    pub fn meter_position(&self) -> f64 {
        if self.sick_and_not_recovered() {
            return 1.0;
        }
        if self.self_reported_recovered {
            return 0.01;
        }
        if !(1..=100).contains(&self.risk_score) {
            return 0.01;
        }
        f64::from(self.risk_score) / 100.0
    }

    pub fn self_report(&self) -> SelfReport {
        SelfReport {
            infected: self.self_reported_infected,
            recovered: self.self_reported_recovered,
        }
    }
}

/// Builds the dashboard snapshot from store counters and self-report flags.
pub fn aggregate(met_count: u64, infected_met_count: u64, report: SelfReport) -> DashboardSnapshot {
    DashboardSnapshot {
        risk_score: u32::try_from(infected_met_count).unwrap_or(u32::MAX),
        met_count,
        infected_met_count,
        self_reported_infected: report.infected,
        self_reported_recovered: report.recovered,
    }
}
