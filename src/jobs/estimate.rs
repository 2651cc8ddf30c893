//! Heuristic report generation time, shown to users while a job runs.

use super::types::{ReportKind, ReportParameters};

/// Cost model for [`estimate`]. All costs are seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EstimatorConfig {
  pub min_generation_delay_secs: u64,
  pub poll_interval_secs: u64,
  pub per_month_secs: u64,
  /// Scale applied to the month cost when the range spans several months
  pub multi_month_percent: u64,
  pub per_unit_secs: u64,
  /// Daily reports only
  pub per_day_secs: u64,
  /// Breadth assumed when no classrooms are selected (all of them)
  pub full_breadth_units: u64,
}

impl Default for EstimatorConfig {
  fn default() -> Self {
    Self {
      min_generation_delay_secs: 20,
      poll_interval_secs: 5,
      per_month_secs: 15,
      multi_month_percent: 125,
      per_unit_secs: 2,
      per_day_secs: 1,
      full_breadth_units: 24,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurationEstimate {
  pub min_seconds: u64,
  /// Always a multiple of the poll interval
  pub total_seconds: u64,
  pub description: String,
}

pub fn estimate(params: &ReportParameters, config: &EstimatorConfig) -> DurationEstimate {
  let months = u64::from(params.month_count());
  let mut month_cost = config.per_month_secs * months;
  if months > 1 {
    month_cost = (month_cost * config.multi_month_percent).div_ceil(100);
  }

  let breadth = if params.is_all_classrooms() {
    config.full_breadth_units
  } else {
    params.classroom_ids.len() as u64
  };
  let unit_cost = config.per_unit_secs * breadth;

  let day_cost = match params.kind {
    ReportKind::Daily => config.per_day_secs * u64::from(params.business_days()),
    ReportKind::Monthly => 0,
  };

  let raw = config.min_generation_delay_secs + month_cost + unit_cost + day_cost;
  let interval = config.poll_interval_secs.max(1);
  let total_seconds = raw.div_ceil(interval) * interval;

  DurationEstimate {
    min_seconds: config.min_generation_delay_secs,
    total_seconds,
    description: format!(
      "about {} for {} month{} across {}",
      format_duration(total_seconds),
      months,
      if months == 1 { "" } else { "s" },
      if params.is_all_classrooms() {
        "all classrooms".to_string()
      } else {
        format!("{} classroom{}", breadth, if breadth == 1 { "" } else { "s" })
      }
    ),
  }
}

fn format_duration(secs: u64) -> String {
  match (secs / 60, secs % 60) {
    (0, s) => format!("{}s", s),
    (m, 0) => format!("{}m", m),
    (m, s) => format!("{}m {}s", m, s),
  }
}

#[cfg(test)]
mod tests {
  use chrono::NaiveDate;

  use super::*;

  fn d(y: i32, m: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, day).unwrap()
  }

  #[test]
  fn test_two_month_full_breadth_aligns_to_interval() {
    let config = EstimatorConfig::default();
    let params = ReportParameters::new(ReportKind::Monthly, d(2024, 1, 1), d(2024, 2, 29), vec![]);
    let est = estimate(&params, &config);

    assert_eq!(est.total_seconds % config.poll_interval_secs, 0);
    // 20 + ceil(30 * 1.25) + 2 * 24 = 106, rounded up to 110
    assert_eq!(est.total_seconds, 110);
    assert_eq!(est.min_seconds, 20);
    assert_eq!(est.description, "about 1m 50s for 2 months across all classrooms");
  }

  #[test]
  fn test_daily_reports_pay_per_business_day() {
    let config = EstimatorConfig::default();
    // 2024-03-04 is a Monday, two full weeks: ten business days
    let monthly = ReportParameters::new(ReportKind::Monthly, d(2024, 3, 4), d(2024, 3, 17), vec![1]);
    let daily = ReportParameters::new(ReportKind::Daily, d(2024, 3, 4), d(2024, 3, 17), vec![1]);

    assert_eq!(estimate(&monthly, &config).total_seconds, 40);
    assert_eq!(estimate(&daily, &config).total_seconds, 50);
  }

  #[test]
  fn test_format_duration() {
    assert_eq!(format_duration(45), "45s");
    assert_eq!(format_duration(120), "2m");
    assert_eq!(format_duration(125), "2m 5s");
  }
}
