//! Read-only statistics folds over decrypted payment amounts.
//!
//! Rows are produced by the store (which alone holds the vault); everything
//! here is pure.

use super::models::PaymentMethod;
use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::BTreeMap;

/// Filters on `subscription_start`. A date range, when set, overrides year/month.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsFilter {
    pub year: Option<i32>,
    pub month: Option<u32>,
    pub date_range: Option<(NaiveDate, NaiveDate)>,
}

impl StatsFilter {
    pub fn year(year: i32) -> Self {
        Self {
            year: Some(year),
            ..Self::default()
        }
    }

    pub fn matches(&self, start: NaiveDate) -> bool {
        if let Some((from, to)) = self.date_range {
            return from <= start && start <= to;
        }
        self.year.map_or(true, |y| start.year() == y) && self.month.map_or(true, |m| start.month() == m)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsRow {
    pub protocol_id: String,
    pub subscription_start: NaiveDate,
    pub subscription_end: NaiveDate,
    pub payment_amount: Decimal,
    pub payment_method: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PaymentStatistics {
    pub total_revenue: Decimal,
    pub subscription_count: usize,
    pub average_payment: Decimal,
    pub pos_count: usize,
    pub bollettino_count: usize,
}

pub fn payment_statistics(rows: &[StatsRow]) -> PaymentStatistics {
    let total_revenue: Decimal = rows.iter().map(|r| r.payment_amount).sum();
    let subscription_count = rows.len();
    let average_payment = if subscription_count == 0 {
        Decimal::ZERO
    } else {
        (total_revenue / Decimal::from(subscription_count)).round_dp(2)
    };
    let mut stats = PaymentStatistics {
        total_revenue,
        subscription_count,
        average_payment,
        ..PaymentStatistics::default()
    };
    for row in rows {
        match PaymentMethod::normalize(&row.payment_method) {
            PaymentMethod::Pos => stats.pos_count += 1,
            PaymentMethod::Bollettino => stats.bollettino_count += 1,
            PaymentMethod::Other(_) => {}
        }
    }
    stats
}

fn month_of(date: NaiveDate) -> NaiveDate {
    NaiveDate::from_ymd_opt(date.year(), date.month(), 1).unwrap_or(date)
}

fn month_label(month: NaiveDate) -> String {
    month.format("%b %Y").to_string()
}

/// Revenue per calendar month, oldest first.
pub fn monthly_revenue(rows: &[StatsRow]) -> Vec<(String, Decimal)> {
    let mut months: BTreeMap<NaiveDate, Decimal> = BTreeMap::new();
    for row in rows {
        *months.entry(month_of(row.subscription_start)).or_default() += row.payment_amount;
    }
    months.into_iter().map(|(m, total)| (month_label(m), total)).collect()
}

pub fn subscriptions_per_month(rows: &[StatsRow]) -> Vec<(String, usize)> {
    let mut months: BTreeMap<NaiveDate, usize> = BTreeMap::new();
    for row in rows {
        *months.entry(month_of(row.subscription_start)).or_default() += 1;
    }
    months.into_iter().map(|(m, count)| (month_label(m), count)).collect()
}

/// Always reports POS and BOLLETTINO, plus any other method seen.
pub fn payment_methods_breakdown(rows: &[StatsRow]) -> BTreeMap<String, usize> {
    let mut methods = BTreeMap::from([
        (PaymentMethod::POS.to_string(), 0),
        (PaymentMethod::BOLLETTINO.to_string(), 0),
    ]);
    for row in rows {
        let method = PaymentMethod::normalize(&row.payment_method);
        if method.as_str().is_empty() {
            continue;
        }
        *methods.entry(method.as_str().to_string()).or_default() += 1;
    }
    methods
}

/// Cumulative revenue by start date. Labels drop the year when the filter pins one.
pub fn revenue_trend(rows: &[StatsRow], filter: &StatsFilter) -> Vec<(String, Decimal)> {
    let mut ordered: Vec<&StatsRow> = rows.iter().collect();
    ordered.sort_by_key(|r| r.subscription_start);
    let pattern = if filter.year.is_some() { "%d/%m" } else { "%d/%m/%Y" };
    let mut cumulative = Decimal::ZERO;
    ordered
        .into_iter()
        .map(|row| {
            cumulative += row.payment_amount;
            (row.subscription_start.format(pattern).to_string(), cumulative)
        })
        .collect()
}
