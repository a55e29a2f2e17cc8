//! Calendar arithmetic for the three grouping passes.

use crate::catalog_store::PeriodType;
use chrono::{Datelike, Days, Months, NaiveDate};

/// Grouping key of one aggregate: `(year, period)`, where `year` is the ISO
/// week-year for weekly records and `period` is `None` for annual ones.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PeriodKey {
    pub year: i32,
    pub period: Option<u32>,
}

impl PeriodKey {
    pub fn of(period_type: PeriodType, date: NaiveDate) -> Self {
        match period_type {
            PeriodType::Weekly => {
                let week = date.iso_week();
                PeriodKey {
                    year: week.year(),
                    period: Some(week.week()),
                }
            }
            PeriodType::Monthly => PeriodKey {
                year: date.year(),
                period: Some(date.month()),
            },
            PeriodType::Annual => PeriodKey {
                year: date.year(),
                period: None,
            },
        }
    }
}

/// Calendar bounds of the period containing `date`: Monday to Sunday for
/// weeks, first to last day for months. Annual records use the observed
/// range instead, so `None` is returned for them.
pub fn calendar_bounds(period_type: PeriodType, date: NaiveDate) -> Option<(NaiveDate, NaiveDate)> {
    match period_type {
        PeriodType::Weekly => {
            let offset = u64::from(date.weekday().num_days_from_monday());
            let start = date.checked_sub_days(Days::new(offset))?;
            let end = start.checked_add_days(Days::new(6))?;
            Some((start, end))
        }
        PeriodType::Monthly => {
            let start = date.with_day(1)?;
            let end = start.checked_add_months(Months::new(1))?.pred_opt()?;
            Some((start, end))
        }
        PeriodType::Annual => None,
    }
}
