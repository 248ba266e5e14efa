use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

/// Energy carriers traded inside the community and with the utility grids.
/// All quantities are kWh, powers kW, prices SEK/kWh.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Resource {
    Electricity,
    HighTempHeat,
    LowTempHeat,
    Cooling,
}

impl Resource {
    /// Whether an external utility market exists for this resource.
    /// Low-temperature heat and cooling only move between community members.
    pub fn has_external_market(self) -> bool {
        matches!(self, Resource::Electricity | Resource::HighTempHeat)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
    EnumString,
)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Action {
    Buy,
    Sell,
}

/// Whether a trade cleared on the community's internal bus or directly
/// against the external utility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Market {
    Local,
    External,
}

/// Calendar-month key. Tariff components are settled per month, so maps are
/// keyed by this record rather than by a timestamp or a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Self {
        Self { year, month }
    }

    pub fn of(period: DateTime<Utc>) -> Self {
        Self { year: period.year(), month: period.month() }
    }

    pub fn days_in_month(&self) -> u32 {
        days_in_month(self.year, self.month)
    }

    pub fn days_in_year(&self) -> u32 {
        if is_leap_year(self.year) {
            366
        } else {
            365
        }
    }

    /// First hour of the month as a UTC timestamp.
    pub fn first_hour(&self) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(self.year, self.month, 1, 0, 0, 0)
            .single()
            .unwrap_or(DateTime::UNIX_EPOCH)
    }
}

impl std::fmt::Display for YearMonth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{:02}", self.year, self.month)
    }
}

pub fn is_leap_year(year: i32) -> bool {
    NaiveDate::from_ymd_opt(year, 2, 29).is_some()
}

pub fn days_in_month(year: i32, month: u32) -> u32 {
    let first = NaiveDate::from_ymd_opt(year, month, 1).expect("valid month");
    let next = if month == 12 {
        NaiveDate::from_ymd_opt(year + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(year, month + 1, 1)
    }
    .expect("valid month");
    (next - first).num_days() as u32
}

/// Months where the district heating network accepts exports from buildings
/// and the heat pumps run in low-temperature mode.
pub fn is_summer_month(month: u32) -> bool {
    (6..=8).contains(&month)
}

/// Whether a horizon starting at `period` is scheduled with the summer
/// constraint set. There is no intra-horizon mode change.
pub fn should_use_summer_mode(period: DateTime<Utc>) -> bool {
    is_summer_month(period.month())
}

/// Consecutive hourly timestamps `[from, from + n)`.
pub fn hourly_range(from: DateTime<Utc>, n: usize) -> Vec<DateTime<Utc>> {
    (0..n).map(|i| from + Duration::hours(i as i64)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};
    use rstest::rstest;

    #[rstest]
    #[case(2019, 1, 31)]
    #[case(2019, 2, 28)]
    #[case(2020, 2, 29)]
    #[case(2019, 4, 30)]
    fn test_days_in_month(#[case] year: i32, #[case] month: u32, #[case] expected: u32) {
        assert_eq!(days_in_month(year, month), expected);
    }

    #[test]
    fn test_summer_mode_boundaries() {
        let may = Utc.with_ymd_and_hms(2019, 5, 31, 23, 0, 0).unwrap();
        let june = Utc.with_ymd_and_hms(2019, 6, 1, 0, 0, 0).unwrap();
        let september = Utc.with_ymd_and_hms(2019, 9, 1, 0, 0, 0).unwrap();
        assert!(!should_use_summer_mode(may));
        assert!(should_use_summer_mode(june));
        assert!(!should_use_summer_mode(september));
    }

    #[test]
    fn test_external_markets() {
        use strum::IntoEnumIterator;
        let with_market: Vec<Resource> =
            Resource::iter().filter(|r| r.has_external_market()).collect();
        assert_eq!(with_market, vec![Resource::Electricity, Resource::HighTempHeat]);
    }

    #[test]
    fn test_year_month_ordering() {
        let a = YearMonth::new(2019, 12);
        let b = YearMonth::new(2020, 1);
        assert!(a < b);
    }

    #[test]
    fn test_hourly_range() {
        let start = Utc.with_ymd_and_hms(2019, 2, 1, 0, 0, 0).unwrap();
        let range = hourly_range(start, 24);
        assert_eq!(range.len(), 24);
        assert_eq!(range[23].hour(), 23);
    }
}
