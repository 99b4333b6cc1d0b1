use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// The fixed daily slot table, as (start hour, end hour).
pub const SLOT_TABLE: [(u32, u32); 6] = [(8, 10), (10, 12), (12, 14), (14, 16), (16, 18), (18, 20)];

/// One slot of the daily slot table, written as `HH:MM-HH:MM` on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TimeSlot(usize);

impl TimeSlot {
    pub fn all() -> impl Iterator<Item = TimeSlot> {
        (0..SLOT_TABLE.len()).map(TimeSlot)
    }

    pub fn index(&self) -> usize {
        self.0
    }

    pub fn start(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(SLOT_TABLE[self.0].0, 0, 0).unwrap_or(NaiveTime::MIN)
    }

    pub fn end(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(SLOT_TABLE[self.0].1, 0, 0).unwrap_or(NaiveTime::MIN)
    }

    pub fn starts_on(&self, date: NaiveDate) -> NaiveDateTime {
        date.and_time(self.start())
    }
}

impl fmt::Display for TimeSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (start, end) = SLOT_TABLE[self.0];
        write!(f, "{:02}:00-{:02}:00", start, end)
    }
}

impl FromStr for TimeSlot {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TimeSlot::all()
            .find(|slot| slot.to_string() == s.trim())
            .ok_or_else(|| format!("unknown time slot '{}'", s))
    }
}

impl TryFrom<String> for TimeSlot {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TimeSlot> for String {
    fn from(slot: TimeSlot) -> Self {
        slot.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_slot() {
        let slot: TimeSlot = "10:00-12:00".parse().unwrap();
        assert_eq!(slot.index(), 1);
        assert_eq!(slot.to_string(), "10:00-12:00");
    }

    #[test]
    fn test_rejects_slot_outside_table() {
        assert!("09:00-10:00".parse::<TimeSlot>().is_err());
        assert!(serde_json::from_str::<TimeSlot>("\"22:00-23:00\"").is_err());
    }

    #[test]
    fn test_slot_start_on_date() {
        let slot: TimeSlot = "18:00-20:00".parse().unwrap();
        let date = NaiveDate::from_ymd_opt(2030, 1, 2).unwrap();
        assert_eq!(slot.starts_on(date).to_string(), "2030-01-02 18:00:00");
    }
}
