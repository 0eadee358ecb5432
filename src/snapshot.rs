//! Typed view of everything the client learned about the device.
//!
//! A [`DeviceSnapshot`] is only ever replaced group by group: a failed decode
//! leaves the previous values of that unit in place.

use crate::history::HistoryExtremes;
use crate::logbook::{BalancingTotals, RecentLogEntry};
use crate::protocol::{SystemInfo, BMU_UNIT_ID};
use crate::status::{BmsStatus, BmuStatus};
use chrono::{DateTime, Local};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BmuSnapshot {
    pub status: Option<BmuStatus>,
    /// Summary of the newest log entry.
    pub last_log: Option<String>,
    pub updated: Option<DateTime<Local>>,
}

/// Everything known about a single tower.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TowerSnapshot {
    pub status: Option<BmsStatus>,
    pub last_log: Option<String>,
    pub updated: Option<DateTime<Local>>,
    pub history: Option<HistoryExtremes>,
    /// Highest cell voltage since the last history reset, V.
    pub max_history_voltage: Option<f64>,
    /// Lowest cell voltage since the last history reset, V.
    pub min_history_voltage: Option<f64>,
    pub balancing: BalancingTotals,
}

impl TowerSnapshot {
    pub(crate) fn set_history(&mut self, extremes: Option<&HistoryExtremes>) {
        self.max_history_voltage = extremes.and_then(HistoryExtremes::max_voltage);
        self.min_history_voltage = extremes.and_then(HistoryExtremes::min_voltage);
        self.history = extremes.cloned();
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub info: Option<SystemInfo>,
    pub bmu: BmuSnapshot,
    /// Keyed by BMS unit id, starting at 1.
    pub towers: BTreeMap<u8, TowerSnapshot>,
    /// Size of the log store.
    pub log_entries: usize,
    /// Newest log entries first.
    pub recent_log: Vec<RecentLogEntry>,
}

impl DeviceSnapshot {
    pub fn tower(&self, unit_id: u8) -> Option<&TowerSnapshot> {
        self.towers.get(&unit_id)
    }

    pub(crate) fn tower_mut(&mut self, unit_id: u8) -> &mut TowerSnapshot {
        self.towers.entry(unit_id).or_default()
    }

    pub(crate) fn set_last_log(&mut self, unit_id: u8, summary: String) {
        if unit_id == BMU_UNIT_ID {
            self.bmu.last_log = Some(summary);
        } else {
            self.tower_mut(unit_id).last_log = Some(summary);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::HistoryTracker;
    use crate::status::CellMatrix;

    #[test]
    fn last_log_test() {
        let mut snapshot = DeviceSnapshot::default();
        snapshot.set_last_log(0, String::from("bmu"));
        snapshot.set_last_log(2, String::from("tower"));
        assert_eq!(snapshot.bmu.last_log.as_deref(), Some("bmu"));
        assert_eq!(snapshot.tower(2).and_then(|t| t.last_log.as_deref()), Some("tower"));
        assert!(snapshot.tower(1).is_none());
    }

    #[test]
    fn history_test() {
        let mut tracker = HistoryTracker::new();
        let extremes = tracker.update(1, &CellMatrix(vec![vec![3300, 3412]]));
        let mut tower = TowerSnapshot::default();
        tower.set_history(Some(extremes));
        assert_eq!(tower.max_history_voltage, Some(3.412));
        assert_eq!(tower.min_history_voltage, Some(3.3));
        tower.set_history(None);
        assert_eq!(tower, TowerSnapshot::default());
    }

    #[test]
    fn serialize_test() {
        let json = serde_json::to_value(DeviceSnapshot::default()).unwrap();
        assert_eq!(json["log_entries"], 0);
        assert!(json["bmu"]["status"].is_null());
    }
}
