//! Running per-cell voltage extremes of every tower.

use crate::status::{millivolts_to_volts, CellMatrix};
use serde::Serialize;
use std::collections::BTreeMap;

/// Element-wise maximum and minimum of all cell voltages seen since the last reset.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HistoryExtremes {
    pub max: CellMatrix,
    pub min: CellMatrix,
}

impl HistoryExtremes {
    fn seed(current: &CellMatrix) -> Self {
        Self {
            max: current.clone(),
            min: current.clone(),
        }
    }

    fn fits(&self, current: &CellMatrix) -> bool {
        let shape = current.shape();
        self.max.shape() == shape && self.min.shape() == shape
    }

    /// Highest cell voltage in V.
    pub fn max_voltage(&self) -> Option<f64> {
        self.max.max().map(millivolts_to_volts)
    }

    /// Lowest cell voltage in V.
    pub fn min_voltage(&self) -> Option<f64> {
        self.min.min().map(millivolts_to_volts)
    }
}

#[derive(Debug, Clone, Default)]
pub struct HistoryTracker {
    units: BTreeMap<u8, HistoryExtremes>,
}

impl HistoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Folds the latest cell voltages of `unit_id` into its extremes.
    ///
    /// The extremes are reseeded if none exist yet or the module layout changed.
    pub fn update(&mut self, unit_id: u8, current: &CellMatrix) -> &HistoryExtremes {
        let extremes = self
            .units
            .entry(unit_id)
            .and_modify(|extremes| {
                if extremes.fits(current) {
                    extremes.max.merge_with(current, i16::max);
                    extremes.min.merge_with(current, i16::min);
                } else {
                    log::debug!("BMS {unit_id} cell layout changed, reseed history");
                    *extremes = HistoryExtremes::seed(current);
                }
            })
            .or_insert_with(|| HistoryExtremes::seed(current));
        &*extremes
    }

    pub fn get(&self, unit_id: u8) -> Option<&HistoryExtremes> {
        self.units.get(&unit_id)
    }

    /// Forgets the extremes of `unit_id`, or of every unit for `None`.
    pub fn reset(&mut self, unit_id: Option<u8>) {
        match unit_id {
            Some(unit_id) => {
                self.units.remove(&unit_id);
                log::info!("history reset for BMS {unit_id}");
            }
            None => {
                self.units.clear();
                log::info!("history reset for all units");
            }
        }
    }
}
