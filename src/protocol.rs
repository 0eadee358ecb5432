//! Register map, device information and vendor label tables of the BYD Battery-Box.
//!
//! The register layout is not documented by the vendor. Addresses and offsets
//! below are what the BMU gateway answers with; several registers are still
//! unexplained and are only watched for drift.

use crate::codec::{self, label_or};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// 16-bit value stored in a Modbus register.
pub type Word = u16;

pub const BASE_INFO_REG_ADDR: u16 = 0x0000;
pub const BASE_INFO_REG_QUAN: u16 = 20;
pub const EXT_INFO_REG_ADDR: u16 = 0x0010;
pub const EXT_INFO_REG_QUAN: u16 = 2;

pub const BMU_STATUS_REG_ADDR: u16 = 0x0500;
pub const BMU_STATUS_REG_QUAN: u16 = 21;

pub const BMS_REQUEST_REG_ADDR: u16 = 0x0550;
pub const BMS_READY_REG_ADDR: u16 = 0x0551;
pub const BMS_DATA_REG_ADDR: u16 = 0x0558;
pub const BMS_DATA_BURSTS: usize = 4;

pub const LOG_REQUEST_REG_ADDR: u16 = 0x05A0;
pub const LOG_READY_REG_ADDR: u16 = 0x05A1;
pub const LOG_DATA_REG_ADDR: u16 = 0x05A8;
pub const LOG_DATA_BURSTS: usize = 5;

/// Registers per burst on the BMS and log data addresses.
pub const BURST_REG_QUAN: u16 = 65;
/// Second word of the request command, triggers data preparation.
pub const PREPARE_COMMAND: Word = 0x8100;
/// Value of the ready register once the requested data is available.
pub const READY_RESPONSE: Word = 0x8801;

/// Unit id of the BMU; towers (BMS) are numbered from 1.
pub const BMU_UNIT_ID: u8 = 0;

/// Timing of the request / poll-for-ready handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeTiming {
    /// Minimum delay after writing the request before the first poll.
    pub initial_delay: Duration,
    /// Delay between polls of the ready register.
    pub interval: Duration,
    /// Give up once the accumulated poll delay reaches this value.
    pub timeout: Duration,
}

impl Default for HandshakeTiming {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(200),
            interval: Duration::from_millis(200),
            timeout: Duration::from_secs(5),
        }
    }
}

/// Human readable name of a unit, `BMU` or `BMS {n}`.
pub fn unit_name(unit_id: u8) -> String {
    if unit_id == BMU_UNIT_ID {
        String::from("BMU")
    } else {
        format!("BMS {unit_id}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatteryType {
    /// Modules in series.
    HV,
    /// Modules in parallel.
    LV,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Model {
    HVL,
    HVM,
    HVS,
    LVL,
    LVS,
    Unknown,
}

impl Model {
    fn detect(battery_type: BatteryType, model_id: u8) -> Self {
        match (battery_type, model_id) {
            (BatteryType::HV, 0) => Model::HVL,
            (BatteryType::HV, 1) => Model::HVM,
            (BatteryType::HV, 2) => Model::HVS,
            (BatteryType::LV, 0) => Model::LVL,
            (BatteryType::LV, 2) => Model::LVS,
            _ => {
                log::error!("Unknown {battery_type:?} battery type {model_id}");
                Model::Unknown
            }
        }
    }

    pub fn spec(&self) -> Option<ModuleSpec> {
        MODULE_SPECS
            .iter()
            .find(|(model, _)| model == self)
            .map(|(_, spec)| *spec)
    }

    fn inverter(&self, inverter_id: u8) -> String {
        let table: &[&str] = match self {
            Model::LVS => &LVS_INVERTER_LIST,
            Model::HVL => &HVL_INVERTER_LIST,
            _ => &INVERTER_LIST,
        };
        match table.get(usize::from(inverter_id)) {
            Some(name) => name.to_string(),
            None => {
                log::error!("unknown inverter - model={self:?} inverter_id={inverter_id}");
                format!("Unknown: {inverter_id} {self:?}")
            }
        }
    }
}

/// Per-module characteristics of a battery model.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModuleSpec {
    pub capacity_kwh: f64,
    pub cells: u8,
    pub temp_sensors: u8,
}

const MODULE_SPECS: [(Model, ModuleSpec); 5] = [
    (Model::HVL, ModuleSpec { capacity_kwh: 4.0, cells: 16, temp_sensors: 8 }),
    (Model::HVM, ModuleSpec { capacity_kwh: 2.76, cells: 16, temp_sensors: 8 }),
    (Model::HVS, ModuleSpec { capacity_kwh: 2.56, cells: 32, temp_sensors: 12 }),
    (Model::LVL, ModuleSpec { capacity_kwh: 15.36, cells: 16, temp_sensors: 8 }),
    (Model::LVS, ModuleSpec { capacity_kwh: 4.0, cells: 16, temp_sensors: 8 }),
];

/// Shape of the per-tower cell data, learned once during initialization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CellLayout {
    pub modules: u8,
    pub cells: u8,
    pub temp_sensors: u8,
}

/// Base information block at `0x0000`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BaseInfo {
    pub serial: String,
    pub battery_type: BatteryType,
    pub bmu_version_a: String,
    pub bmu_version_b: String,
    /// Firmware of the active BMU working area.
    pub bmu_version: String,
    pub bms_version: String,
    pub bmu_area: String,
    pub bms_area: String,
    pub towers: u8,
    pub modules: u8,
    pub application: String,
    pub lvs_type: u8,
    pub phase: String,
}

impl BaseInfo {
    pub fn decode(regs: &[Word]) -> Result<Self> {
        validate_len(regs, BASE_INFO_REG_QUAN)?;
        let mut serial = codec::to_string(&regs[0..10]);
        // the last character is a checksum digit
        serial.pop();
        log::debug!("bmu reg 10-12: {:?}", &regs[10..12]);
        let (bmu_a_major, bmu_a_minor) = codec::split_byte(regs[12]);
        let (bmu_b_major, bmu_b_minor) = codec::split_byte(regs[13]);
        let (bms_major, bms_minor) = codec::split_byte(regs[14]);
        let (bmu_area, bms_area) = codec::split_byte(regs[15]);
        let (mut towers, modules) = codec::split_nibble(regs[16]);
        let (application_id, lvs_type) = codec::split_byte(regs[17]);
        let (phase_id, _) = codec::split_byte(regs[18]);
        log::debug!("bmu reg 19: {:?}", &regs[19..]);

        let battery_type = if serial.starts_with("P03") || serial.starts_with("E0P3") {
            if towers > 3 {
                log::warn!("HV towers set to 3, BMU reported {towers}.");
                towers = 3;
            }
            BatteryType::HV
        } else if serial.starts_with("P02") || serial.starts_with("P011") {
            // the BMU starts counting parallel towers at 0
            towers += 1;
            log::warn!("LV towers set to {towers}, BMU reported {}.", towers - 1);
            BatteryType::LV
        } else {
            log::error!(
                "Battery type HV/LV could not be determined. SN starts with: {}",
                serial.chars().take(4).collect::<String>()
            );
            BatteryType::Unknown
        };

        let bmu_version_a = codec::version(bmu_a_major, bmu_a_minor);
        let bmu_version_b = codec::version(bmu_b_major, bmu_b_minor);
        let bmu_version = if bmu_area == 0 {
            bmu_version_a.clone()
        } else {
            bmu_version_b.clone()
        };

        Ok(Self {
            serial,
            battery_type,
            bmu_version_a,
            bmu_version_b,
            bmu_version,
            bms_version: codec::version(bms_major, bms_minor),
            bmu_area: label_or(&WORKING_AREA, bmu_area, "Unknown").to_string(),
            bms_area: label_or(&WORKING_AREA, bms_area, "Unknown").to_string(),
            towers,
            modules,
            application: label_or(&APPLICATION_LIST, application_id, "Unknown").to_string(),
            lvs_type,
            phase: label_or(&PHASE_LIST, phase_id, "Unknown").to_string(),
        })
    }
}

/// Extended information block at `0x0010`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtInfo {
    pub inverter: String,
    pub model: Model,
    pub capacity_kwh: f64,
    pub cells: u8,
    pub temp_sensors: u8,
}

impl ExtInfo {
    pub fn decode(regs: &[Word], base: &BaseInfo) -> Result<Self> {
        validate_len(regs, EXT_INFO_REG_QUAN)?;
        let (inverter_id, _) = codec::split_byte(regs[0]);
        let (model_id, _) = codec::split_byte(regs[1]);
        let model = Model::detect(base.battery_type, model_id);
        let spec = model.spec().unwrap_or(ModuleSpec {
            capacity_kwh: 0.0,
            cells: 0,
            temp_sensors: 0,
        });
        Ok(Self {
            inverter: model.inverter(inverter_id),
            model,
            capacity_kwh: codec::round_to(
                f64::from(base.towers) * f64::from(base.modules) * spec.capacity_kwh,
                2,
            ),
            cells: spec.cells,
            temp_sensors: spec.temp_sensors,
        })
    }
}

/// Everything learned during initialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    #[serde(flatten)]
    pub base: BaseInfo,
    #[serde(flatten)]
    pub ext: ExtInfo,
}

impl SystemInfo {
    pub fn layout(&self) -> CellLayout {
        CellLayout {
            modules: self.base.modules,
            cells: self.ext.cells,
            temp_sensors: self.ext.temp_sensors,
        }
    }

    pub fn towers(&self) -> u8 {
        self.base.towers
    }
}

pub(crate) fn validate_len(regs: &[Word], expected: u16) -> Result<()> {
    if regs.len() != usize::from(expected) {
        log::warn!(
            "Invalid register count - expected={} received={}",
            expected,
            regs.len()
        );
        return Err(Error::UnexpectedLength {
            expected: usize::from(expected),
            received: regs.len(),
        });
    }
    Ok(())
}

pub const WORKING_AREA: [&str; 2] = ["A", "B"];
pub const APPLICATION_LIST: [&str; 3] = ["Off Grid", "On Grid", "Backup"];
pub const PHASE_LIST: [&str; 2] = ["Single", "Three"];

pub const INVERTER_LIST: [&str; 20] = [
    "Fronius HV",
    "Goodwe HV",
    "Fronius HV",
    "Kostal HV",
    "Goodwe HV",
    "SMA SBS3.7/5.0/6.0 HV",
    "Kostal HV",
    "SMA SBS3.7/5.0/6.0 HV",
    "Sungrow HV",
    "Sungrow HV",
    "Kaco HV",
    "Kaco HV",
    "Ingeteam HV",
    "Ingeteam HV",
    "SMA SBS 2.5 HV",
    "Undefined",
    "SMA SBS 2.5 HV",
    "Fronius HV",
    "Undefined",
    "SMA STP",
];

pub const LVS_INVERTER_LIST: [&str; 18] = [
    "Fronius HV",
    "Goodwe HV",
    "Goodwe HV",
    "Kostal HV",
    "Selectronic LV",
    "SMA SBS3.7/5.0/6.0 HV",
    "SMA LV",
    "Victron LV",
    "Suntech LV",
    "Sungrow HV",
    "Kaco HV",
    "Studer LV",
    "Solar Edge LV",
    "Ingeteam HV",
    "Sungrow LV",
    "Schneider LV",
    "SMA SBS 2.5 HV",
    "Solar Edge LV",
];

pub const HVL_INVERTER_LIST: [&str; 11] = [
    "Fronius HV",
    "Goodwe HV",
    "Goodwe HV",
    "Kostal HV",
    "Undefined",
    "SMA SBS3.7/5.0/6.0 HV",
    "SMA STP",
    "Sungrow HV",
    "Kaco HV",
    "Ingeteam HV",
    "SMA SBS 2.5 HV",
];

/// Error bits of the BMU status block.
pub const BMU_ERRORS: [&str; 16] = [
    "High Temperature Charging (Cells)",
    "Low Temperature Charging (Cells)",
    "Over Current Discharging",
    "Over Current Charging",
    "Main circuit Failure",
    "Short Current Alarm",
    "Cells Imbalance",
    "Current Sensor Failure",
    "Battery Over Voltage",
    "Battery Under Voltage",
    "Cell Over Voltage",
    "Cell Under Voltage",
    "Voltage Sensor Failure",
    "Temperature Sensor Failure",
    "High Temperature Discharging (Cells)",
    "Low Temperature Discharging (Cells)",
];

/// Bits of the first and second BMS warning word.
pub const BMS_WARNINGS: [&str; 16] = [
    "Battery Over Voltage",
    "Battery Under Voltage",
    "Cells OverVoltage",
    "Cells UnderVoltage",
    "Cells Imbalance",
    "Charging High Temperature(Cells)",
    "Charging Low Temperature(Cells)",
    "DisCharging High Temperature(Cells)",
    "DisCharging Low Temperature(Cells)",
    "Charging OverCurrent(Cells)",
    "DisCharging OverCurrent(Cells)",
    "Charging OverCurrent(Hardware)",
    "Short Circuit",
    "Inversly Connection",
    "Interlock switch Abnormal",
    "AirSwitch Abnormal",
];

/// Bits of the third BMS warning word.
pub const BMS_WARNINGS3: [&str; 16] = [
    "Battery Over Voltage",
    "Battery Under Voltage",
    "Cell Over Voltage",
    "Cell Under Voltage",
    "Voltage Sensor Failure",
    "Temperature Sensor Failure",
    "High Temperature Discharging (Cells)",
    "Low Temperature Discharging (Cells)",
    "High Temperature Charging (Cells)",
    "Low Temperature Charging (Cells)",
    "Over Current Discharging",
    "Over Current Charging",
    "Main circuit Failure",
    "Short Current Alarm",
    "Cells Imbalance",
    "Current Sensor Failure",
];

pub const BMS_ERRORS: [&str; 16] = [
    "Cells Voltage Sensor Failure",
    "Temperature Sensor Failure",
    "BIC Communication Failure",
    "Pack Voltage Sensor Failure",
    "Current Sensor Failure",
    "Charging Mos Failure",
    "DisCharging Mos Failure",
    "PreCharging Mos Failure",
    "Main Relay Failure",
    "PreCharging Failed",
    "Heating Device Failure",
    "Radiator Failure",
    "BIC Balance Failure",
    "Cells Failure",
    "PCB Temperature Sensor Failure",
    "Functional Safety Failure",
];

#[cfg(test)]
mod tests {
    use super::*;

    fn serial_regs(serial: &str) -> Vec<Word> {
        let mut bytes = serial.as_bytes().to_vec();
        bytes.resize(20, 0);
        bytes
            .chunks(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
            .collect()
    }

    fn base_regs(serial: &str, towers_modules: Word) -> Vec<Word> {
        let mut regs = serial_regs(serial);
        regs.extend_from_slice(&[
            0,
            0,
            0x0310, // BMU A 3.16
            0x0317, // BMU B 3.23
            0x0309, // BMS 3.9
            0x0100, // BMU area B, BMS area A
            towers_modules,
            0x0100, // on grid
            0x0100, // three phase
            0,
        ]);
        regs
    }

    #[test]
    fn base_info_hv_test() {
        let info = BaseInfo::decode(&base_regs("P030T020Z2008030001", 0x0025)).unwrap();
        assert_eq!(info.serial, "P030T020Z200803000");
        assert_eq!(info.battery_type, BatteryType::HV);
        assert_eq!(info.towers, 2);
        assert_eq!(info.modules, 5);
        assert_eq!(info.bmu_version_a, "3.16");
        assert_eq!(info.bmu_version, "3.23");
        assert_eq!(info.bms_version, "3.9");
        assert_eq!(info.bmu_area, "B");
        assert_eq!(info.bms_area, "A");
        assert_eq!(info.application, "On Grid");
        assert_eq!(info.phase, "Three");
    }

    #[test]
    fn base_info_tower_correction_test() {
        let hv = BaseInfo::decode(&base_regs("P030T020Z2008030001", 0x0055)).unwrap();
        assert_eq!(hv.towers, 3);
        let lv = BaseInfo::decode(&base_regs("P021T020Z2008030001", 0x0003)).unwrap();
        assert_eq!(lv.battery_type, BatteryType::LV);
        assert_eq!(lv.towers, 1);
    }

    #[test]
    fn base_info_length_test() {
        assert!(matches!(
            BaseInfo::decode(&[0; 5]),
            Err(Error::UnexpectedLength {
                expected: 20,
                received: 5
            })
        ));
    }

    #[test]
    fn ext_info_test() {
        let base = BaseInfo::decode(&base_regs("P030T020Z2008030001", 0x0025)).unwrap();
        let ext = ExtInfo::decode(&[0x0300, 0x0100], &base).unwrap();
        assert_eq!(ext.model, Model::HVM);
        assert_eq!(ext.inverter, "Kostal HV");
        assert_eq!(ext.cells, 16);
        assert_eq!(ext.temp_sensors, 8);
        assert_eq!(ext.capacity_kwh, 27.6);

        let unknown = ExtInfo::decode(&[0xFF00, 0x0700], &base).unwrap();
        assert_eq!(unknown.model, Model::Unknown);
        assert_eq!(unknown.inverter, "Unknown: 255 Unknown");
        assert_eq!(unknown.cells, 0);
    }
}
