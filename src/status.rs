//! BMU and BMS status decoding.
//!
//! The BMU status is a single 21 register read. A BMS status needs the
//! request / ready handshake first and then four bursts of 65 registers.

use crate::codec::{self, WordOrder};
use crate::protocol::{
    validate_len, CellLayout, HandshakeTiming, Word, BMS_DATA_BURSTS, BMS_DATA_REG_ADDR,
    BMS_ERRORS, BMS_READY_REG_ADDR, BMS_REQUEST_REG_ADDR, BMS_WARNINGS, BMS_WARNINGS3,
    BMU_ERRORS, BMU_STATUS_REG_ADDR, BMU_STATUS_REG_QUAN, BURST_REG_QUAN,
};
use crate::transport::{request_bursts, BurstAddresses, Transport};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Number of registers of a complete BMS status read.
pub const BMS_STATUS_REG_QUAN: u16 = BURST_REG_QUAN * BMS_DATA_BURSTS as u16;

/// A cell voltage above this value means the read is corrupt.
pub const MAX_PLAUSIBLE_CELL_VOLTAGE: f64 = 5.0;

const BMS_HANDSHAKE: BurstAddresses = BurstAddresses {
    request: BMS_REQUEST_REG_ADDR,
    ready: BMS_READY_REG_ADDR,
    data: BMS_DATA_REG_ADDR,
    bursts: BMS_DATA_BURSTS,
};

/// Cell voltages in mV, one row per module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CellMatrix(pub Vec<Vec<i16>>);

impl CellMatrix {
    pub fn modules(&self) -> &[Vec<i16>] {
        &self.0
    }

    /// Number of cells of every module.
    pub fn shape(&self) -> Vec<usize> {
        self.0.iter().map(Vec::len).collect()
    }

    pub fn cells(&self) -> impl Iterator<Item = i16> + '_ {
        self.0.iter().flatten().copied()
    }

    pub fn max(&self) -> Option<i16> {
        self.cells().max()
    }

    pub fn min(&self) -> Option<i16> {
        self.cells().min()
    }

    /// Applies `f` to every cell of `self` and the matching cell of `other`.
    ///
    /// Both matrices must have the same shape.
    pub(crate) fn merge_with(&mut self, other: &CellMatrix, f: impl Fn(i16, i16) -> i16) {
        for (row, other_row) in self.0.iter_mut().zip(&other.0) {
            for (cell, &other_cell) in row.iter_mut().zip(other_row) {
                *cell = f(*cell, other_cell);
            }
        }
    }
}

/// Converts a mV reading to V rounded to 3 decimals.
pub fn millivolts_to_volts(millivolts: i16) -> f64 {
    codec::round_to(f64::from(millivolts) * 0.001, 3)
}

fn efficiency(charge: f64, discharge: f64) -> Option<f64> {
    (charge > 0.0).then(|| codec::round_to(discharge / charge * 100.0, 1))
}

fn check_reserved(name: &str, regs: &[Word], expected: &[Word]) {
    if regs != expected {
        log::debug!("{name}: {regs:?} {expected:?}");
    }
}

/// Status of the BMU at `0x0500`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BmuStatus {
    pub soc: u16,
    pub max_cell_voltage: f64,
    pub min_cell_voltage: f64,
    pub soh: u16,
    /// A, negative while discharging.
    pub current: f64,
    pub battery_voltage: f64,
    pub max_cell_temp: i16,
    pub min_cell_temp: i16,
    pub bmu_temp: i16,
    pub errors: String,
    pub param_table_version: String,
    pub output_voltage: f64,
    /// kWh
    pub charge_energy: f64,
    /// kWh
    pub discharge_energy: f64,
    /// W
    pub power: f64,
    /// Absent as long as nothing was charged.
    pub efficiency: Option<f64>,
}

impl BmuStatus {
    pub fn decode(regs: &[Word]) -> Result<Self> {
        validate_len(regs, BMU_STATUS_REG_QUAN)?;
        let current = codec::round_to(f64::from(codec::to_i16(regs[4])) * 0.1, 1);
        check_reserved("bmu status reg 9-12", &regs[9..13], &[0, 792, 0, 0]);
        let (param_major, param_minor) = codec::split_byte(regs[14]);
        let output_voltage = codec::round_to(f64::from(regs[16]) * 0.01, 2);
        let charge_energy = f64::from(codec::to_u32(&regs[17..19], WordOrder::Little)) * 0.1;
        let discharge_energy = f64::from(codec::to_u32(&regs[19..21], WordOrder::Little)) * 0.1;

        Ok(Self {
            soc: regs[0],
            max_cell_voltage: codec::round_to(f64::from(regs[1]) * 0.01, 2),
            min_cell_voltage: codec::round_to(f64::from(regs[2]) * 0.01, 2),
            soh: regs[3],
            current,
            battery_voltage: codec::round_to(f64::from(regs[5]) * 0.01, 2),
            max_cell_temp: codec::to_i16(regs[6]),
            min_cell_temp: codec::to_i16(regs[7]),
            bmu_temp: codec::to_i16(regs[8]),
            errors: codec::bitmask_to_string(regs[13], &BMU_ERRORS, "Normal"),
            param_table_version: codec::version(param_major, param_minor),
            output_voltage,
            charge_energy,
            discharge_energy,
            power: current * output_voltage,
            efficiency: efficiency(charge_energy, discharge_energy),
        })
    }
}

/// Status of one tower, decoded from the 260 register burst at `0x0558`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BmsStatus {
    /// Maximum cell voltage as reported by the BMS.
    pub max_cell_voltage: f64,
    pub min_cell_voltage: f64,
    pub max_voltage_cell_id: u8,
    pub min_voltage_cell_id: u8,
    pub max_cell_temp: i16,
    pub min_cell_temp: i16,
    pub max_temp_cell_id: u8,
    pub min_temp_cell_id: u8,
    /// Balancing flag of every cell, one row per module.
    pub cell_balancing: Vec<Vec<bool>>,
    pub balancing_qty: u32,
    pub charge_energy: f64,
    pub discharge_energy: f64,
    pub efficiency: Option<f64>,
    pub battery_voltage: f64,
    pub output_voltage: f64,
    pub soc: f64,
    pub soh: i16,
    pub current: f64,
    pub warnings: String,
    pub errors: String,
    pub cell_voltages: CellMatrix,
    /// Temperature readings in °C, one row per module.
    pub cell_temps: Vec<Vec<u8>>,
    pub avg_cell_voltage: Option<f64>,
    pub avg_cell_temp: Option<f64>,
    /// Maximum over [`Self::cell_voltages`], in V.
    pub calc_max_cell_voltage: Option<f64>,
    pub calc_min_cell_voltage: Option<f64>,
}

impl BmsStatus {
    pub fn decode(regs: &[Word], layout: &CellLayout) -> Result<Self> {
        validate_len(regs, BMS_STATUS_REG_QUAN)?;
        // register 0 holds the burst length
        let max_cell_voltage = codec::round_to(f64::from(codec::to_i16(regs[1])) * 0.001, 3);
        if max_cell_voltage > MAX_PLAUSIBLE_CELL_VOLTAGE {
            return Err(Error::CellVoltageOutOfRange(max_cell_voltage));
        }
        let min_cell_voltage = codec::round_to(f64::from(codec::to_i16(regs[2])) * 0.001, 3);
        let (max_voltage_cell_id, min_voltage_cell_id) = codec::split_byte(regs[3]);
        let (max_temp_cell_id, min_temp_cell_id) = codec::split_byte(regs[6]);

        let cell_balancing: Vec<Vec<bool>> = (0..usize::from(layout.modules))
            .map(|module| {
                let flags = regs.get(7 + module).copied().unwrap_or(0);
                (0..16).map(|bit| codec::read_bit!(flags, bit)).collect()
            })
            .collect();
        let balancing_qty = cell_balancing.iter().flatten().filter(|&&flag| flag).count() as u32;

        let charge_energy = f64::from(codec::to_u32(&regs[15..17], WordOrder::Little)) * 0.001;
        let discharge_energy = f64::from(codec::to_u32(&regs[17..19], WordOrder::Little)) * 0.001;
        log::debug!("bms reg 20: {}", regs[20]);
        check_reserved("bms reg 22", &regs[22..23], &[0]);
        check_reserved("bms reg 23", &regs[23..24], &[1560]);
        check_reserved(
            "bms reg 31-42",
            &regs[31..42],
            &[6659, 7683, 256, 20528, 13104, 21552, 12848, 23090, 12848, 14129, 12593],
        );
        check_reserved("bms reg 42-44", &regs[42..44], &[13619, 12920]);
        check_reserved("bms reg 44-48", &regs[44..48], &[30840, 30840, 270, 270]);

        let mut warnings = codec::bitmask_to_strings(regs[28], &BMS_WARNINGS);
        warnings.extend(codec::bitmask_to_strings(regs[29], &BMS_WARNINGS));
        warnings.extend(codec::bitmask_to_strings(regs[30], &BMS_WARNINGS3));

        let cell_voltages = slice_cell_voltages(regs, layout)?;
        let cell_temps = slice_cell_temps(regs, layout)?;

        let voltages: Vec<i16> = cell_voltages.cells().collect();
        let avg_cell_voltage = (!voltages.is_empty()).then(|| {
            let sum: f64 = voltages.iter().map(|&mv| f64::from(mv)).sum();
            codec::round_to(sum / voltages.len() as f64 * 0.001, 3)
        });
        let temps: Vec<u8> = cell_temps.iter().flatten().copied().collect();
        let avg_cell_temp = (!temps.is_empty()).then(|| {
            let sum: f64 = temps.iter().map(|&temp| f64::from(temp)).sum();
            codec::round_to(sum / temps.len() as f64, 1)
        });

        Ok(Self {
            max_cell_voltage,
            min_cell_voltage,
            max_voltage_cell_id,
            min_voltage_cell_id,
            max_cell_temp: codec::to_i16(regs[4]),
            min_cell_temp: codec::to_i16(regs[5]),
            max_temp_cell_id,
            min_temp_cell_id,
            cell_balancing,
            balancing_qty,
            charge_energy,
            discharge_energy,
            efficiency: efficiency(charge_energy, discharge_energy),
            battery_voltage: codec::round_to(f64::from(codec::to_i16(regs[21])) * 0.1, 2),
            output_voltage: codec::round_to(f64::from(codec::to_i16(regs[24])) * 0.1, 2),
            soc: codec::round_to(f64::from(codec::to_i16(regs[25])) * 0.1, 2),
            soh: codec::to_i16(regs[26]),
            current: codec::round_to(f64::from(codec::to_i16(regs[27])) * 0.1, 2),
            warnings: codec::strings_to_string(&warnings, "Normal", 255),
            errors: codec::bitmask_to_string(regs[48], &BMS_ERRORS, "Normal"),
            calc_max_cell_voltage: cell_voltages.max().map(millivolts_to_volts),
            calc_min_cell_voltage: cell_voltages.min().map(millivolts_to_volts),
            avg_cell_voltage,
            avg_cell_temp,
            cell_voltages,
            cell_temps,
        })
    }
}

/// Voltage registers with the burst length markers at 65 and 130 removed.
fn voltage_region(regs: &[Word]) -> Vec<Word> {
    [&regs[49..65], &regs[66..130], &regs[131..180]].concat()
}

fn temperature_region(regs: &[Word]) -> Vec<Word> {
    [&regs[180..195], &regs[196..213]].concat()
}

/// Registers between the first cell of two modules. Modules with more cells
/// (HVS) run into the next module's registers.
const VOLTAGE_STRIDE: usize = 16;
const TEMPERATURE_STRIDE: usize = 4;

fn slice_cell_voltages(regs: &[Word], layout: &CellLayout) -> Result<CellMatrix> {
    let region = voltage_region(regs);
    let cells = usize::from(layout.cells);
    let stride = VOLTAGE_STRIDE;
    let needed = usize::from(layout.modules).saturating_sub(1) * stride + cells;
    if layout.modules > 0 && needed > region.len() {
        log::error!(
            "cell voltages do not fit the status block - modules={} cells={cells}",
            layout.modules
        );
        return Err(Error::UnexpectedLength {
            expected: needed,
            received: region.len(),
        });
    }
    Ok(CellMatrix(
        (0..usize::from(layout.modules))
            .map(|module| {
                region[module * stride..module * stride + cells]
                    .iter()
                    .map(|&word| codec::to_i16(word))
                    .collect()
            })
            .collect(),
    ))
}

fn slice_cell_temps(regs: &[Word], layout: &CellLayout) -> Result<Vec<Vec<u8>>> {
    let region = temperature_region(regs);
    let words = usize::from(layout.temp_sensors).div_ceil(2);
    let stride = TEMPERATURE_STRIDE;
    let needed = usize::from(layout.modules).saturating_sub(1) * stride + words;
    if layout.modules > 0 && needed > region.len() {
        log::error!(
            "cell temperatures do not fit the status block - modules={} sensors={}",
            layout.modules,
            layout.temp_sensors
        );
        return Err(Error::UnexpectedLength {
            expected: needed,
            received: region.len(),
        });
    }
    Ok((0..usize::from(layout.modules))
        .map(|module| {
            region[module * stride..module * stride + words]
                .iter()
                .flat_map(|&word| {
                    let (first, second) = codec::split_byte(word);
                    [first, second]
                })
                .collect()
        })
        .collect())
}

/// Reads and decodes the BMU status.
pub async fn read_bmu_status<T: Transport + ?Sized>(transport: &mut T) -> Result<BmuStatus> {
    let regs = transport
        .read_holding_registers(BMU_STATUS_REG_ADDR, BMU_STATUS_REG_QUAN)
        .await?;
    BmuStatus::decode(&regs)
}

/// Requests, fetches and decodes the status of tower `unit_id`.
pub async fn read_bms_status<T: Transport + ?Sized>(
    transport: &mut T,
    unit_id: u8,
    layout: &CellLayout,
    timing: &HandshakeTiming,
) -> Result<BmsStatus> {
    let regs = request_bursts(transport, unit_id, BMS_HANDSHAKE, timing)
        .await?
        .concat();
    BmsStatus::decode(&regs, layout).inspect_err(|err| log::error!("BMS {unit_id} status: {err}"))
}
