//! Decoding of event log payloads.
//!
//! Every log entry carries a 23 byte payload whose layout depends on the
//! unit kind and the event code. [`describe`] looks up the decoder for a code,
//! unpacks the payload into named [`Datapoints`] and renders them into one
//! human readable sentence. Codes without a decoder are reported as
//! `Not decoded: {hex}` and never fail.

use crate::codec::{self, byte_at, label_or, Endian};
use crate::protocol::{BMS_ERRORS, BMS_WARNINGS, BMS_WARNINGS3, BMU_UNIT_ID, INVERTER_LIST};
use chrono::{NaiveDate, NaiveDateTime};
use serde::ser::SerializeMap;
use serde::Serialize;
use std::fmt;

/// Event code of a balancing entry of a BMS.
pub const BALANCING_CODE: u8 = 17;

const NOT_AVAILABLE: &str = "Not available";

/// Value of a decoded datapoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum DataValue {
    Int(i64),
    /// Scaled value, already rounded.
    Float(f64),
    Text(String),
    List(Vec<String>),
    Time(NaiveDateTime),
}

impl fmt::Display for DataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataValue::Int(value) => write!(f, "{value}"),
            // shortest round-trip form, keeps the trailing `.0`
            DataValue::Float(value) => write!(f, "{value:?}"),
            DataValue::Text(value) => f.write_str(value),
            DataValue::List(values) => f.write_str(&values.join(", ")),
            DataValue::Time(value) => write!(f, "{}", value.format("%Y-%m-%d %H:%M:%S")),
        }
    }
}

macro_rules! impl_from_int {
    ($($t:ty),*) => {
        $(impl From<$t> for DataValue {
            fn from(value: $t) -> Self {
                DataValue::Int(i64::from(value))
            }
        })*
    };
}
impl_from_int!(u8, u16, i16, u32);

impl From<f64> for DataValue {
    fn from(value: f64) -> Self {
        DataValue::Float(value)
    }
}

impl From<&str> for DataValue {
    fn from(value: &str) -> Self {
        DataValue::Text(value.to_string())
    }
}

impl From<String> for DataValue {
    fn from(value: String) -> Self {
        DataValue::Text(value)
    }
}

impl From<Vec<String>> for DataValue {
    fn from(value: Vec<String>) -> Self {
        DataValue::List(value)
    }
}

impl From<NaiveDateTime> for DataValue {
    fn from(value: NaiveDateTime) -> Self {
        DataValue::Time(value)
    }
}

/// Named values of one log payload, in decoding order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Datapoints(Vec<(&'static str, DataValue)>);

impl Datapoints {
    pub fn push(&mut self, name: &'static str, value: impl Into<DataValue>) {
        self.0.push((name, value.into()));
    }

    pub fn get(&self, name: &str) -> Option<&DataValue> {
        self.0
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, value)| value)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &DataValue)> {
        self.0.iter().map(|(name, value)| (*name, value))
    }
}

impl Serialize for Datapoints {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// A log payload decoded for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecodedLog {
    /// Label of the event code.
    pub description: &'static str,
    pub datapoints: Datapoints,
    /// Rendered sentence, or the raw hex when the code is not decoded.
    pub detail: String,
}

/// Decodes `payload` of an entry with `code` logged by `unit_id`.
pub fn describe(unit_id: u8, code: u8, payload: &[u8]) -> DecodedLog {
    let datapoints = decode(unit_id, code, payload);
    let detail = if datapoints.is_empty() {
        format!("Not decoded: {}", hex::encode(payload))
    } else {
        render(&datapoints)
    };
    DecodedLog {
        description: code_description(unit_id, code),
        datapoints,
        detail,
    }
}

/// Label of an event code, `Not available` for unknown codes.
pub fn code_description(unit_id: u8, code: u8) -> &'static str {
    let table = if unit_id == BMU_UNIT_ID {
        BMU_LOG_CODES
    } else {
        BMS_LOG_CODES
    };
    lookup(table, code).unwrap_or(NOT_AVAILABLE)
}

/// Unpacks `payload`, empty if the code has no decoder.
pub fn decode(unit_id: u8, code: u8, payload: &[u8]) -> Datapoints {
    let decoders = if unit_id == BMU_UNIT_ID {
        BMU_DECODERS
    } else {
        BMS_DECODERS
    };
    decoders
        .iter()
        .find(|(codes, _)| codes.contains(&code))
        .map(|(_, decoder)| decoder(code, payload))
        .unwrap_or_default()
}

/// Indices of the cells flagged in a balancing payload.
pub fn balancing_cells(payload: &[u8]) -> Vec<u16> {
    (0..20usize)
        .flat_map(|byte| {
            let flags = byte_at(payload, byte);
            (0..8usize)
                .filter(move |&bit| codec::read_bit!(flags, bit))
                .map(move |bit| (byte * 8 + bit) as u16)
        })
        .collect()
}

/// Renders datapoints into one sentence using their label metadata.
pub fn render(datapoints: &Datapoints) -> String {
    let parts: Vec<String> = datapoints
        .iter()
        .filter_map(|(name, value)| {
            let Some(point) = DATA_POINTS.iter().find(|point| point.name == name) else {
                log::error!("Datapoint {name} not defined");
                return None;
            };
            Some(point.render(value))
        })
        .collect();
    format!("{}.", parts.join(". "))
}

fn lookup(table: &[(u8, &'static str)], code: u8) -> Option<&'static str> {
    table
        .iter()
        .find(|(key, _)| *key == code)
        .map(|(_, label)| *label)
}

fn join_string_list(values: &[String]) -> String {
    match values {
        [] => String::from("-"),
        [single] => single.clone(),
        [head @ .., last] => format!("{} & {last}", head.join(", ")),
    }
}

#[derive(Debug, Clone, Copy)]
enum Kind {
    /// Value followed by the unit, if any.
    Number(&'static str),
    /// The label is a template, `{v}` is replaced by the value.
    Template,
    StringList,
    NumberList,
}

#[derive(Debug, Clone, Copy)]
struct DataPoint {
    name: &'static str,
    label: &'static str,
    kind: Kind,
}

impl DataPoint {
    const fn new(name: &'static str, label: &'static str, kind: Kind) -> Self {
        Self { name, label, kind }
    }

    fn render(&self, value: &DataValue) -> String {
        match (self.kind, value) {
            (Kind::Template, _) => self.label.replace("{v}", &value.to_string()),
            (Kind::StringList, DataValue::List(values)) => {
                format!("{}: {}", self.label, join_string_list(values))
            }
            (Kind::NumberList, DataValue::List(values)) if values.is_empty() => {
                format!("{}: -", self.label)
            }
            (Kind::NumberList, DataValue::List(values)) => {
                format!("{}: {}", self.label, values.join(","))
            }
            (Kind::Number(unit), _) if !unit.is_empty() => {
                format!("{}: {value} {unit}", self.label)
            }
            _ => format!("{}: {value}", self.label),
        }
    }
}

type Decoder = fn(u8, &[u8]) -> Datapoints;

/// Rounds a raw value in tenths to one decimal.
fn tenths(raw: impl Into<f64>) -> f64 {
    codec::round_to(raw.into() * 0.1, 1)
}

fn version_at(payload: &[u8], major: usize, minor: usize) -> String {
    codec::version(byte_at(payload, major), byte_at(payload, minor))
}

fn be16(payload: &[u8], pos: usize) -> u16 {
    codec::uint16_from_bytes(payload, pos, Endian::Big)
}

fn le16(payload: &[u8], pos: usize) -> u16 {
    codec::uint16_from_bytes(payload, pos, Endian::Little)
}

fn area(value: u8, b_value: u8) -> DataValue {
    match value {
        0 => DataValue::from("A"),
        value if value == b_value => DataValue::from("B"),
        value => DataValue::from(value),
    }
}

const BMU_DECODERS: &[(&[u8], Decoder)] = &[
    (&[0], bmu_power_on),
    (&[1], bmu_power_off),
    (&[2], bmu_event),
    (&[32], bmu_status_change),
    (&[34, 35], bmu_mcu_firmware),
    (&[36], bmu_bms_report),
    (&[38], bmu_inverter_limits),
    (&[40, 103], bmu_firmware_list),
    (&[45], bmu_switch_status),
    (&[101, 102], bmu_firmware_update),
    (&[105], bmu_parameter_table),
    (&[111], bmu_calibration),
    (&[118], bmu_system_status),
];

fn bmu_power_on(_code: u8, payload: &[u8]) -> Datapoints {
    let mut points = Datapoints::default();
    points.push("bootl", byte_at(payload, 0));
    points.push("exec", area(byte_at(payload, 1), 1));
    points.push("firmware_v", version_at(payload, 2, 3));
    points
}

fn bmu_power_off(_code: u8, payload: &[u8]) -> Datapoints {
    let mut points = Datapoints::default();
    match byte_at(payload, 0) {
        0 => points.push("switchoff", "0"),
        1 => points.push("switchoff", "LED button"),
        other => points.push("switchoff", other),
    }
    points
}

fn bmu_event(_code: u8, payload: &[u8]) -> Datapoints {
    let event = if byte_at(payload, 0) == 0 {
        String::from("Error/Warning cleared")
    } else {
        match byte_at(payload, 1) {
            23 => {
                let warnings = codec::bitmask_to_strings(be16(payload, 2), &BMU_LOG_WARNINGS);
                format!(
                    "Warning; {}",
                    codec::strings_to_string(&warnings, "NA", 255).to_lowercase()
                )
            }
            error => format!(
                "Error; {}",
                label_or(&BMU_LOG_ERRORS, error, "Undefined").to_lowercase()
            ),
        }
    };
    let mut points = Datapoints::default();
    points.push("event", event);
    points.push("c_max_v", be16(payload, 4));
    points.push("c_min_v", be16(payload, 6));
    points.push("bat_max_t", byte_at(payload, 8));
    points.push("bat_min_t", byte_at(payload, 9));
    points.push("bat_v", tenths(be16(payload, 10)));
    points.push("soc", byte_at(payload, 12));
    points.push("soh", byte_at(payload, 13));
    points
}

fn bmu_status_change(_code: u8, payload: &[u8]) -> Datapoints {
    let mut points = Datapoints::default();
    points.push("p_status", label_or(&BMU_STATUS, byte_at(payload, 1), "NA"));
    points.push("n_status", label_or(&BMU_STATUS, byte_at(payload, 0), "Undefined"));
    points
}

fn bmu_mcu_firmware(_code: u8, payload: &[u8]) -> Datapoints {
    let mut points = Datapoints::default();
    points.push("firmware_v", version_at(payload, 1, 2));
    points.push("mcu", byte_at(payload, 4));
    points
}

fn bmu_bms_report(_code: u8, payload: &[u8]) -> Datapoints {
    let running_time = u32::from_be_bytes([
        byte_at(payload, 0),
        byte_at(payload, 1),
        byte_at(payload, 2),
        byte_at(payload, 3),
    ]);
    let mut points = Datapoints::default();
    points.push("rtime", running_time);
    points.push("bmu_qty_c", byte_at(payload, 4));
    points.push("bmu_qty_t", byte_at(payload, 5));
    points.push("c_max_v", be16(payload, 6));
    points.push("c_min_v", be16(payload, 8));
    points.push("c_max_t", byte_at(payload, 10));
    points.push("c_min_t", byte_at(payload, 11));
    points.push(
        "out_a",
        tenths(codec::int16_from_bytes(payload, 12, Endian::Big)),
    );
    points.push("out_v", tenths(be16(payload, 14)));
    points.push("acc_v", tenths(be16(payload, 16)));
    points.push("bms_addr", byte_at(payload, 18));
    points.push("m_type", label_or(&MODULE_TYPE, byte_at(payload, 19), "Undefined"));
    points.push("m_qty", byte_at(payload, 20));
    points
}

fn bmu_inverter_limits(_code: u8, payload: &[u8]) -> Datapoints {
    let signed = |pos| tenths(codec::int16_from_bytes(payload, pos, Endian::Big));
    let mut points = Datapoints::default();
    points.push("max_charge_a", signed(0));
    points.push("max_discharge_a", signed(2));
    points.push("max_charge_v", signed(4));
    points.push("max_discharge_v", signed(6));
    points.push(
        "status",
        vec![label_or(&BMU_STATUS, byte_at(payload, 8), "Undefined").to_string()],
    );
    points.push("bat_t", byte_at(payload, 9));
    points.push("inverter", label_or(&INVERTER_LIST, byte_at(payload, 10), "Undefined"));
    points.push("bms_qty", byte_at(payload, 11));
    points
}

fn bmu_firmware_list(code: u8, payload: &[u8]) -> Datapoints {
    let mut points = Datapoints::default();
    points.push("firmware_n1", byte_at(payload, 0));
    points.push("firmware_v1", version_at(payload, 1, 2));
    points.push("firmware_n2", byte_at(payload, 3));
    points.push("firmware_v2", version_at(payload, 4, 5));
    // a third firmware is only listed at power up
    if code == 40 && byte_at(payload, 6) != 0xFF {
        points.push("firmware_n3", byte_at(payload, 6));
        points.push("firmware_v3", version_at(payload, 7, 8));
    }
    points
}

fn bmu_switch_status(_code: u8, payload: &[u8]) -> Datapoints {
    let mut points = Datapoints::default();
    points.push("status", vec![byte_at(payload, 0).to_string()]);
    points.push("out_v", tenths(be16(payload, 4)));
    points.push("bat_v", tenths(be16(payload, 6)));
    points.push("soc_a", tenths(be16(payload, 10)));
    points.push("soc_b", tenths(be16(payload, 12)));
    points
}

fn bmu_firmware_update(_code: u8, payload: &[u8]) -> Datapoints {
    let mut points = Datapoints::default();
    let updated = if byte_at(payload, 0) == 0 { "A" } else { "B" };
    points.push("bms_updt", updated);
    points.push("firmware_v", version_at(payload, 1, 2));
    points
}

fn bmu_parameter_table(_code: u8, payload: &[u8]) -> Datapoints {
    let mut points = Datapoints::default();
    points.push("pt_v", version_at(payload, 1, 2));
    points
}

fn bmu_calibration(_code: u8, payload: &[u8]) -> Datapoints {
    let mut points = Datapoints::default();
    points.push(
        "dt_cal",
        label_or(&BMU_CALIBRATION, byte_at(payload, 0), "Undefined"),
    );
    points
}

fn bmu_system_status(_code: u8, payload: &[u8]) -> Datapoints {
    let mut points = Datapoints::default();
    let Some(status) = BMU_STATUS.get(usize::from(byte_at(payload, 0))) else {
        points.push("status", vec![String::from("Undefined")]);
        return points;
    };
    points.push("status", vec![status.to_string()]);
    points.push("env_min_t", byte_at(payload, 1));
    points.push("env_max_t", byte_at(payload, 2));
    points.push("soc", byte_at(payload, 3));
    points.push("soh", byte_at(payload, 4));
    points.push("bat_t", byte_at(payload, 5));
    points.push("bat_v", tenths(be16(payload, 6)));
    points.push("c_max_v", be16(payload, 8));
    points.push("c_min_v", be16(payload, 10));
    points.push("bat_max_t", byte_at(payload, 13));
    points.push("bat_min_t", byte_at(payload, 15));
    points
}

const BMS_DECODERS: &[(&[u8], Decoder)] = &[
    (&[0], bms_power_on),
    (&[1], bms_power_off),
    (
        &[2, 3, 4, 5, 6, 7, 9, 10, 11, 13, 14, 16, 19, 20, 21],
        bms_event,
    ),
    (&[BALANCING_CODE, 18], bms_balancing),
    (&[101, 102], bms_firmware_update),
    (&[105], bms_parameter_table),
    (&[106], bms_serial_change),
    (&[111], bms_time_calibration),
];

fn bms_power_on(_code: u8, payload: &[u8]) -> Datapoints {
    let mut points = Datapoints::default();
    points.push("bootl", byte_at(payload, 0));
    points.push("exec", area(byte_at(payload, 1), 2));
    points.push("firmware_v", version_at(payload, 3, 4));
    points
}

fn bms_power_off(_code: u8, payload: &[u8]) -> Datapoints {
    let mut points = Datapoints::default();
    points.push(
        "power_off",
        label_or(&BMS_POWER_OFF, byte_at(payload, 1), "NA"),
    );
    points.push("section", area(byte_at(payload, 2), 1));
    points.push("firmware_v", version_at(payload, 3, 4));
    points
}

fn bms_event(code: u8, payload: &[u8]) -> Datapoints {
    let mut warnings = codec::bitmask_to_strings(le16(payload, 0), &BMS_WARNINGS);
    warnings.extend(codec::bitmask_to_strings(le16(payload, 2), &BMS_WARNINGS));
    warnings.extend(codec::bitmask_to_strings(le16(payload, 4), &BMS_WARNINGS3));
    let status = byte_at(payload, 8);
    // an odd status byte reports the switched off state
    let status_labels: &[&str] = if status % 2 == 1 {
        &BMS_STATUS_OFF
    } else {
        &BMS_STATUS_ON
    };

    let mut points = Datapoints::default();
    points.push("warnings", warnings);
    points.push(
        "errors",
        codec::bitmask_to_strings(le16(payload, 6), &BMS_ERRORS),
    );
    points.push(
        "status",
        codec::bitmask_to_strings(u16::from(status), status_labels),
    );
    match code {
        9 => {
            points.push("bat_idle", byte_at(payload, 9));
            points.push("target_soc", byte_at(payload, 10));
        }
        20 => {
            points.push("bmu_serial_v1", byte_at(payload, 9));
            points.push("bmu_serial_v2", byte_at(payload, 10));
        }
        _ => {
            points.push("soc", byte_at(payload, 9));
            points.push("soh", byte_at(payload, 10));
            points.push("bat_v", tenths(le16(payload, 11)));
            points.push("out_v", tenths(le16(payload, 13)));
            points.push(
                "out_a",
                tenths(codec::int16_from_bytes(payload, 15, Endian::Little)),
            );
        }
    }
    if code == 21 {
        points.push("c_max_v_n", byte_at(payload, 17));
        points.push("c_min_v_n", byte_at(payload, 18));
        points.push("c_max_t_n", byte_at(payload, 20));
        points.push("c_min_t_n", byte_at(payload, 21));
    } else {
        points.push("c_max_v", le16(payload, 17));
        points.push("c_min_v", le16(payload, 19));
        points.push("c_max_t", byte_at(payload, 21));
        points.push("c_min_t", byte_at(payload, 22));
    }
    points
}

fn bms_balancing(code: u8, payload: &[u8]) -> Datapoints {
    let mut points = Datapoints::default();
    if code == BALANCING_CODE {
        let cells: Vec<String> = balancing_cells(payload)
            .iter()
            .map(u16::to_string)
            .collect();
        points.push("b_cells", cells);
    }
    points.push("c_min_v", le16(payload, 21));
    points
}

fn bms_firmware_update(_code: u8, payload: &[u8]) -> Datapoints {
    let mut points = Datapoints::default();
    let area = if byte_at(payload, 0) == 0 { "A" } else { "B" };
    points.push("area", area);
    points.push("firmware_p", version_at(payload, 2, 1));
    points.push("firmware_n", version_at(payload, 4, 3));
    points
}

fn bms_parameter_table(_code: u8, payload: &[u8]) -> Datapoints {
    let mut points = Datapoints::default();
    points.push(
        "pt_v",
        format!("{}.{}", le16(payload, 0), le16(payload, 2)),
    );
    points
}

fn bms_serial_change(_code: u8, _payload: &[u8]) -> Datapoints {
    let mut points = Datapoints::default();
    points.push("sn_change", 1u8);
    points
}

fn bms_time_calibration(_code: u8, payload: &[u8]) -> Datapoints {
    let mut points = Datapoints::default();
    let new_time = NaiveDate::from_ymd_opt(
        2000 + i32::from(byte_at(payload, 0)),
        u32::from(byte_at(payload, 1)),
        u32::from(byte_at(payload, 2)),
    )
    .and_then(|date| {
        date.and_hms_opt(
            u32::from(byte_at(payload, 3)),
            u32::from(byte_at(payload, 4)),
            u32::from(byte_at(payload, 5)),
        )
    });
    match new_time {
        Some(new_time) => points.push("nt", new_time),
        None => log::error!(
            "Failed to convert to datetime {:?}",
            &payload[..payload.len().min(6)]
        ),
    }
    points
}

const DATA_POINTS: &[DataPoint] = &[
    DataPoint::new("bootl", "Bootloader", Kind::Number("")),
    DataPoint::new("exec", "Executing area", Kind::Number("")),
    DataPoint::new("firmware_v", "Firmware", Kind::Number("")),
    DataPoint::new("switchoff", "Switched off by", Kind::Number("")),
    DataPoint::new("event", "{v}", Kind::Template),
    DataPoint::new("c_max_v", "Cell max voltage", Kind::Number("mV")),
    DataPoint::new("c_min_v", "Cell min voltage", Kind::Number("mV")),
    DataPoint::new("c_max_t", "Cell max temperature", Kind::Number("°C")),
    DataPoint::new("c_min_t", "Cell min temperature", Kind::Number("°C")),
    DataPoint::new("c_max_v_n", "Cell max voltage number", Kind::Number("")),
    DataPoint::new("c_min_v_n", "Cell min voltage number", Kind::Number("")),
    DataPoint::new("c_max_t_n", "Cell max temperature number", Kind::Number("")),
    DataPoint::new("c_min_t_n", "Cell min temperature number", Kind::Number("")),
    DataPoint::new("bat_max_t", "Battery max temperature", Kind::Number("°C")),
    DataPoint::new("bat_min_t", "Battery min temperature", Kind::Number("°C")),
    DataPoint::new("bat_t", "Battery temperature", Kind::Number("°C")),
    DataPoint::new("bat_v", "Battery voltage", Kind::Number("V")),
    DataPoint::new("out_v", "Output voltage", Kind::Number("V")),
    DataPoint::new("out_a", "Output current", Kind::Number("A")),
    DataPoint::new("acc_v", "Accumulated voltage", Kind::Number("V")),
    DataPoint::new("soc", "SOC", Kind::Number("%")),
    DataPoint::new("soh", "SOH", Kind::Number("%")),
    DataPoint::new("soc_a", "SOC A", Kind::Number("%")),
    DataPoint::new("soc_b", "SOC B", Kind::Number("%")),
    DataPoint::new("target_soc", "Target SOC", Kind::Number("%")),
    DataPoint::new("bat_idle", "Battery idle", Kind::Number("")),
    DataPoint::new("p_status", "Previous status", Kind::Number("")),
    DataPoint::new("n_status", "New status", Kind::Number("")),
    DataPoint::new("status", "Status", Kind::StringList),
    DataPoint::new("warnings", "Warnings", Kind::StringList),
    DataPoint::new("errors", "Errors", Kind::StringList),
    DataPoint::new("mcu", "MCU", Kind::Number("")),
    DataPoint::new("rtime", "Running time", Kind::Number("s")),
    DataPoint::new("bmu_qty_c", "Cells", Kind::Number("")),
    DataPoint::new("bmu_qty_t", "Temperature sensors", Kind::Number("")),
    DataPoint::new("bms_addr", "BMS address", Kind::Number("")),
    DataPoint::new("bms_qty", "Towers", Kind::Number("")),
    DataPoint::new("m_type", "Module type", Kind::Number("")),
    DataPoint::new("m_qty", "Modules", Kind::Number("")),
    DataPoint::new("max_charge_a", "Max charge current", Kind::Number("A")),
    DataPoint::new("max_discharge_a", "Max discharge current", Kind::Number("A")),
    DataPoint::new("max_charge_v", "Max charge voltage", Kind::Number("V")),
    DataPoint::new("max_discharge_v", "Min discharge voltage", Kind::Number("V")),
    DataPoint::new("inverter", "Inverter", Kind::Number("")),
    DataPoint::new("firmware_n1", "Firmware 1 type", Kind::Number("")),
    DataPoint::new("firmware_v1", "Firmware 1", Kind::Number("")),
    DataPoint::new("firmware_n2", "Firmware 2 type", Kind::Number("")),
    DataPoint::new("firmware_v2", "Firmware 2", Kind::Number("")),
    DataPoint::new("firmware_n3", "Firmware 3 type", Kind::Number("")),
    DataPoint::new("firmware_v3", "Firmware 3", Kind::Number("")),
    DataPoint::new("firmware_p", "Previous firmware", Kind::Number("")),
    DataPoint::new("firmware_n", "New firmware", Kind::Number("")),
    DataPoint::new("bms_updt", "Updated area", Kind::Number("")),
    DataPoint::new("area", "Area", Kind::Number("")),
    DataPoint::new("section", "Section", Kind::Number("")),
    DataPoint::new("pt_v", "Parameter table", Kind::Number("")),
    DataPoint::new("dt_cal", "Date and time calibrated by {v}", Kind::Template),
    DataPoint::new("env_min_t", "Environment min temperature", Kind::Number("°C")),
    DataPoint::new("env_max_t", "Environment max temperature", Kind::Number("°C")),
    DataPoint::new("power_off", "Power off reason", Kind::Number("")),
    DataPoint::new("bmu_serial_v1", "BMU serial 1", Kind::Number("")),
    DataPoint::new("bmu_serial_v2", "BMU serial 2", Kind::Number("")),
    DataPoint::new("b_cells", "Balancing cells", Kind::NumberList),
    DataPoint::new("sn_change", "Serial number changed", Kind::Template),
    DataPoint::new("nt", "Time set to {v}", Kind::Template),
];

pub const BMU_LOG_CODES: &[(u8, &str)] = &[
    (0, "Power ON"),
    (1, "Power OFF"),
    (2, "Events record"),
    (3, "Timing record"),
    (4, "Start charging"),
    (5, "Stop charging"),
    (6, "Start discharging"),
    (7, "Stop discharging"),
    (8, "SOC calibration rough"),
    (9, "SOC calibration fine"),
    (10, "SOC calibration stop"),
    (11, "CAN communication failed"),
    (12, "Serial communication failed"),
    (13, "Receive precharge command"),
    (14, "Precharge successful"),
    (15, "Precharge failure"),
    (16, "Start end SOC calibration"),
    (17, "Start balancing"),
    (18, "Stop balancing"),
    (19, "Address registered"),
    (20, "System functional safety fault"),
    (21, "Events additional info"),
    (32, "System status changed"),
    (33, "Erase BMS firmware"),
    (34, "BMS update start"),
    (35, "BMS update done"),
    (36, "Functional safety info"),
    (38, "SOP info"),
    (40, "BMS firmware list"),
    (41, "MCU list of BMS"),
    (45, "Switch status"),
    (101, "Firmware start to update"),
    (102, "Firmware update successful"),
    (103, "Firmware list"),
    (105, "Parameters table update"),
    (106, "SN code was changed"),
    (111, "DateTime calibration"),
    (118, "System timing log"),
];

pub const BMS_LOG_CODES: &[(u8, &str)] = &[
    (0, "Power ON"),
    (1, "Power OFF"),
    (2, "Events record"),
    (3, "Timing record"),
    (4, "Start charging"),
    (5, "Stop charging"),
    (6, "Start discharging"),
    (7, "Stop discharging"),
    (8, "SOC calibration rough"),
    (9, "SOC calibration fine"),
    (10, "SOC calibration stop"),
    (11, "CAN communication failed"),
    (12, "Serial communication failed"),
    (13, "Receive precharge command"),
    (14, "Precharge successful"),
    (15, "Precharge failure"),
    (16, "Start end SOC calibration"),
    (17, "Start balancing"),
    (18, "Stop balancing"),
    (19, "Address registered"),
    (20, "System functional safety fault"),
    (21, "Events additional info"),
    (101, "Start firmware update"),
    (102, "Firmware update finish"),
    (105, "Parameters table update"),
    (106, "SN code was changed"),
    (111, "DateTime calibration"),
];

/// Error codes of BMU event records.
pub const BMU_LOG_ERRORS: [&str; 24] = [
    "Cells voltage sensor failure",
    "Temperature sensor failure",
    "BIC communication failure",
    "Pack voltage sensor failure",
    "Current sensor failure",
    "Charging MOS failure",
    "Discharging MOS failure",
    "Precharging MOS failure",
    "Main relay failure",
    "Precharging failed",
    "Heating device failure",
    "Radiator failure",
    "BIC balance failure",
    "Cells failure",
    "PCB temperature sensor failure",
    "Functional safety failure",
    "Battery over voltage",
    "Battery under voltage",
    "Cell over voltage",
    "Cell under voltage",
    "Cells imbalance",
    "Short circuit",
    "BMS communication failure",
    // 23 flags a warning bitmask instead of an error
    "Warning",
];

pub const BMU_LOG_WARNINGS: [&str; 16] = [
    "Cells over voltage",
    "Cells under voltage",
    "Cells imbalance",
    "Charging high temperature",
    "Charging low temperature",
    "Discharging high temperature",
    "Discharging low temperature",
    "Charging over current",
    "Discharging over current",
    "Battery over voltage",
    "Battery under voltage",
    "BMS communication lost",
    "Insulation resistance low",
    "Interlock switch abnormal",
    "Air switch abnormal",
    "Current sensor abnormal",
];

pub const BMU_STATUS: [&str; 8] = [
    "Standby",
    "Inactive",
    "Charging",
    "Discharging",
    "Idle",
    "Fault",
    "Upgrading",
    "Shutdown",
];

/// Status bits of BMS events with an even status byte.
pub const BMS_STATUS_ON: [&str; 8] = [
    "Battery on",
    "Charging",
    "Discharging",
    "Balancing",
    "Precharging",
    "Main relay on",
    "Fan on",
    "Heating",
];

/// Status bits of BMS events with an odd status byte.
pub const BMS_STATUS_OFF: [&str; 8] = [
    "Battery off",
    "Charging disabled",
    "Discharging disabled",
    "Balancing off",
    "Precharge off",
    "Main relay off",
    "Fan off",
    "Heating off",
];

pub const BMS_POWER_OFF: [&str; 6] = [
    "Power switch",
    "SOC 0%",
    "Communication lost",
    "Firmware update",
    "Error",
    "BMU command",
];

pub const BMU_CALIBRATION: [&str; 2] = ["inverter", "internet"];

pub const MODULE_TYPE: [&str; 5] = ["HVL", "HVM", "HVS", "LVL", "LVS"];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bmu_power_on_test() {
        let decoded = describe(0, 0, &[5, 0, 1, 0]);
        assert_eq!(decoded.description, "Power ON");
        assert_eq!(decoded.datapoints.get("bootl"), Some(&DataValue::Int(5)));
        assert_eq!(decoded.datapoints.get("exec"), Some(&DataValue::from("A")));
        assert_eq!(
            decoded.datapoints.get("firmware_v"),
            Some(&DataValue::from("1.0"))
        );
        assert_eq!(
            decoded.detail,
            "Bootloader: 5. Executing area: A. Firmware: 1.0."
        );
    }

    #[test]
    fn bms_power_on_area_test() {
        let points = decode(1, 0, &[3, 2, 0, 3, 16]);
        assert_eq!(points.get("exec"), Some(&DataValue::from("B")));
        assert_eq!(points.get("firmware_v"), Some(&DataValue::from("3.16")));
        let points = decode(1, 0, &[3, 7]);
        assert_eq!(points.get("exec"), Some(&DataValue::Int(7)));
    }

    #[test]
    fn unknown_code_test() {
        let decoded = describe(0, 250, &[0xDE, 0xAD]);
        assert_eq!(decoded.description, "Not available");
        assert!(decoded.datapoints.is_empty());
        assert_eq!(decoded.detail, "Not decoded: dead");
        // known code without a decoder
        let decoded = describe(0, 41, &[0x01]);
        assert_eq!(decoded.description, "MCU list of BMS");
        assert_eq!(decoded.detail, "Not decoded: 01");
    }

    #[test]
    fn short_payload_test() {
        // every accessor falls back to 0 instead of panicking
        let points = decode(0, 36, &[]);
        assert_eq!(points.get("rtime"), Some(&DataValue::Int(0)));
        assert_eq!(points.get("out_a"), Some(&DataValue::Float(0.0)));
        let points = decode(1, 4, &[0x01]);
        assert_eq!(points.get("c_min_t"), Some(&DataValue::Int(0)));
    }

    #[test]
    fn bmu_event_test() {
        let mut payload = [0u8; 23];
        payload[0] = 1;
        payload[1] = 23;
        payload[3] = 0b101;
        payload[4..6].copy_from_slice(&3_350u16.to_be_bytes());
        payload[10..12].copy_from_slice(&520u16.to_be_bytes());
        let points = decode(0, 2, &payload);
        assert_eq!(
            points.get("event"),
            Some(&DataValue::from("Warning; cells over voltage,cells imbalance"))
        );
        assert_eq!(points.get("c_max_v"), Some(&DataValue::Int(3_350)));
        assert_eq!(points.get("bat_v"), Some(&DataValue::Float(52.0)));

        payload[3] = 0;
        assert_eq!(
            decode(0, 2, &payload).get("event"),
            Some(&DataValue::from("Warning; na"))
        );

        payload[1] = 4;
        let detail = describe(0, 2, &payload).detail;
        assert!(detail.starts_with("Error; current sensor failure. Cell max voltage: 3350 mV."));
        assert!(detail.contains("Battery voltage: 52.0 V"));
    }

    #[test]
    fn bms_event_test() {
        let mut payload = [0u8; 23];
        payload[0] = 0b10; // battery under voltage
        payload[4] = 0b1; // battery over voltage
        payload[6] = 0b100;
        payload[8] = 0b110;
        payload[9] = 88;
        payload[11..13].copy_from_slice(&4_010u16.to_le_bytes());
        payload[15..17].copy_from_slice(&(-25i16).to_le_bytes());
        payload[17..19].copy_from_slice(&3_351u16.to_le_bytes());
        let decoded = describe(2, 4, &payload);
        assert_eq!(decoded.description, "Start charging");
        assert_eq!(decoded.datapoints.get("out_a"), Some(&DataValue::Float(-2.5)));
        assert_eq!(decoded.datapoints.get("c_max_v"), Some(&DataValue::Int(3_351)));
        assert!(decoded
            .detail
            .starts_with("Warnings: Battery Under Voltage & Battery Over Voltage. Errors: BIC Communication Failure. Status: Charging & Discharging. SOC: 88 %."));
        assert!(decoded.detail.contains("Battery voltage: 401.0 V"));

        // odd status byte selects the off labels
        payload[8] = 0b11;
        let points = decode(2, 4, &payload);
        assert_eq!(
            points.get("status"),
            Some(&DataValue::List(vec![
                String::from("Battery off"),
                String::from("Charging disabled")
            ]))
        );
    }

    #[test]
    fn bms_event_variants_test() {
        let payload: Vec<u8> = (0..23).collect();
        let idle = decode(1, 9, &payload);
        assert_eq!(idle.get("bat_idle"), Some(&DataValue::Int(9)));
        assert_eq!(idle.get("soc"), None);
        let info = decode(1, 21, &payload);
        assert_eq!(info.get("c_max_v_n"), Some(&DataValue::Int(17)));
        assert_eq!(info.get("c_min_t_n"), Some(&DataValue::Int(21)));
        assert_eq!(info.get("c_max_v"), None);
    }

    #[test]
    fn balancing_test() {
        let mut payload = [0u8; 23];
        payload[0] = 0b1000_0001;
        payload[19] = 0b1000_0000;
        payload[21..23].copy_from_slice(&3_280u16.to_le_bytes());
        assert_eq!(balancing_cells(&payload), vec![0, 7, 159]);
        let decoded = describe(1, BALANCING_CODE, &payload);
        assert_eq!(
            decoded.detail,
            "Balancing cells: 0,7,159. Cell min voltage: 3280 mV."
        );
        let stop = describe(1, 18, &payload);
        assert_eq!(stop.datapoints.len(), 1);
        assert_eq!(render(&decode(1, BALANCING_CODE, &[0; 23])), "Balancing cells: -. Cell min voltage: 0 mV.");
    }

    #[test]
    fn time_calibration_test() {
        let points = decode(1, 111, &[24, 3, 9, 13, 5, 59]);
        let expected = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(13, 5, 59)
            .unwrap();
        assert_eq!(points.get("nt"), Some(&DataValue::Time(expected)));
        assert_eq!(render(&points), "Time set to 2024-03-09 13:05:59.");
        // invalid date is skipped, not an error
        assert!(decode(1, 111, &[24, 13, 9, 13, 5, 59]).is_empty());
    }

    #[test]
    fn firmware_list_test() {
        let points = decode(0, 40, &[1, 3, 16, 2, 3, 9, 0xFF, 0, 0]);
        assert_eq!(points.len(), 4);
        let points = decode(0, 40, &[1, 3, 16, 2, 3, 9, 3, 1, 2]);
        assert_eq!(points.get("firmware_v3"), Some(&DataValue::from("1.2")));
        assert_eq!(describe(1, 101, &[1, 9, 3, 16, 3]).detail, "Area: B. Previous firmware: 3.9. New firmware: 3.16.");
    }

    #[test]
    fn string_list_join_test() {
        assert_eq!(join_string_list(&[]), "-");
        assert_eq!(join_string_list(&[String::from("a")]), "a");
        let values = [String::from("a"), String::from("b"), String::from("c")];
        assert_eq!(join_string_list(&values), "a, b & c");
    }

    #[test]
    fn datapoints_serialize_test() {
        let points = decode(0, 0, &[5, 1, 3, 2]);
        assert_eq!(
            serde_json::to_string(&points).unwrap(),
            r#"{"bootl":5,"exec":"B","firmware_v":"3.2"}"#
        );
    }
}
