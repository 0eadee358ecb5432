//! Event log retrieval and storage.
//!
//! A log page is fetched with the same request / ready handshake as a BMS
//! status, followed by five bursts of 65 registers. The first register of
//! every burst is a length marker. The first 300 of the remaining 320 registers
//! hold 20 entries of 15 registers each:
//!
//! | register | high byte | low byte  |
//! |----------|-----------|-----------|
//! | 0        | code      | year      |
//! | 1        | month     | day       |
//! | 2        | hour      | minute    |
//! | 3        | second    | payload 0 |
//! | 4..15    | payload 1.. (big endian pairs) |
//!
//! Pages overlap between polls, entries are deduplicated by [`LogEntry::key`].

use crate::codec;
use crate::log_codec::{self, Datapoints, BALANCING_CODE};
use crate::protocol::{
    unit_name, CellLayout, HandshakeTiming, Word, BURST_REG_QUAN, LOG_DATA_BURSTS,
    LOG_DATA_REG_ADDR, LOG_READY_REG_ADDR, LOG_REQUEST_REG_ADDR, PREPARE_COMMAND,
};
use crate::transport::{wait_for_ready, Transport};
use crate::{Error, Result};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeZone};
use serde::{Deserialize, Serialize};
use std::collections::{btree_map, BTreeMap, HashMap};
use std::fmt;
use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

/// Entries per log page.
pub const PAGE_ENTRIES: usize = 20;
/// Registers per log entry.
pub const ENTRY_REG_QUAN: usize = 15;
/// Registers of a page once the burst markers are removed.
pub const PAGE_REG_QUAN: usize = LOG_DATA_BURSTS * (BURST_REG_QUAN as usize - 1);
/// Bytes of opaque payload per entry.
pub const PAYLOAD_LEN: usize = 23;

const KEY_TIME_FORMAT: &str = "%Y%m%d %H:%M:%S";

/// One event of the BMU or a BMS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: NaiveDateTime,
    pub unit_id: u8,
    pub code: u8,
    pub payload: Vec<u8>,
}

impl LogEntry {
    /// Identity of the entry, `"{YYYYMMDD HH:MM:SS}-{code}-{unit_id}"`.
    pub fn key(&self) -> String {
        format!(
            "{}-{}-{}",
            self.timestamp.format(KEY_TIME_FORMAT),
            self.code,
            self.unit_id
        )
    }

    pub fn describe(&self) -> log_codec::DecodedLog {
        log_codec::describe(self.unit_id, self.code, &self.payload)
    }

    /// Short summary of the entry, e.g. `01/31/2024, 08:15:00 17 Start balancing`.
    pub fn summary(&self) -> String {
        format!(
            "{} {} {}",
            self.timestamp.format("%m/%d/%Y, %H:%M:%S"),
            self.code,
            log_codec::code_description(self.unit_id, self.code)
        )
    }

    fn to_record(&self) -> LogRecord {
        LogRecord {
            ts: to_unix_seconds(&self.timestamp),
            u: self.unit_id,
            c: self.code,
            data: hex::encode(&self.payload),
        }
    }

    fn from_record(record: &LogRecord) -> Option<Self> {
        let timestamp = from_unix_seconds(record.ts)?;
        let payload = hex::decode(&record.data).ok()?;
        Some(Self {
            timestamp,
            unit_id: record.u,
            code: record.c,
            payload,
        })
    }
}

/// Persisted form of a [`LogEntry`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Unix seconds of the local time stamp.
    pub ts: f64,
    pub u: u8,
    pub c: u8,
    /// Payload as lower case hex.
    pub data: String,
}

fn to_unix_seconds(timestamp: &NaiveDateTime) -> f64 {
    let seconds = Local
        .from_local_datetime(timestamp)
        .earliest()
        .map(|local| local.timestamp())
        .unwrap_or_else(|| timestamp.and_utc().timestamp());
    seconds as f64
}

fn from_unix_seconds(seconds: f64) -> Option<NaiveDateTime> {
    DateTime::from_timestamp(seconds.floor() as i64, 0)
        .map(|utc| utc.with_timezone(&Local).naive_local())
}

/// Parses one log entry block.
///
/// Returns `None` once the page holds no further valid entries.
fn parse_entry(index: usize, regs: &[Word], unit_id: u8) -> Option<LogEntry> {
    let (code, year) = codec::split_byte(regs[0]);
    let (mut month, mut day) = codec::split_byte(regs[1]);
    let (hour, minute) = codec::split_byte(regs[2]);
    let (second, first_byte) = codec::split_byte(regs[3]);
    let stamp = format!("{year}-{month}-{day} {hour}:{minute}:{second} code: {code}");

    if year == 0 && month == 0 && day == 0 && code == 0 {
        log::debug!("Reached end: {index} {stamp}");
        return None;
    }
    if year == 255 {
        log::error!("Invalid year in log entry: {index} {stamp}");
        return None;
    }
    if month == 0 || month == 13 {
        log::warn!("Invalid month in log entry: {index} {stamp}");
        month = 1;
    }
    if day == 0 {
        log::warn!("Invalid day in log entry: {index} {stamp}");
        day = 1;
    }
    let Some(timestamp) = NaiveDate::from_ymd_opt(
        2000 + i32::from(year),
        u32::from(month),
        u32::from(day),
    )
    .and_then(|date| date.and_hms_opt(u32::from(hour), u32::from(minute), u32::from(second))) else {
        log::error!("Failed to derive log timestamp entry: {index} {stamp}");
        return None;
    };

    let mut payload = Vec::with_capacity(PAYLOAD_LEN);
    payload.push(first_byte);
    payload.extend(codec::to_bytes(&regs[4..ENTRY_REG_QUAN]));
    Some(LogEntry {
        timestamp,
        unit_id,
        code,
        payload,
    })
}

/// Splits a 320 register page into its entries.
///
/// Parsing stops at the end-of-log sentinel, a corrupt year or an invalid
/// time stamp; entries before that point are kept.
pub fn parse_page(regs: &[Word], unit_id: u8) -> Result<Vec<LogEntry>> {
    if regs.len() != PAGE_REG_QUAN {
        log::error!(
            "Unexpected number of {} log regs: {}",
            unit_name(unit_id),
            regs.len()
        );
        return Err(Error::UnexpectedLength {
            expected: PAGE_REG_QUAN,
            received: regs.len(),
        });
    }
    Ok(regs[..PAGE_ENTRIES * ENTRY_REG_QUAN]
        .chunks_exact(ENTRY_REG_QUAN)
        .enumerate()
        .map_while(|(index, block)| parse_entry(index, block, unit_id))
        .collect())
}

/// Steps of a log page read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogPhase {
    Idle,
    Requested,
    WaitingReady,
    Fetching,
    Parsing,
    Done,
    Failed,
}

impl fmt::Display for LogPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LogPhase::Idle => "idle",
            LogPhase::Requested => "requested",
            LogPhase::WaitingReady => "waiting for ready",
            LogPhase::Fetching => "fetching",
            LogPhase::Parsing => "parsing",
            LogPhase::Done => "done",
            LogPhase::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Tracks the phase of one page read for diagnostics.
struct PageRead {
    unit: String,
    phase: LogPhase,
}

impl PageRead {
    fn new(unit_id: u8) -> Self {
        Self {
            unit: unit_name(unit_id),
            phase: LogPhase::Idle,
        }
    }

    fn enter(&mut self, phase: LogPhase) {
        log::trace!("{} log: {} -> {phase}", self.unit, self.phase);
        self.phase = phase;
    }

    fn fail(&mut self, err: &Error) {
        log::error!("read {} log data error while {}: {err}", self.unit, self.phase);
        self.phase = LogPhase::Failed;
    }
}

/// Requests, fetches and parses the most recent log page of `unit_id`.
pub async fn read_log_page<T: Transport + ?Sized>(
    transport: &mut T,
    unit_id: u8,
    timing: &HandshakeTiming,
) -> Result<Vec<LogEntry>> {
    let mut read = PageRead::new(unit_id);
    let result = fetch_page(transport, unit_id, timing, &mut read).await;
    match &result {
        Ok(_) => read.enter(LogPhase::Done),
        Err(err) => read.fail(err),
    }
    result
}

async fn fetch_page<T: Transport + ?Sized>(
    transport: &mut T,
    unit_id: u8,
    timing: &HandshakeTiming,
    read: &mut PageRead,
) -> Result<Vec<LogEntry>> {
    read.enter(LogPhase::Requested);
    transport
        .write_registers(LOG_REQUEST_REG_ADDR, &[Word::from(unit_id), PREPARE_COMMAND])
        .await?;

    read.enter(LogPhase::WaitingReady);
    wait_for_ready(transport, LOG_READY_REG_ADDR, timing).await?;

    read.enter(LogPhase::Fetching);
    let mut regs = Vec::with_capacity(PAGE_REG_QUAN);
    for _ in 0..LOG_DATA_BURSTS {
        let burst = transport
            .read_holding_registers(LOG_DATA_REG_ADDR, BURST_REG_QUAN)
            .await?;
        // skip the length marker
        regs.extend(burst.iter().skip(1));
    }

    read.enter(LogPhase::Parsing);
    parse_page(&regs, unit_id)
}

/// Entry of the recent log list.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecentLogEntry {
    pub timestamp: NaiveDateTime,
    pub unit: String,
    pub code: u8,
    pub description: String,
    pub datapoints: Datapoints,
    pub detail: String,
    pub hex: String,
}

/// Balancing statistics of one tower.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BalancingTotals {
    /// Number of balancing events.
    pub total: u32,
    /// How often every cell was balanced, one row per module.
    pub cells: Vec<Vec<u32>>,
}

/// All log entries known so far, ordered by key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LogStore {
    entries: BTreeMap<String, LogEntry>,
}

impl LogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `entry`, returns `false` if its key is already known.
    pub fn insert(&mut self, entry: LogEntry) -> bool {
        match self.entries.entry(entry.key()) {
            btree_map::Entry::Vacant(vacant) => {
                vacant.insert(entry);
                true
            }
            btree_map::Entry::Occupied(occupied) => {
                log::trace!("skip known log entry {}", occupied.key());
                false
            }
        }
    }

    /// Stores all entries, returns the number of new ones.
    pub fn extend(&mut self, entries: impl IntoIterator<Item = LogEntry>) -> usize {
        entries
            .into_iter()
            .map(|entry| self.insert(entry))
            .filter(|&new| new)
            .count()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&LogEntry> {
        self.entries.get(key)
    }

    /// Iterates the entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &LogEntry)> {
        self.entries.iter()
    }

    /// The `count` entries with the highest keys, newest first.
    pub fn recent(&self, count: usize) -> Vec<RecentLogEntry> {
        self.entries
            .values()
            .rev()
            .take(count)
            .map(|entry| {
                let decoded = entry.describe();
                RecentLogEntry {
                    timestamp: entry.timestamp,
                    unit: unit_name(entry.unit_id),
                    code: entry.code,
                    description: decoded.description.to_string(),
                    datapoints: decoded.datapoints,
                    detail: decoded.detail,
                    hex: hex::encode(&entry.payload),
                }
            })
            .collect()
    }

    /// Counts the balancing events of `unit_id` and how often each cell took part.
    pub fn balancing_totals(&self, unit_id: u8, layout: &CellLayout) -> BalancingTotals {
        let mut total = 0;
        let mut per_cell: HashMap<u16, u32> = HashMap::new();
        for entry in self
            .entries
            .values()
            .filter(|entry| entry.unit_id == unit_id && entry.code == BALANCING_CODE)
        {
            total += 1;
            for cell in log_codec::balancing_cells(&entry.payload) {
                *per_cell.entry(cell).or_default() += 1;
            }
        }
        let per_module = u16::from(layout.cells);
        let cells = (0..u16::from(layout.modules))
            .map(|module| {
                (0..per_module)
                    .map(|cell| {
                        per_cell
                            .get(&(module * per_module + cell))
                            .copied()
                            .unwrap_or(0)
                    })
                    .collect()
            })
            .collect();
        BalancingTotals { total, cells }
    }

    /// Loads a store written by [`LogStore::save_json`].
    ///
    /// Records that cannot be converted back are skipped.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path.as_ref())?;
        let records: BTreeMap<String, LogRecord> = serde_json::from_reader(BufReader::new(file))?;
        let mut entries = BTreeMap::new();
        for (key, record) in records {
            match LogEntry::from_record(&record) {
                Some(entry) => {
                    entries.insert(key, entry);
                }
                None => log::warn!("skip invalid log record {key}: {record:?}"),
            }
        }
        log::debug!("log entries loaded: {}", entries.len());
        Ok(Self { entries })
    }

    /// Writes the store as JSON object keyed by entry key.
    pub fn save_json(&self, path: impl AsRef<Path>) -> Result<()> {
        let records: BTreeMap<&String, LogRecord> = self
            .entries
            .iter()
            .map(|(key, entry)| (key, entry.to_record()))
            .collect();
        let mut writer = BufWriter::new(File::create(path.as_ref())?);
        serde_json::to_writer_pretty(&mut writer, &records)?;
        writer.flush()?;
        Ok(())
    }

    /// Writes the decoded store as CSV.
    pub fn save_csv(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut writer = csv::Writer::from_path(path.as_ref())?;
        writer.write_record(["ts", "unit", "code", "description", "detail", "data"])?;
        for entry in self.entries.values() {
            let decoded = entry.describe();
            writer.write_record([
                entry.timestamp.format(KEY_TIME_FORMAT).to_string(),
                unit_name(entry.unit_id),
                entry.code.to_string(),
                decoded.description.to_string(),
                decoded.detail,
                hex::encode(&entry.payload),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }
}
