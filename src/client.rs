//! Public operations on a battery box.
//!
//! [`BydBox`] owns the transport behind an async mutex. Every logical device
//! transaction (a BMS status handshake, a log page, a whole round of units)
//! runs under a single acquisition, so the health probe can delay but never
//! split it. Decoded data lands in a [`DeviceSnapshot`] that readers copy out.
//!
//! ```no_run
//! use bydbox_lib::client::BydBox;
//! use bydbox_lib::transport::{ModbusTransport, TransportConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), bydbox_lib::Error> {
//!     let client = BydBox::new(ModbusTransport::new(TransportConfig::new("192.168.16.254:8080")));
//!     let info = client.initialize().await?;
//!     client.poll_status(0).await?;
//!     for unit in 1..=info.towers() {
//!         client.poll_status(unit).await?;
//!     }
//!     println!("{:#?}", client.snapshot());
//!     Ok(())
//! }
//! ```

use crate::health::{HealthMonitor, HealthReport, HealthTask};
use crate::history::HistoryTracker;
use crate::logbook::{read_log_page, LogEntry, LogStore, PAGE_ENTRIES};
use crate::protocol::{
    unit_name, BaseInfo, ExtInfo, HandshakeTiming, SystemInfo, BASE_INFO_REG_ADDR,
    BASE_INFO_REG_QUAN, BMU_UNIT_ID, EXT_INFO_REG_ADDR, EXT_INFO_REG_QUAN,
};
use crate::snapshot::DeviceSnapshot;
use crate::status::{read_bms_status, read_bmu_status, BmsStatus};
use crate::transport::Transport;
use crate::{Error, Result};
use chrono::Local;
use std::path::Path;
use std::sync::{Arc, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex;

/// Pause between two units of a whole-system round.
pub const UNIT_PAUSE: Duration = Duration::from_millis(200);
/// Entries of the recent log list in the snapshot.
pub const DEFAULT_RECENT_ENTRIES: usize = 20;

pub const LOG_JSON_FILE: &str = "byd_log.json";
pub const LOG_CSV_FILE: &str = "byd_log.csv";

#[derive(Debug, Default)]
struct State {
    info: Option<SystemInfo>,
    snapshot: DeviceSnapshot,
    log: LogStore,
    history: HistoryTracker,
    /// Store size at the last load or save.
    persisted_entries: usize,
}

pub struct BydBox<T> {
    transport: Arc<Mutex<T>>,
    state: std::sync::Mutex<State>,
    timing: HandshakeTiming,
    recent_entries: usize,
    health: Arc<HealthMonitor<T>>,
}

impl<T: Transport + 'static> BydBox<T> {
    pub fn new(transport: T) -> Self {
        let transport = Arc::new(Mutex::new(transport));
        let health = Arc::new(HealthMonitor::new(
            Arc::clone(&transport),
            HealthMonitor::<T>::DEFAULT_INTERVAL,
        ));
        Self {
            transport,
            state: std::sync::Mutex::new(State::default()),
            timing: HandshakeTiming::default(),
            recent_entries: DEFAULT_RECENT_ENTRIES,
            health,
        }
    }

    pub fn with_timing(mut self, timing: HandshakeTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn with_recent_entries(mut self, count: usize) -> Self {
        self.recent_entries = count;
        self
    }

    pub fn with_health_interval(mut self, interval: Duration) -> Self {
        self.health = Arc::new(HealthMonitor::new(Arc::clone(&self.transport), interval));
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The device information, or [`Error::NotInitialized`].
    pub fn info(&self) -> Result<SystemInfo> {
        self.state().info.clone().ok_or(Error::NotInitialized)
    }

    fn checked_info(&self, unit_id: u8) -> Result<SystemInfo> {
        let info = self.info()?;
        if unit_id != BMU_UNIT_ID && unit_id > info.towers() {
            return Err(Error::UnknownUnit(unit_id));
        }
        Ok(info)
    }

    /// Connects and reads the base and extended information.
    ///
    /// Every later operation depends on the layout learned here, a failure
    /// is reported as [`Error::Initialization`].
    pub async fn initialize(&self) -> Result<SystemInfo> {
        let mut transport = self.transport.lock().await;
        let info = read_system_info(&mut *transport)
            .await
            .map_err(Error::initialization)?;
        drop(transport);

        log::info!(
            "{:?} {:?} serial={} towers={} modules={} capacity={} kWh",
            info.base.battery_type,
            info.ext.model,
            info.base.serial,
            info.towers(),
            info.base.modules,
            info.ext.capacity_kwh
        );
        let mut state = self.state();
        for unit_id in 1..=info.towers() {
            state.snapshot.tower_mut(unit_id);
        }
        state.snapshot.info = Some(info.clone());
        state.info = Some(info.clone());
        Ok(info)
    }

    /// Reads the status of the BMU (`0`) or a tower (`1..=towers`).
    pub async fn poll_status(&self, unit_id: u8) -> Result<()> {
        let info = self.checked_info(unit_id)?;
        let mut transport = self.transport.lock().await;
        if unit_id == BMU_UNIT_ID {
            let status = read_bmu_status(&mut *transport).await?;
            drop(transport);
            let mut state = self.state();
            state.snapshot.bmu.status = Some(status);
            state.snapshot.bmu.updated = Some(Local::now());
        } else {
            let status =
                read_bms_status(&mut *transport, unit_id, &info.layout(), &self.timing).await?;
            drop(transport);
            self.store_bms_status(unit_id, status);
        }
        Ok(())
    }

    /// Reads the status of every tower, stops at the first failure.
    pub async fn poll_all_status(&self) -> Result<()> {
        let info = self.info()?;
        let layout = info.layout();
        let mut transport = self.transport.lock().await;
        for unit_id in 1..=info.towers() {
            if unit_id > 1 {
                tokio::time::sleep(UNIT_PAUSE).await;
            }
            let status = read_bms_status(&mut *transport, unit_id, &layout, &self.timing).await?;
            self.store_bms_status(unit_id, status);
        }
        Ok(())
    }

    fn store_bms_status(&self, unit_id: u8, status: BmsStatus) {
        let mut state = self.state();
        let State {
            snapshot, history, ..
        } = &mut *state;
        let extremes = history.update(unit_id, &status.cell_voltages);
        let tower = snapshot.tower_mut(unit_id);
        tower.set_history(Some(extremes));
        tower.status = Some(status);
        tower.updated = Some(Local::now());
    }

    /// Reads up to `depth` log pages of `unit_id`, newest first.
    ///
    /// Returns the number of entries the pages held, known ones included.
    /// With more than one page the scan ends at the first page that is not
    /// full. Only a single page read updates the unit's last log summary.
    pub async fn poll_log(&self, unit_id: u8, depth: usize) -> Result<usize> {
        let info = self.checked_info(unit_id)?;
        let depth = depth.max(1);
        let mut transport = self.transport.lock().await;
        let mut found = 0;
        let mut result = Ok(());
        for page in 0..depth {
            let entries = match read_log_page(&mut *transport, unit_id, &self.timing).await {
                Ok(entries) => entries,
                Err(err) => {
                    result = Err(err);
                    break;
                }
            };
            let count = entries.len();
            found += count;
            self.store_log_page(unit_id, entries, depth == 1);
            if depth > 1 && count < PAGE_ENTRIES {
                log::debug!("{} log exhausted after {} pages", unit_name(unit_id), page + 1);
                break;
            }
        }
        drop(transport);
        self.refresh_log_views(&info);
        result.map(|()| found)
    }

    /// Reads one log page of the BMU and of every tower.
    ///
    /// Returns the number of entries read before the first failure.
    pub async fn poll_all_logs(&self) -> Result<usize> {
        let info = self.info()?;
        let mut transport = self.transport.lock().await;
        let mut found = 0;
        let mut result = Ok(());
        for unit_id in BMU_UNIT_ID..=info.towers() {
            if unit_id > BMU_UNIT_ID {
                tokio::time::sleep(UNIT_PAUSE).await;
            }
            match read_log_page(&mut *transport, unit_id, &self.timing).await {
                Ok(entries) => {
                    found += entries.len();
                    self.store_log_page(unit_id, entries, true);
                }
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        drop(transport);
        self.refresh_log_views(&info);
        result.map(|()| found)
    }

    /// Reads as many pages as needed for the newest `entries` log entries.
    pub async fn import_log_history(&self, unit_id: u8, entries: usize) -> Result<usize> {
        self.poll_log(unit_id, entries.div_ceil(PAGE_ENTRIES)).await
    }

    fn store_log_page(&self, unit_id: u8, entries: Vec<LogEntry>, update_last: bool) {
        let mut state = self.state();
        if update_last {
            if let Some(newest) = entries.first() {
                state.snapshot.set_last_log(unit_id, newest.summary());
            }
        }
        let new = state.log.extend(entries);
        log::debug!("{} new log entries: {new}", unit_name(unit_id));
    }

    fn refresh_log_views(&self, info: &SystemInfo) {
        let layout = info.layout();
        let mut state = self.state();
        let State { snapshot, log, .. } = &mut *state;
        snapshot.log_entries = log.len();
        snapshot.recent_log = log.recent(self.recent_entries);
        for unit_id in 1..=info.towers() {
            snapshot.tower_mut(unit_id).balancing = log.balancing_totals(unit_id, &layout);
        }
    }

    /// Forgets the voltage extremes of `unit_id`, or of all towers for `None`.
    pub fn reset_history(&self, unit_id: Option<u8>) {
        let mut state = self.state();
        state.history.reset(unit_id);
        for (id, tower) in state.snapshot.towers.iter_mut() {
            if unit_id.map_or(true, |unit_id| unit_id == *id) {
                tower.set_history(None);
            }
        }
    }

    /// Last known connection health, does not touch the device.
    pub fn connection_metrics(&self) -> HealthReport {
        self.health.metrics().report()
    }

    pub fn health(&self) -> &Arc<HealthMonitor<T>> {
        &self.health
    }

    /// Starts the periodic connection probe.
    pub fn start_health_monitor(&self) -> HealthTask {
        Arc::clone(&self.health).spawn()
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        self.state().snapshot.clone()
    }

    /// Number of entries in the log store.
    pub fn log_entries(&self) -> usize {
        self.state().log.len()
    }

    /// Merges the entries of a saved log store, returns the store size.
    pub fn load_log(&self, path: impl AsRef<Path>) -> Result<usize> {
        let loaded = LogStore::load(path)?;
        let mut state = self.state();
        state
            .log
            .extend(loaded.iter().map(|(_, entry)| entry.clone()));
        state.persisted_entries = state.log.len();
        let entries = state.log.len();
        let info = state.info.clone();
        drop(state);
        if let Some(info) = info {
            self.refresh_log_views(&info);
        }
        Ok(entries)
    }

    /// Writes [`LOG_JSON_FILE`] and [`LOG_CSV_FILE`] into `dir`.
    ///
    /// Nothing is written unless the store grew since the last load or save.
    pub fn save_log(&self, dir: impl AsRef<Path>) -> Result<bool> {
        let mut state = self.state();
        if state.log.len() == state.persisted_entries {
            return Ok(false);
        }
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        state.log.save_json(dir.join(LOG_JSON_FILE))?;
        state.log.save_csv(dir.join(LOG_CSV_FILE))?;
        state.persisted_entries = state.log.len();
        log::info!("log saved, {} entries", state.persisted_entries);
        Ok(true)
    }

    /// Drops the device connection.
    pub async fn close(&self) {
        self.transport.lock().await.close();
    }
}

async fn read_system_info<T: Transport + ?Sized>(transport: &mut T) -> Result<SystemInfo> {
    if !transport.is_connected() {
        transport.connect().await?;
    }
    let regs = transport
        .read_holding_registers(BASE_INFO_REG_ADDR, BASE_INFO_REG_QUAN)
        .await?;
    let base = BaseInfo::decode(&regs)?;
    let regs = transport
        .read_holding_registers(EXT_INFO_REG_ADDR, EXT_INFO_REG_QUAN)
        .await?;
    let ext = ExtInfo::decode(&regs, &base)?;
    Ok(SystemInfo { base, ext })
}
