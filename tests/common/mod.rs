//! Scripted in-memory battery box for the integration tests.
#![allow(dead_code)]

use async_trait::async_trait;
use bydbox_lib::logbook::{PAGE_REG_QUAN, PAYLOAD_LEN};
use bydbox_lib::protocol::*;
use bydbox_lib::transport::Transport;
use bydbox_lib::{BydBox, Error, Result};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

pub const SERIAL: &str = "P030T020Z2012345678";

/// Three HVM modules per tower.
pub const LAYOUT: CellLayout = CellLayout {
    modules: 3,
    cells: 16,
    temp_sensors: 8,
};

/// Register contents and request log of the simulated device.
pub struct MockDevice {
    pub base_info: Vec<Word>,
    pub ext_info: Vec<Word>,
    pub bmu_status: Vec<Word>,
    /// 260 register status block per tower.
    pub bms_status: HashMap<u8, Vec<Word>>,
    /// Log pages per unit, served one per request. An exhausted queue serves an empty page.
    pub log_pages: HashMap<u8, VecDeque<Vec<Word>>>,
    /// Not ready answers before the ready register reports `ready_value`.
    pub ready_delay: usize,
    pub ready_value: Word,
    pub fail_reads: bool,
    pub writes: Vec<(u16, Vec<Word>)>,
    pub reads: Vec<(u16, u16)>,
    pending_ready: usize,
    selected: u8,
    burst: usize,
    page: Vec<Word>,
}

impl MockDevice {
    pub fn new(towers: u8) -> Self {
        Self {
            base_info: base_info(SERIAL, towers, LAYOUT.modules),
            // inverter 3, HVM
            ext_info: vec![0x0300, 0x0100],
            bmu_status: bmu_status(),
            bms_status: (1..=towers)
                .map(|unit| (unit, bms_status(&LAYOUT, |_, _| 3_300)))
                .collect(),
            log_pages: HashMap::new(),
            ready_delay: 2,
            ready_value: READY_RESPONSE,
            fail_reads: false,
            writes: Vec::new(),
            reads: Vec::new(),
            pending_ready: 0,
            selected: 0,
            burst: 0,
            page: Vec::new(),
        }
    }

    pub fn queue_page(&mut self, unit_id: u8, page: Vec<Word>) {
        self.log_pages.entry(unit_id).or_default().push_back(page);
    }

    /// Number of handshake requests written to `address`.
    pub fn requests(&self, address: u16) -> usize {
        self.writes.iter().filter(|(addr, _)| *addr == address).count()
    }

    fn read(&mut self, address: u16, count: u16) -> Result<Vec<Word>> {
        self.reads.push((address, count));
        if self.fail_reads {
            return Err(Error::RetriesExhausted {
                address,
                attempts: 4,
            });
        }
        let count = usize::from(count);
        let regs = match address {
            BASE_INFO_REG_ADDR => self.base_info.iter().copied().take(count).collect(),
            EXT_INFO_REG_ADDR => self.ext_info.clone(),
            BMU_STATUS_REG_ADDR => self.bmu_status.clone(),
            BMS_READY_REG_ADDR | LOG_READY_REG_ADDR => {
                if self.pending_ready > 0 {
                    self.pending_ready -= 1;
                    vec![0]
                } else {
                    vec![self.ready_value]
                }
            }
            BMS_DATA_REG_ADDR => {
                let block = self
                    .bms_status
                    .get(&self.selected)
                    .cloned()
                    .unwrap_or_else(|| vec![0; 260]);
                let start = self.burst * count;
                self.burst += 1;
                block[start..start + count].to_vec()
            }
            LOG_DATA_REG_ADDR => {
                let data = count - 1;
                let start = self.burst * data;
                self.burst += 1;
                let mut regs = vec![data as Word];
                regs.extend_from_slice(&self.page[start..start + data]);
                regs
            }
            _ => return Err(Error::Exception(tokio_modbus::ExceptionCode::IllegalDataAddress)),
        };
        Ok(regs)
    }

    fn write(&mut self, address: u16, values: &[Word]) {
        self.writes.push((address, values.to_vec()));
        let unit_id = values.first().copied().unwrap_or_default() as u8;
        match address {
            BMS_REQUEST_REG_ADDR => {}
            LOG_REQUEST_REG_ADDR => {
                self.page = self
                    .log_pages
                    .get_mut(&unit_id)
                    .and_then(VecDeque::pop_front)
                    .unwrap_or_else(|| vec![0; PAGE_REG_QUAN]);
            }
            _ => return,
        }
        self.selected = unit_id;
        self.pending_ready = self.ready_delay;
        self.burst = 0;
    }
}

pub struct MockTransport {
    device: Arc<Mutex<MockDevice>>,
    connected: bool,
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&mut self) -> Result<()> {
        self.connected = true;
        Ok(())
    }

    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<Word>> {
        self.device.lock().unwrap().read(address, count)
    }

    async fn write_registers(&mut self, address: u16, values: &[Word]) -> Result<()> {
        self.device.lock().unwrap().write(address, values);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn close(&mut self) {
        self.connected = false;
    }
}

/// A client on top of `device` and a handle to inspect the device afterwards.
pub fn client(device: MockDevice) -> (BydBox<MockTransport>, Arc<Mutex<MockDevice>>) {
    let device = Arc::new(Mutex::new(device));
    let transport = MockTransport {
        device: Arc::clone(&device),
        connected: false,
    };
    (BydBox::new(transport), device)
}

pub fn base_info(serial: &str, towers: u8, modules: u8) -> Vec<Word> {
    let mut bytes = serial.as_bytes().to_vec();
    // checksum digit
    bytes.push(b'9');
    bytes.resize(20, 0);
    let mut regs: Vec<Word> = bytes
        .chunks(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    regs.resize(20, 0);
    regs[12] = 0x0310;
    regs[13] = 0x0311;
    regs[14] = 0x0315;
    regs[16] = (Word::from(towers) << 4) | Word::from(modules);
    regs[17] = 0x0100;
    regs[18] = 0x0100;
    regs
}

pub fn bmu_status() -> Vec<Word> {
    let mut regs = vec![0; 21];
    regs[0] = 87;
    regs[1] = 334;
    regs[2] = 331;
    regs[3] = 100;
    // 10.0 A
    regs[4] = 100;
    regs[5] = 41_000;
    regs[6] = 24;
    regs[7] = 19;
    regs[8] = 31;
    regs[10] = 792;
    regs[14] = 0x0213;
    // 240.00 V
    regs[16] = 24_000;
    regs[17] = 10_000;
    regs[19] = 9_500;
    regs
}

/// Status block of a tower with `voltage(module, cell)` in mV.
pub fn bms_status(layout: &CellLayout, voltage: impl Fn(usize, usize) -> i16) -> Vec<Word> {
    let mut regs = vec![0; 260];
    regs[1] = 3_350;
    regs[2] = 3_290;
    regs[3] = 0x0207;
    regs[4] = 25;
    regs[5] = 19;
    regs[6] = 0x0103;
    regs[21] = 4_012;
    regs[23] = 1_560;
    regs[24] = 4_010;
    regs[25] = 875;
    regs[26] = 100;
    for module in 0..usize::from(layout.modules) {
        regs[7 + module] = 0b11;
        for cell in 0..usize::from(layout.cells) {
            let index = module * 16 + cell;
            let reg = match index {
                0..=15 => 49 + index,
                16..=79 => 66 + index - 16,
                _ => 131 + index - 80,
            };
            regs[reg] = voltage(module, cell) as Word;
        }
        for word in 0..usize::from(layout.temp_sensors).div_ceil(2) {
            regs[180 + module * 4 + word] = 0x1415;
        }
    }
    regs
}

/// One 15 register log entry.
pub fn log_block(code: u8, date: [u8; 6], payload: &[u8]) -> Vec<Word> {
    let [year, month, day, hour, minute, second] = date;
    let mut bytes = payload.to_vec();
    bytes.resize(PAYLOAD_LEN, 0);
    let mut regs = vec![
        Word::from(code) << 8 | Word::from(year),
        Word::from(month) << 8 | Word::from(day),
        Word::from(hour) << 8 | Word::from(minute),
        Word::from(second) << 8 | Word::from(bytes[0]),
    ];
    regs.extend(
        bytes[1..]
            .chunks(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]])),
    );
    regs
}

pub fn log_page(blocks: &[Vec<Word>]) -> Vec<Word> {
    let mut regs = blocks.concat();
    regs.resize(PAGE_REG_QUAN, 0);
    regs
}

/// A page of `count` entries, one per minute going back from `hour:59` on `day`.
pub fn full_page(code: u8, day: u8, hour: u8, count: usize) -> Vec<Word> {
    let blocks: Vec<Vec<Word>> = (0..count)
        .map(|index| log_block(code, [24, 3, day, hour, 59 - index as u8, 0], &[]))
        .collect();
    log_page(&blocks)
}
