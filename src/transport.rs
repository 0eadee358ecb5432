//! Register transport to the BMU gateway.
//!
//! [`Transport`] is the seam every decoder talks through; [`ModbusTransport`]
//! implements it with `tokio-modbus` over a TCP stream. Only one request is
//! ever outstanding: callers serialize access through the client's transport
//! guard.
//!
//! # Example
//!
//! ```no_run
//! use bydbox_lib::transport::{ModbusTransport, Transport, TransportConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), bydbox_lib::Error> {
//!     let mut transport = ModbusTransport::new(TransportConfig::new("192.168.16.254:8080"));
//!     transport.connect().await?;
//!     let regs = transport.read_holding_registers(0x0000, 20).await?;
//!     println!("Base info: {regs:04X?}");
//!     Ok(())
//! }
//! ```

use crate::protocol::{HandshakeTiming, Word, BURST_REG_QUAN, PREPARE_COMMAND, READY_RESPONSE};
use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_modbus::prelude::{Reader, Writer};
use tokio_modbus::Slave;

/// Framing used inside the TCP stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Framing {
    /// Standard Modbus TCP (MBAP header).
    Tcp,
    /// RTU frames tunneled through TCP, as spoken by the battery box gateway.
    #[default]
    Rtu,
}

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// `host:port` of the gateway.
    pub address: String,
    pub slave: u8,
    pub framing: Framing,
    /// Timeout of a single request.
    pub io_timeout: Duration,
    /// Retries of a read after the first attempt.
    pub retries: u8,
    /// Attempts to establish the connection.
    pub connect_retries: u8,
    /// Fixed backoff between attempts.
    pub retry_delay: Duration,
}

impl TransportConfig {
    pub const DEFAULT_PORT: u16 = 8080;
    pub const DEFAULT_SLAVE: u8 = 1;

    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            slave: Self::DEFAULT_SLAVE,
            framing: Framing::default(),
            io_timeout: Duration::from_secs(5),
            retries: 3,
            connect_retries: 3,
            retry_delay: Duration::from_millis(200),
        }
    }
}

/// A single-outstanding-request register transport.
#[async_trait]
pub trait Transport: Send {
    /// Establishes the connection, retrying with a fixed backoff.
    async fn connect(&mut self) -> Result<()>;

    /// Reads `count` holding registers (function code 0x03).
    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<Word>>;

    /// Writes `values` to consecutive registers (function code 0x10).
    async fn write_registers(&mut self, address: u16, values: &[Word]) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Drops the connection.
    fn close(&mut self);
}

/// Opens a TCP stream to the gateway and attaches a Modbus context to it.
async fn open(config: TransportConfig) -> Result<tokio_modbus::client::Context> {
    let stream =
        tokio::time::timeout(config.io_timeout, TcpStream::connect(&config.address)).await??;
    let slave = Slave(config.slave);
    Ok(match config.framing {
        Framing::Tcp => tokio_modbus::client::tcp::attach_slave(stream, slave),
        Framing::Rtu => tokio_modbus::client::rtu::attach_slave(stream, slave),
    })
}

/// [`Transport`] implementation on top of `tokio-modbus`.
pub struct ModbusTransport {
    config: TransportConfig,
    ctx: Option<tokio_modbus::client::Context>,
}

/// Outcome of a single register transaction.
enum Attempt<T> {
    Done(T),
    /// Connection level failure, the context is dropped and reconnected.
    Transport(Error),
    /// The device answered with an exception code.
    Exception(tokio_modbus::ExceptionCode),
}

impl ModbusTransport {
    pub fn new(config: TransportConfig) -> Self {
        Self { config, ctx: None }
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    async fn ensure_connected(&mut self) -> Result<()> {
        if self.ctx.is_none() {
            log::warn!("Modbus client is not connected, reconnecting...");
            self.connect().await?;
        }
        Ok(())
    }

    async fn read_once(&mut self, address: u16, count: u16) -> Attempt<Vec<Word>> {
        let Some(ctx) = self.ctx.as_mut() else {
            return Attempt::Transport(Error::NotConnected {
                address: self.config.address.clone(),
                attempts: 0,
            });
        };
        match tokio::time::timeout(
            self.config.io_timeout,
            ctx.read_holding_registers(address, count),
        )
        .await
        {
            Ok(Ok(Ok(words))) => Attempt::Done(words),
            Ok(Ok(Err(exception))) => Attempt::Exception(exception),
            Ok(Err(err)) => Attempt::Transport(err.into()),
            Err(elapsed) => Attempt::Transport(elapsed.into()),
        }
    }

    async fn write_once(&mut self, address: u16, values: &[Word]) -> Attempt<()> {
        let Some(ctx) = self.ctx.as_mut() else {
            return Attempt::Transport(Error::NotConnected {
                address: self.config.address.clone(),
                attempts: 0,
            });
        };
        match tokio::time::timeout(
            self.config.io_timeout,
            ctx.write_multiple_registers(address, values),
        )
        .await
        {
            Ok(Ok(Ok(()))) => Attempt::Done(()),
            Ok(Ok(Err(exception))) => Attempt::Exception(exception),
            Ok(Err(err)) => Attempt::Transport(err.into()),
            Err(elapsed) => Attempt::Transport(elapsed.into()),
        }
    }
}

#[async_trait]
impl Transport for ModbusTransport {
    async fn connect(&mut self) -> Result<()> {
        for attempt in 0..self.config.connect_retries {
            if attempt > 0 {
                log::debug!(
                    "Connect retry attempt: {attempt}/{} connecting to: {} slave: {}",
                    self.config.connect_retries,
                    self.config.address,
                    self.config.slave
                );
                tokio::time::sleep(self.config.retry_delay).await;
            }
            match open(self.config.clone()).await {
                Ok(ctx) => {
                    log::debug!("successfully connected to {}", self.config.address);
                    self.ctx = Some(ctx);
                    return Ok(());
                }
                Err(err) => log::debug!("connect to {} failed ({err})", self.config.address),
            }
        }
        Err(Error::NotConnected {
            address: self.config.address.clone(),
            attempts: self.config.connect_retries,
        })
    }

    async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<Word>> {
        self.ensure_connected().await?;
        let attempts = self.config.retries + 1;
        for attempt in 1..=attempts {
            match self.read_once(address, count).await {
                Attempt::Done(words) => {
                    log::trace!("read {address:#06X} x{count}: {words:04X?}");
                    return Ok(words);
                }
                Attempt::Exception(code) => {
                    log::debug!(
                        "Exception response reading register {address:#06X} count {count} attempt {attempt}/{attempts}: {code:?}"
                    );
                }
                Attempt::Transport(err) => {
                    log::warn!(
                        "error reading registers attempt {attempt}/{attempts} address: {address:#06X} count: {count} ({err})"
                    );
                    self.ctx = None;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay).await;
                if self.ctx.is_none() {
                    // a failed reconnect is retried by the next attempt
                    if let Err(err) = self.connect().await {
                        log::debug!("reconnect failed ({err})");
                    }
                }
            }
        }
        log::error!(
            "error reading registers. retries exhausted. connected {} address: {address:#06X} count: {count}",
            self.is_connected()
        );
        Err(Error::RetriesExhausted { address, attempts })
    }

    async fn write_registers(&mut self, address: u16, values: &[Word]) -> Result<()> {
        self.ensure_connected().await?;
        log::trace!("write {address:#06X}: {values:04X?}");
        match self.write_once(address, values).await {
            Attempt::Done(()) => Ok(()),
            Attempt::Exception(code) => Err(Error::Exception(code)),
            Attempt::Transport(err) => {
                self.ctx = None;
                Err(err)
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.ctx.is_some()
    }

    fn close(&mut self) {
        self.ctx = None;
    }
}

/// Polls `ready_address` until it reports [`READY_RESPONSE`].
///
/// Waits `timing.initial_delay` first, then polls every `timing.interval`
/// until `timing.timeout` worth of intervals elapsed. Read failures while
/// waiting are not fatal; only the timeout is.
pub async fn wait_for_ready<T: Transport + ?Sized>(
    transport: &mut T,
    ready_address: u16,
    timing: &HandshakeTiming,
) -> Result<()> {
    let mut last = 0;
    let mut waited = Duration::ZERO;
    tokio::time::sleep(timing.initial_delay).await;
    while waited < timing.timeout {
        tokio::time::sleep(timing.interval).await;
        waited += timing.interval;
        match transport.read_holding_registers(ready_address, 1).await {
            Ok(regs) => match regs.first() {
                Some(&READY_RESPONSE) => {
                    log::trace!("ready response at {ready_address:#06X} after {waited:?}");
                    return Ok(());
                }
                Some(&value) => last = value,
                None => log::debug!("empty response while waiting for {ready_address:#06X}"),
            },
            Err(err) => log::debug!("error while waiting for response {ready_address:#06X} ({err})"),
        }
    }
    log::error!("wait for response timeout. {ready_address:#06X} last response {last:#06X}");
    Err(Error::ReadyTimeout {
        address: ready_address,
        last,
    })
}

/// Runs the request / poll-for-ready / burst-fetch handshake for `unit_id`.
///
/// Returns the raw bursts in order, each of [`BURST_REG_QUAN`] registers.
pub async fn request_bursts<T: Transport + ?Sized>(
    transport: &mut T,
    unit_id: u8,
    addresses: BurstAddresses,
    timing: &HandshakeTiming,
) -> Result<Vec<Vec<Word>>> {
    transport
        .write_registers(addresses.request, &[Word::from(unit_id), PREPARE_COMMAND])
        .await?;
    wait_for_ready(transport, addresses.ready, timing).await?;
    let mut bursts = Vec::with_capacity(addresses.bursts);
    for part in 0..addresses.bursts {
        let regs = transport
            .read_holding_registers(addresses.data, BURST_REG_QUAN)
            .await
            .inspect_err(|err| {
                log::error!("Failed reading unit {unit_id} part {part} at {:#06X} ({err})", addresses.data)
            })?;
        bursts.push(regs);
    }
    Ok(bursts)
}

/// Register addresses of one request / ready / data handshake.
#[derive(Debug, Clone, Copy)]
pub struct BurstAddresses {
    pub request: u16,
    pub ready: u16,
    pub data: u16,
    pub bursts: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Answers ready polls from a script and data reads with their address.
    #[derive(Default)]
    struct Scripted {
        ready: VecDeque<Result<Word>>,
        writes: Vec<(u16, Vec<Word>)>,
        reads: Vec<u16>,
    }

    #[async_trait]
    impl Transport for Scripted {
        async fn connect(&mut self) -> Result<()> {
            Ok(())
        }

        async fn read_holding_registers(&mut self, address: u16, count: u16) -> Result<Vec<Word>> {
            self.reads.push(address);
            if count == 1 {
                return self.ready.pop_front().unwrap_or(Ok(0)).map(|value| vec![value]);
            }
            Ok(vec![address; usize::from(count)])
        }

        async fn write_registers(&mut self, address: u16, values: &[Word]) -> Result<()> {
            self.writes.push((address, values.to_vec()));
            Ok(())
        }

        fn is_connected(&self) -> bool {
            true
        }

        fn close(&mut self) {}
    }

    const ADDRESSES: BurstAddresses = BurstAddresses {
        request: 0x0550,
        ready: 0x0551,
        data: 0x0558,
        bursts: 4,
    };

    #[test]
    fn config_defaults_test() {
        let config = TransportConfig::new("10.0.0.1:8080");
        assert_eq!(config.slave, 1);
        assert_eq!(config.framing, Framing::Rtu);
        assert_eq!(config.retries, 3);
        assert_eq!(config.retry_delay, Duration::from_millis(200));
        assert!(!ModbusTransport::new(config).is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn ready_test() {
        let mut transport = Scripted {
            ready: VecDeque::from([
                Ok(0),
                Err(Error::RetriesExhausted {
                    address: 0x0551,
                    attempts: 4,
                }),
                Ok(READY_RESPONSE),
            ]),
            ..Default::default()
        };
        let start = tokio::time::Instant::now();
        wait_for_ready(&mut transport, 0x0551, &HandshakeTiming::default())
            .await
            .unwrap();
        // a failed poll is not fatal
        assert_eq!(transport.reads.len(), 3);
        assert_eq!(start.elapsed(), Duration::from_millis(800));
    }

    #[tokio::test(start_paused = true)]
    async fn ready_timeout_test() {
        let mut transport = Scripted {
            ready: std::iter::repeat_with(|| Ok(0x0042)).take(30).collect(),
            ..Default::default()
        };
        let result = wait_for_ready(&mut transport, 0x05A1, &HandshakeTiming::default()).await;
        assert!(matches!(
            result,
            Err(Error::ReadyTimeout {
                address: 0x05A1,
                last: 0x0042
            })
        ));
        assert_eq!(transport.reads.len(), 25);
    }

    #[tokio::test(start_paused = true)]
    async fn request_bursts_test() {
        let mut transport = Scripted {
            ready: VecDeque::from([Ok(READY_RESPONSE)]),
            ..Default::default()
        };
        let bursts = request_bursts(&mut transport, 3, ADDRESSES, &HandshakeTiming::default())
            .await
            .unwrap();
        assert_eq!(transport.writes, vec![(0x0550, vec![3, PREPARE_COMMAND])]);
        assert_eq!(bursts.len(), 4);
        assert!(bursts
            .iter()
            .all(|burst| burst.len() == usize::from(BURST_REG_QUAN) && burst[0] == 0x0558));
    }

    /// Answer of the local device to one request.
    enum Reply {
        Registers,
        Exception(u8),
        /// Drops the connection without answering.
        Hangup,
    }

    /// Modbus TCP device on localhost. `reply(connection, request)` decides
    /// the answer, both indices count from 0.
    struct LocalDevice {
        address: String,
        connections: Arc<AtomicUsize>,
        requests: Arc<AtomicUsize>,
    }

    impl LocalDevice {
        async fn start(reply: fn(usize, usize) -> Reply) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let address = listener.local_addr().unwrap().to_string();
            let connections = Arc::new(AtomicUsize::new(0));
            let requests = Arc::new(AtomicUsize::new(0));
            let (accepted, handled) = (Arc::clone(&connections), Arc::clone(&requests));
            tokio::spawn(async move {
                while let Ok((mut stream, _)) = listener.accept().await {
                    let connection = accepted.fetch_add(1, Ordering::SeqCst);
                    let handled = Arc::clone(&handled);
                    tokio::spawn(async move {
                        let mut header = [0u8; 7];
                        while stream.read_exact(&mut header).await.is_ok() {
                            let len = usize::from(u16::from_be_bytes([header[4], header[5]]));
                            let mut pdu = vec![0u8; len - 1];
                            if stream.read_exact(&mut pdu).await.is_err() {
                                return;
                            }
                            let request = handled.fetch_add(1, Ordering::SeqCst);
                            let answer = match reply(connection, request) {
                                Reply::Registers => {
                                    let count = u16::from_be_bytes([pdu[3], pdu[4]]);
                                    let mut answer = vec![pdu[0], (count * 2) as u8];
                                    for word in 0..count {
                                        answer.extend_from_slice(&(0x0100 + word).to_be_bytes());
                                    }
                                    answer
                                }
                                Reply::Exception(code) => vec![pdu[0] | 0x80, code],
                                Reply::Hangup => return,
                            };
                            let mut frame = header[..4].to_vec();
                            frame.extend_from_slice(&(answer.len() as u16 + 1).to_be_bytes());
                            frame.push(header[6]);
                            frame.extend(answer);
                            if stream.write_all(&frame).await.is_err() {
                                return;
                            }
                        }
                    });
                }
            });
            Self {
                address,
                connections,
                requests,
            }
        }

        fn transport(&self) -> ModbusTransport {
            ModbusTransport::new(tcp_config(&self.address))
        }

        fn counts(&self) -> (usize, usize) {
            (
                self.connections.load(Ordering::SeqCst),
                self.requests.load(Ordering::SeqCst),
            )
        }
    }

    fn tcp_config(address: &str) -> TransportConfig {
        TransportConfig {
            framing: Framing::Tcp,
            io_timeout: Duration::from_secs(1),
            ..TransportConfig::new(address)
        }
    }

    #[tokio::test]
    async fn read_registers_test() {
        let device = LocalDevice::start(|_, _| Reply::Registers).await;
        let mut transport = device.transport();
        let regs = transport.read_holding_registers(0x0000, 3).await.unwrap();
        assert_eq!(regs, vec![0x0100, 0x0101, 0x0102]);
        assert!(transport.is_connected());
        assert_eq!(device.counts(), (1, 1));
    }

    #[tokio::test]
    async fn connect_refused_test() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let mut transport = ModbusTransport::new(tcp_config(&address));
        let start = tokio::time::Instant::now();
        assert!(matches!(
            transport.read_holding_registers(0x0000, 1).await,
            Err(Error::NotConnected { attempts: 3, .. })
        ));
        // two backoffs between three attempts
        assert!(start.elapsed() >= Duration::from_millis(400));
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn reconnect_after_hangup_test() {
        let device = LocalDevice::start(|connection, _| match connection {
            0 => Reply::Hangup,
            _ => Reply::Registers,
        })
        .await;
        let mut transport = device.transport();
        let regs = transport.read_holding_registers(0x0010, 2).await.unwrap();
        assert_eq!(regs, vec![0x0100, 0x0101]);
        assert_eq!(device.counts(), (2, 2));
    }

    #[tokio::test]
    async fn exception_retry_test() {
        let device = LocalDevice::start(|_, request| match request {
            0 => Reply::Exception(0x06),
            _ => Reply::Registers,
        })
        .await;
        let mut transport = device.transport();
        let regs = transport.read_holding_registers(0x0551, 1).await.unwrap();
        assert_eq!(regs, vec![0x0100]);
        // the connection survives an exception response
        assert_eq!(device.counts(), (1, 2));
    }

    #[tokio::test]
    async fn retries_exhausted_test() {
        let device = LocalDevice::start(|_, _| Reply::Exception(0x02)).await;
        let mut transport = ModbusTransport::new(TransportConfig {
            retries: 2,
            ..tcp_config(&device.address)
        });
        assert!(matches!(
            transport.read_holding_registers(0x0500, 1).await,
            Err(Error::RetriesExhausted {
                address: 0x0500,
                attempts: 3
            })
        ));
        assert_eq!(device.counts(), (1, 3));
    }

    #[tokio::test]
    async fn write_exception_test() {
        let device = LocalDevice::start(|_, _| Reply::Exception(0x02)).await;
        let mut transport = device.transport();
        assert!(matches!(
            transport.write_registers(0x0550, &[1, PREPARE_COMMAND]).await,
            Err(Error::Exception(tokio_modbus::ExceptionCode::IllegalDataAddress))
        ));
        assert!(transport.is_connected());
        assert_eq!(device.counts(), (1, 1));
    }
}
