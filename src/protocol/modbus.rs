//! Modbus TCP client.
//!
//! Blocking MBAP framing over `std::net::TcpStream`. The socket is dropped on
//! any I/O failure or framing desync; the supervisor reconnects it.

use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use crate::catalog::Tag;
use crate::core::{Clock, SystemClock, Timezone};
use crate::protocol::registers::{
    read_table, Endianness, ReadError, RegisterKind, RegisterReader, RegisterRow,
};
use crate::protocol::{CollectError, CollectResult, Device, Reading, Readings};

const MBAP_HEADER_LEN: usize = 7;
const PROTOCOL_ID: u16 = 0;

#[derive(Debug, Clone)]
pub struct ModbusConfig {
    /// `host:port` of the server.
    pub address: String,
    pub connect_timeout: Duration,
    pub io_timeout: Duration,
    pub endianness: Endianness,
}

impl ModbusConfig {
    pub fn tcp(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connect_timeout: Duration::from_secs(5),
            io_timeout: Duration::from_secs(3),
            endianness: Endianness::default(),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    pub fn with_endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = endianness;
        self
    }
}

pub struct ModbusDevice {
    config: ModbusConfig,
    stream: Option<TcpStream>,
    transaction_id: u16,
    clock: Arc<dyn Clock>,
}

impl ModbusDevice {
    pub fn new(config: ModbusConfig) -> Self {
        Self {
            config,
            stream: None,
            transaction_id: 0,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &ModbusConfig {
        &self.config
    }

    fn open(&self) -> std::io::Result<TcpStream> {
        let mut last_err = None;
        for addr in self.config.address.to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.config.connect_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.config.io_timeout))?;
                    stream.set_write_timeout(Some(self.config.io_timeout))?;
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} did not resolve", self.config.address),
            )
        }))
    }

    fn next_transaction(&mut self) -> u16 {
        self.transaction_id = self.transaction_id.wrapping_add(1);
        self.transaction_id
    }
}

impl RegisterReader for ModbusDevice {
    fn read(
        &mut self,
        unit_id: u8,
        kind: RegisterKind,
        start: u16,
        count: u16,
    ) -> Result<Vec<u16>, ReadError> {
        let transaction = self.next_transaction();
        let function = kind.function_code();
        let request = encode_read_request(transaction, unit_id, function, start, count);

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| ReadError::Connection("not connected".to_string()))?;
        let result = exchange(stream, &request).and_then(|(header, pdu)| {
            parse_read_response(transaction, function, count, &header, &pdu)
        });
        if let Err(ReadError::Connection(_)) = &result {
            self.stream = None;
        }
        result
    }
}

fn exchange(stream: &mut TcpStream, request: &[u8]) -> Result<([u8; MBAP_HEADER_LEN], Vec<u8>), ReadError> {
    let io = |err: std::io::Error| ReadError::Connection(err.to_string());
    stream.write_all(request).map_err(io)?;
    let mut header = [0u8; MBAP_HEADER_LEN];
    stream.read_exact(&mut header).map_err(io)?;
    let length = u16::from_be_bytes([header[4], header[5]]) as usize;
    if length < 2 {
        return Err(ReadError::Connection(format!("invalid MBAP length {length}")));
    }
    let mut pdu = vec![0u8; length - 1];
    stream.read_exact(&mut pdu).map_err(io)?;
    Ok((header, pdu))
}

pub(crate) fn encode_read_request(
    transaction: u16,
    unit_id: u8,
    function: u8,
    start: u16,
    count: u16,
) -> [u8; 12] {
    let t = transaction.to_be_bytes();
    let s = start.to_be_bytes();
    let c = count.to_be_bytes();
    let p = PROTOCOL_ID.to_be_bytes();
    [t[0], t[1], p[0], p[1], 0, 6, unit_id, function, s[0], s[1], c[0], c[1]]
}

/// Validate an MBAP response and return its registers.
///
/// Framing mismatches desync the stream and count as connection failures;
/// exceptions and short payloads only reject the chunk.
pub(crate) fn parse_read_response(
    transaction: u16,
    function: u8,
    count: u16,
    header: &[u8; MBAP_HEADER_LEN],
    pdu: &[u8],
) -> Result<Vec<u16>, ReadError> {
    let got_transaction = u16::from_be_bytes([header[0], header[1]]);
    let got_protocol = u16::from_be_bytes([header[2], header[3]]);
    if got_transaction != transaction || got_protocol != PROTOCOL_ID {
        return Err(ReadError::Connection(format!(
            "unexpected frame: transaction {got_transaction} (expected {transaction}), protocol {got_protocol}"
        )));
    }
    let code = pdu
        .first()
        .copied()
        .ok_or_else(|| ReadError::Rejected("empty pdu".to_string()))?;
    if code == function | 0x80 {
        let exception = pdu.get(1).copied().unwrap_or(0);
        return Err(ReadError::Rejected(format!(
            "exception 0x{exception:02x} ({})",
            exception_name(exception)
        )));
    }
    if code != function {
        return Err(ReadError::Rejected(format!(
            "function 0x{code:02x} in reply to 0x{function:02x}"
        )));
    }
    let byte_count = pdu.get(1).copied().unwrap_or(0) as usize;
    let data = &pdu[2.min(pdu.len())..];
    if byte_count != count as usize * 2 || data.len() != byte_count {
        return Err(ReadError::Rejected(format!(
            "short payload: {} bytes for {count} registers",
            data.len()
        )));
    }
    Ok(data
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect())
}

fn exception_name(code: u8) -> &'static str {
    match code {
        0x01 => "illegal function",
        0x02 => "illegal data address",
        0x03 => "illegal data value",
        0x04 => "server device failure",
        0x06 => "server device busy",
        0x0A => "gateway path unavailable",
        0x0B => "gateway target failed to respond",
        _ => "unknown",
    }
}

impl Device for ModbusDevice {
    fn protocol(&self) -> &'static str {
        "modbus"
    }

    fn connect(&mut self) -> bool {
        self.stream = None;
        match self.open() {
            Ok(stream) => {
                self.stream = Some(stream);
                true
            }
            Err(err) => {
                log::debug!("modbus connect to {} failed: {err}", self.config.address);
                false
            }
        }
    }

    fn collect(&mut self, timezone: Timezone, tags: &[Tag]) -> CollectResult {
        if self.stream.is_none() {
            return Err(CollectError::Connection(format!(
                "{} not connected",
                self.config.address
            )));
        }

        let rows: Vec<RegisterRow> = tags
            .iter()
            .enumerate()
            .filter_map(|(idx, tag)| {
                let row = tag.register_row(idx);
                if row.is_none() {
                    log::warn!("tag {} has no modbus address, skipped", tag.name);
                }
                row
            })
            .collect();

        let endianness = self.config.endianness;
        let readout = read_table(self, &rows, endianness).map_err(|err| match err {
            ReadError::Connection(msg) => CollectError::Connection(msg),
            ReadError::Rejected(msg) => CollectError::Decode(msg),
        })?;

        let timestamp_ns = self.clock.now_ns();
        let mut readings = Readings::new();
        let mut first_failure = None;
        for (idx, result) in readout.values {
            let tag = &tags[idx];
            let decoded = result.and_then(|value| {
                value.coerce(tag.datatype).ok_or_else(|| {
                    crate::core::Error::Decode(format!("{value} is not a valid {}", tag.datatype))
                })
            });
            match decoded {
                Ok(value) => {
                    readings.insert(
                        tag.name.clone(),
                        Reading {
                            value,
                            timestamp_ns,
                            timezone,
                        },
                    );
                }
                Err(err) => {
                    log::warn!("{}: dropped {}: {err}", self.config.address, tag.name);
                    first_failure.get_or_insert_with(|| format!("{}: {err}", tag.name));
                }
            }
        }

        match first_failure {
            Some(detail) if readings.is_empty() => Err(CollectError::Decode(detail)),
            _ => Ok(readings),
        }
    }
}
