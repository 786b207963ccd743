//! SLCAN (Lawicel) serial adapter link
//!
//! NOTE: Tested against Teensy and CANable style firmwares only. Frames are exchanged as
//! ASCII lines (`t7E48021001...\r`). Transmissions are not acknowledged synchronously, the
//! acknowledgements are read and dropped by [LinkDriver::poll_frame]

use std::{collections::VecDeque, fmt, io::Write, time::Duration, time::Instant};

use serialport::SerialPort;

use crate::{
    channel::{CAN_MAX_DLC, LinkDriver, LinkError, LinkMode, LinkResult, RawFrame},
    helpers::hex_nibble,
};

const MAX_LINE_SIZE: usize = 32;
const HEX: [u8; 16] = *b"0123456789ABCDEF";
const ACK_TIMEOUT: Duration = Duration::from_millis(1000);
const BELL: u8 = 0x07;

/// Default number of decoded frames buffered before the oldest is dropped
pub const DEFAULT_RX_QUEUE_LIMIT: usize = 256;

/// SLCAN adapter on a serial port
pub struct SlcanLink {
    port: Box<dyn SerialPort>,
    bitrate: u32,
    line: Vec<u8>,
    rx_queue: VecDeque<RawFrame>,
    rx_queue_limit: usize,
    mode: LinkMode,
}

impl fmt::Debug for SlcanLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SlcanLink {} @ {} bps",
            self.port.name().unwrap_or_default(),
            self.bitrate
        )
    }
}

impl SlcanLink {
    /// Wraps an already opened serial port
    ///
    /// ## Parameters
    /// * port - Serial port of the adapter
    /// * bitrate - CAN bus bitrate, e.g. 500_000
    pub fn new(port: Box<dyn SerialPort>, bitrate: u32) -> Self {
        Self {
            port,
            bitrate,
            line: Vec::with_capacity(MAX_LINE_SIZE),
            rx_queue: VecDeque::new(),
            rx_queue_limit: DEFAULT_RX_QUEUE_LIMIT,
            mode: LinkMode::Sleep,
        }
    }

    /// Opens the serial port at `path`
    pub fn open_port(path: &str, baud: u32, bitrate: u32) -> LinkResult<Self> {
        let port = serialport::new(path, baud)
            .timeout(Duration::from_millis(10))
            .open()
            .map_err(|e| LinkError::InitFailed(format!("cannot open {path}: {e}")))?;
        Ok(Self::new(port, bitrate))
    }

    /// Number of decoded frames buffered before the oldest is dropped
    pub fn with_rx_queue_limit(mut self, limit: usize) -> Self {
        self.rx_queue_limit = limit;
        self
    }

    // Reads whatever the adapter has sent so far without blocking
    fn pump(&mut self) -> LinkResult<Option<Line>> {
        let available = self.port.bytes_to_read().map_err(io_error)? as usize;
        if available == 0 {
            return Ok(None);
        }
        let mut buf = vec![0u8; available];
        let read = std::io::Read::read(&mut self.port, &mut buf)?;
        let mut last = None;
        for b in &buf[..read] {
            if let Some(line) = self.feed(*b) {
                match line {
                    Line::Frame(f) => self.queue_frame(f),
                    Line::Invalid => log::debug!("Ignoring unknown SLCAN line"),
                    ack => last = Some(ack),
                }
            }
        }
        Ok(last)
    }

    fn feed(&mut self, byte: u8) -> Option<Line> {
        match byte {
            b'\r' => {
                let line = decode_line(&self.line);
                self.line.clear();
                Some(line)
            }
            BELL => {
                self.line.clear();
                Some(Line::Nack)
            }
            _ if self.line.len() == MAX_LINE_SIZE => {
                log::warn!("SLCAN line too long, dropping it");
                self.line.clear();
                None
            }
            _ => {
                self.line.push(byte);
                None
            }
        }
    }

    fn queue_frame(&mut self, f: RawFrame) {
        if self.rx_queue.len() >= self.rx_queue_limit {
            log::warn!("SLCAN receive queue full, dropping oldest frame");
            self.rx_queue.pop_front();
        }
        self.rx_queue.push_back(f);
    }

    fn command_with_ack(&mut self, cmd: &[u8]) -> LinkResult<()> {
        self.port.write_all(cmd)?;
        let start = Instant::now();
        while start.elapsed() <= ACK_TIMEOUT {
            match self.pump()? {
                Some(Line::Ack) => return Ok(()),
                Some(Line::Nack) => return Err(LinkError::NotAcknowledged),
                _ => std::thread::sleep(Duration::from_millis(1)),
            }
        }
        Err(LinkError::InitFailed("SLCAN adapter did not acknowledge".into()))
    }

    fn open_channel(&mut self) -> LinkResult<()> {
        let speed = speed_command(self.bitrate)?;
        // Close first, the adapter refuses to change speed while open
        let _ = self.command_with_ack(b"C\r");
        self.command_with_ack(&speed)?;
        self.command_with_ack(b"O\r")?;
        self.mode = LinkMode::Normal;
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Line {
    Ack,
    Nack,
    Frame(RawFrame),
    Invalid,
}

fn io_error(e: serialport::Error) -> LinkError {
    LinkError::Other(e.to_string())
}

fn speed_command(bitrate: u32) -> LinkResult<[u8; 3]> {
    match bitrate {
        10_000 => Ok(*b"S0\r"),
        20_000 => Ok(*b"S1\r"),
        50_000 => Ok(*b"S2\r"),
        100_000 => Ok(*b"S3\r"),
        125_000 => Ok(*b"S4\r"),
        250_000 => Ok(*b"S5\r"),
        500_000 => Ok(*b"S6\r"),
        800_000 => Ok(*b"S7\r"),
        1_000_000 => Ok(*b"S8\r"),
        _ => Err(LinkError::UnsupportedRequest),
    }
}

fn parse_hex(digits: &[u8]) -> Option<u32> {
    digits
        .iter()
        .try_fold(0u32, |acc, d| Some(acc << 4 | u32::from(hex_nibble(*d)?)))
}

fn decode_line(line: &[u8]) -> Line {
    let (id_len, extended) = match line.first() {
        None => return Line::Ack,
        // Acknowledgement of a transmitted frame
        Some(b'z' | b'Z') if line.len() == 1 => return Line::Ack,
        Some(b't') => (3, false),
        Some(b'T') => (8, true),
        Some(_) => return Line::Invalid,
    };
    let Some(id) = line.get(1..1 + id_len).and_then(parse_hex) else {
        return Line::Invalid;
    };
    let Some(dlc) = line.get(1 + id_len).and_then(|d| hex_nibble(*d)) else {
        return Line::Invalid;
    };
    let dlc = dlc as usize;
    let start = 2 + id_len;
    if dlc > CAN_MAX_DLC || line.len() < start + dlc * 2 {
        return Line::Invalid;
    }
    let mut data = [0u8; CAN_MAX_DLC];
    for (i, b) in data.iter_mut().enumerate().take(dlc) {
        match parse_hex(&line[start + i * 2..start + i * 2 + 2]) {
            Some(v) => *b = v as u8,
            None => return Line::Invalid,
        }
    }
    Line::Frame(RawFrame::new(id, &data[..dlc], extended))
}

fn encode_frame(id: u32, extended: bool, data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(27);
    if extended {
        buf.push(b'T');
        for b in id.to_be_bytes() {
            buf.push(HEX[b as usize >> 4]);
            buf.push(HEX[b as usize & 0xF]);
        }
    } else {
        buf.push(b't');
        let id = id & 0x7FF;
        buf.push(HEX[id as usize >> 8]);
        buf.push(HEX[(id as usize >> 4) & 0xF]);
        buf.push(HEX[id as usize & 0xF]);
    }
    buf.push(HEX[data.len() & 0xF]);
    for d in data {
        buf.push(HEX[*d as usize >> 4]);
        buf.push(HEX[*d as usize & 0xF]);
    }
    buf.push(b'\r');
    buf
}

impl LinkDriver for SlcanLink {
    fn open(&mut self) -> LinkResult<()> {
        self.rx_queue.clear();
        self.line.clear();
        self.open_channel()
    }

    fn close(&mut self) -> LinkResult<()> {
        self.mode = LinkMode::Sleep;
        self.command_with_ack(b"C\r")
    }

    fn send_frame(&mut self, id: u32, extended: bool, data: [u8; 8]) -> LinkResult<()> {
        if self.mode == LinkMode::Sleep {
            return Err(LinkError::NotOpen);
        }
        self.port.write_all(&encode_frame(id, extended, &data))?;
        Ok(())
    }

    fn poll_frame(&mut self) -> Option<RawFrame> {
        if self.rx_queue.is_empty() {
            match self.pump() {
                Ok(Some(Line::Nack)) => log::warn!("SLCAN adapter rejected a frame"),
                Ok(_) => {}
                Err(e) => log::warn!("SLCAN read failed: {e}"),
            }
        }
        self.rx_queue.pop_front()
    }

    fn set_mode(&mut self, mode: LinkMode) -> LinkResult<()> {
        match mode {
            LinkMode::Normal if self.mode != LinkMode::Normal => self.open_channel(),
            LinkMode::Sleep if self.mode != LinkMode::Sleep => self.close(),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_frame() {
        assert_eq!(
            b"t7E480221010000000000\r".to_vec(),
            encode_frame(0x7E4, false, &[0x02, 0x21, 0x01, 0, 0, 0, 0, 0])
        );
        assert_eq!(
            b"T18DADAF1203221\r".to_vec(),
            encode_frame(0x18DADAF1, true, &[0x32, 0x21])
        );
    }

    #[test]
    fn test_decode_line() {
        assert_eq!(
            Line::Frame(RawFrame::new(0x7EC, &[0x03, 0x61, 0x01, 0xAA], false)),
            decode_line(b"t7EC4036101AA")
        );
        assert_eq!(
            Line::Frame(RawFrame::new(0x18DAF1DA, &[0x02, 0x62], true)),
            decode_line(b"T18DAF1DA20262")
        );
        assert_eq!(Line::Ack, decode_line(b""));
        assert_eq!(Line::Ack, decode_line(b"z"));
        assert_eq!(Line::Invalid, decode_line(b"t7EC9"));
        assert_eq!(Line::Invalid, decode_line(b"t7EC40361"));
        assert_eq!(Line::Invalid, decode_line(b"t7XC1AA"));
        assert_eq!(Line::Invalid, decode_line(b"V1013"));
    }

    #[test]
    fn test_speed_command() {
        assert_eq!(*b"S6\r", speed_command(500_000).unwrap());
        assert!(speed_command(33_333).is_err());
    }
}
