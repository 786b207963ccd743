//! SocketCAN link (Linux only)
//!
//! Uses a raw, non blocking CAN socket. The engine does its own ISO-TP handling, so the
//! kernel ISO-TP sockets are not used.

use socketcan::{CanFrame, CanSocket, EmbeddedFrame, ExtendedId, Frame, Socket, StandardId};

use crate::channel::{
    CAN_MAX_STANDARD_ID, LinkDriver, LinkError, LinkMode, LinkResult, RawFrame,
};

/// SocketCAN interface such as `can0` or `vcan0`
#[derive(Debug)]
pub struct SocketCanLink {
    iface: String,
    socket: Option<CanSocket>,
    mode: LinkMode,
}

impl SocketCanLink {
    /// Creates a closed link for interface `iface`
    pub fn new(iface: &str) -> Self {
        Self {
            iface: iface.to_string(),
            socket: None,
            mode: LinkMode::Sleep,
        }
    }

    /// Name of the interface
    pub fn iface(&self) -> &str {
        &self.iface
    }

    /// True if the interface exists on this machine
    pub fn is_present(&self) -> bool {
        std::path::Path::new(&format!("/sys/class/net/{}", self.iface)).exists()
    }
}

fn build_frame(id: u32, extended: bool, data: &[u8]) -> LinkResult<CanFrame> {
    let frame = if extended {
        ExtendedId::new(id).and_then(|id| CanFrame::new(id, data))
    } else {
        u16::try_from(id)
            .ok()
            .filter(|id| u32::from(*id) <= CAN_MAX_STANDARD_ID)
            .and_then(StandardId::new)
            .and_then(|id| CanFrame::new(id, data))
    };
    frame.ok_or(LinkError::InvalidId(id))
}

impl LinkDriver for SocketCanLink {
    fn open(&mut self) -> LinkResult<()> {
        let socket = CanSocket::open(&self.iface)
            .map_err(|e| LinkError::InitFailed(format!("cannot open {}: {e}", self.iface)))?;
        socket.set_nonblocking(true)?;
        log::info!("Opened SocketCAN interface {}", self.iface);
        self.socket = Some(socket);
        self.mode = LinkMode::Normal;
        Ok(())
    }

    fn close(&mut self) -> LinkResult<()> {
        self.socket = None;
        self.mode = LinkMode::Sleep;
        Ok(())
    }

    fn send_frame(&mut self, id: u32, extended: bool, data: [u8; 8]) -> LinkResult<()> {
        if self.mode == LinkMode::Sleep {
            return Err(LinkError::NotOpen);
        }
        let socket = self.socket.as_ref().ok_or(LinkError::NotOpen)?;
        let frame = build_frame(id, extended, &data)?;
        socket.write_frame(&frame).map_err(|e| {
            if e.kind() == std::io::ErrorKind::WouldBlock {
                LinkError::BufferFull
            } else {
                e.into()
            }
        })
    }

    fn poll_frame(&mut self) -> Option<RawFrame> {
        let socket = self.socket.as_ref()?;
        loop {
            match socket.read_frame() {
                Ok(CanFrame::Data(f)) => {
                    return Some(RawFrame::new(f.raw_id(), f.data(), f.is_extended()));
                }
                // Remote and error frames carry no response data
                Ok(_) => continue,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return None,
                Err(e) => {
                    log::warn!("SocketCAN read on {} failed: {e}", self.iface);
                    return None;
                }
            }
        }
    }

    fn set_mode(&mut self, mode: LinkMode) -> LinkResult<()> {
        if self.socket.is_none() && mode == LinkMode::Normal {
            return self.open();
        }
        // The kernel owns the controller, sleeping just silences this side
        self.mode = mode;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_frame() {
        let f = build_frame(0x7E4, false, &[0x02, 0x21, 0x01]).unwrap();
        assert_eq!(0x7E4, f.raw_id());
        assert!(!f.is_extended());
        let f = build_frame(0x18DADAF1, true, &[0x02, 0x21, 0x01]).unwrap();
        assert!(f.is_extended());
        assert!(matches!(
            build_frame(0x800, false, &[0x00]),
            Err(LinkError::InvalidId(0x800))
        ));
    }

    #[test]
    fn test_closed_link() {
        let mut link = SocketCanLink::new("vcan-missing");
        assert!(link.poll_frame().is_none());
        assert!(matches!(
            link.send_frame(0x7E4, false, [0; 8]),
            Err(LinkError::NotOpen)
        ));
    }
}
