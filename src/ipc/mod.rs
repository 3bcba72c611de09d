//! C6: best-effort telemetry export over a UNIX datagram socket.

use std::io;
use std::os::unix::net::UnixDatagram;
use std::path::Path;

use crate::telemetry::TelemetrySample;

/// Fixed little-endian wire layout, 68 bytes, one datagram per sample.
/// Chosen over a serde-based encoding so external ML
/// consumers can memory-map the socket's datagrams without pulling in a
/// Rust deserializer.
const WIRE_SIZE: usize = 68;

fn encode(sample: &TelemetrySample) -> [u8; WIRE_SIZE] {
    let mut buf = [0u8; WIRE_SIZE];
    buf[0..8].copy_from_slice(&sample.timestamp_ns.to_le_bytes());
    buf[8..16].copy_from_slice(&sample.cache_references.to_le_bytes());
    buf[16..24].copy_from_slice(&sample.cache_misses.to_le_bytes());
    buf[24..32].copy_from_slice(&sample.branch_instructions.to_le_bytes());
    buf[32..40].copy_from_slice(&sample.branch_misses.to_le_bytes());
    buf[40..48].copy_from_slice(&sample.cycles.to_le_bytes());
    buf[48..56].copy_from_slice(&sample.instructions.to_le_bytes());
    buf[56..60].copy_from_slice(&(sample.cache_miss_rate as f32).to_le_bytes());
    buf[60..64].copy_from_slice(&(sample.branch_miss_rate as f32).to_le_bytes());
    buf[64..68].copy_from_slice(&(sample.ipc as f32).to_le_bytes());
    buf
}

/// C6: a non-blocking datagram client. Absent or slow readers never stall
/// the caller: a full kernel send buffer or no listener at all is a
/// silent drop, matching the "best-effort, telemetry-only" framing of
/// the ML export path.
pub struct IpcPublisher {
    socket: Option<UnixDatagram>,
    logged_error: bool,
}

impl IpcPublisher {
    /// Connects to `path`. A missing or refused socket at startup is not
    /// fatal: the publisher just carries no live socket and every `send`
    /// becomes a no-op until a future reconnect.
    pub fn connect(path: &Path) -> Self {
        let socket = UnixDatagram::unbound()
            .and_then(|s| {
                s.set_nonblocking(true)?;
                s.connect(path)?;
                Ok(s)
            })
            .map_err(|e| {
                log::warn!("IPC publisher could not connect to {}: {e}", path.display());
                e
            })
            .ok();
        Self {
            socket,
            logged_error: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.socket.is_some()
    }

    /// Sends one sample. `WouldBlock` (send buffer full) and
    /// `ConnectionRefused`/`NotFound` (no listener) are expected steady
    /// states and are dropped silently; anything else is logged once per
    /// publisher lifetime to avoid flooding the log on a persistent
    /// failure.
    pub fn send(&mut self, sample: &TelemetrySample) {
        let Some(socket) = &self.socket else {
            return;
        };
        let wire = encode(sample);
        match socket.send(&wire) {
            Ok(_) => {}
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::ConnectionRefused
                        | io::ErrorKind::NotFound
                ) => {}
            Err(e) => {
                if !self.logged_error {
                    log::warn!("IPC publisher send failed: {e}");
                    self.logged_error = true;
                }
            }
        }
    }

    pub fn close(&mut self) {
        self.socket = None;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_layout_matches_wire_spec() {
        let sample = TelemetrySample {
            timestamp_ns: 1,
            cycles: 2,
            instructions: 3,
            cache_misses: 4,
            branch_misses: 5,
            branch_instructions: 6,
            cache_references: 7,
            cache_miss_rate: 0.5,
            branch_miss_rate: 0.25,
            ipc: 1.5,
        };
        let wire = encode(&sample);
        assert_eq!(wire.len(), WIRE_SIZE);
        assert_eq!(u64::from_le_bytes(wire[0..8].try_into().unwrap()), 1);
        assert_eq!(u64::from_le_bytes(wire[8..16].try_into().unwrap()), 7);
        assert_eq!(u64::from_le_bytes(wire[16..24].try_into().unwrap()), 4);
        assert_eq!(u64::from_le_bytes(wire[24..32].try_into().unwrap()), 6);
        assert_eq!(u64::from_le_bytes(wire[32..40].try_into().unwrap()), 5);
        assert_eq!(u64::from_le_bytes(wire[40..48].try_into().unwrap()), 2);
        assert_eq!(u64::from_le_bytes(wire[48..56].try_into().unwrap()), 3);
        assert_eq!(f32::from_le_bytes(wire[56..60].try_into().unwrap()), 0.5);
        assert_eq!(f32::from_le_bytes(wire[60..64].try_into().unwrap()), 0.25);
        assert_eq!(f32::from_le_bytes(wire[64..68].try_into().unwrap()), 1.5);
    }

    #[test]
    fn connect_to_missing_socket_is_not_connected_but_does_not_panic() {
        let publisher = IpcPublisher::connect(Path::new("/nonexistent/cacheguard.sock"));
        assert!(!publisher.is_connected());
    }

    #[test]
    fn send_on_disconnected_publisher_is_a_noop() {
        let mut publisher = IpcPublisher::connect(Path::new("/nonexistent/cacheguard.sock"));
        let sample = TelemetrySample::default();
        publisher.send(&sample); // must not panic
    }
}
