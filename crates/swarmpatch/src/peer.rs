//! Local peer identity
//!
//! A device's peer id must survive reinstalls and reboots, so it is derived
//! from hardware: the board serial number on Raspberry-Pi-class devices,
//! otherwise the MAC address of the first active interface. Uniqueness is an
//! operator assumption — two devices presenting the same id look like a
//! single peer taking itself over on the server.

use crate::error::{Result, SwarmpatchError};
use std::fs;
use std::path::Path;
use swarmpatch_wire::PeerId;
use sysinfo::Networks;
use tracing::debug;

/// Derive the peer id of the local machine.
pub fn local_peer_id() -> Result<PeerId> {
    match serial_peer_id("/proc/cpuinfo") {
        Ok(id) => return Ok(id),
        Err(e) => debug!("no board serial available: {e}"),
    }
    match mac_peer_id() {
        Ok(id) => return Ok(id),
        Err(e) => debug!("no usable interface MAC: {e}"),
    }
    Err(SwarmpatchError::AgentRuntime(
        "neither CPU serial nor an active interface MAC is available".to_string(),
    ))
}

/// Read the board serial from a cpuinfo-formatted file.
///
/// The `Serial` line carries a hex value padded with leading zeros
/// (`Serial          : 00000000deadbeef`); the significant bytes are
/// right-aligned into the 6-byte id, matching how the fleet tooling has
/// always printed them.
pub fn serial_peer_id(cpuinfo_path: impl AsRef<Path>) -> Result<PeerId> {
    let content = fs::read_to_string(cpuinfo_path.as_ref()).map_err(|e| {
        SwarmpatchError::AgentRuntime(format!(
            "cannot read {}: {e}",
            cpuinfo_path.as_ref().display()
        ))
    })?;

    for line in content.lines() {
        if !line.starts_with("Serial") {
            continue;
        }
        let value = match line.split(':').nth(1) {
            Some(v) => v.trim().trim_start_matches('0'),
            None => continue,
        };
        if value.is_empty() {
            continue;
        }
        let padded = if value.len() % 2 == 1 {
            format!("0{value}")
        } else {
            value.to_string()
        };
        let raw = hex::decode(&padded).map_err(|e| {
            SwarmpatchError::AgentRuntime(format!("serial '{value}' is not hex: {e}"))
        })?;

        let mut id = [0u8; PeerId::LEN];
        let take = raw.len().min(PeerId::LEN);
        id[PeerId::LEN - take..].copy_from_slice(&raw[raw.len() - take..]);
        return Ok(PeerId(id));
    }

    Err(SwarmpatchError::AgentRuntime(
        "no Serial line in cpuinfo".to_string(),
    ))
}

/// Peer id from the first active interface's hardware address.
fn mac_peer_id() -> Result<PeerId> {
    let networks = Networks::new_with_refreshed_list();
    let mut interfaces: Vec<_> = networks.iter().collect();
    // deterministic pick across restarts
    interfaces.sort_by(|(a, _), (b, _)| a.cmp(b));

    for (name, data) in interfaces {
        if name.as_str() == "lo" {
            continue;
        }
        let mac = data.mac_address();
        if mac.0 == [0u8; 6] {
            continue;
        }
        debug!("deriving peer id from interface {name} ({mac})");
        return Ok(PeerId(mac.0));
    }

    Err(SwarmpatchError::AgentRuntime(
        "no active interface with a hardware address".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn cpuinfo(serial_line: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "processor\t: 0").unwrap();
        writeln!(file, "model name\t: ARMv7 Processor rev 4 (v7l)").unwrap();
        writeln!(file, "{serial_line}").unwrap();
        file
    }

    #[test]
    fn serial_is_right_aligned() {
        let file = cpuinfo("Serial\t\t: 00000000deadbeef");
        let id = serial_peer_id(file.path()).unwrap();
        assert_eq!(id.to_string(), "0000deadbeef");
    }

    #[test]
    fn serial_with_odd_digit_count_is_padded() {
        let file = cpuinfo("Serial\t\t: 00000000000abc12");
        let id = serial_peer_id(file.path()).unwrap();
        assert_eq!(id.to_string(), "0000000abc12");
    }

    #[test]
    fn long_serial_keeps_low_bytes() {
        let file = cpuinfo("Serial\t\t: 1122334455667788");
        let id = serial_peer_id(file.path()).unwrap();
        assert_eq!(id.to_string(), "334455667788");
    }

    #[test]
    fn missing_serial_is_an_error() {
        let file = cpuinfo("Hardware\t: BCM2835");
        assert!(serial_peer_id(file.path()).is_err());
    }

    #[test]
    fn all_zero_serial_is_an_error() {
        let file = cpuinfo("Serial\t\t: 0000000000000000");
        assert!(serial_peer_id(file.path()).is_err());
    }
}
