//! SCSI INQUIRY probe
//!
//! Issues a standard INQUIRY against a device and extracts the vendor and
//! product identification fields (SPC-4 standard INQUIRY data).

use crate::error::{BridgeError, BridgeResult};
use crate::passthrough::{PassthroughCommand, ScsiPassthrough};
use crate::srb::DataDirection;
use std::fmt;
use std::time::Duration;

/// INQUIRY allocation length used by the probe
pub const INQUIRY_LEN: usize = 96;

/// INQUIRY, standard data, allocation length 96
pub const INQUIRY_CDB: [u8; 6] = [0x12, 0, 0, 0, INQUIRY_LEN as u8, 0];

/// T10 vendor identification: bytes 8..16
pub const VENDOR_OFFSET: usize = 8;
pub const VENDOR_LEN: usize = 8;

/// Product identification: bytes 16..32
pub const PRODUCT_OFFSET: usize = 16;
pub const PRODUCT_LEN: usize = 16;

/// Vendor/product identity of a probed device
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DeviceIdentity {
    pub vendor: String,
    pub product: String,
}

impl DeviceIdentity {
    pub fn new(vendor: &str, product: &str) -> Self {
        DeviceIdentity {
            vendor: vendor.to_string(),
            product: product.to_string(),
        }
    }

    /// Parse the identity out of standard INQUIRY data
    pub fn from_inquiry(data: &[u8]) -> BridgeResult<Self> {
        if data.len() < PRODUCT_OFFSET + PRODUCT_LEN {
            return Err(BridgeError::Probe(format!(
                "INQUIRY data too short: {} bytes",
                data.len()
            )));
        }

        Ok(DeviceIdentity {
            vendor: ascii_field(&data[VENDOR_OFFSET..VENDOR_OFFSET + VENDOR_LEN]),
            product: ascii_field(&data[PRODUCT_OFFSET..PRODUCT_OFFSET + PRODUCT_LEN]),
        })
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Vendor='{}' Product='{}'", self.vendor, self.product)
    }
}

/// Space-padded ASCII field, right-trimmed
fn ascii_field(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches([' ', '\0'])
        .to_string()
}

/// Send INQUIRY to `device` and return its identity
pub fn probe<D: ScsiPassthrough + ?Sized>(
    device: &mut D,
    timeout: Duration,
) -> BridgeResult<DeviceIdentity> {
    let mut data = [0u8; INQUIRY_LEN];
    let mut sense = [0u8; 32];

    let mut cmd = PassthroughCommand {
        cdb: &INQUIRY_CDB,
        direction: DataDirection::In,
        data: &mut data,
        sense: &mut sense,
        timeout,
    };

    let result = device.execute(&mut cmd)?;
    if result.status != 0 {
        return Err(BridgeError::Probe(format!(
            "INQUIRY returned SCSI status 0x{:02x}",
            result.status
        )));
    }

    DeviceIdentity::from_inquiry(&data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::passthrough::PassthroughResult;
    use std::io;

    fn inquiry_data(vendor: &[u8; 8], product: &[u8; 16]) -> Vec<u8> {
        let mut data = vec![0u8; INQUIRY_LEN];
        data[0] = 0x03; // Processor device
        data[4] = 31;
        data[8..16].copy_from_slice(vendor);
        data[16..32].copy_from_slice(product);
        data[32..36].copy_from_slice(b"1.0 ");
        data
    }

    struct InquiryDevice {
        response: Vec<u8>,
        status: u8,
        seen_cdb: Vec<u8>,
    }

    impl ScsiPassthrough for InquiryDevice {
        fn execute(&mut self, cmd: &mut PassthroughCommand<'_>) -> io::Result<PassthroughResult> {
            self.seen_cdb = cmd.cdb.to_vec();
            let n = self.response.len().min(cmd.data.len());
            cmd.data[..n].copy_from_slice(&self.response[..n]);
            Ok(PassthroughResult {
                status: self.status,
                ..Default::default()
            })
        }
    }

    #[test]
    fn test_from_inquiry_trims_padding() {
        let data = inquiry_data(b"JEOL    ", b"SEM             ");
        let identity = DeviceIdentity::from_inquiry(&data).unwrap();
        assert_eq!(identity, DeviceIdentity::new("JEOL", "SEM"));
    }

    #[test]
    fn test_from_inquiry_keeps_inner_spaces() {
        let data = inquiry_data(b"ACME CO ", b"Scan Unit 2\0\0\0\0\0");
        let identity = DeviceIdentity::from_inquiry(&data).unwrap();
        assert_eq!(identity.vendor, "ACME CO");
        assert_eq!(identity.product, "Scan Unit 2");
    }

    #[test]
    fn test_from_inquiry_short_data() {
        assert!(matches!(
            DeviceIdentity::from_inquiry(&[0u8; 20]),
            Err(BridgeError::Probe(_))
        ));
    }

    #[test]
    fn test_probe_sends_inquiry() {
        let mut device = InquiryDevice {
            response: inquiry_data(b"SEAGATE ", b"ST1000DM003     "),
            status: 0,
            seen_cdb: Vec::new(),
        };
        let identity = probe(&mut device, Duration::from_secs(2)).unwrap();
        assert_eq!(device.seen_cdb, INQUIRY_CDB.to_vec());
        assert_eq!(identity.to_string(), "Vendor='SEAGATE' Product='ST1000DM003'");
    }

    #[test]
    fn test_probe_check_condition_fails() {
        let mut device = InquiryDevice {
            response: Vec::new(),
            status: 0x02,
            seen_cdb: Vec::new(),
        };
        assert!(matches!(
            probe(&mut device, Duration::from_secs(2)),
            Err(BridgeError::Probe(_))
        ));
    }
}
