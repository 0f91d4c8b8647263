//! Generic-SCSI device discovery
//!
//! Walks a bounded range of candidate nodes, probes each with INQUIRY and
//! keeps the first one whose identity the matcher accepts. When the scan
//! finds nothing, a configured override path is opened without probing.
//! Discovery runs once; an unplugged device is not looked for again.

use crate::config::DiscoveryConfig;
use crate::passthrough::ScsiPassthrough;
use crate::probe::{self, DeviceIdentity};
use std::io;
use std::path::{Path, PathBuf};

/// Decides whether a probed device is the target peripheral
pub trait DeviceMatcher {
    fn matches(&self, identity: &DeviceIdentity) -> bool;
}

impl<F> DeviceMatcher for F
where
    F: Fn(&DeviceIdentity) -> bool,
{
    fn matches(&self, identity: &DeviceIdentity) -> bool {
        self(identity)
    }
}

/// Case-sensitive substring allowlist over vendor and product
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AllowlistMatcher {
    vendor_patterns: Vec<String>,
    product_patterns: Vec<String>,
}

impl AllowlistMatcher {
    pub fn new(vendor_patterns: Vec<String>, product_patterns: Vec<String>) -> Self {
        AllowlistMatcher {
            vendor_patterns,
            product_patterns,
        }
    }

    pub fn from_config(config: &DiscoveryConfig) -> Self {
        Self::new(config.vendor_patterns.clone(), config.product_patterns.clone())
    }
}

impl DeviceMatcher for AllowlistMatcher {
    fn matches(&self, identity: &DeviceIdentity) -> bool {
        self.vendor_patterns
            .iter()
            .any(|p| identity.vendor.contains(p.as_str()))
            || self
                .product_patterns
                .iter()
                .any(|p| identity.product.contains(p.as_str()))
    }
}

/// Opens candidate device nodes
pub trait DeviceOpener {
    type Device: ScsiPassthrough;

    /// Open a scan candidate; must not block on a busy node
    fn open_candidate(&self, path: &Path) -> io::Result<Self::Device>;

    /// Open the configured override path
    fn open_override(&self, path: &Path) -> io::Result<Self::Device>;
}

/// The device discovery settled on
#[derive(Debug)]
pub struct Discovered<D> {
    pub device: D,
    pub path: PathBuf,
    /// `None` when the device came from the override path
    pub identity: Option<DeviceIdentity>,
}

/// Scan for the target device
pub fn discover<O, M>(config: &DiscoveryConfig, opener: &O, matcher: &M) -> Option<Discovered<O::Device>>
where
    O: DeviceOpener,
    M: DeviceMatcher + ?Sized,
{
    log::info!(
        "Scanning {}{}..{}{} for SCSI devices",
        config.node_prefix,
        config.node_range.start,
        config.node_prefix,
        config.node_range.end.saturating_sub(1)
    );

    for index in config.node_range.clone() {
        let path = config.node_path(index);

        // Most indices do not exist or are busy
        let mut device = match opener.open_candidate(&path) {
            Ok(device) => device,
            Err(e) => {
                log::trace!("Skipping {}: {}", path.display(), e);
                continue;
            }
        };

        let identity = match probe::probe(&mut device, config.probe_timeout) {
            Ok(identity) => identity,
            Err(e) => {
                log::debug!("Probe of {} failed: {}", path.display(), e);
                continue;
            }
        };

        log::info!("Found {}: {}", path.display(), identity);

        if matcher.matches(&identity) {
            log::info!("Matched target device: {}", path.display());
            return Some(Discovered {
                device,
                path,
                identity: Some(identity),
            });
        }
    }

    log::info!("No matching device found in scan");

    let path = config.override_path.as_ref()?;
    match opener.open_override(path) {
        Ok(device) => {
            log::info!("Opened configured device: {}", path.display());
            Some(Discovered {
                device,
                path: path.clone(),
                identity: None,
            })
        }
        Err(e) => {
            log::warn!("Cannot open configured device {}: {}", path.display(), e);
            None
        }
    }
}
