//! List generic-SCSI devices and show which one discovery would pick
//!
//! Probes every candidate node with INQUIRY, like discovery does, but keeps
//! going after a match so the whole bus is reported.

#[cfg(target_os = "linux")]
fn main() -> Result<(), Box<dyn std::error::Error>> {
    use aspi_bridge::discovery::DeviceMatcher;
    use aspi_bridge::sg::SgDevice;
    use aspi_bridge::{probe, AllowlistMatcher, BridgeConfig};

    env_logger::init();

    let config = BridgeConfig::from_env()?;
    let discovery = &config.discovery;
    let matcher = AllowlistMatcher::from_config(discovery);

    let mut found = 0;
    for index in discovery.node_range.clone() {
        let path = discovery.node_path(index);
        let Ok(mut device) = SgDevice::open_nonblocking(&path) else {
            continue;
        };
        match probe::probe(&mut device, discovery.probe_timeout) {
            Ok(identity) => {
                found += 1;
                let mark = if matcher.matches(&identity) { " <- match" } else { "" };
                println!("{}: {}{}", path.display(), identity, mark);
            }
            Err(e) => println!("{}: probe failed: {}", path.display(), e),
        }
    }

    if found == 0 {
        println!("No responding devices under {}", discovery.node_prefix);
    }
    if let Some(path) = &discovery.override_path {
        println!("Override: {}", path.display());
    }

    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("Device scanning needs Linux generic-SCSI (/dev/sg*)");
}
