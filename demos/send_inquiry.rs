//! Send INQUIRY through the ASPI dispatcher
//!
//! Uses the socket bridge by default; pass `--passthrough` to run the
//! command on the local device picked by discovery instead.

use aspi_bridge::{
    describe_status, flags, Aspi, BridgeConfig, CommandBridge, CommandCode, CompletionEvent,
    DeviceIdentity, SocketBridge, Srb, SrbStatus,
};
use std::time::Duration;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = BridgeConfig::from_env()?;
    let passthrough = std::env::args().any(|a| a == "--passthrough");

    let bridge: Box<dyn CommandBridge> = if passthrough {
        passthrough_bridge(&config)?
    } else {
        println!("Executor: {}", config.endpoint);
        Box::new(SocketBridge::from_config(&config))
    };
    let mut aspi = Aspi::new(bridge);

    println!("Support info: 0x{:04x}", aspi.support_info());

    let mut srb = Srb::new(CommandCode::AdapterInquiry as u8);
    aspi.send_command(&mut srb);
    if let Some(inquiry) = &srb.adapter_inquiry {
        println!("Adapter: {} / {}", inquiry.manager_id, inquiry.identifier);
    }

    let mut srb = Srb::new(CommandCode::GetDeviceType as u8);
    aspi.send_command(&mut srb);
    println!("Device type: {:?}", srb.device_type);

    let event = CompletionEvent::new();
    let mut buf = [0u8; 96];
    let mut srb = Srb::exec(&[0x12, 0, 0, 0, 96, 0], flags::DIR_IN, &mut buf).with_completion(&event);
    let status = aspi.send_command(&mut srb);
    event.wait_timeout(Duration::from_secs(1));
    let target_status = srb.target_status;

    println!("Status: {:?} ({})", status, describe_status(status));
    if status == SrbStatus::Complete {
        println!("{}", DeviceIdentity::from_inquiry(&buf)?);
        println!("Raw: {}", hex::encode(&buf[..36]));
    } else if target_status != 0 {
        println!("Target status: 0x{:02x}", target_status);
    }

    Ok(())
}

#[cfg(target_os = "linux")]
fn passthrough_bridge(config: &BridgeConfig) -> Result<Box<dyn CommandBridge>, Box<dyn std::error::Error>> {
    Ok(Box::new(aspi_bridge::PassthroughBridge::discover(config)))
}

#[cfg(not(target_os = "linux"))]
fn passthrough_bridge(_config: &BridgeConfig) -> Result<Box<dyn CommandBridge>, Box<dyn std::error::Error>> {
    Err("generic-SCSI passthrough needs Linux".into())
}
