//! Remote executor for the socket bridge
//!
//! Serves request frames on a TCP port. By default the commands run on the
//! generic-SCSI device picked by discovery; with `--virtual` they are
//! answered by an in-memory stand-in that identifies as a JEOL SEM.
//!
//! `--log-dir DIR` keeps a transaction log per client; `--decoder FILE`
//! names commands in it from a TOML opcode table instead of the built-in
//! one.
//!
//! ```text
//! cargo run --example executor_server -- 0.0.0.0:9999 --virtual --log-dir logs
//! ```

use aspi_bridge::{CommandExecutor, ExecutorServer, OpcodeDecoder, VirtualSem};
use std::time::Duration;

/// Value following `flag`, if given
fn option<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .map(String::as_str)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let virtual_device = args.iter().any(|a| a == "--virtual");
    let log_dir = option(&args, "--log-dir");
    let decoder_file = option(&args, "--decoder");
    let bind_addr = args
        .iter()
        .enumerate()
        .find(|&(i, a)| {
            let is_value = i > 0 && matches!(args[i - 1].as_str(), "--log-dir" | "--decoder");
            !a.starts_with("--") && !is_value
        })
        .map(|(_, a)| a.clone())
        .unwrap_or_else(|| "127.0.0.1:9999".to_string());

    let executor: Box<dyn CommandExecutor + Send> = if virtual_device {
        println!("Serving virtual SEM on {}", bind_addr);
        Box::new(VirtualSem::new())
    } else {
        passthrough_executor()?
    };

    let mut builder = ExecutorServer::builder()
        .bind_addr(&bind_addr)
        .io_timeout(Duration::from_secs(300));
    if let Some(dir) = log_dir {
        println!("Session logs in {}", dir);
        builder = builder.session_log_dir(dir);
    }
    if let Some(path) = decoder_file {
        builder = builder.decoder(OpcodeDecoder::from_toml_file(path)?);
    }

    builder.build(executor)?.run()?;

    Ok(())
}

#[cfg(target_os = "linux")]
fn passthrough_executor() -> Result<Box<dyn CommandExecutor + Send>, Box<dyn std::error::Error>> {
    let config = aspi_bridge::BridgeConfig::from_env()?;
    let executor = aspi_bridge::PassthroughExecutor::discover(&config)?;
    Ok(Box::new(executor))
}

#[cfg(not(target_os = "linux"))]
fn passthrough_executor() -> Result<Box<dyn CommandExecutor + Send>, Box<dyn std::error::Error>> {
    Err("generic-SCSI passthrough needs Linux, use --virtual".into())
}
