//! Co-processor device simulator.
//!
//! Serves the co-processor protocol over TCP with an in-memory pin bank, the
//! worker-thread bridge and the Thumb emulator backend.
//!
//! # Usage
//! ```text
//! copro-device <listen_addr> [OPTIONS]
//! ```
//!
//! # Arguments
//! - `listen_addr`: Local address to bind (e.g., `127.0.0.1:7000`)
//!
//! # Options
//! - `--mailbox <bytes>`: Mailbox capacity
//! - `--max-blob <bytes>`: Largest accepted blob
//! - `--max-script <bytes>`: Largest accepted script
//! - `--timeout <ms>`: Default EXEC/SCRIPT_EXEC budget
//! - `--trailing-crc`: Write and expect the redundant trailing CRC
//! - `--pace <chunk>:<delay_ms>`: Pace response payloads like a slow UART

use copro::device::{DeviceConfig, DeviceServer, Dispatcher};
use copro::exec::default_runner;
use copro::network::FrameCodec;
use copro::vm::SimPins;
use copro::{error, info};
use std::env;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let listen_addr: SocketAddr = match args[1].parse() {
        Ok(addr) => addr,
        Err(_) => {
            eprintln!("Invalid listen address: {}", args[1]);
            process::exit(1);
        }
    };

    let mut config = DeviceConfig::default();
    let mut codec = FrameCodec::default();

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            k @ ("--mailbox" | "--max-blob" | "--max-script" | "--timeout") => {
                i += 1;
                let value = number_arg(k, args.get(i));
                match k {
                    "--mailbox" => config.mailbox_capacity = value as usize,
                    "--max-blob" => config.max_blob_len = value as usize,
                    "--max-script" => config.max_script_len = value as usize,
                    _ => config.default_timeout_ms = value,
                }
                i += 1;
            }
            "--trailing-crc" => {
                config.trailing_crc = true;
                codec.trailing_crc = true;
                i += 1;
            }
            "--pace" => {
                i += 1;
                let Some((chunk, delay)) = args.get(i).and_then(|s| s.split_once(':')) else {
                    eprintln!("--pace requires <chunk>:<delay_ms>");
                    process::exit(1);
                };
                let chunk = number_arg("--pace", Some(&chunk.to_string()));
                let delay = number_arg("--pace", Some(&delay.to_string()));
                let trailing = codec.trailing_crc;
                codec = FrameCodec::paced(chunk as usize, Duration::from_millis(delay as u64));
                codec.trailing_crc = trailing;
                i += 1;
            }
            other => {
                eprintln!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }

    let dispatcher = match Dispatcher::new(config.clone(), Arc::new(SimPins::new()), default_runner()) {
        Ok(dispatcher) => dispatcher,
        Err(e) => {
            error!("Failed to start worker: {}", e);
            process::exit(1);
        }
    };
    let server = DeviceServer::new(dispatcher, codec);

    info!(
        "Device ready: mailbox={}B max_blob={}B max_script={}B timeout={}ms trailing_crc={}",
        config.mailbox_capacity, config.max_blob_len, config.max_script_len, config.default_timeout_ms, config.trailing_crc
    );

    tokio::select! {
        result = server.listen(listen_addr) => {
            if let Err(e) = result {
                error!("Failed to listen on {}: {}", listen_addr, e);
                process::exit(1);
            }
        }
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                eprintln!("Failed to setup Ctrl+C handler: {}", e);
            }
            info!("Ctrl+C received, shutting down...");
        }
    }
}

/// Parses a numeric option value or exits with a message.
fn number_arg(flag: &str, value: Option<&String>) -> u32 {
    let Some(value) = value else {
        eprintln!("{flag} requires an argument");
        process::exit(1);
    };
    match value.parse::<u32>() {
        Ok(n) => n,
        Err(_) => {
            eprintln!("Invalid value for {flag}: '{value}' is not a number");
            process::exit(1);
        }
    }
}

const USAGE: &str = "\
Co-processor device simulator

USAGE:
    {program} <listen_addr> [OPTIONS]

ARGS:
    <listen_addr>            Local address to bind (e.g., 127.0.0.1:7000)

OPTIONS:
    --mailbox <bytes>        Mailbox capacity (default 256)
    --max-blob <bytes>       Largest accepted blob (default 16384)
    --max-script <bytes>     Largest accepted script (default 8192)
    --timeout <ms>           Default exec budget when a request passes 0 (default 1000)
    --trailing-crc           Write and expect a trailing CRC32 after each payload
    --pace <chunk>:<ms>      Pause <ms> between <chunk>-byte pieces of each response
    -h, --help               Print this help message

ENVIRONMENT:
    COPRO_LOG    Minimum log level: debug, info, warn, error (default info)

EXAMPLES:
    {program} 127.0.0.1:7000
    {program} 0.0.0.0:7000 --mailbox 1024 --trailing-crc
";

/// Prints usage information to stderr.
fn print_usage(program: &str) {
    eprintln!("{}", USAGE.replace("{program}", program));
}
