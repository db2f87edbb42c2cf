//! Host command-line client for the co-processor protocol.
//!
//! # Usage
//! ```text
//! coprpc <addr> [OPTIONS] <command> [ARGS]
//! ```
//!
//! Integer arguments accept decimal or `0x` hex with an optional sign.

use copro::coplm::NoteStream;
use copro::network::{ClientConfig, FrameCodec, RpcClient, RpcError, TcpLink};
use copro::protocol::args::{ArgEncoding, parse_int};
use copro::{error, info};
use std::env;
use std::fs;
use std::net::SocketAddr;
use std::process;
use std::time::Duration;

/// Parsed command with its arguments.
enum Action {
    Hello,
    Info,
    Status,
    Load(String),
    Exec { timeout_ms: u32, args: Vec<i32> },
    Script { path: String, timeout_ms: u32, encoding: ArgEncoding, args: Vec<i32> },
    Mailbox(u32),
    Cancel,
    Reset,
    Func { name: String, encoding: ArgEncoding, args: Vec<i32> },
    IspEnter,
    IspExit,
    Coplm { path: String, play: bool },
}

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 3 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 3 { 1 } else { 0 });
    }

    let addr: SocketAddr = match args[1].parse() {
        Ok(addr) => addr,
        Err(_) => {
            eprintln!("Invalid device address: {}", args[1]);
            process::exit(1);
        }
    };

    let mut config = ClientConfig::default();
    let mut i = 2;
    while i < args.len() && args[i].starts_with("--") {
        match args[i].as_str() {
            "--trailing-crc" => config.codec.trailing_crc = true,
            "--strict-crc" => config.strict_crc = true,
            "--rpc-timeout" => {
                i += 1;
                config.timeout = Duration::from_millis(value_of(&args, i, "--rpc-timeout") as u64);
            }
            "--pace" => {
                i += 1;
                let Some((chunk, delay)) = args.get(i).and_then(|s| s.split_once(':')) else {
                    eprintln!("--pace requires <chunk>:<delay_ms>");
                    process::exit(1);
                };
                let trailing = config.codec.trailing_crc;
                let delay = Duration::from_millis(parse_int(delay.as_bytes()).max(0) as u64);
                config.codec = FrameCodec::paced(parse_int(chunk.as_bytes()).max(1) as usize, delay);
                config.codec.trailing_crc = trailing;
                config.data_chunk = config.codec.chunk_size;
                config.data_delay = delay;
            }
            other => {
                eprintln!("Unexpected option: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
        }
        i += 1;
    }

    let action = parse_action(&args, i);

    if let Action::Coplm { path, play: false } = &action {
        let stream = NoteStream::read_from(path).unwrap_or_else(|e| {
            error!("Failed to read {}: {}", path, e);
            process::exit(1);
        });
        print!("{}", stream.to_script());
        return;
    }

    let link = match TcpLink::connect(addr).await {
        Ok(link) => link,
        Err(e) => {
            error!("Failed to connect to {}: {}", addr, e);
            process::exit(1);
        }
    };
    let mut client = RpcClient::with_config(link, config);

    if let Err(e) = run(&mut client, action).await {
        error!("{}", e);
        process::exit(2);
    }
}

async fn run(client: &mut RpcClient<TcpLink>, action: Action) -> Result<(), RpcError> {
    match action {
        Action::Hello => {
            let hello = client.hello().await?;
            println!("version={:#06x} caps={:#010x}", hello.version, hello.caps);
        }
        Action::Info => {
            let info = client.info().await?;
            println!(
                "flags={:#010x} blob_len={} mailbox_max={}",
                info.flags, info.blob_len, info.mailbox_max
            );
        }
        Action::Status => println!("{:?}", client.status().await?),
        Action::Load(path) => {
            let code = read_file(&path);
            let len = client.load_blob(&code).await?;
            info!("Loaded {} ({} bytes)", path, len);
        }
        Action::Exec { timeout_ms, args } => println!("{}", client.exec(&args, timeout_ms).await?),
        Action::Script {
            path,
            timeout_ms,
            encoding,
            args,
        } => {
            let text = read_file(&path);
            client.load_script(&text).await?;
            println!("{}", client.script_exec(&args, timeout_ms, encoding).await?);
        }
        Action::Mailbox(max) => {
            let text = client.mailbox_read(max).await?;
            println!("{}", String::from_utf8_lossy(&text));
        }
        Action::Cancel => client.cancel().await?,
        Action::Reset => client.reset().await?,
        Action::Func { name, encoding, args } => println!("{}", client.func(&name, &args, encoding).await?),
        Action::IspEnter => client.isp_enter().await?,
        Action::IspExit => client.isp_exit().await?,
        Action::Coplm { path, .. } => {
            let stream = NoteStream::read_from(&path).unwrap_or_else(|e| {
                error!("Failed to read {}: {}", path, e);
                process::exit(1);
            });
            let script = stream.to_script();
            client.load_script(script.as_bytes()).await?;
            // budget the whole tune plus a second of slack
            let timeout_ms = (stream.duration_us() / 1000 + 1000).min(u32::MAX as u64) as u32;
            println!("{}", client.script_exec(&[], timeout_ms, ArgEncoding::Binary).await?);
        }
    }
    Ok(())
}

fn parse_action(args: &[String], mut i: usize) -> Action {
    let Some(command) = args.get(i) else {
        eprintln!("Missing command\n");
        print_usage(&args[0]);
        process::exit(1);
    };
    i += 1;

    let mut timeout_ms = 0u32;
    let mut encoding = ArgEncoding::Binary;
    let mut play = false;
    let mut positional = Vec::new();
    while i < args.len() {
        match args[i].as_str() {
            "--timeout" => {
                i += 1;
                timeout_ms = value_of(args, i, "--timeout");
            }
            "--ascii" => encoding = ArgEncoding::Ascii,
            "--play" => play = true,
            other => positional.push(other.to_string()),
        }
        i += 1;
    }

    let ints = |values: &[String]| values.iter().map(|v| parse_int(v.as_bytes())).collect::<Vec<_>>();
    let first = |what: &str| -> String {
        positional.first().cloned().unwrap_or_else(|| {
            eprintln!("{command} requires {what}");
            process::exit(1);
        })
    };

    match command.as_str() {
        "hello" => Action::Hello,
        "info" => Action::Info,
        "status" => Action::Status,
        "load" => Action::Load(first("a blob file")),
        "exec" => Action::Exec {
            timeout_ms,
            args: ints(&positional),
        },
        "script" => Action::Script {
            path: first("a script file"),
            timeout_ms,
            encoding,
            args: ints(&positional[1..]),
        },
        "mailbox" => Action::Mailbox(positional.first().map_or(u32::MAX, |v| parse_int(v.as_bytes()) as u32)),
        "cancel" => Action::Cancel,
        "reset" => Action::Reset,
        "func" => Action::Func {
            name: first("a function name"),
            encoding,
            args: ints(&positional[1..]),
        },
        "isp-enter" => Action::IspEnter,
        "isp-exit" => Action::IspExit,
        "coplm" => Action::Coplm {
            path: first("a .coplm file"),
            play,
        },
        other => {
            eprintln!("Unknown command: {}\n", other);
            print_usage(&args[0]);
            process::exit(1);
        }
    }
}

fn value_of(args: &[String], i: usize, flag: &str) -> u32 {
    match args.get(i) {
        Some(value) => parse_int(value.as_bytes()) as u32,
        None => {
            eprintln!("{flag} requires an argument");
            process::exit(1);
        }
    }
}

fn read_file(path: &str) -> Vec<u8> {
    fs::read(path).unwrap_or_else(|e| {
        error!("Failed to read {}: {}", path, e);
        process::exit(1);
    })
}

const USAGE: &str = "\
Co-processor RPC client

USAGE:
    {program} <addr> [OPTIONS] <command> [ARGS]

OPTIONS:
    --trailing-crc           Write and expect a trailing CRC32 after each payload
    --strict-crc             Fail responses whose payload no CRC vouches for
    --rpc-timeout <ms>       Per-request response timeout (default 2000)
    --pace <chunk>:<ms>      Pause <ms> between <chunk>-byte pieces and DATA frames
    -h, --help               Print this help message

COMMANDS:
    hello                               Protocol version and capability bits
    info                                Flags, blob length, mailbox capacity
    status                              Exec state
    load <file.bin>                     Upload a Thumb blob
    exec [--timeout ms] [args...]       Run the loaded blob
    script <file> [--timeout ms] [--ascii] [args...]
                                        Upload and run a script
    mailbox [max]                       Read mailbox text
    cancel                              Raise the cancel flag
    reset                               Drop loaded code and clear the mailbox
    func <name> [--ascii] [args...]     Call a host function
    isp-enter | isp-exit                Toggle in-system-programming mode
    coplm <file.coplm> [--play]         Print the generated script, or upload and run it

ENVIRONMENT:
    COPRO_LOG    Minimum log level: debug, info, warn, error (default info)

EXAMPLES:
    {program} 127.0.0.1:7000 hello
    {program} 127.0.0.1:7000 load ret42.bin
    {program} 127.0.0.1:7000 exec --timeout 500 1 2 3
    {program} 127.0.0.1:7000 script blink.txt --ascii 0x0D 5
    {program} 127.0.0.1:7000 func add 40 2
";

/// Prints usage information to stderr.
fn print_usage(program: &str) {
    eprintln!("{}", USAGE.replace("{program}", program));
}
