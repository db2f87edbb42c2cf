//! Host client against a full device over an in-memory link.

use copro::device::dispatcher::{CAP_BLOB_EXEC, CAP_SCRIPT_VM, INFO_BLOB_LOADED, INFO_MAILBOX_NONEMPTY};
use copro::device::{DeviceConfig, DeviceServer, Dispatcher};
use copro::exec::{ExecState, ThumbEmulator};
use copro::network::{ClientConfig, FrameCodec, LocalLink, RpcClient, RpcError};
use copro::protocol::Status;
use copro::protocol::args::ArgEncoding;
use copro::vm::SimPins;
use std::sync::Arc;
use std::time::Duration;

const RETURN_42: [u8; 4] = [0x2A, 0x20, 0x70, 0x47];

fn start_device(config: DeviceConfig, codec: FrameCodec) -> (RpcClient<LocalLink>, Arc<SimPins>) {
    let pins = Arc::new(SimPins::recording());
    let dispatcher = Dispatcher::new(config, pins.clone(), Box::new(ThumbEmulator::default())).unwrap();
    let server = DeviceServer::new(dispatcher, codec.clone());

    let (host, device) = LocalLink::pair();
    tokio::spawn(server.serve(device));

    let client_config = ClientConfig {
        codec,
        data_chunk: 16,
        ..ClientConfig::default()
    };
    (RpcClient::with_config(host, client_config), pins)
}

fn device() -> (RpcClient<LocalLink>, Arc<SimPins>) {
    start_device(DeviceConfig::default(), FrameCodec::default())
}

#[tokio::test]
async fn return_42_blob() {
    let (mut client, _) = device();

    let hello = client.hello().await.unwrap();
    assert_eq!(hello.version, 1);
    assert_eq!(hello.caps & (CAP_BLOB_EXEC | CAP_SCRIPT_VM), CAP_BLOB_EXEC | CAP_SCRIPT_VM);

    assert_eq!(client.status().await.unwrap(), ExecState::Idle);
    assert_eq!(client.load_blob(&RETURN_42).await.unwrap(), 4);

    let info = client.info().await.unwrap();
    assert_eq!(info.flags & INFO_BLOB_LOADED, INFO_BLOB_LOADED);
    assert_eq!(info.blob_len, 4);

    assert_eq!(client.exec(&[], 100).await.unwrap(), 42);
    assert_eq!(client.status().await.unwrap(), ExecState::Done);
}

#[tokio::test]
async fn blob_using_arguments() {
    let (mut client, _) = device();
    // adds r0, r0, r1 ; adds r0, r0, r2 ; bx lr
    let code = [0x40, 0x18, 0x80, 0x18, 0x70, 0x47];
    client.load_blob(&code).await.unwrap();
    assert_eq!(client.exec(&[1, 2, 3, 99], 100).await.unwrap(), 6);
}

#[tokio::test]
async fn exec_without_blob_is_state() {
    let (mut client, _) = device();
    let err = client.exec(&[], 100).await.unwrap_err();
    assert_eq!(err.status(), Some(Status::State));
}

#[tokio::test]
async fn runaway_blob_times_out_and_device_recovers() {
    let (mut client, _) = device();
    // b .
    client.load_blob(&[0xFE, 0xE7]).await.unwrap();
    let err = client.exec(&[], 30).await.unwrap_err();
    assert_eq!(err.status(), Some(Status::Timeout));

    // the emulator honours cancel, so the slot is free again
    client.load_blob(&RETURN_42).await.unwrap();
    assert_eq!(client.exec(&[], 100).await.unwrap(), 42);
}

#[tokio::test]
async fn script_drives_pins_and_mailbox() {
    let (mut client, pins) = device();
    let script = b"\
PINMODE 13 OUTPUT
LET R2 3
blink: DWRITE 13 HIGH; DWRITE 13 LOW
SUB R2 1
IF R2 > 0 GOTO blink
PRINT \"blinked\"
ADD R0 R1
RET R0
";
    assert_eq!(client.load_script(script).await.unwrap(), script.len() as u32);

    let result = client.script_exec(&[40, 2], 500, ArgEncoding::Ascii).await.unwrap();
    assert_eq!(result, 42);

    let highs = pins
        .take_events()
        .into_iter()
        .filter(|e| *e == copro::vm::pins::PinEvent::Digital(13, true))
        .count();
    assert_eq!(highs, 3);

    let info = client.info().await.unwrap();
    assert_eq!(info.flags & INFO_MAILBOX_NONEMPTY, INFO_MAILBOX_NONEMPTY);
    assert_eq!(client.mailbox_read(3).await.unwrap(), b"bli");
    assert_eq!(client.mailbox_read(100).await.unwrap(), b"blinked");
}

#[tokio::test]
async fn script_registers_do_not_leak_between_runs() {
    let (mut client, _) = device();
    client.load_script(b"ADD R5 7\nRET R5").await.unwrap();
    assert_eq!(client.script_exec(&[], 100, ArgEncoding::Binary).await.unwrap(), 7);
    assert_eq!(client.script_exec(&[], 100, ArgEncoding::Binary).await.unwrap(), 7);
}

#[tokio::test]
async fn first_binary_arg_of_minus_one_survives() {
    let (mut client, _) = device();
    client.load_script(b"RET R0").await.unwrap();
    assert_eq!(client.script_exec(&[-1, 5], 100, ArgEncoding::Binary).await.unwrap(), -1);
}

#[tokio::test]
async fn script_timeout() {
    let (mut client, _) = device();
    client.load_script(b"top: GOTO top").await.unwrap();
    let err = client.script_exec(&[], 50, ArgEncoding::Binary).await.unwrap_err();
    assert_eq!(err.status(), Some(Status::Timeout));
}

#[tokio::test]
async fn client_recovers_after_giving_up_on_a_reply() {
    let config = DeviceConfig {
        default_timeout_ms: 100,
        ..DeviceConfig::default()
    };
    let (host, device) = LocalLink::pair();
    let dispatcher = Dispatcher::new(config, Arc::new(SimPins::new()), Box::new(ThumbEmulator::default())).unwrap();
    tokio::spawn(DeviceServer::new(dispatcher, FrameCodec::default()).serve(device));

    let client_config = ClientConfig {
        timeout: Duration::from_millis(30),
        ..ClientConfig::default()
    };
    let mut client = RpcClient::with_config(host, client_config);
    client.load_script(b"spin: GOTO spin").await.unwrap();

    let err = client.script_exec(&[], 0, ArgEncoding::Binary).await.unwrap_err();
    assert!(matches!(err, RpcError::Timeout(_)));

    // the device answers the abandoned SCRIPT_EXEC later
    tokio::time::sleep(Duration::from_millis(400)).await;
    for _ in 0..3 {
        assert_eq!(client.hello().await.unwrap().version, 1);
    }
    assert_ne!(client.status().await.unwrap(), ExecState::Running);
}

#[tokio::test]
async fn func_and_reset() {
    let (mut client, pins) = device();
    assert_eq!(client.func("sum", &[1, 2, 3, 4, 5], ArgEncoding::Ascii).await.unwrap(), 15);
    assert_eq!(client.func("pin_write", &[4, 1], ArgEncoding::Binary).await.unwrap(), 0);
    assert_eq!(pins.level(4), Some(1));
    assert!(matches!(
        client.func("missing", &[], ArgEncoding::Binary).await,
        Err(RpcError::Status(Status::Param))
    ));

    client.load_blob(&RETURN_42).await.unwrap();
    client.reset().await.unwrap();
    assert_eq!(client.info().await.unwrap().blob_len, 0);
    assert_eq!(client.status().await.unwrap(), ExecState::Idle);
}

#[tokio::test]
async fn isp_mode_blocks_uploads() {
    let (mut client, _) = device();
    client.isp_enter().await.unwrap();
    let err = client.load_blob(&RETURN_42).await.unwrap_err();
    assert_eq!(err.status(), Some(Status::State));
    client.isp_exit().await.unwrap();
    client.load_blob(&RETURN_42).await.unwrap();
}

#[tokio::test]
async fn paced_link_with_trailing_crc() {
    let codec = FrameCodec {
        trailing_crc: true,
        ..FrameCodec::paced(8, Duration::from_millis(1))
    };
    let config = DeviceConfig {
        trailing_crc: true,
        ..DeviceConfig::default()
    };
    let (mut client, _) = start_device(config, codec);

    let script = b"# long enough to need several chunks\nLET R0 0x10\nADD R0 -6\nRET R0\n";
    client.load_script(script).await.unwrap();
    assert_eq!(client.script_exec(&[], 100, ArgEncoding::Binary).await.unwrap(), 10);
}
