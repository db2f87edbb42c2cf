//! Host-side RPC client.
//!
//! One request is in flight at a time. Each call frames a request with the
//! next sequence number, waits for the matching response within the
//! configured timeout and checks the leading status. Late responses to
//! requests that already timed out are dropped. Nothing is retried
//! implicitly; the one exception is the documented SCRIPT_END fallback.

use crate::exec::loader::ExecState;
use crate::network::codec::{Frame, FrameCodec};
use crate::network::link::Link;
use crate::protocol::args::{ArgEncoding, write_args};
use crate::protocol::frame::{CRC_SEED, CRC_TRUST_DEVICE, Command, FrameHeader, Status, crc32_ieee};
use crate::protocol::payload::{PayloadReader, PayloadWriter};
use crate::types::encoding::Decode;
use crate::{debug, warn};
use copro_derive::Error;
use std::io;
use std::time::Duration;
use tokio::time::timeout;

/// Everything a call can fail with.
#[derive(Debug, Error)]
pub enum RpcError {
    #[error("link i/o failed: {0}")]
    Io(#[from] io::Error),
    #[error("no response within {0:?}")]
    Timeout(Duration),
    #[error("response too short: needed {expected} bytes, got {actual}")]
    ShortResponse { expected: usize, actual: usize },
    #[error("unexpected response: {0}")]
    BadResponse(String),
    #[error("device answered {0}")]
    Status(Status),
    #[error("crc mismatch: host {expected:#010x}, device {actual:#010x}")]
    CrcMismatch { expected: u32, actual: u32 },
}

impl RpcError {
    /// Device status behind this error, if it is one.
    pub fn status(&self) -> Option<Status> {
        match self {
            RpcError::Status(status) => Some(*status),
            _ => None,
        }
    }
}

/// Host-side settings.
#[derive(Clone, Debug)]
pub struct ClientConfig {
    /// Budget for one request/response exchange.
    pub timeout: Duration,
    /// Bytes per LOAD_DATA / SCRIPT_DATA frame.
    pub data_chunk: usize,
    /// Pause after each DATA frame.
    pub data_delay: Duration,
    /// Fail responses whose payload no checksum vouches for.
    pub strict_crc: bool,
    pub codec: FrameCodec,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(2),
            data_chunk: 256,
            data_delay: Duration::ZERO,
            strict_crc: false,
            codec: FrameCodec::default(),
        }
    }
}

/// HELLO reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HelloReply {
    pub version: u16,
    pub caps: u32,
}

/// INFO reply.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DeviceInfo {
    pub flags: u32,
    pub blob_len: u32,
    pub mailbox_max: u32,
}

pub struct RpcClient<L: Link> {
    link: L,
    config: ClientConfig,
    seq: u32,
}

impl<L: Link> RpcClient<L> {
    pub fn new(link: L) -> Self {
        Self::with_config(link, ClientConfig::default())
    }

    pub fn with_config(link: L, config: ClientConfig) -> Self {
        Self { link, config, seq: 0 }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Gives the link back.
    pub fn into_inner(self) -> L {
        self.link
    }

    /// Sends one request and returns the raw response payload.
    pub async fn request(&mut self, cmd: Command, payload: &[u8]) -> Result<Vec<u8>, RpcError> {
        self.request_within(cmd, payload, self.config.timeout).await
    }

    async fn request_within(&mut self, cmd: Command, payload: &[u8], budget: Duration) -> Result<Vec<u8>, RpcError> {
        self.seq = self.seq.wrapping_add(1);
        let seq = self.seq;
        let header = FrameHeader::request(cmd, seq, payload);

        let exchange = async {
            self.config.codec.write_frame(&mut self.link, &header, payload).await?;
            loop {
                let frame = self.config.codec.read_frame(&mut self.link).await?;
                // a reply to an earlier request that timed out
                if is_older(frame.header.seq, seq) {
                    debug!(
                        "{} seq={}: dropping late response cmd={:#06x} seq={}",
                        cmd.name(),
                        seq,
                        frame.header.cmd,
                        frame.header.seq
                    );
                    continue;
                }
                return Ok::<_, io::Error>(frame);
            }
        };
        let frame = match timeout(budget, exchange).await {
            Ok(Ok(frame)) => frame,
            Ok(Err(err)) => {
                warn!("{} seq={}: link error: {}", cmd.name(), seq, err);
                return Err(err.into());
            }
            Err(_) => {
                warn!("{} seq={}: timed out after {:?}", cmd.name(), seq, budget);
                return Err(RpcError::Timeout(budget));
            }
        };

        self.check_frame(cmd, seq, frame)
    }

    fn check_frame(&self, cmd: Command, seq: u32, frame: Frame) -> Result<Vec<u8>, RpcError> {
        let header = frame.header;
        if !header.answers(cmd) || header.seq != seq {
            warn!("{} seq={}: got cmd={:#06x} seq={}", cmd.name(), seq, header.cmd, header.seq);
            return Err(RpcError::BadResponse(format!(
                "expected cmd {:#06x} seq {}, got cmd {:#06x} seq {}",
                cmd.response_code(),
                seq,
                header.cmd,
                header.seq
            )));
        }
        if self.config.strict_crc && !frame.is_intact() {
            warn!("{} seq={}: response failed crc", cmd.name(), seq);
            return Err(RpcError::CrcMismatch {
                expected: header.crc32,
                actual: crc32_ieee(&frame.payload, CRC_SEED),
            });
        }
        Ok(frame.payload)
    }

    /// Sends a request and strips an OK status; any other status is an error.
    async fn call(&mut self, cmd: Command, payload: &[u8]) -> Result<Vec<u8>, RpcError> {
        let response = self.request(cmd, payload).await?;
        let (status, rest) = split_checked(cmd, &response)?;
        if !status.is_ok() {
            warn!("{}: device status {}", cmd.name(), status);
            return Err(RpcError::Status(status));
        }
        Ok(rest.to_vec())
    }

    pub async fn hello(&mut self) -> Result<HelloReply, RpcError> {
        let body = self.call(Command::Hello, &[]).await?;
        let mut reader = Fields::new(&body);
        let version = reader.get::<u16>()?;
        let _reserved = reader.get::<u16>()?;
        Ok(HelloReply {
            version,
            caps: reader.get()?,
        })
    }

    pub async fn info(&mut self) -> Result<DeviceInfo, RpcError> {
        let body = self.call(Command::Info, &[]).await?;
        let mut reader = Fields::new(&body);
        Ok(DeviceInfo {
            flags: reader.get()?,
            blob_len: reader.get()?,
            mailbox_max: reader.get()?,
        })
    }

    pub async fn status(&mut self) -> Result<ExecState, RpcError> {
        let body = self.call(Command::Status, &[]).await?;
        Fields::new(&body).get()
    }

    /// Uploads a native blob: BEGIN, paced DATA chunks, END with the CRC.
    ///
    /// Returns the length the device stored.
    pub async fn load_blob(&mut self, code: &[u8]) -> Result<u32, RpcError> {
        self.upload(Command::LoadBegin, Command::LoadData, code).await?;

        let crc = crc32_ieee(code, CRC_SEED);
        let body = self.call(Command::LoadEnd, &crc.to_le_bytes()).await?;
        let len = Fields::new(&body).get::<u32>()?;
        debug!("blob loaded: {} bytes, crc {:#010x}", len, crc);
        Ok(len)
    }

    /// Uploads script text.
    ///
    /// END is first sent with the trust-device sentinel. A device that still
    /// answers CRC gets END again with the CRC it reported, provided that
    /// matches the text sent.
    pub async fn load_script(&mut self, text: &[u8]) -> Result<u32, RpcError> {
        self.upload(Command::ScriptBegin, Command::ScriptData, text).await?;

        let response = self.request(Command::ScriptEnd, &CRC_TRUST_DEVICE.to_le_bytes()).await?;
        let (status, rest) = split_checked(Command::ScriptEnd, &response)?;
        if !matches!(status, Status::Ok | Status::Crc) {
            warn!("SCRIPT_END: device status {}", status);
            return Err(RpcError::Status(status));
        }
        let mut reader = Fields::new(rest);
        let (len, device_crc) = (reader.get::<u32>()?, reader.get::<u32>()?);
        if status.is_ok() {
            return Ok(len);
        }

        let local = crc32_ieee(text, CRC_SEED);
        if device_crc != local {
            warn!("script crc: host {:#010x}, device {:#010x}", local, device_crc);
            return Err(RpcError::CrcMismatch {
                expected: local,
                actual: device_crc,
            });
        }
        debug!("device ignored the crc sentinel, retrying END with {:#010x}", device_crc);
        let body = self.call(Command::ScriptEnd, &device_crc.to_le_bytes()).await?;
        Fields::new(&body).get()
    }

    async fn upload(&mut self, begin: Command, data: Command, bytes: &[u8]) -> Result<(), RpcError> {
        self.call(begin, &(bytes.len() as u32).to_le_bytes()).await?;

        let mut sent = 0u32;
        for chunk in bytes.chunks(self.config.data_chunk.max(1)) {
            let body = self.call(data, chunk).await?;
            let total = Fields::new(&body).get::<u32>()?;
            sent += chunk.len() as u32;
            if total != sent {
                return Err(RpcError::BadResponse(format!("device holds {total} bytes, sent {sent}")));
            }
            if !self.config.data_delay.is_zero() {
                tokio::time::sleep(self.config.data_delay).await;
            }
        }
        Ok(())
    }

    /// Runs the loaded blob. `timeout_ms` of 0 selects the device default.
    pub async fn exec(&mut self, args: &[i32], timeout_ms: u32) -> Result<i32, RpcError> {
        let mut writer = PayloadWriter::new();
        writer.write_pod(&(args.len() as u32));
        for arg in args {
            writer.write_pod(arg);
        }
        writer.write_pod(&timeout_ms);

        let budget = self.config.timeout + Duration::from_millis(timeout_ms as u64);
        self.call_within(Command::Exec, &writer.finish(), budget).await
    }

    /// Runs the loaded script with `args` in the requested encoding.
    pub async fn script_exec(&mut self, args: &[i32], timeout_ms: u32, encoding: ArgEncoding) -> Result<i32, RpcError> {
        let mut writer = PayloadWriter::new();
        write_args(&mut writer, args, encoding);
        writer.write_pod(&timeout_ms);

        let budget = self.config.timeout + Duration::from_millis(timeout_ms as u64);
        self.call_within(Command::ScriptExec, &writer.finish(), budget).await
    }

    /// Calls a registered host function.
    pub async fn func(&mut self, name: &str, args: &[i32], encoding: ArgEncoding) -> Result<i32, RpcError> {
        let mut writer = PayloadWriter::new();
        writer.write_pod(&(name.len() as u32)).write_bytes(name.as_bytes());
        write_args(&mut writer, args, encoding);

        let body = self.call(Command::Func, &writer.finish()).await?;
        Fields::new(&body).get()
    }

    async fn call_within(&mut self, cmd: Command, payload: &[u8], budget: Duration) -> Result<i32, RpcError> {
        let response = self.request_within(cmd, payload, budget).await?;
        let (status, rest) = split_checked(cmd, &response)?;
        if !status.is_ok() {
            warn!("{}: device status {}", cmd.name(), status);
            return Err(RpcError::Status(status));
        }
        Fields::new(rest).get()
    }

    /// Reads up to `max` bytes of mailbox text.
    pub async fn mailbox_read(&mut self, max: u32) -> Result<Vec<u8>, RpcError> {
        let body = self.call(Command::MailboxRead, &max.to_le_bytes()).await?;
        let mut reader = Fields::new(&body);
        let n = reader.get::<u32>()? as usize;
        Ok(reader.bytes(n)?.to_vec())
    }

    pub async fn cancel(&mut self) -> Result<(), RpcError> {
        self.call(Command::Cancel, &[]).await.map(drop)
    }

    pub async fn reset(&mut self) -> Result<(), RpcError> {
        self.call(Command::Reset, &[]).await.map(drop)
    }

    pub async fn isp_enter(&mut self) -> Result<(), RpcError> {
        self.call(Command::IspEnter, &[]).await.map(drop)
    }

    pub async fn isp_exit(&mut self) -> Result<(), RpcError> {
        self.call(Command::IspExit, &[]).await.map(drop)
    }
}

/// `seq` was issued before `current`, allowing for wrap-around.
fn is_older(seq: u32, current: u32) -> bool {
    (current.wrapping_sub(seq) as i32) > 0
}

/// Splits off the leading status, mapping unknown codes to an error.
fn split_checked(cmd: Command, response: &[u8]) -> Result<(Status, &[u8]), RpcError> {
    let mut reader = Fields::new(response);
    let code = reader.get::<i32>()?;
    let status = Status::from_code(code)
        .ok_or_else(|| RpcError::BadResponse(format!("{} returned unknown status {}", cmd.name(), code)))?;
    Ok((status, reader.rest()))
}

/// Response field reader reporting [`RpcError::ShortResponse`].
struct Fields<'a> {
    reader: PayloadReader<'a>,
    offset: usize,
}

impl<'a> Fields<'a> {
    fn new(body: &'a [u8]) -> Self {
        Self {
            reader: PayloadReader::new(body),
            offset: 0,
        }
    }

    fn get<T: Decode>(&mut self) -> Result<T, RpcError> {
        let before = self.reader.remaining();
        let value = self.reader.read_pod::<T>().map_err(|_| RpcError::ShortResponse {
            expected: self.offset + std::mem::size_of::<T>(),
            actual: self.offset + before,
        })?;
        self.offset += before - self.reader.remaining();
        Ok(value)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], RpcError> {
        let before = self.reader.remaining();
        let bytes = self.reader.read_bytes(n).map_err(|_| RpcError::ShortResponse {
            expected: self.offset + n,
            actual: self.offset + before,
        })?;
        self.offset += n;
        Ok(bytes)
    }

    fn rest(&self) -> &'a [u8] {
        self.reader.rest()
    }
}
