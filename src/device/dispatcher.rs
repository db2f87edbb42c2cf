//! Device-side command handling.
//!
//! [`Dispatcher`] owns everything a request can touch: the blob and script
//! buffers, the worker bridge, the mailbox, the host function table and the
//! ISP flag. Each handler reads its fields through a fail-closed
//! [`PayloadReader`] and answers with a status-first payload; nothing here
//! panics on malformed input.

use crate::device::functions::{FunctionRegistry, MAX_NAME_LEN};
use crate::exec::bridge::{Bridge, DEFAULT_GRACE, Engine, Job};
use crate::exec::loader::{ExecState, LoadBuffer};
use crate::exec::native::NativeRunner;
use crate::protocol::args::{Args, MAX_NATIVE_ARGS, MAX_VM_ARGS, read_binary_values};
use crate::protocol::frame::{
    Command, FrameHeader, RESPONSE_BIT, Status, VERSION, make_response_header, payload_crc,
};
use crate::protocol::payload::{PayloadReader, PayloadWriter, status_only};
use crate::vm::{CancelToken, Mailbox, Pins, Vm, VmLimits};
use crate::{debug, warn};
use std::sync::Arc;
use std::time::Duration;

/// HELLO capability bits.
pub const CAP_BLOB_EXEC: u32 = 1 << 0;
pub const CAP_SCRIPT_VM: u32 = 1 << 1;
pub const CAP_FUNC: u32 = 1 << 2;
pub const CAP_ASCII_ARGS: u32 = 1 << 3;
pub const CAP_TRAILING_CRC: u32 = 1 << 4;

/// INFO flag bits.
pub const INFO_BLOB_LOADED: u32 = 1 << 0;
pub const INFO_EXEC_RUNNING: u32 = 1 << 1;
pub const INFO_MAILBOX_NONEMPTY: u32 = 1 << 2;
pub const INFO_ISP_ACTIVE: u32 = 1 << 8;

/// Extra time a SCRIPT_EXEC waits beyond the script's own budget.
const SCRIPT_WAIT_SLACK: Duration = Duration::from_millis(100);

/// Device-side settings.
#[derive(Clone, Debug)]
pub struct DeviceConfig {
    /// Mailbox size in bytes, terminator included.
    pub mailbox_capacity: usize,
    /// Largest blob LOAD_BEGIN accepts.
    pub max_blob_len: usize,
    /// Largest script SCRIPT_BEGIN accepts.
    pub max_script_len: usize,
    /// Budget used when EXEC or SCRIPT_EXEC pass 0.
    pub default_timeout_ms: u32,
    /// Advertise and emit the redundant trailing CRC.
    pub trailing_crc: bool,
    /// Time a cancelled job gets before it is abandoned.
    pub grace: Duration,
    pub vm_limits: VmLimits,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            mailbox_capacity: 256,
            max_blob_len: 16 * 1024,
            max_script_len: 8 * 1024,
            default_timeout_ms: 1000,
            trailing_crc: false,
            grace: DEFAULT_GRACE,
            vm_limits: VmLimits::default(),
        }
    }
}

type Reply = Result<PayloadWriter, Status>;

pub struct Dispatcher {
    config: DeviceConfig,
    blob: LoadBuffer,
    script: LoadBuffer,
    bridge: Bridge,
    mailbox: Mailbox,
    functions: FunctionRegistry,
    exec_state: ExecState,
    isp_active: bool,
}

impl Dispatcher {
    /// Builds a dispatcher and starts its worker thread.
    ///
    /// The function table starts with the built-ins bound to `pins`.
    pub fn new(config: DeviceConfig, pins: Arc<dyn Pins>, runner: Box<dyn NativeRunner>) -> std::io::Result<Self> {
        let mailbox = Mailbox::new(config.mailbox_capacity);
        let vm = Vm::new(pins.clone(), mailbox.clone(), CancelToken::new()).with_limits(config.vm_limits);
        let bridge = Bridge::spawn(Engine::new(vm, runner))?.with_grace(config.grace);
        let functions = FunctionRegistry::with_builtins(pins, mailbox.clone());

        Ok(Self {
            blob: LoadBuffer::blob(config.max_blob_len),
            script: LoadBuffer::script(config.max_script_len),
            config,
            bridge,
            mailbox,
            functions,
            exec_state: ExecState::Idle,
            isp_active: false,
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub fn mailbox(&self) -> &Mailbox {
        &self.mailbox
    }

    pub fn functions_mut(&mut self) -> &mut FunctionRegistry {
        &mut self.functions
    }

    /// Exec state as STATUS reports it; an abandoned job still counts as running.
    pub fn exec_state(&self) -> ExecState {
        if self.bridge.is_busy() {
            ExecState::Running
        } else {
            self.exec_state
        }
    }

    /// Answers one complete frame, including framing-level rejections.
    ///
    /// `trailing_crc_ok` is the codec's verdict on the trailing CRC, if one was
    /// read. The payload is refused with CRC only when neither checksum matches.
    pub fn handle_frame(
        &mut self,
        header: &FrameHeader,
        payload: &[u8],
        trailing_crc_ok: Option<bool>,
    ) -> (FrameHeader, Vec<u8>) {
        let request_cmd = header.cmd & !RESPONSE_BIT;
        let response = match header.validate() {
            Err(status) => {
                warn!("rejecting frame cmd={:#06x} seq={}: {}", header.cmd, header.seq, status);
                status_only(status)
            }
            Ok(cmd) if header.crc32 != payload_crc(payload) && trailing_crc_ok != Some(true) => {
                warn!("{} seq={}: no checksum matches the payload", cmd.name(), header.seq);
                status_only(Status::Crc)
            }
            Ok(cmd) => self.handle(cmd, payload),
        };

        let reply = make_response_header(request_cmd, header.seq, response.len() as u32, payload_crc(&response));
        (reply, response)
    }

    /// Runs the handler for `cmd` and returns the status-first response payload.
    pub fn handle(&mut self, cmd: Command, payload: &[u8]) -> Vec<u8> {
        let mut reader = PayloadReader::new(payload);
        let reply = match cmd {
            Command::Hello => self.op_hello(),
            Command::Info => self.op_info(),
            Command::LoadBegin => self.op_begin(&mut reader, false),
            Command::LoadData => self.op_data(payload, false),
            Command::LoadEnd => self.op_load_end(&mut reader),
            Command::Exec => self.op_exec(&mut reader),
            Command::Status => self.op_status(),
            Command::MailboxRead => self.op_mailbox_read(&mut reader),
            Command::Cancel => self.op_cancel(),
            Command::Reset => self.op_reset(),
            Command::ScriptBegin => self.op_begin(&mut reader, true),
            Command::ScriptData => self.op_data(payload, true),
            Command::ScriptEnd => self.op_script_end(&mut reader),
            Command::ScriptExec => self.op_script_exec(&mut reader),
            Command::Func => self.op_func(&mut reader),
            Command::IspEnter => self.op_isp(true),
            Command::IspExit => self.op_isp(false),
        };

        match reply {
            Ok(writer) => writer.finish(),
            Err(status) => {
                debug!("{} -> {}", cmd.name(), status);
                let mut writer = PayloadWriter::status_first(status);
                // result-bearing replies keep their shape on failure
                if matches!(cmd, Command::Exec | Command::ScriptExec | Command::Func) {
                    writer.write_pod(&0i32);
                }
                writer.finish()
            }
        }
    }

    fn ok() -> PayloadWriter {
        PayloadWriter::status_first(Status::Ok)
    }

    fn deny_during_isp(&self) -> Result<(), Status> {
        if self.isp_active { Err(Status::State) } else { Ok(()) }
    }

    fn timeout_or_default(&self, timeout_ms: u32) -> u32 {
        if timeout_ms == 0 { self.config.default_timeout_ms } else { timeout_ms }
    }

    fn op_hello(&self) -> Reply {
        let mut caps = CAP_BLOB_EXEC | CAP_SCRIPT_VM | CAP_FUNC | CAP_ASCII_ARGS;
        if self.config.trailing_crc {
            caps |= CAP_TRAILING_CRC;
        }
        let mut writer = Self::ok();
        writer.write_pod(&VERSION).write_pod(&0u16).write_pod(&caps);
        Ok(writer)
    }

    fn op_info(&self) -> Reply {
        let mut flags = 0;
        if self.blob.is_sealed() {
            flags |= INFO_BLOB_LOADED;
        }
        if self.bridge.is_busy() {
            flags |= INFO_EXEC_RUNNING;
        }
        if !self.mailbox.is_empty() {
            flags |= INFO_MAILBOX_NONEMPTY;
        }
        if self.isp_active {
            flags |= INFO_ISP_ACTIVE;
        }

        let mut writer = Self::ok();
        writer
            .write_pod(&flags)
            .write_pod(&(self.blob.len() as u32))
            .write_pod(&(self.mailbox.capacity() as u32));
        Ok(writer)
    }

    fn op_begin(&mut self, reader: &mut PayloadReader<'_>, script: bool) -> Reply {
        self.deny_during_isp()?;
        let total = reader.read_pod::<u32>()?;
        if script {
            self.script.begin(total)?;
        } else {
            self.blob.begin(total)?;
            self.exec_state = ExecState::Idle;
        }
        debug!("{} begin: {} bytes", if script { "script" } else { "blob" }, total);
        Ok(Self::ok())
    }

    fn op_data(&mut self, chunk: &[u8], script: bool) -> Reply {
        self.deny_during_isp()?;
        let buffer = if script { &mut self.script } else { &mut self.blob };
        let reply = buffer.data(chunk)?;
        if !reply.status.is_ok() {
            warn!("load data truncated at {} bytes", reply.total);
        }

        let mut writer = PayloadWriter::status_first(reply.status);
        writer.write_pod(&reply.total);
        Ok(writer)
    }

    fn op_load_end(&mut self, reader: &mut PayloadReader<'_>) -> Reply {
        self.deny_during_isp()?;
        let expected = reader.read_pod::<u32>()?;
        let reply = self.blob.end(expected)?;
        if reply.status.is_ok() {
            self.exec_state = ExecState::Loaded;
        } else {
            warn!("blob end: {} (device crc {:#010x}, host {:#010x})", reply.status, reply.crc, expected);
        }

        let mut writer = PayloadWriter::status_first(reply.status);
        writer.write_pod(&reply.len);
        Ok(writer)
    }

    fn op_script_end(&mut self, reader: &mut PayloadReader<'_>) -> Reply {
        self.deny_during_isp()?;
        let expected = reader.read_pod::<u32>()?;
        let reply = self.script.end(expected)?;
        if !reply.status.is_ok() {
            warn!("script end: {} after {} bytes", reply.status, reply.len);
        }

        let mut writer = PayloadWriter::status_first(reply.status);
        writer.write_pod(&reply.len).write_pod(&reply.crc);
        Ok(writer)
    }

    fn op_exec(&mut self, reader: &mut PayloadReader<'_>) -> Reply {
        self.deny_during_isp()?;
        let argc = reader.read_pod::<u32>()?;
        let argv = read_binary_values(reader, argc)?;
        let timeout_ms = self.timeout_or_default(reader.read_optional_u32().unwrap_or(0));

        let Some(code) = self.blob.sealed() else {
            return Err(Status::State);
        };
        if self.bridge.is_busy() {
            return Err(Status::State);
        }

        let mut args = [0i32; MAX_NATIVE_ARGS];
        for (slot, value) in args.iter_mut().zip(&argv) {
            *slot = *value;
        }

        self.exec_state = ExecState::Running;
        let result = self.bridge.run(Job::Native { code, args }, Duration::from_millis(timeout_ms as u64));
        self.exec_state = ExecState::Done;

        let value = result?;
        debug!("exec returned {}", value);
        let mut writer = Self::ok();
        writer.write_pod(&value);
        Ok(writer)
    }

    fn op_status(&self) -> Reply {
        let mut writer = Self::ok();
        writer.write_pod(&self.exec_state());
        Ok(writer)
    }

    fn op_mailbox_read(&self, reader: &mut PayloadReader<'_>) -> Reply {
        let max = reader.read_pod::<u32>()?;
        let text = self.mailbox.read(max as usize);

        let mut writer = Self::ok();
        writer.write_pod(&(text.len() as u32)).write_bytes(&text);
        Ok(writer)
    }

    fn op_cancel(&self) -> Reply {
        self.bridge.cancel();
        Ok(Self::ok())
    }

    fn op_reset(&mut self) -> Reply {
        self.bridge.cancel();
        if self.bridge.is_busy() {
            return Err(Status::State);
        }

        self.blob.free();
        self.script.free();
        self.mailbox.clear();
        self.exec_state = ExecState::Idle;
        self.isp_active = false;
        debug!("device reset");
        Ok(Self::ok())
    }

    fn op_script_exec(&mut self, reader: &mut PayloadReader<'_>) -> Reply {
        self.deny_during_isp()?;
        let args = Args::read(reader)?;
        let timeout_ms = self.timeout_or_default(reader.read_optional_u32().unwrap_or(0));

        let Some(code) = self.script.sealed() else {
            return Err(Status::State);
        };
        if self.bridge.is_busy() {
            return Err(Status::State);
        }

        let values = args.values();
        let job = Job::Script {
            code,
            args: values[..values.len().min(MAX_VM_ARGS)].to_vec(),
            timeout_ms,
        };
        let wait = Duration::from_millis(timeout_ms as u64) + SCRIPT_WAIT_SLACK;
        let value = self.bridge.run(job, wait)?;

        let mut writer = Self::ok();
        writer.write_pod(&value);
        Ok(writer)
    }

    fn op_func(&mut self, reader: &mut PayloadReader<'_>) -> Reply {
        self.deny_during_isp()?;
        let name_len = reader.read_pod::<u32>()? as usize;
        if name_len == 0 || name_len > MAX_NAME_LEN {
            return Err(Status::Param);
        }
        let name = reader.read_bytes(name_len)?;
        let args = if reader.remaining() == 0 { Args::default() } else { Args::read(reader)? };

        let value = self.functions.call(name, args.values())?;
        let mut writer = Self::ok();
        writer.write_pod(&value);
        Ok(writer)
    }

    fn op_isp(&mut self, enter: bool) -> Reply {
        if enter && self.bridge.is_busy() {
            return Err(Status::State);
        }
        self.isp_active = enter;
        Ok(Self::ok())
    }
}
