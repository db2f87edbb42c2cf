//! BEGIN/DATA/END loading of native blobs and script text.
//!
//! Both pipelines share [`LoadBuffer`]; they differ only in the checks made at
//! BEGIN and END:
//!
//! | check            | blob                  | script                          |
//! |------------------|-----------------------|---------------------------------|
//! | BEGIN length     | non-zero, even, ≤ max | non-zero, not `0xFFFFFFFF`, ≤ max |
//! | END length       | must be even          | must equal the declared length  |
//! | END crc          | rolling CRC           | canonical CRC, `0xFFFFFFFF` trusts |
//!
//! A successful END seals the buffer into an immutable `Arc<[u8]>` that can be
//! handed to the worker; a failed END leaves it open so END may be retried.

use crate::protocol::frame::{CRC_SEED, CRC_TRUST_DEVICE, Crc32, Status, crc32_ieee};
use copro_derive::BinaryCodec;
use std::sync::Arc;

/// Exec state reported by STATUS.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, BinaryCodec)]
#[binary_codec(repr = "u32")]
pub enum ExecState {
    #[default]
    Idle = 0,
    Loaded = 1,
    Running = 2,
    Done = 3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LoadKind {
    Blob,
    Script,
}

#[derive(Debug, Default)]
enum Stage {
    #[default]
    Empty,
    Loading { data: Vec<u8>, declared: usize, crc: Crc32 },
    Sealed(Arc<[u8]>),
}

/// Reply to a DATA chunk: status (`Size` when truncated) and bytes held so far.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataReply {
    pub status: Status,
    pub total: u32,
}

/// Reply to END: status, stored length and the CRC the device computed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EndReply {
    pub status: Status,
    pub len: u32,
    pub crc: u32,
}

/// One bounded upload buffer.
#[derive(Debug)]
pub struct LoadBuffer {
    kind: LoadKind,
    max_len: usize,
    stage: Stage,
}

impl LoadBuffer {
    pub fn blob(max_len: usize) -> Self {
        Self::new(LoadKind::Blob, max_len)
    }

    pub fn script(max_len: usize) -> Self {
        Self::new(LoadKind::Script, max_len)
    }

    fn new(kind: LoadKind, max_len: usize) -> Self {
        Self {
            kind,
            max_len,
            stage: Stage::Empty,
        }
    }

    pub fn kind(&self) -> LoadKind {
        self.kind
    }

    /// Drops any previous content and allocates exactly `total` bytes.
    pub fn begin(&mut self, total: u32) -> Result<(), Status> {
        let invalid = match self.kind {
            LoadKind::Blob => total == 0 || total % 2 != 0,
            LoadKind::Script => total == 0 || total == u32::MAX,
        };
        if invalid || total as usize > self.max_len {
            return Err(Status::Size);
        }

        self.free();
        let mut data = Vec::new();
        data.try_reserve_exact(total as usize)
            .map_err(|_| Status::NoMem)?;

        self.stage = Stage::Loading {
            data,
            declared: total as usize,
            crc: Crc32::new(),
        };
        Ok(())
    }

    /// Appends as much of `chunk` as still fits.
    pub fn data(&mut self, chunk: &[u8]) -> Result<DataReply, Status> {
        let Stage::Loading { data, declared, crc } = &mut self.stage else {
            return Err(Status::State);
        };

        let room = *declared - data.len();
        let take = chunk.len().min(room);
        data.extend_from_slice(&chunk[..take]);
        crc.update(&chunk[..take]);

        Ok(DataReply {
            status: if take < chunk.len() { Status::Size } else { Status::Ok },
            total: data.len() as u32,
        })
    }

    /// Verifies length and CRC; seals the buffer on success.
    pub fn end(&mut self, expected_crc: u32) -> Result<EndReply, Status> {
        let Stage::Loading { data, declared, crc } = &mut self.stage else {
            return Err(Status::State);
        };

        let len = data.len() as u32;
        let (status, crc) = match self.kind {
            LoadKind::Blob => {
                let actual = crc.value();
                let status = if data.len() % 2 != 0 {
                    Status::Size
                } else if actual != expected_crc {
                    Status::Crc
                } else {
                    Status::Ok
                };
                (status, actual)
            }
            LoadKind::Script => {
                let actual = crc32_ieee(data, CRC_SEED);
                let status = if data.len() != *declared {
                    Status::Size
                } else if expected_crc == CRC_TRUST_DEVICE || expected_crc == actual {
                    Status::Ok
                } else {
                    Status::Crc
                };
                (status, actual)
            }
        };

        if status.is_ok() {
            let sealed: Arc<[u8]> = Arc::from(std::mem::take(data));
            self.stage = Stage::Sealed(sealed);
        }
        Ok(EndReply { status, len, crc })
    }

    pub fn free(&mut self) {
        self.stage = Stage::Empty;
    }

    /// Sealed content, if END succeeded.
    pub fn sealed(&self) -> Option<Arc<[u8]>> {
        match &self.stage {
            Stage::Sealed(code) => Some(code.clone()),
            _ => None,
        }
    }

    pub fn is_sealed(&self) -> bool {
        matches!(self.stage, Stage::Sealed(_))
    }

    /// Bytes currently held, sealed or not.
    pub fn len(&self) -> usize {
        match &self.stage {
            Stage::Empty => 0,
            Stage::Loading { data, .. } => data.len(),
            Stage::Sealed(code) => code.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::encoding::Encode;

    const RETURN_42: [u8; 4] = [0x2A, 0x20, 0x70, 0x47];

    #[test]
    fn blob_exact_length_load() {
        let mut blob = LoadBuffer::blob(1024);
        blob.begin(4).unwrap();
        assert_eq!(blob.data(&RETURN_42[..2]).unwrap(), DataReply { status: Status::Ok, total: 2 });
        assert_eq!(blob.data(&RETURN_42[2..]).unwrap(), DataReply { status: Status::Ok, total: 4 });

        let crc = crc32_ieee(&RETURN_42, CRC_SEED);
        let reply = blob.end(crc).unwrap();
        assert_eq!(reply, EndReply { status: Status::Ok, len: 4, crc });
        assert_eq!(blob.sealed().as_deref(), Some(&RETURN_42[..]));
    }

    #[test]
    fn blob_begin_rejects_bad_lengths() {
        let mut blob = LoadBuffer::blob(16);
        assert_eq!(blob.begin(0), Err(Status::Size));
        assert_eq!(blob.begin(3), Err(Status::Size));
        assert_eq!(blob.begin(18), Err(Status::Size));
        assert_eq!(blob.begin(16), Ok(()));
    }

    #[test]
    fn data_before_begin_is_state_error() {
        let mut blob = LoadBuffer::blob(16);
        assert_eq!(blob.data(b"ab"), Err(Status::State));
        assert_eq!(blob.end(0), Err(Status::State));
    }

    #[test]
    fn overlong_chunk_is_truncated_with_warning() {
        let mut script = LoadBuffer::script(64);
        script.begin(4).unwrap();
        let reply = script.data(b"RET 42").unwrap();
        assert_eq!(reply, DataReply { status: Status::Size, total: 4 });

        let reply = script.end(crc32_ieee(b"RET ", CRC_SEED)).unwrap();
        assert_eq!(reply.status, Status::Ok);
    }

    #[test]
    fn blob_crc_mismatch_keeps_buffer_open() {
        let mut blob = LoadBuffer::blob(16);
        blob.begin(4).unwrap();
        blob.data(&RETURN_42).unwrap();
        assert_eq!(blob.end(0xDEAD_BEEF).unwrap().status, Status::Crc);
        assert!(!blob.is_sealed());

        let crc = crc32_ieee(&RETURN_42, CRC_SEED);
        assert_eq!(blob.end(crc).unwrap().status, Status::Ok);
        assert!(blob.is_sealed());
    }

    #[test]
    fn short_blob_is_checked_against_received_bytes() {
        let mut blob = LoadBuffer::blob(16);
        blob.begin(8).unwrap();
        blob.data(&RETURN_42).unwrap();
        let reply = blob.end(crc32_ieee(&RETURN_42, CRC_SEED)).unwrap();
        assert_eq!(reply.status, Status::Ok);
        assert_eq!(reply.len, 4);

        blob.begin(8).unwrap();
        blob.data(&RETURN_42[..3]).unwrap();
        assert_eq!(blob.end(0).unwrap().status, Status::Size);
    }

    #[test]
    fn script_truncation_reports_size_and_crc_so_far() {
        let mut script = LoadBuffer::script(64);
        script.begin(10).unwrap();
        script.data(b"RET 1").unwrap();

        let reply = script.end(CRC_TRUST_DEVICE).unwrap();
        assert_eq!(reply.status, Status::Size);
        assert_eq!(reply.len, 5);
        assert_eq!(reply.crc, crc32_ieee(b"RET 1", CRC_SEED));
    }

    #[test]
    fn script_sentinel_crc_is_accepted() {
        let mut script = LoadBuffer::script(64);
        script.begin(5).unwrap();
        script.data(b"RET 1").unwrap();
        assert_eq!(script.end(CRC_TRUST_DEVICE).unwrap().status, Status::Ok);
    }

    #[test]
    fn script_begin_rejects_sentinel_length() {
        let mut script = LoadBuffer::script(usize::MAX);
        assert_eq!(script.begin(u32::MAX), Err(Status::Size));
        assert_eq!(script.begin(0), Err(Status::Size));
        // odd script lengths are fine
        assert_eq!(script.begin(3), Ok(()));
    }

    #[test]
    fn new_begin_replaces_sealed_content() {
        let mut blob = LoadBuffer::blob(16);
        blob.begin(2).unwrap();
        blob.data(&[0x00, 0xBF]).unwrap();
        blob.end(crc32_ieee(&[0x00, 0xBF], CRC_SEED)).unwrap();
        let old = blob.sealed().unwrap();

        blob.begin(4).unwrap();
        assert!(blob.sealed().is_none());
        assert_eq!(blob.len(), 0);
        // the old code stays alive for whoever still holds it
        assert_eq!(&old[..], &[0x00, 0xBF]);
    }

    #[test]
    fn exec_state_wire_values() {
        assert_eq!(ExecState::Running.to_bytes(), 2u32.to_le_bytes().to_vec());
        assert_eq!(ExecState::default(), ExecState::Idle);
    }
}
