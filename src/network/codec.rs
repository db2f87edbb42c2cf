//! Frame reading and writing over a [`Link`].
//!
//! The physical link is a slow software UART with no flow control, so writes
//! are paced: a pause after the header when a large payload follows, and
//! between payload chunks. Reads resynchronise on the magic with a sliding
//! 4-byte window, so line noise before a frame is skipped.
//!
//! ```text
//! [header: 20][payload: len][trailing crc32: 4, optional]
//! ```

use crate::network::link::Link;
use crate::protocol::frame::{FrameHeader, HEADER_LEN, MAGIC, payload_crc};
use crate::{debug, warn};
use std::collections::VecDeque;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Largest payload accepted by default.
pub const DEFAULT_MAX_PAYLOAD: usize = 64 * 1024;

/// A frame as read off the link.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Vec<u8>,
    /// Header CRC matched the payload.
    pub header_crc_ok: bool,
    /// Trailing CRC verdict, `None` when none was expected.
    pub trailing_crc_ok: Option<bool>,
    /// Noise bytes skipped before the magic.
    pub skipped: usize,
}

impl Frame {
    /// At least one checksum vouches for the payload.
    pub fn is_intact(&self) -> bool {
        self.header_crc_ok || self.trailing_crc_ok == Some(true)
    }
}

/// Framing and pacing parameters, shared by both ends.
#[derive(Clone, Debug)]
pub struct FrameCodec {
    /// Payload bytes written per burst.
    pub chunk_size: usize,
    /// Pause between payload bursts.
    pub chunk_delay: Duration,
    /// Pause between the header and a payload longer than one chunk.
    pub header_delay: Duration,
    /// Frames announcing more than this are refused.
    pub max_payload: usize,
    /// Write, and expect on read, a trailing CRC32 of the payload.
    pub trailing_crc: bool,
    /// Noise bytes tolerated before a magic is found.
    pub max_scan: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self {
            chunk_size: 64,
            chunk_delay: Duration::ZERO,
            header_delay: Duration::ZERO,
            max_payload: DEFAULT_MAX_PAYLOAD,
            trailing_crc: false,
            max_scan: 4096,
        }
    }
}

impl FrameCodec {
    /// Codec paced for a slow serial bridge.
    pub fn paced(chunk_size: usize, chunk_delay: Duration) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunk_delay,
            header_delay: chunk_delay,
            ..Self::default()
        }
    }

    /// Writes `header` and `payload`, plus the trailing CRC when enabled.
    pub async fn write_frame<L: Link + ?Sized>(&self, link: &mut L, header: &FrameHeader, payload: &[u8]) -> io::Result<()> {
        link.write_all(&header.to_array()).await?;

        let chunk_size = self.chunk_size.max(1);
        if payload.len() > chunk_size && !self.header_delay.is_zero() {
            link.flush().await?;
            tokio::time::sleep(self.header_delay).await;
        }

        let mut chunks = payload.chunks(chunk_size).peekable();
        while let Some(chunk) = chunks.next() {
            link.write_all(chunk).await?;
            if chunks.peek().is_some() && !self.chunk_delay.is_zero() {
                link.flush().await?;
                tokio::time::sleep(self.chunk_delay).await;
            }
        }

        if self.trailing_crc {
            link.write_all(&payload_crc(payload).to_le_bytes()).await?;
        }
        link.flush().await
    }

    /// Reads the next frame, skipping noise up to the magic.
    ///
    /// CRC mismatches are logged and reported in the returned [`Frame`] but are
    /// not errors. A magic followed by an oversized length is taken to be
    /// noise and the scan resumes one byte later; running past `max_scan`
    /// noise bytes is an error.
    pub async fn read_frame<L: Link + ?Sized>(&self, link: &mut L) -> io::Result<Frame> {
        // bytes already pulled off the link that still need scanning
        let mut pending = VecDeque::new();
        let mut skipped = 0;

        let header = loop {
            let mut raw = [0u8; HEADER_LEN];
            self.scan_magic(link, &mut pending, &mut skipped, &mut raw).await?;
            fill(link, &mut pending, &mut raw[4..]).await?;

            let header = FrameHeader::parse(&raw).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            if header.len as usize <= self.max_payload {
                break header;
            }
            debug!(
                "ignoring magic with length {} over the limit of {}, rescanning",
                header.len, self.max_payload
            );
            for byte in raw[1..].iter().rev() {
                pending.push_front(*byte);
            }
            skipped += 1;
        };

        let mut payload = vec![0u8; header.len as usize];
        fill(link, &mut pending, &mut payload).await?;

        let actual = payload_crc(&payload);
        let header_crc_ok = actual == header.crc32;
        if !header_crc_ok {
            warn!(
                "frame cmd={:#06x} seq={}: header crc {:#010x}, payload crc {:#010x}",
                header.cmd, header.seq, header.crc32, actual
            );
        }

        let trailing_crc_ok = if self.trailing_crc {
            let mut bytes = [0u8; 4];
            fill(link, &mut pending, &mut bytes).await?;
            let trailing = u32::from_le_bytes(bytes);
            if trailing != actual {
                warn!("frame seq={}: trailing crc {:#010x} does not match", header.seq, trailing);
            }
            Some(trailing == actual)
        } else {
            None
        };

        if skipped > 0 {
            debug!("skipped {} noise bytes before frame seq={}", skipped, header.seq);
        }
        Ok(Frame {
            header,
            payload,
            header_crc_ok,
            trailing_crc_ok,
            skipped,
        })
    }

    /// Slides a 4-byte window until it holds the magic; leaves it in `raw[..4]`.
    async fn scan_magic<L: Link + ?Sized>(
        &self,
        link: &mut L,
        pending: &mut VecDeque<u8>,
        skipped: &mut usize,
        raw: &mut [u8; HEADER_LEN],
    ) -> io::Result<()> {
        let magic = MAGIC.to_le_bytes();
        let mut window = [0u8; 4];
        fill(link, pending, &mut window).await?;

        while window != magic {
            if *skipped >= self.max_scan {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "no frame magic found"));
            }
            window.rotate_left(1);
            window[3] = match pending.pop_front() {
                Some(byte) => byte,
                None => link.read_u8().await?,
            };
            *skipped += 1;
        }
        raw[..4].copy_from_slice(&window);
        Ok(())
    }
}

/// Fills `buf` from `pending` first, then from the link.
async fn fill<L: Link + ?Sized>(link: &mut L, pending: &mut VecDeque<u8>, buf: &mut [u8]) -> io::Result<()> {
    let buffered = pending.len().min(buf.len());
    for (slot, byte) in buf.iter_mut().zip(pending.drain(..buffered)) {
        *slot = byte;
    }
    link.read_exact(&mut buf[buffered..]).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::link::LocalLink;
    use crate::protocol::frame::{Command, make_response_header};
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn frame_round_trip() {
        let (mut host, mut device) = LocalLink::pair();
        let codec = FrameCodec::default();
        let payload = vec![7u8; 300];
        let header = FrameHeader::request(Command::LoadData, 5, &payload);

        codec.write_frame(&mut host, &header, &payload).await.unwrap();
        let frame = codec.read_frame(&mut device).await.unwrap();
        assert_eq!(frame.header, header);
        assert_eq!(frame.payload, payload);
        assert!(frame.header_crc_ok);
        assert_eq!(frame.trailing_crc_ok, None);
        assert_eq!(frame.skipped, 0);
    }

    #[tokio::test]
    async fn noise_before_magic_is_skipped() {
        let (mut host, mut device) = LocalLink::pair();
        let codec = FrameCodec::default();
        // includes a partial magic to make the window slide over it
        host.write_all(&[0x00, 0x43, 0x50, 0xFF, 0x43]).await.unwrap();
        let header = FrameHeader::request(Command::Hello, 1, &[]);
        codec.write_frame(&mut host, &header, &[]).await.unwrap();

        let frame = codec.read_frame(&mut device).await.unwrap();
        assert_eq!(frame.header, header);
        assert_eq!(frame.skipped, 5);
    }

    #[tokio::test]
    async fn trailing_crc_written_and_checked() {
        let (mut host, mut device) = LocalLink::pair();
        let codec = FrameCodec {
            trailing_crc: true,
            ..FrameCodec::default()
        };
        let payload = b"abc".to_vec();
        let mut header = make_response_header(Command::Info as u16, 3, 3, 0);
        // header crc left wrong on purpose; the trailing one still vouches
        header.crc32 = 0;

        codec.write_frame(&mut host, &header, &payload).await.unwrap();
        let frame = codec.read_frame(&mut device).await.unwrap();
        assert!(!frame.header_crc_ok);
        assert_eq!(frame.trailing_crc_ok, Some(true));
        assert!(frame.is_intact());
    }

    #[tokio::test]
    async fn false_magic_with_huge_length_is_rescanned() {
        let (mut host, mut device) = LocalLink::pair();
        let codec = FrameCodec::default();
        host.write_all(b"CPR0").await.unwrap();
        host.write_all(&[0xAA; 16]).await.unwrap();
        let header = FrameHeader::request(Command::Hello, 6, &[]);
        codec.write_frame(&mut host, &header, &[]).await.unwrap();

        let frame = codec.read_frame(&mut device).await.unwrap();
        assert_eq!(frame.header, header);
        assert_eq!(frame.skipped, 20);
    }

    #[tokio::test]
    async fn false_magic_overlapping_the_real_frame() {
        let (mut host, mut device) = LocalLink::pair();
        let codec = FrameCodec::default();
        // the real frame starts inside the bogus header
        host.write_all(b"CPR0\xFF\xFF").await.unwrap();
        let payload = b"xyz".to_vec();
        let header = FrameHeader::request(Command::ScriptData, 2, &payload);
        codec.write_frame(&mut host, &header, &payload).await.unwrap();

        let frame = codec.read_frame(&mut device).await.unwrap();
        assert_eq!(frame.header, header);
        assert_eq!(frame.payload, payload);
        assert_eq!(frame.skipped, 6);
    }

    #[tokio::test]
    async fn oversized_frame_counts_as_noise() {
        let (mut host, mut device) = LocalLink::pair();
        let writer = FrameCodec::default();
        let reader = FrameCodec {
            max_payload: 8,
            max_scan: 16,
            ..FrameCodec::default()
        };
        let payload = [0u8; 16];
        let header = FrameHeader::request(Command::LoadData, 1, &payload);
        writer.write_frame(&mut host, &header, &payload).await.unwrap();

        let err = reader.read_frame(&mut device).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn paced_write_delivers_everything() {
        let (mut host, mut device) = LocalLink::pair();
        let codec = FrameCodec::paced(16, Duration::from_millis(1));
        let payload: Vec<u8> = (0..100u8).collect();
        let header = FrameHeader::request(Command::ScriptData, 2, &payload);

        codec.write_frame(&mut host, &header, &payload).await.unwrap();
        let frame = codec.read_frame(&mut device).await.unwrap();
        assert_eq!(frame.payload, payload);
    }

    #[tokio::test]
    async fn closed_link_is_eof() {
        let (host, mut device) = LocalLink::pair();
        drop(host);
        let err = FrameCodec::default().read_frame(&mut device).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
