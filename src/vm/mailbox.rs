//! Shared text mailbox.
//!
//! A fixed-size byte buffer that scripts append to and the host drains with
//! MAILBOX_RD. The text always ends with a NUL inside the buffer, so at most
//! `capacity - 1` bytes of text fit.

use std::sync::{Arc, Mutex};

struct Slot {
    buf: Box<[u8]>,
    len: usize,
}

/// Cloneable handle to one mailbox buffer.
#[derive(Clone)]
pub struct Mailbox {
    slot: Arc<Mutex<Slot>>,
}

impl Mailbox {
    /// Creates a mailbox with `capacity` bytes of storage (at least 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slot: Arc::new(Mutex::new(Slot {
                buf: vec![0u8; capacity].into_boxed_slice(),
                len: 0,
            })),
        }
    }

    fn with_slot<R>(&self, f: impl FnOnce(&mut Slot) -> R) -> R {
        let mut guard = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    pub fn capacity(&self) -> usize {
        self.with_slot(|s| s.buf.len())
    }

    /// Bytes of text currently held.
    pub fn len(&self) -> usize {
        self.with_slot(|s| s.len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.with_slot(|s| {
            s.len = 0;
            s.buf[0] = 0;
        });
    }

    /// Appends `text`, silently dropping whatever does not fit.
    ///
    /// Returns the number of bytes stored.
    pub fn append(&self, text: &[u8]) -> usize {
        // text is NUL-terminated inside the buffer, embedded NULs end it
        let text = text.split(|&b| b == 0).next().unwrap_or_default();
        self.with_slot(|s| {
            let room = s.buf.len() - 1 - s.len;
            let n = text.len().min(room);
            let start = s.len;
            s.buf[start..start + n].copy_from_slice(&text[..n]);
            s.len += n;
            let end = s.len;
            s.buf[end] = 0;
            n
        })
    }

    /// Copies out up to `max` bytes of text, stopping at the terminator.
    pub fn read(&self, max: usize) -> Vec<u8> {
        self.with_slot(|s| {
            let n = max.min(s.buf.len()).min(s.len);
            s.buf[..n].to_vec()
        })
    }

    /// Whole text as a lossy string.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.read(usize::MAX)).into_owned()
    }

    /// Raw buffer contents, terminator included.
    pub fn raw(&self) -> Vec<u8> {
        self.with_slot(|s| s.buf.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_truncates_and_terminates() {
        let mailbox = Mailbox::new(8);
        assert_eq!(mailbox.append(b"hello"), 5);
        assert_eq!(mailbox.append(b" world"), 2);
        assert_eq!(mailbox.text(), "hello w");
        assert_eq!(mailbox.len(), 7);
        assert_eq!(mailbox.raw()[7], 0);
        assert_eq!(mailbox.append(b"!"), 0);
    }

    #[test]
    fn read_is_clamped() {
        let mailbox = Mailbox::new(16);
        mailbox.append(b"abcdef");
        assert_eq!(mailbox.read(3), b"abc");
        assert_eq!(mailbox.read(100), b"abcdef");
        assert_eq!(mailbox.read(0), b"");
    }

    #[test]
    fn clear_empties_shared_handles() {
        let mailbox = Mailbox::new(4);
        let other = mailbox.clone();
        mailbox.append(b"ab");
        assert!(!other.is_empty());
        other.clear();
        assert!(mailbox.is_empty());
        assert_eq!(mailbox.raw()[0], 0);
    }

    #[test]
    fn embedded_nul_ends_text() {
        let mailbox = Mailbox::new(16);
        assert_eq!(mailbox.append(b"ok\0junk"), 2);
        assert_eq!(mailbox.text(), "ok");
    }

    #[test]
    fn one_byte_mailbox_holds_nothing() {
        let mailbox = Mailbox::new(0);
        assert_eq!(mailbox.capacity(), 1);
        assert_eq!(mailbox.append(b"x"), 0);
        assert!(mailbox.is_empty());
    }
}
