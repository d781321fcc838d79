//! Growable byte buffer with separate read and write cursors.
//!
//! Layout: `[prepend area | readable bytes | writable space]`. The read
//! cursor only moves forward; the wasted prefix is reclaimed by sliding the
//! live bytes back to the prepend reserve when that avoids a reallocation.

use std::io;
use std::os::fd::RawFd;

/// Space kept in front of the readable region so a frame header can be
/// prepended without moving the payload.
pub const PREPEND_RESERVE: usize = 8;

const INITIAL_SIZE: usize = 1024;

/// Stack-local spillover for `read_from_fd`. Bounds the number of read
/// syscalls under a burst while keeping the steady-state buffer small.
const EXTRA_BUF_LEN: usize = 64 * 1024;

pub struct Buffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Default for Buffer {
    fn default() -> Self {
        Buffer::new()
    }
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(capacity: usize) -> Buffer {
        Buffer {
            data: vec![0; PREPEND_RESERVE + capacity],
            read_pos: PREPEND_RESERVE,
            write_pos: PREPEND_RESERVE,
        }
    }

    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn writable_bytes(&self) -> usize {
        self.data.len() - self.write_pos
    }

    pub fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    pub fn is_empty(&self) -> bool {
        self.readable_bytes() == 0
    }

    /// Borrowed view of the readable bytes.
    pub fn peek(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Drop `n` readable bytes. Dropping everything resets both cursors so
    /// the full region becomes writable again.
    pub fn retrieve(&mut self, n: usize) {
        if n < self.readable_bytes() {
            self.read_pos += n;
        } else {
            self.retrieve_all();
        }
    }

    pub fn retrieve_all(&mut self) {
        self.read_pos = PREPEND_RESERVE;
        self.write_pos = PREPEND_RESERVE;
    }

    /// Copy out and drop up to `n` readable bytes.
    pub fn retrieve_as_vec(&mut self, n: usize) -> Vec<u8> {
        let n = n.min(self.readable_bytes());
        let out = self.peek()[..n].to_vec();
        self.retrieve(n);
        out
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.data[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    /// Write into the prepend area, immediately in front of the readable
    /// bytes.
    ///
    /// # Panics
    ///
    /// Panics if `data` is larger than `prependable_bytes()`.
    pub fn prepend(&mut self, data: &[u8]) {
        assert!(
            data.len() <= self.prependable_bytes(),
            "prepend of {} bytes exceeds prependable space {}",
            data.len(),
            self.prependable_bytes()
        );
        self.read_pos -= data.len();
        self.data[self.read_pos..self.read_pos + data.len()].copy_from_slice(data);
    }

    /// Make room for at least `n` more writable bytes: slide the live bytes
    /// back over the wasted prefix when that suffices, otherwise grow by
    /// doubling.
    pub fn ensure_writable(&mut self, n: usize) {
        if self.writable_bytes() >= n {
            return;
        }
        if self.prependable_bytes() + self.writable_bytes() >= n + PREPEND_RESERVE {
            let readable = self.readable_bytes();
            self.data.copy_within(self.read_pos..self.write_pos, PREPEND_RESERVE);
            self.read_pos = PREPEND_RESERVE;
            self.write_pos = PREPEND_RESERVE + readable;
        } else {
            let needed = self.write_pos + n;
            let new_len = (self.data.len() * 2).max(needed);
            self.data.resize(new_len, 0);
        }
    }

    /// Scatter-read from `fd`: first into the writable tail, spilling into a
    /// 64 KiB stack buffer that is appended afterwards. Returns the number
    /// of bytes read (0 on EOF).
    pub fn read_from_fd(&mut self, fd: RawFd) -> io::Result<usize> {
        let mut extra = [0u8; EXTRA_BUF_LEN];
        let writable = self.writable_bytes();
        let mut iov = [
            libc::iovec {
                iov_base: self.data[self.write_pos..].as_mut_ptr() as *mut libc::c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut libc::c_void,
                iov_len: EXTRA_BUF_LEN,
            },
        ];
        let iovcnt: libc::c_int = if writable < EXTRA_BUF_LEN { 2 } else { 1 };
        let n = unsafe { libc::readv(fd, iov.as_mut_ptr(), iovcnt) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        let n = n as usize;
        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.data.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }
}
