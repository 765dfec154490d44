use std::fmt::{Debug, Formatter};
use std::ops::Range;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;

/// A fixed-size byte buffer that read requests write into.
///
/// The allocation is made once and never moves, so the address of every byte is stable for
/// the lifetime of the buffer. This is what allows the stack to reason about memory
/// alignment of read targets: an [`IoBuffer`] created with [`IoBuffer::aligned`] begins at a
/// multiple of the requested alignment, and any [`BufferView`] into it has an address that
/// can be checked against a device's requirements.
///
/// Internally, it over-allocates by up to the alignment size and pads the front as
/// necessary, reads and writes only see the region after the padding.
///
/// Buffers are cheaply cloneable handles and may be written from I/O worker threads. Writes
/// go through a lock, stages only ever hand out non-overlapping views to concurrent readers.
#[derive(Clone)]
pub struct IoBuffer(Arc<Inner>);

struct Inner {
    data: Mutex<Vec<u8>>,
    padding: usize,
    len: usize,
    alignment: usize,
    address: usize,
}

impl IoBuffer {
    /// Allocate a zeroed buffer of `len` bytes with no alignment guarantee.
    pub fn new(len: usize) -> Self {
        Self::aligned(len, 1)
    }

    /// Allocate a zeroed buffer of `len` bytes whose first byte is aligned to `alignment`.
    ///
    /// # Panics
    ///
    /// Panics if `alignment` is not a power of two.
    pub fn aligned(len: usize, alignment: usize) -> Self {
        assert!(
            alignment.is_power_of_two(),
            "buffer alignment {alignment} is not a power of two"
        );

        // Allocate up to `alignment` extra bytes, in case we need to pad the start.
        let mut buf = Vec::<u8>::with_capacity(len + alignment - 1);
        let padding = buf.as_ptr().align_offset(alignment);
        // Stays within the reserved capacity, so the allocation does not move.
        buf.resize(padding + len, 0);
        let address = buf.as_ptr() as usize + padding;

        Self(Arc::new(Inner {
            data: Mutex::new(buf),
            padding,
            len,
            alignment,
            address,
        }))
    }

    /// Allocate an unaligned buffer holding a copy of `data`.
    pub fn copy_from(data: &[u8]) -> Self {
        let buffer = Self::new(data.len());
        buffer.view(0..data.len()).write(0, data);
        buffer
    }

    /// Usable length of this buffer in bytes.
    pub fn len(&self) -> usize {
        self.0.len
    }

    /// Returns true if the buffer holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.0.len == 0
    }

    /// The alignment requested when the buffer was allocated.
    pub fn alignment(&self) -> usize {
        self.0.alignment
    }

    /// The memory address of the first usable byte.
    pub fn address(&self) -> usize {
        self.0.address
    }

    /// A view on the given byte range of this buffer.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub fn view(&self, range: Range<usize>) -> BufferView {
        assert!(
            range.start <= range.end && range.end <= self.len(),
            "view {}..{} out of bounds for buffer of {} bytes",
            range.start,
            range.end,
            self.len()
        );
        BufferView {
            buffer: self.clone(),
            offset: range.start,
            len: range.end - range.start,
        }
    }

    /// A view covering the entire buffer.
    pub fn full_view(&self) -> BufferView {
        self.view(0..self.len())
    }

    /// Copy the contents of the buffer out into a vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.full_view().to_vec()
    }

    /// Move the contents out of the buffer as [`Bytes`] without copying.
    ///
    /// The returned bytes keep the alignment of the buffer. The buffer, and every view into
    /// it, is left empty: subsequent reads observe zero bytes and writes are discarded.
    pub fn take_bytes(&self) -> Bytes {
        let buf = std::mem::take(&mut *self.0.data.lock());
        if buf.is_empty() {
            return Bytes::new();
        }
        Bytes::from(buf).slice(self.0.padding..self.0.padding + self.0.len)
    }

    fn with_data<R>(&self, range: Range<usize>, f: impl FnOnce(&[u8]) -> R) -> R {
        let data = self.0.data.lock();
        let start = self.0.padding + range.start;
        let end = self.0.padding + range.end;
        f(data.get(start..end).unwrap_or_default())
    }

    fn with_data_mut<R>(&self, range: Range<usize>, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut data = self.0.data.lock();
        let start = self.0.padding + range.start;
        let end = self.0.padding + range.end;
        f(data.get_mut(start..end).unwrap_or_default())
    }
}

impl Debug for IoBuffer {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IoBuffer")
            .field("len", &self.0.len)
            .field("alignment", &self.0.alignment)
            .field("address", &format_args!("{:#x}", self.0.address))
            .finish()
    }
}

/// A window onto an [`IoBuffer`], used as the output target of a read.
#[derive(Clone)]
pub struct BufferView {
    buffer: IoBuffer,
    offset: usize,
    len: usize,
}

impl BufferView {
    /// The buffer this view is part of.
    pub fn buffer(&self) -> &IoBuffer {
        &self.buffer
    }

    /// The offset of this view from the start of its buffer.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// The length of the view in bytes.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the view is zero-sized.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The memory address of the first byte of the view.
    pub fn address(&self) -> usize {
        self.buffer.address() + self.offset
    }

    /// A sub-view, with the range relative to the start of this view.
    ///
    /// # Panics
    ///
    /// Panics if the range is out of bounds.
    pub fn slice(&self, range: Range<usize>) -> BufferView {
        assert!(
            range.start <= range.end && range.end <= self.len,
            "slice {}..{} out of bounds for view of {} bytes",
            range.start,
            range.end,
            self.len
        );
        BufferView {
            buffer: self.buffer.clone(),
            offset: self.offset + range.start,
            len: range.end - range.start,
        }
    }

    /// Run `f` with shared access to the bytes of the view.
    pub fn with_slice<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        self.buffer.with_data(self.range(), f)
    }

    /// Run `f` with exclusive access to the bytes of the view.
    pub fn with_slice_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        self.buffer.with_data_mut(self.range(), f)
    }

    /// Write `data` into the view starting at `at`.
    ///
    /// # Panics
    ///
    /// Panics if the data does not fit.
    pub fn write(&self, at: usize, data: &[u8]) {
        assert!(
            at + data.len() <= self.len,
            "write of {} bytes at {at} overflows view of {} bytes",
            data.len(),
            self.len
        );
        self.with_slice_mut(|dst| {
            if let Some(dst) = dst.get_mut(at..at + data.len()) {
                dst.copy_from_slice(data);
            }
        })
    }

    /// Copy `len` bytes starting at `src_offset` of this view into the start of `target`.
    ///
    /// # Panics
    ///
    /// Panics if either range is out of bounds.
    pub fn copy_into(&self, src_offset: usize, len: usize, target: &BufferView) {
        assert!(
            src_offset + len <= self.len && len <= target.len,
            "copy of {len} bytes at {src_offset} out of bounds"
        );
        if Arc::ptr_eq(&self.buffer.0, &target.buffer.0) {
            let src = self.offset + src_offset;
            let dst = target.offset;
            self.buffer.with_data_mut(0..self.buffer.len(), |data| {
                if src + len <= data.len() && dst + len <= data.len() {
                    data.copy_within(src..src + len, dst);
                }
            });
            return;
        }

        self.slice(src_offset..src_offset + len)
            .with_slice(|src| target.slice(0..len).write(0, src));
    }

    /// Copy the bytes of the view out into a vector.
    pub fn to_vec(&self) -> Vec<u8> {
        self.with_slice(|data| data.to_vec())
    }

    fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }
}

impl Debug for BufferView {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferView")
            .field("offset", &self.offset)
            .field("len", &self.len)
            .field("address", &format_args!("{:#x}", self.address()))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::buffer::IoBuffer;

    #[test]
    fn test_align() {
        let buffer = IoBuffer::aligned(1, 128);
        assert_eq!(buffer.address() % 128, 0);
        assert_eq!(buffer.len(), 1);

        let buffer = IoBuffer::aligned(4097, 4096);
        let view = buffer.view(1..4097);
        assert_eq!(view.address() % 4096, 1);
    }

    #[test]
    fn writes_land_in_view_window() {
        let buffer = IoBuffer::new(8);
        let view = buffer.view(2..6);
        view.write(1, b"ab");
        view.slice(3..4).write(0, b"c");

        assert_eq!(buffer.to_vec(), b"\0\0\0abc\0\0");
        assert_eq!(view.to_vec(), b"\0abc");
    }

    #[test]
    fn copy_between_buffers() {
        let scratch = IoBuffer::copy_from(b"xxhello");
        let output = IoBuffer::new(5);
        scratch.full_view().copy_into(2, 5, &output.full_view());
        assert_eq!(output.to_vec(), b"hello");
    }

    #[test]
    fn copy_within_one_buffer() {
        let buffer = IoBuffer::copy_from(b"abcdef");
        let view = buffer.full_view();
        view.copy_into(3, 3, &view.slice(0..3));
        assert_eq!(buffer.to_vec(), b"defdef");
    }

    #[test]
    fn take_bytes_preserves_alignment() {
        let buffer = IoBuffer::aligned(16, 64);
        buffer.view(0..16).write(0, b"0123456789abcdef");

        let bytes = buffer.take_bytes();
        assert_eq!(bytes.as_ref(), b"0123456789abcdef");
        assert_eq!(bytes.as_ptr().align_offset(64), 0);

        // The buffer is drained.
        assert!(buffer.full_view().to_vec().is_empty());
        assert!(buffer.take_bytes().is_empty());
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn view_out_of_bounds() {
        IoBuffer::new(4).view(2..6);
    }
}
