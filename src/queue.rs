// SPDX-License-Identifier: MPL-2.0

//! Device-side view of the message-queue transport.
//!
//! The transport itself (rings, descriptors, notification suppression) lives
//! outside this crate. The core only needs to pull descriptor chains off a
//! queue, fill their device-writable side, and hand them back, so that is
//! the whole seam.

use crate::prelude::*;

/// One descriptor chain popped from a queue.
///
/// `out` is what the driver wrote for the device to read; the device may
/// write up to `in_capacity` bytes back.
#[derive(Debug)]
pub struct DescChain {
    out: Vec<u8>,
    in_capacity: usize,
    in_written: Vec<u8>,
}

impl DescChain {
    pub fn new(out: Vec<u8>, in_capacity: usize) -> Self {
        DescChain {
            out,
            in_capacity,
            in_written: Vec::new(),
        }
    }

    /// The driver-written, device-readable bytes.
    pub fn out_bytes(&self) -> &[u8] {
        &self.out
    }

    /// Capacity of the device-writable side.
    pub fn in_capacity(&self) -> usize {
        self.in_capacity
    }

    /// Appends device-written bytes to the writable side.
    pub fn write_in(&mut self, bytes: &[u8]) -> Result<()> {
        if self.in_written.len() + bytes.len() > self.in_capacity {
            return_errno_with_msg!(IoFailed, "descriptor chain in-buffer overflow");
        }
        self.in_written.extend_from_slice(bytes);
        Ok(())
    }

    /// The bytes written by the device so far.
    pub fn in_bytes(&self) -> &[u8] {
        &self.in_written
    }

    /// Number of bytes written by the device, as reported on completion.
    pub fn written(&self) -> u32 {
        self.in_written.len() as u32
    }
}

/// What the device core needs from a driver-facing queue.
///
/// `pop` hands out the next available chain. `push` completes a chain,
/// making `chain.written()` bytes visible to the driver. `detach` returns a
/// chain to the transport *without* completing it; the transport must not
/// hand it back to this device again before the queue is reset.
pub trait DriverQueue: Send {
    fn pop(&mut self) -> Option<DescChain>;
    fn push(&mut self, chain: DescChain);
    fn detach(&mut self, chain: DescChain);
}
