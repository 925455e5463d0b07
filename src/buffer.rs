//! Per-socket inbound byte queue.
//!
//! One buffer stores either whole datagrams (`push`, one element per
//! packet) or a byte stream (`append`, concatenated onto the tail).
//! A zero-length element is meaningful in both modes: for datagrams it
//! is an empty packet, for streams it marks end-of-stream, which is why
//! `append` never concatenates onto or after an empty element.

use std::collections::VecDeque;

#[derive(Default)]
pub struct Buffer {
    queue: VecDeque<Vec<u8>>,
    /// Native error code of the last failed read, written by the pool.
    pub error: i32,
}

impl Buffer {
    pub fn new() -> Buffer {
        Buffer::default()
    }

    pub fn empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Enqueues one datagram, zero-length included.
    pub fn push(&mut self, data: &[u8]) {
        self.queue.push_back(data.to_vec());
    }

    /// Appends stream data onto the tail element.
    ///
    /// An empty queue or a zero-length chunk opens a fresh element; the
    /// latter is the EOF marker.
    pub fn append(&mut self, data: &[u8]) {
        match self.queue.back_mut() {
            Some(tail) if !data.is_empty() => tail.extend_from_slice(data),
            _ => self.queue.push_back(data.to_vec()),
        }
    }

    pub fn front(&self) -> Option<&[u8]> {
        self.queue.front().map(Vec::as_slice)
    }

    pub fn pop(&mut self) {
        self.queue.pop_front();
    }

    /// Removes one zero-terminated span from the head element.
    ///
    /// Drops the bytes through the first zero plus any zeros directly
    /// following it. When the head holds no zero, the zero is terminal,
    /// or nothing non-zero remains, the whole head element is removed.
    pub fn extract(&mut self) {
        let Some(head) = self.queue.front_mut() else {
            return;
        };
        match head.iter().position(|&b| b == 0) {
            Some(pos) if pos + 1 < head.len() => {
                match head[pos..].iter().position(|&b| b != 0) {
                    Some(skip) => {
                        head.drain(..pos + skip);
                    }
                    None => {
                        self.queue.pop_front();
                    }
                }
            }
            _ => {
                self.queue.pop_front();
            }
        }
    }
}
