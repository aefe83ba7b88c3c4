//! Incremental reassembly of length-prefixed frames from arbitrary reads.
//!
//! The assembler exposes a receive *window* (the bytes still missing for the
//! current phase) and is advanced by however many bytes one `recv()` filled.
//! A phase completes exactly when the window is exhausted, so the result is
//! identical whether a frame arrives in one read or one byte at a time.

use std::sync::Arc;

use crate::memory::{Memory, MessageBuf};
use crate::packet::{FrameError, PKG_HEADER_LEN, PacketHeader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecvState {
    HeaderInit,
    HeaderPartial,
    BodyInit,
    BodyPartial,
    Complete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// More bytes are needed.
    Pending,
    /// A full frame is ready; collect it with [`FrameAssembler::take_frame`].
    Complete,
    /// The header was rejected and the assembler reset to `HeaderInit`.
    Malformed(FrameError),
}

pub struct FrameAssembler {
    state: RecvState,
    header: [u8; PKG_HEADER_LEN],
    frame: Option<MessageBuf>,
    cursor: usize,
    remaining: usize,
    max_len: usize,
    memory: Arc<Memory>,
}

impl FrameAssembler {
    pub fn new(memory: Arc<Memory>, max_len: usize) -> Self {
        Self {
            state: RecvState::HeaderInit,
            header: [0; PKG_HEADER_LEN],
            frame: None,
            cursor: 0,
            remaining: PKG_HEADER_LEN,
            max_len,
            memory,
        }
    }

    pub fn state(&self) -> RecvState {
        self.state
    }

    /// Bytes still expected for the current phase.
    pub fn remaining(&self) -> usize {
        self.remaining
    }

    /// Destination for the next read. Empty only while a frame awaits collection.
    pub fn window(&mut self) -> &mut [u8] {
        let (start, end) = (self.cursor, self.cursor + self.remaining);
        match self.state {
            RecvState::HeaderInit | RecvState::HeaderPartial => &mut self.header[start..end],
            RecvState::BodyInit | RecvState::BodyPartial => match self.frame.as_mut() {
                Some(frame) => &mut frame[start..end],
                None => &mut [],
            },
            RecvState::Complete => &mut [],
        }
    }

    /// Account for `n` bytes written into [`window`](Self::window).
    pub fn advance(&mut self, n: usize) -> Progress {
        let n = n.min(self.remaining);
        self.cursor += n;
        self.remaining -= n;

        match self.state {
            RecvState::HeaderInit | RecvState::HeaderPartial => {
                if self.remaining > 0 {
                    self.state = RecvState::HeaderPartial;
                    Progress::Pending
                } else {
                    self.header_complete()
                }
            }
            RecvState::BodyInit | RecvState::BodyPartial => {
                if self.remaining > 0 {
                    self.state = RecvState::BodyPartial;
                    Progress::Pending
                } else {
                    self.state = RecvState::Complete;
                    Progress::Complete
                }
            }
            RecvState::Complete => Progress::Complete,
        }
    }

    fn header_complete(&mut self) -> Progress {
        let Some(header) = PacketHeader::decode(&self.header) else {
            self.reset();
            return Progress::Pending;
        };
        if let Err(err) = header.validate(self.max_len) {
            self.reset();
            return Progress::Malformed(err);
        }

        let mut frame = self.memory.alloc(header.total_length as usize);
        frame[..PKG_HEADER_LEN].copy_from_slice(&self.header);
        self.frame = Some(frame);

        let body_len = header.body_len();
        if body_len == 0 {
            self.state = RecvState::Complete;
            return Progress::Complete;
        }
        self.state = RecvState::BodyInit;
        self.cursor = PKG_HEADER_LEN;
        self.remaining = body_len;
        Progress::Pending
    }

    /// Hand over the completed frame (header + body) and start the next one.
    pub fn take_frame(&mut self) -> Option<MessageBuf> {
        if self.state != RecvState::Complete {
            return None;
        }
        let frame = self.frame.take();
        self.reset();
        frame
    }

    /// Drop any partial frame and wait for a fresh header.
    pub fn reset(&mut self) {
        self.state = RecvState::HeaderInit;
        self.frame = None;
        self.cursor = 0;
        self.remaining = PKG_HEADER_LEN;
    }

    /// Push a byte slice through the state machine, collecting every frame
    /// outcome it produces. Reads from a socket go through
    /// [`window`](Self::window) instead; this is the in-memory equivalent.
    pub fn feed(&mut self, mut bytes: &[u8]) -> Vec<Result<MessageBuf, FrameError>> {
        let mut out = Vec::new();
        while !bytes.is_empty() {
            let window = self.window();
            let n = window.len().min(bytes.len());
            window[..n].copy_from_slice(&bytes[..n]);
            bytes = &bytes[n..];
            match self.advance(n) {
                Progress::Pending => {}
                Progress::Complete => {
                    if let Some(frame) = self.take_frame() {
                        out.push(Ok(frame));
                    }
                }
                Progress::Malformed(err) => out.push(Err(err)),
            }
        }
        out
    }
}

impl std::fmt::Debug for FrameAssembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameAssembler")
            .field("state", &self.state)
            .field("cursor", &self.cursor)
            .field("remaining", &self.remaining)
            .finish()
    }
}
