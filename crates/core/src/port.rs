//! Memory request port contract.
//!
//! A port serves one request at a time. The client hands a request over with
//! [`MemoryPort::submit`] exactly once, then calls [`MemoryPort::poll`] on each
//! following tick until the outcome is [`PortOutcome::Completed`]. A client
//! must not submit again while a request is unresolved.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryOp {
    Read,
    Write,
}

/// Which store a request is aimed at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestTarget {
    /// Linear backing store, addressed in 16-bit words
    BackingStore,
    /// Internal control/status word file
    Control,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryRequest {
    pub target: RequestTarget,
    /// Word offset inside the target
    pub address: u32,
    pub op: MemoryOp,
    /// Payload for writes
    pub data: Option<u16>,
}

impl MemoryRequest {
    pub fn read(target: RequestTarget, address: u32) -> Self {
        Self {
            target,
            address,
            op: MemoryOp::Read,
            data: None,
        }
    }

    pub fn write(target: RequestTarget, address: u32, data: u16) -> Self {
        Self {
            target,
            address,
            op: MemoryOp::Write,
            data: Some(data),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PortOutcome {
    /// Finished; reads carry their data
    Completed(Option<u16>),
    /// Still working (latency, refresh); poll again next tick
    Busy,
}

pub trait MemoryPort {
    /// Hand a request to the port. Completes in the same tick when possible.
    fn submit(&mut self, request: MemoryRequest) -> PortOutcome;

    /// Progress of the request handed over by the last `submit`.
    fn poll(&mut self) -> PortOutcome;

    /// The port is in a known long stall (refresh); clients may defer
    /// submitting until it clears.
    fn refresh_in_progress(&self) -> bool {
        false
    }
}
