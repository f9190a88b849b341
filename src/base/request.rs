use std::any::Any;
use std::fmt;

use crate::timeq::{Tick, MAX_TICK};

/// Monotonic id assigned by the issuing port.  Zero means "not yet submitted".
pub type RequestId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Read,
    Write,
    ReadExclusive,
    WriteInvalidate,
    Invalidate,
    Prefetch,
    Flush,
}

impl RequestKind {
    pub fn is_read(self) -> bool {
        matches!(self, RequestKind::Read | RequestKind::ReadExclusive)
    }

    pub fn is_write(self) -> bool {
        matches!(self, RequestKind::Write | RequestKind::WriteInvalidate)
    }
}

/// Half-open address range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddrRange {
    pub start: u64,
    pub end: u64,
}

impl AddrRange {
    pub const FULL: AddrRange = AddrRange {
        start: 0,
        end: u64::MAX,
    };

    pub fn new(start: u64, size: u64) -> Self {
        Self {
            start,
            end: start.saturating_add(size),
        }
    }

    pub fn size(&self) -> u64 {
        self.end - self.start
    }

    /// Whether `[addr, addr + len)` lies entirely inside the range.
    pub fn contains(&self, addr: u64, len: u64) -> bool {
        match addr.checked_add(len) {
            Some(last) => addr >= self.start && last <= self.end,
            None => false,
        }
    }
}

pub struct MemoryRequest {
    pub id: RequestId,
    pub kind: RequestKind,
    pub address: u64,
    pub size: u32,
    pub data: Vec<u8>,
    pub request_tick: Tick,
    pub response_tick: Tick,
    /// Caller-owned state carried through to the completion callback.
    pub context: Option<Box<dyn Any>>,
    pub completed: bool,
    pub success: bool,
}

impl MemoryRequest {
    pub fn new(kind: RequestKind, address: u64, size: u32) -> Self {
        let data = if kind.is_write() {
            vec![0; size as usize]
        } else {
            Vec::new()
        };
        Self {
            id: 0,
            kind,
            address,
            size,
            data,
            request_tick: MAX_TICK,
            response_tick: MAX_TICK,
            context: None,
            completed: false,
            success: false,
        }
    }

    pub fn read(address: u64, size: u32) -> Self {
        Self::new(RequestKind::Read, address, size)
    }

    /// Write request whose size is taken from the payload.
    pub fn write(address: u64, data: Vec<u8>) -> Self {
        Self {
            size: data.len() as u32,
            data,
            ..Self::new(RequestKind::Write, address, 0)
        }
    }

    pub fn with_context<C: Any>(mut self, context: C) -> Self {
        self.context = Some(Box::new(context));
        self
    }

    pub fn context_ref<C: Any>(&self) -> Option<&C> {
        self.context.as_ref().and_then(|ctx| ctx.downcast_ref::<C>())
    }

    pub fn is_read(&self) -> bool {
        self.kind.is_read()
    }

    pub fn is_write(&self) -> bool {
        self.kind.is_write()
    }

    /// Ticks between submission and response, once both are known.
    pub fn latency(&self) -> Option<Tick> {
        if self.request_tick == MAX_TICK || self.response_tick == MAX_TICK {
            return None;
        }
        Some(self.response_tick.saturating_sub(self.request_tick))
    }

    pub(crate) fn mark_done(&mut self, success: bool) {
        self.completed = true;
        self.success = success;
    }
}

impl fmt::Debug for MemoryRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRequest")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("address", &format_args!("{:#x}", self.address))
            .field("size", &self.size)
            .field("request_tick", &self.request_tick)
            .field("response_tick", &self.response_tick)
            .field("completed", &self.completed)
            .field("success", &self.success)
            .finish()
    }
}
