//! The closed set of device API verbs a recipe is made of.

use std::fmt;

use serde::{Deserialize, Serialize};

use texpr::VarSpec;

use crate::manikin::{Manikin, MemAlloc};
use crate::unit::{BlasOp, KernelArg};

/// Stream creation flags; recipes default to non-blocking streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamFlags {
    NonBlocking,
    Default,
}

/// Event creation flags; recipes default to timing-disabled, blocking-sync
/// events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventFlags {
    pub disable_timing: bool,
    pub blocking_sync: bool,
}

impl Default for EventFlags {
    fn default() -> Self {
        Self {
            disable_timing: true,
            blocking_sync: true,
        }
    }
}

/// One low-level device API call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DriverCall {
    MemAlloc {
        alloc: MemAlloc,
    },
    MemFree {
        alloc: usize,
    },
    MemcpyAsync {
        dst: Manikin,
        src: Manikin,
        stream: usize,
    },
    MemcpyHtoDAsync {
        dst: Manikin,
        host_src: VarSpec,
        stream: usize,
    },
    MemcpyDtoHAsync {
        host_dst: VarSpec,
        src: Manikin,
        stream: usize,
    },
    MemsetD32Async {
        dst: Manikin,
        value: u32,
        stream: usize,
    },
    StreamCreate {
        id: usize,
        flags: StreamFlags,
    },
    StreamDestroy {
        id: usize,
    },
    StreamWaitEvent {
        stream: usize,
        event: usize,
    },
    EventCreate {
        id: usize,
        flags: EventFlags,
    },
    EventDestroy {
        id: usize,
    },
    EventRecord {
        event: usize,
        stream: usize,
    },
    EventSynchronize {
        event: usize,
    },
    LaunchCKernel {
        name: String,
        work_dim: [u64; 3],
        shared_bytes: usize,
        stream: usize,
        args: Vec<KernelArg>,
    },
    CallCFunc {
        name: String,
        delegate: String,
        stream: usize,
        args: Vec<KernelArg>,
    },
    BlasGemm {
        op_a: BlasOp,
        op_b: BlasOp,
        alpha: f64,
        a: Manikin,
        b: Manikin,
        beta: f64,
        c: Manikin,
        stream: usize,
    },
    Trace {
        uexpr: String,
        result: Manikin,
    },
}

impl fmt::Display for DriverCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriverCall::MemAlloc { alloc } => {
                write!(f, "MemAlloc(#{}, {} bytes)", alloc.id, alloc.bytes)
            }
            DriverCall::MemFree { alloc } => write!(f, "MemFree(#{alloc})"),
            DriverCall::MemcpyAsync { stream, .. } => write!(f, "MemcpyAsync(stream {stream})"),
            DriverCall::MemcpyHtoDAsync {
                host_src, stream, ..
            } => write!(f, "MemcpyHtoDAsync({} -> dev, stream {stream})", host_src.name),
            DriverCall::MemcpyDtoHAsync {
                host_dst, stream, ..
            } => write!(f, "MemcpyDtoHAsync(dev -> {}, stream {stream})", host_dst.name),
            DriverCall::MemsetD32Async { value, stream, .. } => {
                write!(f, "MemsetD32Async({value}, stream {stream})")
            }
            DriverCall::StreamCreate { id, .. } => write!(f, "StreamCreate({id})"),
            DriverCall::StreamDestroy { id } => write!(f, "StreamDestroy({id})"),
            DriverCall::StreamWaitEvent { stream, event } => {
                write!(f, "StreamWaitEvent(stream {stream}, event {event})")
            }
            DriverCall::EventCreate { id, .. } => write!(f, "EventCreate({id})"),
            DriverCall::EventDestroy { id } => write!(f, "EventDestroy({id})"),
            DriverCall::EventRecord { event, stream } => {
                write!(f, "EventRecord(event {event}, stream {stream})")
            }
            DriverCall::EventSynchronize { event } => write!(f, "EventSynchronize({event})"),
            DriverCall::LaunchCKernel {
                name,
                work_dim,
                stream,
                ..
            } => write!(
                f,
                "LaunchCKernel({name}, [{}, {}, {}], stream {stream})",
                work_dim[0], work_dim[1], work_dim[2]
            ),
            DriverCall::CallCFunc { name, stream, .. } => {
                write!(f, "CallCFunc({name}, stream {stream})")
            }
            DriverCall::BlasGemm {
                op_a, op_b, stream, ..
            } => write!(f, "BlasGemm({op_a:?}, {op_b:?}, stream {stream})"),
            DriverCall::Trace { uexpr, .. } => write!(f, "Trace({uexpr})"),
        }
    }
}
