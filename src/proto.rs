//! Typed firmware protocol records.
//!
//! The wire bit layout of the hardware is out of scope; records that cross
//! the host/firmware boundary are expressed as plain structs and enums and
//! carried through the descriptor rings as-is. The thin hardware adapter
//! decodes real descriptors into these types before anything else runs.

use crate::correlator::CompletionId;
use crate::flow::FlowKey;
use crate::rx_buffer::RxBufferHandle;
use bitflags::bitflags;

/// Ownership tag on a ring slot. A slot owned by [`Owner::Device`] must not
/// be read by the host; consuming a slot hands it back to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Owner {
    Host,
    Device,
}

bitflags! {
    /// Out-of-band metadata accompanying an upper-layer handoff.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HandoffFlags: u16 {
        const CSUM_OK = 1 << 0; // L3/L4 checksum verified by firmware
        const RSS_HASH_VALID = 1 << 1;
        const LRO_AGGREGATED = 1 << 2;
    }
}

/// Per-packet metadata. Interpreted by the upper layer, not by this crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketMeta {
    pub vlan: Option<u16>,
    pub rss_hash: u32,
    pub flags: HandoffFlags,
}

/// A fully reassembled packet handed to the host receive entry point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredPacket {
    pub data: Vec<u8>,
    pub meta: PacketMeta,
}

/// Record types the firmware posts into a status ring.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusRecord {
    /// One plain packet in one receive buffer.
    Packet {
        buffer: RxBufferHandle,
        len: u32,
        meta: PacketMeta,
    },
    /// An LRO aggregate that fits a single receive buffer.
    LroContiguous {
        buffer: RxBufferHandle,
        len: u32,
        meta: PacketMeta,
    },
    /// An LRO aggregate chained across several receive buffers, each with
    /// its own byte count.
    LroChained {
        buffers: Vec<(RxBufferHandle, u32)>,
        meta: PacketMeta,
    },
    /// Firmware accepted an "add flow" request.
    FlowAddConfirm { key: FlowKey },
    /// Firmware ended or evicted a flow; the host entry must be dropped.
    FlowDeleteNotify { key: FlowKey },
    /// First slot of a firmware response message. `extra` continuation
    /// slots follow; the span is consumed only once its last slot is
    /// host-owned.
    ResponseHeader {
        id: CompletionId,
        word: u64,
        extra: u8,
    },
    /// Continuation slot of a multi-descriptor response message.
    ResponseContinuation { word: u64 },
    /// Firmware finished DMA for `count` command descriptors.
    TxReclaim { count: u32 },
    /// Unrecognized record type. Logged and dropped, never fatal.
    Unknown { opcode: u8 },
}

impl Default for StatusRecord {
    fn default() -> Self {
        StatusRecord::Unknown { opcode: 0 }
    }
}

/// Status-ring slot: a record plus its ownership tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusDescriptor {
    pub(crate) owner: Owner,
    pub record: StatusRecord,
}

impl StatusDescriptor {
    /// A slot as the firmware posts it: writeback complete, host may read.
    pub fn host_owned(record: StatusRecord) -> Self {
        Self {
            owner: Owner::Host,
            record,
        }
    }

    /// A slot still being filled by the device.
    pub fn device_owned(record: StatusRecord) -> Self {
        Self {
            owner: Owner::Device,
            record,
        }
    }
}

impl Default for StatusDescriptor {
    fn default() -> Self {
        Self {
            owner: Owner::Device,
            record: StatusRecord::default(),
        }
    }
}

/// Descriptor the host posts to hand a receive buffer to the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RxPostDescriptor {
    pub(crate) owner: Owner,
    pub buffer: RxBufferHandle,
    pub bus_addr: u64,
    pub len: u32,
}

impl Default for RxPostDescriptor {
    fn default() -> Self {
        Self {
            owner: Owner::Device,
            buffer: RxBufferHandle(0),
            bus_addr: 0,
            len: 0,
        }
    }
}

/// Host-issued request that expects an asynchronous firmware reply or at
/// least a reclaim of its command descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareRequest {
    pub context_id: u32,
    pub completion_id: Option<CompletionId>,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    AddLroFlow {
        key: FlowKey,
        rss_hash: u32,
        initial_seq: u32,
        tsval: Option<u32>,
    },
    DeleteLroFlow { key: FlowKey },
    /// Tear down all firmware state owned by `context_id`.
    CleanupContext,
    Generic { word: u64 },
}

/// Command-ring slot contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandRecord {
    /// Outbound frame. The data rides in the descriptor here; the real
    /// adapter DMAs from a bounce buffer instead.
    TxPacket { data: Vec<u8> },
    Request(FirmwareRequest),
    Nop,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandDescriptor {
    pub(crate) owner: Owner,
    pub record: CommandRecord,
}

impl CommandDescriptor {
    pub fn new(record: CommandRecord) -> Self {
        Self {
            owner: Owner::Device,
            record,
        }
    }
}

impl Default for CommandDescriptor {
    fn default() -> Self {
        Self {
            owner: Owner::Device,
            record: CommandRecord::Nop,
        }
    }
}

macro_rules! owner_tagged {
    ($($t:ty),*) => {
        $(impl crate::ring::OwnerTagged for $t {
            fn owner(&self) -> Owner {
                self.owner
            }

            fn set_owner(&mut self, owner: Owner) {
                self.owner = owner;
            }
        })*
    };
}

owner_tagged!(StatusDescriptor, RxPostDescriptor, CommandDescriptor);
