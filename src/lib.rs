//! # NIC adapter data path
//!
//! Host-side receive pipeline and firmware command/response correlation for
//! an adapter whose firmware communicates through descriptor rings: the
//! producer/consumer ring protocol, the receive-buffer lifecycle, the LRO
//! flow cache, and the bounded completion-id space used to match
//! asynchronous firmware replies to host requests.
//!
//! Register I/O, BAR mapping, and interrupt-vector plumbing live outside
//! this crate; hardware events enter through the typed surface on
//! [`device::DeviceContext`].

pub mod correlator;
pub mod device;
pub mod dma;
pub mod flow;
pub mod lro;
pub mod mem_pool;
pub mod poller;
pub mod proto;
pub mod ring;
pub mod rx_buffer;
