//! hostlink-testkit: an in-process host counterpart.
//!
//! [`MockHost`] implements both host traits — the synchronous entry point
//! and the accelerated submit queue — against the guest's own shared
//! region, so integration tests can drive the full connector without a
//! hypervisor:
//!
//! - version-gated connect and capability reporting,
//! - a configurable responder (echo by default) with response-size
//!   control for overflow scenarios,
//! - chunk reassembly with an explicit sequence-gap check,
//! - ring draining on Flush,
//! - submit completions delivered from a separate thread, standing in for
//! the interrupt-equivalent dispatch context.

#![forbid(unsafe_op_in_unsafe_fn)]

mod harness;
mod mock_host;

pub use harness::*;
pub use mock_host::*;
