//! The two accept-loop front ends (spec.md §4.9, §4.10): the unified
//! sniffing gateway, and the Linux-only transparent-interception gateway.

pub mod unified;

#[cfg(target_os = "linux")]
pub mod transparent;

pub use unified::UnifiedGateway;

#[cfg(target_os = "linux")]
pub use transparent::TransparentGateway;
