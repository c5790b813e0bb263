#![no_std]
#![cfg_attr(feature = "nightly", feature(thread_local))]

//! hpa-sec: the small extent cache, hugepage-aligned eden provider, and
//! purge batcher from a page-level memory allocator's hugepage allocator
//! (HPA) subsystem.
//!
//! This crate doesn't implement a `GlobalAlloc` front-end, thread caches,
//! arenas, or size-class geometry for object allocation — those live one
//! layer up, in whatever allocator wires this crate in as its page
//! provider. What's here:
//!
//! - [`sec`] — a sharded small extent cache sitting in front of a slower
//!   backing allocator.
//! - [`hpa_central`] — process-wide hugepage-aligned address space
//!   ("eden"), carved into per-shard chunks on demand.
//! - [`purge`] — vectorized purge batching with a documented
//!   inverted-boolean fallback contract.
//! - [`peak_demand`] — sliding-window peak active-page tracking.
//!
//! # Usage
//!
//! ```ignore
//! use hpa_sec::hooks::SystemHooks;
//! use hpa_sec::hpa_central::HpaCentral;
//!
//! let central = HpaCentral::new(SystemHooks);
//! let ps = central.extract(hpa_sec::config::HUGEPAGE, 0, false).unwrap();
//! ```

extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod config;
pub mod edata;
pub mod hooks;
pub mod hpa_central;
#[macro_use]
pub mod macros;
pub mod peak_demand;
pub mod platform;
pub mod purge;
pub mod pszind;
pub mod sec;
pub mod stats;
pub mod sync;

#[cfg(all(not(test), not(feature = "std"), panic = "abort"))]
#[panic_handler]
fn panic(_: &core::panic::PanicInfo) -> ! {
    unsafe extern "C" {
        fn abort() -> !;
    }
    unsafe { abort() }
}
