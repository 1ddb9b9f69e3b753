//! A hosted harness for the monitor.
//!
//! The monitor consumes its environment entirely through traits, so this
//! crate can stand in for the whole machine: [`arena`] simulates the kernel's
//! page allocator and carries a real 4-level host page table, [`hardware`]
//! simulates one logical processor's VMX facility including the extended
//! page table walk and a translation cache, and [`guest`] is the scripted
//! guest program the sessions run. The acceptance scenarios live in
//! `tests/scenarios.rs`; `main.rs` runs the two interception variants as a
//! demonstration.

pub mod arena;
pub mod guest;
pub mod hardware;
pub mod trace;
