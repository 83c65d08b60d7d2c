//! Small synchronization and buffering primitives shared by the `xcbridge` crates.
//!
//! - [`ring_buffer::RingBuffer`]: fixed-capacity FIFO that counts evictions.
//! - [`state_machine::StateMachine`]: mutex-guarded state with atomic transitions.

pub mod ring_buffer;
pub mod state_machine;

pub use ring_buffer::RingBuffer;
pub use state_machine::StateMachine;
