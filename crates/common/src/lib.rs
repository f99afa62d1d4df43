//! Cross-crate primitives shared by the octo workspace.

pub mod clock;

pub use clock::{Clock, ManualClock, SystemClock};
