pub mod clock;
pub mod error;
pub mod model;

pub use clock::{BRIDGE_VERSION, Clock, FixedClock, SystemClock, new_run_id};
