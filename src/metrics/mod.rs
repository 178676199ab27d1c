pub mod clock;
pub mod rate_counter;
pub mod registry;
pub mod stream;

pub use clock::{Clock, ManualClock, MonotonicClock};
pub use rate_counter::{default_granularity, set_default_granularity, RateCounter, DEFAULT_GRANULARITY};
pub use registry::{CounterSet, Exportable, Registry, Var, DISCOVERY_SET};
