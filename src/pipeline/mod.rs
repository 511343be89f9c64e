pub mod cancel;
pub mod driver;
pub mod queue;
pub mod slots;
pub mod throughput;

pub use cancel::CancelToken;
pub use driver::{Driver, DriverSettings, Mode, RunSummary, Stages};
pub use queue::{AsyncInferQueue, Completed, SlotPhase};
pub use slots::{SlotId, SlotOutput, SlotPool};
pub use throughput::{Throughput, ThroughputCounter};
