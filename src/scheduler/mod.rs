pub mod cooldown;
pub mod rotation;
pub mod selection;
pub mod show;
pub mod transition;
pub mod watchdog;

pub use rotation::SchedulerState;
pub use show::{RotationScheduler, SchedulerHandle};
pub use watchdog::Watchdog;
