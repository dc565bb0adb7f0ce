pub mod core;
pub mod policy;

pub use self::core::{RescheduleSelector, SchedulerCore};
pub use policy::RetryPolicy;
