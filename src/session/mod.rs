//! Session glue: trading hours, retry policy, the polling driver and the
//! live orchestration around it

pub mod driver;
pub mod hours;
pub mod live;
pub mod retry;

pub use driver::SessionDriver;
pub use live::{run_live, LiveSettings};
pub use retry::RetryPolicy;
