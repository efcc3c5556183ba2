//! Shared primitives: errors, clocks, timezones, typed values and the stop
//! signal used by every background worker.

pub mod clock;
pub mod error;
pub mod fs;
pub mod stop;
pub mod timezone;
pub mod value;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
pub use stop::StopSignal;
pub use timezone::{format_day, parse_day, Timezone};
pub use value::{DataType, Value};

pub const NANOS_PER_SEC: i64 = 1_000_000_000;

/// Lock a mutex, recovering the guard if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &std::sync::Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
