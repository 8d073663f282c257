pub mod backoff;
pub mod clock;
mod error;
pub mod shutdown;
pub mod strutil;
pub mod tracing_setup;

pub use crate::error::{Error, ErrorKind, ResultExt};

pub type Mutex<T> = parking_lot::Mutex<T>;
pub type Condvar = parking_lot::Condvar;
