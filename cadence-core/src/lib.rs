//! CADENCE Core - Identity, Errors, and Time
//!
//! Pure data types shared by every other crate in the workspace:
//! - [`QueryKey`]: the structural tuple that addresses one cached unit of data
//! - [`FetchError`] and friends: the error taxonomy of the query layer
//! - [`Clock`]: the time source used for staleness deadlines
//!
//! This crate contains no caching behavior.

mod clock;
mod error;
mod key;

pub use clock::{Clock, ManualClock, SharedClock, SystemClock, Timestamp};
pub use error::{
    CadenceError, CadenceResult, ConfigError, FetchError, KeyError, RemoteErrorDetail,
    SnapshotError,
};
pub use key::{KeySegment, QueryKey};
