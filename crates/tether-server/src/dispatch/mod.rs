//! Command and script dispatch with reply correlation.

pub mod correlation;
pub mod dispatcher;


pub use correlation::CorrelationTable;
pub use dispatcher::{
    AdHocCommand, DispatchError, Dispatcher, FanOutOutcome, FanOutRequest, FanOutStatus,
};
