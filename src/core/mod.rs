pub mod error;
pub mod types;

pub use error::{EntityError, Result, ServerError};
pub(crate) use error::invariant_violation;
pub use types::{
    ClientDescriptor, ConcurrencyKey, ConsumerId, EntityTuple, PLATFORM_CONSUMER_ID, ServerRole,
};
