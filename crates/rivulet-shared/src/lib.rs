// Types shared by the Rivulet crates: identities, entity records, the push
// and batch protocols, and error types.

pub mod constants;
pub mod error;
pub mod levels;
pub mod models;
pub mod protocol;
pub mod types;

pub use error::{StreamsError, ValidationError};
pub use types::{PublisherId, StreamKey, StreamName, UserId};
