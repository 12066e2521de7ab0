//! Network layer: the remote Streams API, partition routing and the push
//! channel client.

pub mod http;
pub mod partition;
pub mod remote;
pub mod socket;

pub use http::HttpRemote;
pub use partition::{Partition, Router};
pub use remote::{
    CreatedStream, NewMessage, NewStream, ParticipatingQuery, RelateOnCreate, RelationRequest,
    RemoteApi, RemoteResult,
};
pub use socket::{run_socket, spawn_socket, PushSink};
