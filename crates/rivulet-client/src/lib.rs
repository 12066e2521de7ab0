//! # rivulet-client
//!
//! Client-side coordinator for a Streams service: caches streams, messages,
//! participants and avatars, batches and coalesces lookups, delivers posted
//! messages to listeners in ordinal order, and keeps retained streams fresh.
//!
//! Start it with [`spawn_streams`] and talk to it through the returned
//! [`StreamsHandle`].

pub mod batcher;
pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod handle;
pub mod hub;
pub mod registry;
pub mod stream;
pub mod waiter;

mod coordinator;

use tracing_subscriber::{fmt, EnvFilter};

pub use cache::Related;
pub use config::{CacheCapacities, ParticipantSkip, StreamsConfig};
pub use coordinator::{CacheStats, Created, FetchOptions, RefreshOptions};
pub use dispatcher::HandlerId;
pub use handle::{spawn_push_channels, spawn_streams, RetainWith, StreamsHandle};
pub use hub::{
    AttributeEvent, ErrorEvent, FieldChangedEvent, MessageEvent, RelationEvent, StreamEvent,
    Subscription,
};
pub use registry::RetainKey;
pub use stream::{SharedStream, Stream, StreamDiff};
pub use waiter::{WaitOptions, WaitOutcome};

/// Install a `tracing` subscriber honouring `RUST_LOG`.
///
/// Hosts with their own subscriber should skip this; a second install is
/// ignored.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("rivulet_client=debug,rivulet_net=debug,rivulet_store=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
