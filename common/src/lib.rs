//! Shared building blocks for the LAN multicast streamer.
//!
//! The wire codec, splitter and reassembly buffer are used by both ends of
//! a transfer; the control and discovery tokens define the protocol; the
//! rest is ambient plumbing (config, events, tracing, metrics, CLI policy).

pub mod cli;
pub mod config;
pub mod control;
pub mod datagram;
pub mod discovery;
pub mod events;
pub mod media;
pub mod observability;
pub mod reassembly;
pub mod splitter;
pub mod worker;

pub use cli::ColorWhen;
pub use config::Config;
pub use control::{ControlError, ControlMessage, CONTROL_FRAME_SIZE};
pub use datagram::{Datagram, WireError, HEADER_SIZE, MAX_DATAGRAM_SIZE, MAX_PAYLOAD};
pub use discovery::{DiscoveryToken, CLIENT_ACK, SERVER_BEACON};
pub use events::{EventBus, Subscription};
pub use media::{Id3v1Metadata, MetadataReader, PlaybackSink, TrackMetadata};
pub use observability::{init_tracing, MetricsContext, MetricsServerConfig};
pub use reassembly::{ReassemblyBuffer, ReassemblyError};
pub use splitter::split;
pub use worker::{wait_or_stop, StopSignal, Wake, Worker};
