//! This library moves labeled multi-channel time series between
//! processes on a local network. Producers publish streams through
//! outlets, consumers locate them with a resolver and subscribe with
//! inlets, and every inlet keeps an estimate of the offset between the
//! producer's clock and its own.
//!
//! # Usage
//!
//! ```rust
//! use labstream_core::{
//!     ChannelFormat, DiscoveryConfig, Inlet, Outlet, OutletConfig, Resolver, StreamInfo,
//! };
//! use std::time::Duration;
//!
//! # #[tokio::main]
//! # async fn main() -> labstream_core::Result<()> {
//! // Discovery confined to the loopback interface, talking to itself.
//! let probe = Resolver::new(DiscoveryConfig::loopback()).await?;
//! let resolver = Resolver::new(DiscoveryConfig::loopback().with_peer(probe.local_addr())).await?;
//!
//! // Publish a two-channel stream
//! let info = StreamInfo::new("Accel", "Motion", 2, 100.0, ChannelFormat::Float32, "imu-7")?;
//! let outlet = Outlet::create(info, &probe, OutletConfig::default()).await?;
//!
//! // Find it and subscribe
//! let found = resolver
//!     .resolve_byprop("source_id", "imu-7", 1, Duration::from_secs(2))
//!     .await?;
//! let inlet = Inlet::open(&found[0], 1024).await?;
//! outlet.wait_for_consumers(Duration::from_secs(2)).await;
//!
//! outlet.push_sample(vec![0.5f32, -0.5], None)?;
//! let sample = inlet.pull_sample(Duration::from_secs(2)).await?;
//! assert!(sample.is_some());
//!
//! inlet.close().await;
//! outlet.close().await;
//! # Ok(())
//! # }
//! ```

mod buffer;
mod clock;
mod config;
mod error;
mod info;
mod inlet;
mod outlet;
mod predicate;
mod resolver;
mod task;
mod wire;

pub use buffer::CloseReason;
pub use clock::{ClockEstimator, ClockSyncConfig, OffsetSample, ProbeExchange, local_clock};
pub use config::{
    BackpressurePolicy, CONFIG_ENV, Config, DISCOVERY_PORT, DiscoveryConfig, InletConfig,
    OutletConfig, PostProcessing,
};
pub use error::{Error, Result};
pub use info::{ChannelFormat, DEFAULT_SESSION, DescNode, IRREGULAR_RATE, Sample, StreamInfo, Values};
pub use inlet::Inlet;
pub use outlet::Outlet;
pub use predicate::Predicate;
pub use resolver::{ContinuousResolver, FOREVER, Resolver};

/// Data-plane protocol version. Peers must agree on `version / 100`.
pub const PROTOCOL_VERSION: u32 = 110;

pub fn protocol_version() -> u32 {
    PROTOCOL_VERSION
}

/// Version of this library as `major * 100 + minor`.
pub fn library_version() -> u32 {
    let major: u32 = env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0);
    let minor: u32 = env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0);
    major * 100 + minor
}

/// Human-readable build description.
pub fn library_info() -> String {
    format!(
        "{} {} (protocol {})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        PROTOCOL_VERSION
    )
}
