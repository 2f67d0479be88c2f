use labstream_core::{
    ChannelFormat, ClockSyncConfig, DiscoveryConfig, Inlet, InletConfig, Outlet, OutletConfig,
    Resolver, StreamInfo, Values,
};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Two resolvers on loopback: outlets advertise through `producer`,
/// consumers query through `consumer`.
pub struct Network {
    pub producer: Resolver,
    pub consumer: Resolver,
}

impl Network {
    pub async fn new() -> Self {
        init_tracing();
        let producer = Resolver::new(DiscoveryConfig::loopback()).await.unwrap();
        let consumer = Resolver::new(DiscoveryConfig::loopback().with_peer(producer.local_addr()))
            .await
            .unwrap();
        Self { producer, consumer }
    }

    pub async fn outlet(&self, info: StreamInfo, config: OutletConfig) -> Outlet {
        Outlet::create(info, &self.producer, config).await.unwrap()
    }

    /// Resolves `outlet` from the consumer side and subscribes to it.
    #[allow(dead_code)]
    pub async fn inlet(&self, outlet: &Outlet, config: InletConfig) -> Inlet {
        self.inlet_with_clock(outlet, config, ClockSyncConfig::default())
            .await
    }

    #[allow(dead_code)]
    pub async fn inlet_with_clock(
        &self,
        outlet: &Outlet,
        config: InletConfig,
        clock: ClockSyncConfig,
    ) -> Inlet {
        let found = self
            .consumer
            .resolve_byprop("uid", outlet.info().uid(), 1, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(found.len(), 1, "outlet {} not resolved", outlet.info().name());

        let inlet = Inlet::open_with(&found[0], config, clock).await.unwrap();
        assert!(outlet.wait_for_consumers(Duration::from_secs(2)).await);
        inlet
    }

    #[allow(dead_code)]
    pub async fn close(&self) {
        self.consumer.close().await;
        self.producer.close().await;
    }
}

pub fn stream_info(name: &str, source_id: &str, format: ChannelFormat, channels: u32, srate: f64) -> StreamInfo {
    StreamInfo::new(name, "Test", channels, srate, format, source_id).unwrap()
}

/// Float samples whose first channel counts up from zero.
#[allow(dead_code)]
pub fn counting_samples(count: usize, channels: usize) -> Vec<Values> {
    (0..count)
        .map(|i| {
            let mut values = vec![0.0f32; channels];
            values[0] = i as f32;
            Values::from(values)
        })
        .collect()
}

/// First channel of a float sample.
#[allow(dead_code)]
pub fn first_channel(values: &Values) -> f32 {
    match values {
        Values::Float32(v) => v[0],
        other => panic!("expected float32 values, got {other:?}"),
    }
}

/// Asserts that `pulled` is an ordered subsequence of `0..pushed`.
#[allow(dead_code)]
pub fn assert_ordered_subsequence(pulled: &[f32], pushed: usize) {
    assert!(pulled.windows(2).all(|w| w[0] < w[1]), "reordered or duplicated: {pulled:?}");
    assert!(pulled.iter().all(|&v| v >= 0.0 && (v as usize) < pushed));
}
