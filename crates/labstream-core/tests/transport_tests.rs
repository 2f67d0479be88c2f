mod common;

use common::*;
use labstream_core::{
    ChannelFormat, Error, InletConfig, OutletConfig, PostProcessing, Sample, Values,
};
use std::{sync::Arc, time::Duration};

const PULL_TIMEOUT: Duration = Duration::from_secs(2);

#[tokio::test(flavor = "multi_thread")]
async fn test_pushed_sequence_is_pulled_unchanged() {
    let network = Network::new().await;
    let outlet = network
        .outlet(stream_info("seq", "seq-1", ChannelFormat::Float32, 3, 100.0), OutletConfig::default())
        .await;
    let inlet = network.inlet(&outlet, InletConfig::default()).await;

    let pushed = counting_samples(250, 3);
    for (i, values) in pushed.iter().enumerate() {
        outlet.push_sample(values.clone(), Some(i as f64 / 100.0)).unwrap();
    }

    let mut pulled = Vec::new();
    while pulled.len() < pushed.len() {
        let sample = inlet.pull_sample(PULL_TIMEOUT).await.unwrap().expect("sample missing");
        pulled.push(sample);
    }

    for (i, (sample, values)) in pulled.iter().zip(&pushed).enumerate() {
        assert_eq!(&sample.values, values);
        assert_eq!(sample.timestamp, i as f64 / 100.0);
    }
    assert!(inlet.pull_chunk().unwrap().is_empty());

    inlet.close().await;
    outlet.close().await;
    network.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_every_channel_format_is_carried_exactly() {
    let network = Network::new().await;
    let cases: Vec<(ChannelFormat, Values)> = vec![
        (ChannelFormat::Int8, vec![i8::MIN, 0, i8::MAX].into()),
        (ChannelFormat::Int16, vec![i16::MIN, -1, i16::MAX].into()),
        (ChannelFormat::Int32, vec![i32::MIN, 7, i32::MAX].into()),
        (ChannelFormat::Int64, vec![i64::MIN, 42, i64::MAX].into()),
        (ChannelFormat::Double64, vec![0.25f64, -0.5, 1024.0].into()),
        (ChannelFormat::String, vec!["start", "", "ünïcødé"].into()),
    ];

    for (format, values) in cases {
        let outlet = network
            .outlet(stream_info("fmt", format.as_str(), format, 3, 0.0), OutletConfig::default())
            .await;
        let inlet = network.inlet(&outlet, InletConfig::default()).await;

        outlet.push_sample(values.clone(), Some(1.5)).unwrap();
        let sample = inlet.pull_sample(PULL_TIMEOUT).await.unwrap().unwrap();
        assert_eq!(sample, Sample::new(values, 1.5), "format {format}");

        inlet.close().await;
        outlet.close().await;
    }
    network.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_overflow_yields_ordered_subsequence() {
    let network = Network::new().await;
    let outlet = network
        .outlet(stream_info("burst", "burst-1", ChannelFormat::Float32, 1, 1000.0), OutletConfig::realtime(1024))
        .await;
    let inlet = network.inlet(&outlet, InletConfig::default().with_buffer_len(16)).await;

    outlet.push_chunk(counting_samples(200, 1), None).unwrap();

    // Wait for the newest sample to land before draining.
    let deadline = tokio::time::Instant::now() + PULL_TIMEOUT;
    while inlet.samples_dropped() < 184 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let pulled: Vec<f32> = inlet
        .pull_chunk()
        .unwrap()
        .iter()
        .map(|s| first_channel(&s.values))
        .collect();
    println!("kept {} of 200 samples", pulled.len());

    assert_eq!(pulled.len(), 16);
    assert_ordered_subsequence(&pulled, 200);
    assert_eq!(pulled.last().copied(), Some(199.0));

    inlet.close().await;
    outlet.close().await;
    network.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_inlets_each_receive_full_copy() {
    let network = Network::new().await;
    let outlet = network
        .outlet(stream_info("fan", "fan-1", ChannelFormat::Float32, 2, 50.0), OutletConfig::default())
        .await;
    let first = network.inlet(&outlet, InletConfig::default()).await;
    let second = network.inlet(&outlet, InletConfig::default()).await;
    assert_eq!(outlet.consumer_count(), 2);

    outlet.push_chunk(counting_samples(100, 2), None).unwrap();

    for inlet in [&first, &second] {
        let mut pulled = Vec::new();
        while pulled.len() < 100 {
            let sample = inlet.pull_sample(PULL_TIMEOUT).await.unwrap().expect("sample missing");
            pulled.push(first_channel(&sample.values));
        }
        let expected: Vec<f32> = (0..100).map(|i| i as f32).collect();
        assert_eq!(pulled, expected);
    }

    first.close().await;
    second.close().await;
    outlet.close().await;
    network.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_type_mismatch_rejected_at_push() {
    let network = Network::new().await;
    let outlet = network
        .outlet(stream_info("typed", "typed-1", ChannelFormat::Int16, 2, 0.0), OutletConfig::default())
        .await;

    assert!(matches!(
        outlet.push_sample(vec![1.0f32, 2.0], None),
        Err(Error::InvalidArgument(_))
    ));
    assert!(matches!(
        outlet.push_sample(vec![1i16, 2, 3], None),
        Err(Error::InvalidArgument(_))
    ));
    assert!(outlet.push_sample(vec![1i16, 2], None).is_ok());

    outlet.close().await;
    network.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_block_policy_loses_nothing() {
    let network = Network::new().await;
    let outlet = Arc::new(
        network
            .outlet(stream_info("lossless", "lossless-1", ChannelFormat::Float32, 1, 0.0), OutletConfig::lossless(4))
            .await,
    );
    let inlet = network.inlet(&outlet, InletConfig::default().with_buffer_len(1000)).await;

    let producer = {
        let outlet = outlet.clone();
        tokio::task::spawn_blocking(move || {
            for values in counting_samples(500, 1) {
                outlet.push_sample(values, None).unwrap();
            }
        })
    };

    let mut pulled = Vec::new();
    while pulled.len() < 500 {
        let sample = inlet.pull_sample(PULL_TIMEOUT).await.unwrap().expect("sample missing");
        pulled.push(first_channel(&sample.values));
    }
    producer.await.unwrap();

    assert_eq!(inlet.samples_dropped(), 0);
    let expected: Vec<f32> = (0..500).map(|i| i as f32).collect();
    assert_eq!(pulled, expected);

    inlet.close().await;
    outlet.close().await;
    network.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pre_connection_samples_reach_first_inlet() {
    let network = Network::new().await;
    let outlet = network
        .outlet(
            stream_info("early", "early-1", ChannelFormat::Float32, 1, 0.0),
            OutletConfig::default().with_pre_connection_buffer(8),
        )
        .await;
    assert!(!outlet.have_consumers());
    outlet.push_chunk(counting_samples(3, 1), None).unwrap();

    let inlet = network.inlet(&outlet, InletConfig::default()).await;
    let mut pulled = Vec::new();
    while pulled.len() < 3 {
        let sample = inlet.pull_sample(PULL_TIMEOUT).await.unwrap().expect("backlog missing");
        pulled.push(first_channel(&sample.values));
    }
    assert_eq!(pulled, [0.0, 1.0, 2.0]);

    inlet.close().await;
    outlet.close().await;
    network.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_pull_chunk_max_and_flush() {
    let network = Network::new().await;
    let outlet = network
        .outlet(stream_info("chunks", "chunks-1", ChannelFormat::Float32, 1, 10.0), OutletConfig::default())
        .await;
    let inlet = network.inlet(&outlet, InletConfig::default()).await;

    outlet.push_chunk(counting_samples(10, 1), Some(100.0)).unwrap();
    let deadline = tokio::time::Instant::now() + PULL_TIMEOUT;
    while inlet.samples_available() < 10 && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let head = inlet.pull_chunk_max(4).unwrap();
    assert_eq!(head.len(), 4);
    assert!((head[0].timestamp - 99.1).abs() < 1e-9);
    assert_eq!(inlet.samples_available(), 6);
    assert_eq!(inlet.flush(), 6);
    assert!(inlet.pull_chunk().unwrap().is_empty());

    inlet.close().await;
    outlet.close().await;
    network.close().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_monotonize_flattens_out_of_order_timestamps() {
    let network = Network::new().await;
    let outlet = network
        .outlet(stream_info("jumpy", "jumpy-1", ChannelFormat::Float32, 1, 0.0), OutletConfig::default())
        .await;
    let postprocessing = PostProcessing {
        monotonize: true,
        ..PostProcessing::default()
    };
    let inlet = network
        .inlet(&outlet, InletConfig::default().with_postprocessing(postprocessing))
        .await;

    outlet
        .push_chunk_with_timestamps(counting_samples(4, 1), &[1.0, 3.0, 2.0, 4.0])
        .unwrap();

    let mut stamps = Vec::new();
    while stamps.len() < 4 {
        let sample = inlet.pull_sample(PULL_TIMEOUT).await.unwrap().expect("sample missing");
        stamps.push(sample.timestamp);
    }
    assert_eq!(stamps, [1.0, 3.0, 3.0, 4.0]);

    inlet.close().await;
    outlet.close().await;
    network.close().await;
}
