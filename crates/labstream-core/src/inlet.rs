//! The subscribing side of a stream.

use crate::{
    PROTOCOL_VERSION,
    buffer::{CloseReason, SampleQueue},
    clock::{ClockEstimator, ClockSyncConfig, ProbeExchange, local_clock},
    config::{BackpressurePolicy, InletConfig, PostProcessing},
    error::{Error, Result},
    info::{Sample, StreamInfo},
    task::{TaskGroup, stopped},
    wire::{Frame, read_frame, write_frame},
};
use parking_lot::Mutex;
use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};
use tokio::{
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::watch,
    time::MissedTickBehavior,
};
use tracing::{debug, info, warn};

/// Progress of the clock exchange as seen by waiters.
#[derive(Debug, Clone, Copy, Default)]
struct ClockStatus {
    exchanges: u64,
    lost: bool,
    closed: bool,
}

struct ClockState {
    estimator: Mutex<ClockEstimator>,
    status: watch::Sender<ClockStatus>,
}

impl ClockState {
    fn offset(&self) -> Option<f64> {
        self.estimator.lock().offset(local_clock())
    }
}

/// Running state of the timestamp post-processing.
#[derive(Debug)]
struct PostState {
    /// Dejitter: intercept of the fitted `t = base + n / srate` line.
    base: Option<f64>,
    index: u64,
    last: f64,
}

/// Dejitter weight given to a new sample once the fit has settled,
/// expressed as a number of samples.
const DEJITTER_SPAN: f64 = 500.0;

/// Receives one stream.
///
/// A background task appends arriving samples to a bounded buffer that
/// drops its oldest entries on overflow; the pull methods consume it in
/// push order. A second task probes the outlet's clock. Once the outlet
/// is gone, the samples already received can still be pulled, after
/// which pulls report [Error::LostConnection].
pub struct Inlet {
    info: StreamInfo,
    buffer: Arc<SampleQueue<Sample>>,
    clock: Arc<ClockState>,
    postprocessing: PostProcessing,
    post: Mutex<PostState>,
    closed: AtomicBool,
    tasks: TaskGroup,
}

impl Inlet {
    /// Connects to the stream described by `info`, buffering at most
    /// `max_buffer_len` samples.
    pub async fn open(info: &StreamInfo, max_buffer_len: usize) -> Result<Self> {
        let config = InletConfig::default().with_buffer_len(max_buffer_len);
        Self::open_with(info, config, ClockSyncConfig::default()).await
    }

    /// Connects with explicit inlet and clock synchronization settings.
    pub async fn open_with(info: &StreamInfo, config: InletConfig, clock: ClockSyncConfig) -> Result<Self> {
        let endpoint = info
            .endpoint()
            .ok_or_else(|| Error::invalid(format!("stream '{}' has no known endpoint", info.name())))?;
        if config.max_buffer_len == 0 {
            return Err(Error::invalid("max_buffer_len must be positive"));
        }

        let (stream, mut full_info) = tokio::time::timeout(config.connect_timeout, connect(endpoint, info.uid()))
            .await
            .map_err(|_| Error::Timeout)??;
        full_info.set_endpoint(endpoint);
        let (reader, writer) = stream.into_split();

        let buffer = Arc::new(SampleQueue::with_capacity(config.max_buffer_len));
        let (status, _) = watch::channel(ClockStatus::default());
        let clock_state = Arc::new(ClockState {
            estimator: Mutex::new(ClockEstimator::new(clock.clone())),
            status,
        });

        // Probes double as heartbeats, so they must come more often than
        // the liveness timeout.
        let probe_interval = clock.probe_interval.min(config.liveness_timeout / 3);

        let tasks = TaskGroup::new("inlet");
        tasks.spawn(receive_loop(
            reader,
            buffer.clone(),
            clock_state.clone(),
            config.liveness_timeout,
            full_info.name().to_string(),
            tasks.shutdown_signal(),
        ));
        tasks.spawn(probe_loop(
            writer,
            clock,
            probe_interval,
            tasks.shutdown_signal(),
        ));

        info!(name = full_info.name(), uid = full_info.uid(), %endpoint, "inlet opened");

        Ok(Self {
            info: full_info,
            buffer,
            clock: clock_state,
            postprocessing: config.postprocessing,
            post: Mutex::new(PostState::default()),
            closed: AtomicBool::new(false),
            tasks,
        })
    }

    /// Full description of the stream, including its metadata.
    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// Takes the oldest sample, waiting up to `timeout` for one.
    ///
    /// Returns `Ok(None)` when the timeout expires. Pass [crate::FOREVER]
    /// or `Duration::MAX` to wait until data arrives or the inlet is
    /// closed.
    pub async fn pull_sample(&self, timeout: Duration) -> Result<Option<Sample>> {
        self.ensure_open()?;
        let sample = self.buffer.pop_wait(Some(timeout)).await?;
        Ok(sample.map(|sample| self.postprocess_one(sample)))
    }

    /// Like [Inlet::pull_sample], blocking the calling thread instead.
    /// Must not be called from within an async task.
    pub fn pull_sample_blocking(&self, timeout: Duration) -> Result<Option<Sample>> {
        self.ensure_open()?;
        let sample = self.buffer.pop_blocking(Some(timeout))?;
        Ok(sample.map(|sample| self.postprocess_one(sample)))
    }

    /// Everything buffered right now, possibly nothing.
    pub fn pull_chunk(&self) -> Result<Vec<Sample>> {
        self.pull_chunk_max(usize::MAX)
    }

    /// At most `max_samples` of the buffered samples.
    pub fn pull_chunk_max(&self, max_samples: usize) -> Result<Vec<Sample>> {
        self.ensure_open()?;
        let samples = self.buffer.drain(max_samples)?;
        Ok(samples
            .into_iter()
            .map(|sample| self.postprocess_one(sample))
            .collect())
    }

    pub fn samples_available(&self) -> usize {
        self.buffer.len()
    }

    /// Samples discarded because the buffer was full.
    pub fn samples_dropped(&self) -> u64 {
        self.buffer.dropped()
    }

    /// Discards the buffered samples and returns how many there were.
    pub fn flush(&self) -> usize {
        self.buffer.clear()
    }

    /// Whether the outlet has gone away.
    pub fn is_lost(&self) -> bool {
        self.buffer.close_reason() == Some(CloseReason::Lost)
    }

    /// Offset that maps outlet timestamps into the local clock:
    /// `local = remote + offset`.
    ///
    /// Waits up to `timeout` for the first probe exchange to complete.
    pub async fn time_correction(&self, timeout: Duration) -> Result<f64> {
        self.ensure_open()?;
        let mut status = self.clock.status.subscribe();
        let waited = tokio::time::timeout(
            timeout,
            status.wait_for(|s| s.exchanges > 0 || s.lost || s.closed),
        )
        .await
        .map(|ready| ready.map(|s| s.closed));

        match waited {
            Err(_) => Err(Error::Timeout),
            Ok(Err(_)) | Ok(Ok(true)) => Err(Error::Closed),
            Ok(Ok(false)) => self.clock.offset().ok_or(Error::LostConnection),
        }
    }

    /// Whether the outlet's clock was observed to jump since the last
    /// call.
    pub fn was_clock_reset(&self) -> bool {
        self.clock.estimator.lock().take_clock_reset()
    }

    /// Drops the connection and wakes every pending pull with
    /// [Error::Closed]. Waits for the background tasks; calling it again
    /// is a no-op.
    pub async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.buffer.close(CloseReason::Closed);
            self.buffer.clear();
            self.clock.status.send_modify(|s| s.closed = true);
            debug!(name = self.info.name(), "inlet closing");
        }
        self.tasks.shutdown().await;
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn postprocess_one(&self, mut sample: Sample) -> Sample {
        let flags = self.postprocessing;
        if flags.is_none() {
            return sample;
        }

        if flags.clocksync
            && let Some(offset) = self.clock.offset()
        {
            sample.timestamp += offset;
        }

        let mut post = self.post.lock();
        let srate = self.info.nominal_srate();
        if flags.dejitter && srate > 0.0 {
            sample.timestamp = post.dejitter(sample.timestamp, srate);
        }
        if flags.monotonize {
            sample.timestamp = sample.timestamp.max(post.last);
        }
        post.last = sample.timestamp;
        sample
    }
}

impl Drop for Inlet {
    fn drop(&mut self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.buffer.close(CloseReason::Closed);
            self.clock.status.send_modify(|s| s.closed = true);
        }
    }
}

impl Default for PostState {
    fn default() -> Self {
        Self {
            base: None,
            index: 0,
            last: f64::NEG_INFINITY,
        }
    }
}

impl PostState {
    /// Fits `t = base + n / srate` with an exponentially weighted
    /// intercept. A residual beyond one second restarts the fit, since
    /// it means samples were dropped or the clock jumped.
    fn dejitter(&mut self, timestamp: f64, srate: f64) -> f64 {
        let n = self.index as f64;
        self.index += 1;
        let observed = timestamp - n / srate;

        let base = match self.base {
            Some(base) if (observed - base).abs() <= 1.0 => {
                let weight = 1.0 / (n + 1.0).min(DEJITTER_SPAN);
                base + weight * (observed - base)
            }
            _ => {
                self.index = 1;
                self.base = Some(timestamp);
                return timestamp;
            }
        };
        self.base = Some(base);
        base + n / srate
    }
}

async fn connect(endpoint: std::net::SocketAddr, uid: &str) -> Result<(TcpStream, StreamInfo)> {
    let mut stream = TcpStream::connect(endpoint).await?;
    stream.set_nodelay(true)?;

    let hello = Frame::Hello {
        version: PROTOCOL_VERSION,
        uid: uid.to_string(),
    };
    write_frame(&mut stream, &hello).await?;

    match read_frame(&mut stream).await? {
        Some(Frame::Welcome { version, info }) => {
            if version / 100 != PROTOCOL_VERSION / 100 {
                return Err(Error::protocol(format!(
                    "outlet speaks protocol {version}, expected {PROTOCOL_VERSION}"
                )));
            }
            Ok((stream, info))
        }
        Some(Frame::Reject { reason }) => Err(Error::protocol(reason)),
        Some(Frame::End) | None => Err(Error::LostConnection),
        Some(other) => Err(Error::protocol(format!("unexpected handshake reply {other:?}"))),
    }
}

async fn receive_loop(
    mut reader: OwnedReadHalf,
    buffer: Arc<SampleQueue<Sample>>,
    clock: Arc<ClockState>,
    liveness_timeout: Duration,
    name: String,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let frame = tokio::select! {
            _ = stopped(&mut shutdown) => return,
            frame = tokio::time::timeout(liveness_timeout, read_frame(&mut reader)) => frame,
        };

        match frame {
            Ok(Ok(Some(Frame::Samples { samples }))) => {
                buffer.extend(samples, BackpressurePolicy::DropOldest);
            }
            Ok(Ok(Some(Frame::ProbeReply { t0, t1, t2, .. }))) => {
                let exchange = ProbeExchange {
                    t0,
                    t1,
                    t2,
                    t3: local_clock(),
                };
                if clock.estimator.lock().add(exchange).is_some() {
                    clock.status.send_modify(|s| s.exchanges += 1);
                }
            }
            Ok(Ok(Some(Frame::End))) => {
                info!(stream = %name, "outlet ended the stream");
                break;
            }
            Ok(Ok(Some(other))) => debug!(stream = %name, "ignoring unexpected frame: {other:?}"),
            Ok(Ok(None)) => {
                info!(stream = %name, "outlet hung up");
                break;
            }
            Ok(Err(err)) => {
                warn!(stream = %name, "connection failed: {err}");
                break;
            }
            Err(_) => {
                warn!(stream = %name, "no word from outlet for {liveness_timeout:?}, assuming it is gone");
                break;
            }
        }
    }

    buffer.close(CloseReason::Lost);
    clock.status.send_modify(|s| s.lost = true);
}

async fn probe_loop(
    mut writer: OwnedWriteHalf,
    config: ClockSyncConfig,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut id = 0u64;

    for _ in 0..config.probe_burst {
        if let Err(err) = send_probe(&mut writer, &mut id).await {
            debug!("probe failed: {err}");
            return;
        }
        tokio::select! {
            _ = stopped(&mut shutdown) => return,
            _ = tokio::time::sleep(config.burst_spacing) => {}
        }
    }

    let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => return,
            _ = ticker.tick() => {}
        }
        if let Err(err) = send_probe(&mut writer, &mut id).await {
            debug!("probe failed: {err}");
            return;
        }
    }
}

async fn send_probe(writer: &mut OwnedWriteHalf, id: &mut u64) -> Result<()> {
    *id += 1;
    let probe = Frame::Probe {
        id: *id,
        t0: local_clock(),
    };
    write_frame(writer, &probe).await
}
