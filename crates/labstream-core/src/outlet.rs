//! The publishing side of a stream.

use crate::{
    PROTOCOL_VERSION,
    buffer::{CloseReason, SampleQueue},
    clock::local_clock,
    config::{BackpressurePolicy, OutletConfig},
    error::{Error, Result},
    info::{Sample, StreamInfo, Values},
    resolver::Resolver,
    task::{TaskGroup, stopped},
    wire::{Frame, read_frame, write_frame},
};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    net::{IpAddr, Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::watch,
    task::JoinSet,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Deadline for an inlet to introduce itself after connecting.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

/// Time connections get to flush their queues when the outlet closes.
const CLOSE_LINGER: Duration = Duration::from_secs(2);

/// Samples sent per data frame at most.
const MAX_BATCH: usize = 512;

struct Consumer {
    id: u64,
    queue: Arc<SampleQueue<Sample>>,
}

struct Shared {
    info: StreamInfo,
    config: OutletConfig,
    consumers: Mutex<Vec<Consumer>>,
    /// Samples pushed while nobody was connected.
    backlog: Mutex<VecDeque<Sample>>,
    consumer_count: watch::Sender<usize>,
    last_timestamp: Mutex<f64>,
    next_consumer: AtomicU64,
    closed: AtomicBool,
}

/// Publishes one stream: advertised through a [Resolver] and served to
/// every inlet that connects.
///
/// Pushes never wait for the network. Each connected inlet has its own
/// bounded queue drained by a background writer; what happens when it
/// fills up is decided by [OutletConfig::backpressure].
pub struct Outlet {
    shared: Arc<Shared>,
    resolver: Resolver,
    local_addr: SocketAddr,
    tasks: TaskGroup,
}

impl Outlet {
    /// Opens the data-plane listener and starts advertising `info`.
    ///
    /// The hosting fields of `info` (uid, hostname, port, creation time)
    /// are filled in here; the session is the resolver's.
    pub async fn create(mut info: StreamInfo, resolver: &Resolver, config: OutletConfig) -> Result<Self> {
        if config.queue_capacity == 0 {
            return Err(Error::invalid("queue_capacity must be positive"));
        }

        let listener = TcpListener::bind(config.bind).await?;
        let local_addr = listener.local_addr()?;

        let hostname = hostname::get()
            .ok()
            .and_then(|name| name.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        info.bind_host(Uuid::new_v4().to_string(), hostname, local_addr.port(), local_clock());
        info.set_session_id(resolver.config().session_id.clone());

        let endpoint_ip = match local_addr.ip() {
            ip if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
            ip => ip,
        };
        info.set_endpoint(SocketAddr::new(endpoint_ip, local_addr.port()));

        let (consumer_count, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            info,
            config,
            consumers: Mutex::new(Vec::new()),
            backlog: Mutex::new(VecDeque::new()),
            consumer_count,
            last_timestamp: Mutex::new(f64::NEG_INFINITY),
            next_consumer: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });

        let tasks = TaskGroup::new("outlet");
        tasks.spawn(accept_loop(shared.clone(), listener, tasks.shutdown_signal()));
        resolver.advertise(shared.info.clone());

        info!(
            name = shared.info.name(),
            uid = shared.info.uid(),
            %local_addr,
            "outlet created"
        );

        Ok(Self {
            shared,
            resolver: resolver.clone(),
            local_addr,
            tasks,
        })
    }

    /// The published description, including its hosting fields.
    pub fn info(&self) -> &StreamInfo {
        &self.shared.info
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Sends one sample to every connected inlet.
    ///
    /// Without an explicit `timestamp` the sample is stamped with
    /// [local_clock], never earlier than the previous sample. With
    /// [BackpressurePolicy::Block] this call may block the thread until
    /// the slowest inlet has room.
    pub fn push_sample(&self, values: impl Into<Values>, timestamp: Option<f64>) -> Result<()> {
        self.ensure_open()?;
        let values = values.into();
        self.shared.info.validate(&values)?;
        let timestamp = self.shared.stamp(timestamp);
        self.shared.dispatch(vec![Sample { timestamp, values }]);
        Ok(())
    }

    /// Sends several samples at once. `timestamp` applies to the last
    /// sample; earlier ones are spaced backwards by the nominal rate, or
    /// share it for irregular streams.
    ///
    /// Nothing is sent if any sample does not match the stream's schema.
    pub fn push_chunk<V: Into<Values>>(
        &self,
        chunk: impl IntoIterator<Item = V>,
        timestamp: Option<f64>,
    ) -> Result<()> {
        self.ensure_open()?;
        let chunk = self.validate_chunk(chunk)?;
        if chunk.is_empty() {
            return Ok(());
        }

        let srate = self.shared.info.nominal_srate();
        let n = chunk.len();
        let span = if srate > 0.0 { (n - 1) as f64 / srate } else { 0.0 };
        let last = self.shared.stamp_chunk(timestamp, span);
        let samples = chunk
            .into_iter()
            .enumerate()
            .map(|(i, values)| {
                let timestamp = if srate > 0.0 {
                    last - (n - 1 - i) as f64 / srate
                } else {
                    last
                };
                Sample { timestamp, values }
            })
            .collect();

        self.shared.dispatch(samples);
        Ok(())
    }

    /// Sends several samples, each with its own timestamp.
    pub fn push_chunk_with_timestamps<V: Into<Values>>(
        &self,
        chunk: impl IntoIterator<Item = V>,
        timestamps: &[f64],
    ) -> Result<()> {
        self.ensure_open()?;
        let chunk = self.validate_chunk(chunk)?;
        if chunk.len() != timestamps.len() {
            return Err(Error::invalid(format!(
                "got {} timestamps for {} samples",
                timestamps.len(),
                chunk.len()
            )));
        }
        if chunk.is_empty() {
            return Ok(());
        }

        if let Some(&last) = timestamps.last() {
            self.shared.stamp(Some(last));
        }
        let samples = chunk
            .into_iter()
            .zip(timestamps)
            .map(|(values, &timestamp)| Sample { timestamp, values })
            .collect();

        self.shared.dispatch(samples);
        Ok(())
    }

    pub fn have_consumers(&self) -> bool {
        *self.shared.consumer_count.borrow() > 0
    }

    pub fn consumer_count(&self) -> usize {
        *self.shared.consumer_count.borrow()
    }

    /// Waits until at least one inlet is connected. Returns `false` on
    /// timeout.
    pub async fn wait_for_consumers(&self, timeout: Duration) -> bool {
        let mut count = self.shared.consumer_count.subscribe();
        matches!(
            tokio::time::timeout(timeout, count.wait_for(|n| *n > 0)).await,
            Ok(Ok(_))
        )
    }

    /// Stops advertising, tells connected inlets the stream is ending and
    /// releases the listener. Waits for the background tasks; calling it
    /// again is a no-op.
    pub async fn close(&self) {
        if self.shared.begin_close() {
            self.resolver.stop_advertising(self.shared.info.uid());
            info!(name = self.shared.info.name(), uid = self.shared.info.uid(), "outlet closing");
        }
        self.tasks.shutdown().await;
    }

    fn ensure_open(&self) -> Result<()> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    fn validate_chunk<V: Into<Values>>(&self, chunk: impl IntoIterator<Item = V>) -> Result<Vec<Values>> {
        chunk
            .into_iter()
            .map(|values| {
                let values = values.into();
                self.shared.info.validate(&values)?;
                Ok(values)
            })
            .collect()
    }
}

impl Drop for Outlet {
    fn drop(&mut self) {
        if self.shared.begin_close() {
            self.resolver.stop_advertising(self.shared.info.uid());
        }
    }
}

impl Shared {
    /// Resolves the timestamp of the next sample and keeps default
    /// timestamps non-decreasing.
    fn stamp(&self, explicit: Option<f64>) -> f64 {
        self.stamp_chunk(explicit, 0.0)
    }

    /// Timestamp of the last sample of a chunk whose samples cover `span`
    /// seconds. A default stamp keeps the first sample of the chunk at or
    /// after everything sent before.
    fn stamp_chunk(&self, explicit: Option<f64>, span: f64) -> f64 {
        let mut last = self.last_timestamp.lock();
        let timestamp = explicit.unwrap_or_else(|| local_clock().max(*last + span));
        *last = last.max(timestamp);
        timestamp
    }

    fn dispatch(&self, samples: Vec<Sample>) {
        let queues: Vec<Arc<SampleQueue<Sample>>> = {
            let consumers = self.consumers.lock();
            if consumers.is_empty() {
                self.keep_backlog(samples);
                return;
            }
            consumers.iter().map(|c| c.queue.clone()).collect()
        };

        let policy = self.config.backpressure;
        if let [queue] = queues.as_slice() {
            queue.extend(samples, policy);
            return;
        }
        for queue in &queues {
            queue.extend(samples.iter().cloned(), policy);
        }
    }

    fn keep_backlog(&self, samples: Vec<Sample>) {
        let capacity = self.config.pre_connection_buffer;
        if capacity == 0 {
            return;
        }
        let mut backlog = self.backlog.lock();
        backlog.extend(samples);
        while backlog.len() > capacity {
            backlog.pop_front();
        }
    }

    fn register(&self) -> Option<(u64, Arc<SampleQueue<Sample>>)> {
        let queue = Arc::new(SampleQueue::with_capacity(self.config.queue_capacity));
        let mut consumers = self.consumers.lock();
        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        let backlog: Vec<Sample> = self.backlog.lock().drain(..).collect();
        if !backlog.is_empty() {
            debug!(samples = backlog.len(), "handing pre-connection backlog to inlet");
            queue.extend(backlog, BackpressurePolicy::DropOldest);
        }

        let id = self.next_consumer.fetch_add(1, Ordering::Relaxed);
        consumers.push(Consumer {
            id,
            queue: queue.clone(),
        });
        self.consumer_count.send_replace(consumers.len());
        Some((id, queue))
    }

    fn unregister(&self, id: u64) {
        let mut consumers = self.consumers.lock();
        consumers.retain(|c| c.id != id);
        self.consumer_count.send_replace(consumers.len());
    }

    /// Marks the outlet closed and closes every consumer queue. Returns
    /// whether this call did it.
    fn begin_close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        for consumer in self.consumers.lock().iter() {
            consumer.queue.close(CloseReason::Closed);
        }
        self.backlog.lock().clear();
        true
    }
}

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, stream = shared.info.name(), "inlet connecting");
                    connections.spawn(serve_connection(shared.clone(), stream, peer));
                }
                Err(err) => {
                    warn!("accept failed: {err}");
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    drop(listener);

    // Writers flush their queues and send End once the queues close.
    let drained = tokio::time::timeout(CLOSE_LINGER, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            stream = shared.info.name(),
            remaining = connections.len(),
            "inlets did not drain in time, dropping them"
        );
        connections.shutdown().await;
    }
    debug!(stream = shared.info.name(), "listener stopped");
}

async fn serve_connection(shared: Arc<Shared>, stream: TcpStream, peer: SocketAddr) {
    if let Err(err) = stream.set_nodelay(true) {
        debug!(%peer, "cannot disable Nagle: {err}");
    }
    let (mut reader, mut writer) = stream.into_split();

    match tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&shared, &mut reader, &mut writer)).await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            debug!(%peer, "handshake failed: {err}");
            return;
        }
        Err(_) => {
            debug!(%peer, "handshake timed out");
            return;
        }
    }

    // Registered before the welcome, so that an inlet sees every sample
    // pushed after its open returns.
    let Some((id, queue)) = shared.register() else {
        let _ = write_frame(&mut writer, &Frame::End).await;
        return;
    };
    let welcome = Frame::Welcome {
        version: PROTOCOL_VERSION,
        info: shared.info.clone(),
    };
    if let Err(err) = write_frame(&mut writer, &welcome).await {
        debug!(%peer, "failed to welcome inlet: {err}");
        queue.close(CloseReason::Lost);
        shared.unregister(id);
        return;
    }
    info!(%peer, stream = shared.info.name(), "inlet connected");

    let (probe_tx, probe_rx) = flume::bounded(64);
    let outcome = tokio::select! {
        res = answer_probes(&mut reader, probe_tx) => res,
        res = send_samples(&mut writer, &queue, probe_rx) => res,
    };

    queue.close(CloseReason::Lost);
    shared.unregister(id);
    match outcome {
        Ok(()) => info!(%peer, stream = shared.info.name(), "inlet disconnected"),
        Err(err) => info!(%peer, stream = shared.info.name(), "inlet dropped: {err}"),
    }
}

async fn handshake(shared: &Shared, reader: &mut OwnedReadHalf, writer: &mut OwnedWriteHalf) -> Result<()> {
    let Some(frame) = read_frame(reader).await? else {
        return Err(Error::LostConnection);
    };
    let Frame::Hello { version, uid } = frame else {
        return Err(Error::protocol("expected a hello frame"));
    };

    let reason = if version / 100 != PROTOCOL_VERSION / 100 {
        Some(format!(
            "protocol version {version} is incompatible with {PROTOCOL_VERSION}"
        ))
    } else if !uid.is_empty() && uid != shared.info.uid() {
        Some(format!("no stream with uid {uid} here"))
    } else {
        None
    };

    if let Some(reason) = reason {
        write_frame(writer, &Frame::Reject { reason: reason.clone() }).await?;
        return Err(Error::protocol(reason));
    }
    Ok(())
}

/// Reads clock probes and hands them to the writer stamped with their
/// arrival time. Ends when the inlet hangs up.
async fn answer_probes(reader: &mut OwnedReadHalf, replies: flume::Sender<(u64, f64, f64)>) -> Result<()> {
    loop {
        match read_frame(reader).await? {
            None => return Ok(()),
            Some(Frame::Probe { id, t0 }) => {
                let t1 = local_clock();
                if replies.send_async((id, t0, t1)).await.is_err() {
                    return Ok(());
                }
            }
            Some(other) => debug!("ignoring unexpected frame from inlet: {other:?}"),
        }
    }
}

async fn send_samples(
    writer: &mut OwnedWriteHalf,
    queue: &SampleQueue<Sample>,
    probes: flume::Receiver<(u64, f64, f64)>,
) -> Result<()> {
    loop {
        tokio::select! {
            biased;

            probe = probes.recv_async() => {
                let Ok((id, t0, t1)) = probe else {
                    return Ok(());
                };
                let reply = Frame::ProbeReply { id, t0, t1, t2: local_clock() };
                write_frame(writer, &reply).await?;
            }
            _ = queue.readable() => match queue.drain(MAX_BATCH) {
                Ok(samples) if samples.is_empty() => {}
                Ok(samples) => write_frame(writer, &Frame::Samples { samples }).await?,
                Err(Error::Closed) => {
                    write_frame(writer, &Frame::End).await?;
                    return Ok(());
                }
                Err(err) => return Err(err),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::DiscoveryConfig, info::ChannelFormat};

    async fn outlet(srate: f64, config: OutletConfig) -> (Resolver, Outlet) {
        let resolver = Resolver::new(DiscoveryConfig::loopback()).await.unwrap();
        let info = StreamInfo::new("test", "EEG", 2, srate, ChannelFormat::Float32, "unit").unwrap();
        let outlet = Outlet::create(info, &resolver, config).await.unwrap();
        (resolver, outlet)
    }

    fn register(outlet: &Outlet) -> Arc<SampleQueue<Sample>> {
        outlet.shared.register().unwrap().1
    }

    #[tokio::test]
    async fn test_create_fills_hosting_fields_and_advertises() {
        let (resolver, outlet) = outlet(100.0, OutletConfig::default()).await;
        let info = outlet.info();
        assert!(!info.uid().is_empty());
        assert!(!info.hostname().is_empty());
        assert_eq!(info.data_port(), outlet.local_addr().port());
        assert!(info.endpoint().unwrap().ip().is_loopback());
        assert_eq!(resolver.advertised()[0].uid(), info.uid());

        outlet.close().await;
        assert!(resolver.advertised().is_empty());
        outlet.close().await;
    }

    #[tokio::test]
    async fn test_default_timestamps_never_decrease() {
        let (_resolver, outlet) = outlet(100.0, OutletConfig::default()).await;
        let queue = register(&outlet);

        outlet.push_sample(vec![0.0f32, 0.0], Some(local_clock() + 10.0)).unwrap();
        outlet.push_sample(vec![1.0f32, 1.0], None).unwrap();
        let samples = queue.drain(usize::MAX).unwrap();
        assert!(samples[1].timestamp >= samples[0].timestamp);
    }

    #[tokio::test]
    async fn test_back_to_back_chunks_do_not_overlap() {
        let (_resolver, outlet) = outlet(100.0, OutletConfig::default()).await;
        let queue = register(&outlet);

        let chunk = || (0..10).map(|i| vec![i as f32, 0.0]).collect::<Vec<_>>();
        outlet.push_chunk(chunk(), None).unwrap();
        outlet.push_chunk(chunk(), None).unwrap();

        let stamps: Vec<f64> = queue.drain(usize::MAX).unwrap().iter().map(|s| s.timestamp).collect();
        assert_eq!(stamps.len(), 20);
        assert!(
            stamps.windows(2).all(|w| w[1] >= w[0]),
            "timestamps went backwards: {stamps:?}"
        );
        // The spacing inside each chunk still follows the rate.
        assert!((stamps[9] - stamps[0] - 0.09).abs() < 1e-9);
        assert!((stamps[19] - stamps[10] - 0.09).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_chunk_timestamps_are_spaced_by_rate() {
        let (_resolver, outlet) = outlet(10.0, OutletConfig::default()).await;
        let queue = register(&outlet);

        outlet
            .push_chunk(vec![vec![0.0f32, 0.0], vec![1.0, 1.0], vec![2.0, 2.0]], Some(5.0))
            .unwrap();
        let stamps: Vec<f64> = queue.drain(usize::MAX).unwrap().iter().map(|s| s.timestamp).collect();
        assert!((stamps[0] - 4.8).abs() < 1e-9);
        assert!((stamps[1] - 4.9).abs() < 1e-9);
        assert_eq!(stamps[2], 5.0);
    }

    #[tokio::test]
    async fn test_invalid_chunk_is_rejected_whole() {
        let (_resolver, outlet) = outlet(10.0, OutletConfig::default()).await;
        let queue = register(&outlet);

        let chunk: Vec<Values> = vec![vec![0.0f32, 0.0].into(), vec![1i32, 1].into()];
        assert!(matches!(
            outlet.push_chunk(chunk, None),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            outlet.push_chunk_with_timestamps(vec![vec![0.0f32, 0.0]], &[1.0, 2.0]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_backlog_is_handed_to_first_consumer() {
        let (_resolver, outlet) = outlet(100.0, OutletConfig::default().with_pre_connection_buffer(2)).await;
        for i in 0..5 {
            outlet.push_sample(vec![i as f32, 0.0], Some(i as f64)).unwrap();
        }

        let queue = register(&outlet);
        let stamps: Vec<f64> = queue.drain(usize::MAX).unwrap().iter().map(|s| s.timestamp).collect();
        assert_eq!(stamps, [3.0, 4.0]);
        assert!(outlet.have_consumers());
    }

    #[tokio::test]
    async fn test_push_after_close_fails() {
        let (_resolver, outlet) = outlet(100.0, OutletConfig::default()).await;
        outlet.close().await;
        assert!(matches!(
            outlet.push_sample(vec![0.0f32, 0.0], None),
            Err(Error::Closed)
        ));
        assert!(outlet.shared.register().is_none());
    }
}
