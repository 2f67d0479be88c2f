//! Stream discovery.
//!
//! A [Resolver] owns one UDP socket on the discovery channel. It
//! periodically announces the streams advertised through it, answers
//! queries from other resolvers, and runs queries of its own. Several
//! resolvers may coexist in one process as long as they bind distinct
//! addresses.

use crate::{
    config::DiscoveryConfig,
    error::{Error, Result},
    info::StreamInfo,
    predicate::Predicate,
    task::{TaskGroup, stopped},
    wire::{DiscoveryMessage, MAX_DATAGRAM_LEN},
};
use indexmap::IndexMap;
use itertools::Itertools;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    io::ErrorKind,
    net::{Ipv4Addr, SocketAddr},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::{
    net::UdpSocket,
    sync::watch,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

/// A timeout long enough to mean "wait until satisfied" (about a year).
pub const FOREVER: Duration = Duration::from_secs(32_000_000);

/// Receiver of discovery results routed by the receive loop.
struct Subscription {
    tx: flume::Sender<StreamInfo>,
    /// Set for live views, which also learn from announcements.
    announcements: Option<Predicate>,
}

struct Shared {
    config: DiscoveryConfig,
    socket: UdpSocket,
    local_addr: SocketAddr,
    advertised: Mutex<IndexMap<String, StreamInfo>>,
    subscriptions: Mutex<HashMap<u64, Subscription>>,
    next_id: AtomicU64,
}

/// Discovery endpoint. Cloning yields another handle to the same
/// socket and registry; background tasks stop when the last handle is
/// dropped or [Resolver::close] is called.
#[derive(Clone)]
pub struct Resolver {
    shared: Arc<Shared>,
    tasks: Arc<TaskGroup>,
}

impl Resolver {
    /// Binds the discovery socket and starts the announcer and the
    /// receive loop.
    pub async fn new(config: DiscoveryConfig) -> Result<Self> {
        config.validate().map_err(Error::Config)?;
        let socket = bind_discovery_socket(&config).await?;
        let local_addr = socket.local_addr()?;
        info!(%local_addr, peers = ?config.peers, "discovery socket bound");

        let shared = Arc::new(Shared {
            config,
            socket,
            local_addr,
            advertised: Mutex::new(IndexMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(rand_seed()),
        });
        let tasks = Arc::new(TaskGroup::new("resolver"));

        tasks.spawn(receive_loop(shared.clone(), tasks.shutdown_signal()));
        tasks.spawn(announce_loop(shared.clone(), tasks.shutdown_signal()));

        Ok(Self { shared, tasks })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.shared.config
    }

    /// Makes a stream discoverable. Re-advertising the same `uid`
    /// replaces the previous entry.
    pub fn advertise(&self, info: StreamInfo) {
        debug!(uid = info.uid(), name = info.name(), "advertising stream");
        let announce = DiscoveryMessage::Announce {
            stream: info.without_desc(),
        };
        self.shared
            .advertised
            .lock()
            .insert(info.uid().to_string(), info);

        if let Ok(bytes) = announce.encode() {
            for peer in &self.shared.config.peers {
                let _ = self.shared.socket.try_send_to(&bytes, *peer);
            }
        }
    }

    /// Withdraws a stream. Returns whether it was advertised.
    pub fn stop_advertising(&self, uid: &str) -> bool {
        let removed = self.shared.advertised.lock().shift_remove(uid).is_some();
        if removed {
            debug!(uid, "stopped advertising stream");
        }
        removed
    }

    /// Streams currently advertised through this resolver.
    pub fn advertised(&self) -> Vec<StreamInfo> {
        self.shared.advertised.lock().values().cloned().collect()
    }

    /// Collects every matching stream seen within `wait_time`.
    ///
    /// An empty result means nothing was found; it is not an error.
    pub async fn resolve(&self, predicate: &Predicate, wait_time: Duration) -> Result<Vec<StreamInfo>> {
        self.query(predicate, usize::MAX, wait_time).await
    }

    /// Every stream on the network.
    pub async fn resolve_all(&self, wait_time: Duration) -> Result<Vec<StreamInfo>> {
        self.query(&Predicate::All, usize::MAX, wait_time).await
    }

    /// Streams whose property `prop` equals `value`. Returns as soon as
    /// `minimum` streams were found, or at the timeout.
    pub async fn resolve_byprop(
        &self,
        prop: &str,
        value: &str,
        minimum: usize,
        timeout: Duration,
    ) -> Result<Vec<StreamInfo>> {
        self.query(&Predicate::property(prop, value), minimum, timeout)
            .await
    }

    /// Streams matching a textual predicate. Returns as soon as
    /// `minimum` streams were found, or at the timeout.
    pub async fn resolve_bypred(
        &self,
        predicate: &str,
        minimum: usize,
        timeout: Duration,
    ) -> Result<Vec<StreamInfo>> {
        let predicate: Predicate = predicate.parse()?;
        self.query(&predicate, minimum, timeout).await
    }

    /// Starts a live view of the matching streams.
    pub fn resolve_continuous(&self, predicate: Predicate) -> ContinuousResolver {
        ContinuousResolver::new(self.clone(), predicate)
    }

    /// Stops the background tasks and waits for them. Idempotent.
    pub async fn close(&self) {
        self.tasks.shutdown().await;
    }

    async fn query(
        &self,
        predicate: &Predicate,
        minimum: usize,
        wait_time: Duration,
    ) -> Result<Vec<StreamInfo>> {
        let (id, rx, _guard) = self.shared.subscribe(None);
        let query = DiscoveryMessage::Query {
            id,
            session_id: self.shared.config.session_id.clone(),
            predicate: predicate.clone(),
        }
        .encode()?;

        let mut found: IndexMap<String, StreamInfo> = self
            .shared
            .local_matches(predicate)
            .into_iter()
            .map(|info| (info.uid().to_string(), info))
            .collect();

        let deadline = deadline_after(wait_time);
        let mut resend = tokio::time::interval(self.shared.config.query_interval);
        resend.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while found.len() < minimum {
            tokio::select! {
                _ = resend.tick() => self.shared.send_to_peers(&query).await,
                answer = rx.recv_async() => match answer {
                    Ok(info) => {
                        // Most recent answer for a uid wins.
                        found.insert(info.uid().to_string(), info);
                    }
                    Err(_) => break,
                },
                _ = tokio::time::sleep_until(deadline) => break,
            }
        }

        debug!(%predicate, found = found.len(), "resolve finished");
        Ok(found.into_values().collect())
    }
}

impl Shared {
    fn subscribe(
        self: &Arc<Self>,
        announcements: Option<Predicate>,
    ) -> (u64, flume::Receiver<StreamInfo>, SubscriptionGuard) {
        let (tx, rx) = flume::unbounded();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions
            .lock()
            .insert(id, Subscription { tx, announcements });
        let guard = SubscriptionGuard {
            shared: self.clone(),
            id,
        };
        (id, rx, guard)
    }

    fn local_matches(&self, predicate: &Predicate) -> Vec<StreamInfo> {
        self.advertised
            .lock()
            .values()
            .filter(|info| predicate.matches(info))
            .map(StreamInfo::without_desc)
            .collect()
    }

    async fn send_to_peers(&self, bytes: &[u8]) {
        for peer in &self.config.peers {
            if let Err(err) = self.socket.send_to(bytes, peer).await {
                debug!(%peer, "discovery send failed: {err}");
            }
        }
    }

    fn handle(&self, msg: DiscoveryMessage, from: SocketAddr) {
        match msg {
            DiscoveryMessage::Query {
                id,
                session_id,
                predicate,
            } => {
                if session_id != self.config.session_id {
                    return;
                }
                for info in self.local_matches(&predicate) {
                    let answer = DiscoveryMessage::Answer { id, stream: info };
                    match answer.encode() {
                        Ok(bytes) => {
                            if let Err(err) = self.socket.try_send_to(&bytes, from) {
                                debug!(%from, "failed to answer query: {err}");
                            }
                        }
                        Err(err) => warn!("cannot encode answer: {err}"),
                    }
                }
            }
            DiscoveryMessage::Answer { id, mut stream } => {
                if stream.session_id() != self.config.session_id {
                    return;
                }
                stream.set_endpoint(SocketAddr::new(from.ip(), stream.data_port()));
                if let Some(sub) = self.subscriptions.lock().get(&id) {
                    let _ = sub.tx.send(stream);
                }
            }
            DiscoveryMessage::Announce { mut stream } => {
                if stream.session_id() != self.config.session_id {
                    return;
                }
                stream.set_endpoint(SocketAddr::new(from.ip(), stream.data_port()));
                let subscriptions = self.subscriptions.lock();
                subscriptions
                    .values()
                    .filter_map(|sub| sub.announcements.as_ref().map(|pred| (sub, pred)))
                    .filter(|(_, pred)| !pred.uses_metadata() && pred.matches(&stream))
                    .for_each(|(sub, _)| {
                        let _ = sub.tx.send(stream.clone());
                    });
            }
        }
    }
}

struct SubscriptionGuard {
    shared: Arc<Shared>,
    id: u64,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.shared.subscriptions.lock().remove(&self.id);
    }
}

async fn bind_discovery_socket(config: &DiscoveryConfig) -> Result<UdpSocket> {
    let socket = match UdpSocket::bind(config.bind).await {
        Ok(socket) => socket,
        Err(err) if err.kind() == ErrorKind::AddrInUse && config.bind.port() != 0 => {
            // Another process owns the well-known port. Queries still
            // work since answers come back to the sending socket.
            warn!(bind = %config.bind, "discovery port in use, falling back to an ephemeral port");
            UdpSocket::bind(SocketAddr::new(config.bind.ip(), 0)).await?
        }
        Err(err) => return Err(err.into()),
    };

    socket.set_broadcast(true)?;
    socket.set_ttl(config.ttl)?;
    if let Some(group) = config.multicast_group {
        socket.join_multicast_v4(group, Ipv4Addr::UNSPECIFIED)?;
        socket.set_multicast_ttl_v4(config.ttl)?;
        socket.set_multicast_loop_v4(true)?;
    }
    Ok(socket)
}

async fn receive_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];

    loop {
        let (len, from) = tokio::select! {
            _ = stopped(&mut shutdown) => break,
            received = shared.socket.recv_from(&mut buf) => match received {
                Ok(received) => received,
                Err(err) => {
                    // ICMP errors from earlier sends surface here on some
                    // platforms; they do not affect the socket.
                    debug!("discovery receive failed: {err}");
                    continue;
                }
            },
        };

        match DiscoveryMessage::decode(&buf[..len]) {
            Ok(msg) => shared.handle(msg, from),
            Err(err) => debug!(%from, "ignoring malformed discovery datagram: {err}"),
        }
    }

    debug!("discovery receive loop stopped");
}

async fn announce_loop(shared: Arc<Shared>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(shared.config.announce_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = ticker.tick() => {}
        }

        let announcements: Vec<Vec<u8>> = shared
            .advertised
            .lock()
            .values()
            .filter_map(|info| {
                DiscoveryMessage::Announce {
                    stream: info.without_desc(),
                }
                .encode()
                .ok()
            })
            .collect();

        for bytes in &announcements {
            shared.send_to_peers(bytes).await;
        }
    }

    debug!("announcer stopped");
}

/// Live, self-updating set of matching streams.
///
/// Entries are refreshed by answers to periodic queries and by
/// announcements; an entry not refreshed within `forget_after` is
/// removed, since producers may vanish without notice.
pub struct ContinuousResolver {
    results: Arc<Mutex<IndexMap<String, (StreamInfo, Instant)>>>,
    updates: watch::Receiver<Vec<StreamInfo>>,
    forget_after: Duration,
    tasks: TaskGroup,
}

impl ContinuousResolver {
    fn new(resolver: Resolver, predicate: Predicate) -> Self {
        let results = Arc::new(Mutex::new(IndexMap::new()));
        let (updates_tx, updates) = watch::channel(Vec::new());
        let forget_after = resolver.shared.config.forget_after;
        let tasks = TaskGroup::new("continuous-resolver");

        tasks.spawn(refresh_loop(
            resolver,
            predicate,
            results.clone(),
            updates_tx,
            tasks.shutdown_signal(),
        ));

        Self {
            results,
            updates,
            forget_after,
            tasks,
        }
    }

    /// Streams currently considered present.
    pub fn results(&self) -> Vec<StreamInfo> {
        let mut results = self.results.lock();
        prune(&mut results, self.forget_after);
        results.values().map(|(info, _)| info.clone()).collect()
    }

    /// A receiver notified whenever streams appear or disappear.
    pub fn updates(&self) -> watch::Receiver<Vec<StreamInfo>> {
        self.updates.clone()
    }

    pub async fn close(&self) {
        self.tasks.shutdown().await;
    }
}

async fn refresh_loop(
    resolver: Resolver,
    predicate: Predicate,
    results: Arc<Mutex<IndexMap<String, (StreamInfo, Instant)>>>,
    updates: watch::Sender<Vec<StreamInfo>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let shared = resolver.shared.clone();
    let (id, rx, _guard) = shared.subscribe(Some(predicate.clone()));
    let query = match (DiscoveryMessage::Query {
        id,
        session_id: shared.config.session_id.clone(),
        predicate: predicate.clone(),
    })
    .encode()
    {
        Ok(query) => query,
        Err(err) => {
            warn!("cannot encode continuous query: {err}");
            return;
        }
    };

    let mut ticker = tokio::time::interval(shared.config.query_interval.max(Duration::from_millis(10)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = ticker.tick() => {
                shared.send_to_peers(&query).await;
                let now = Instant::now();
                let mut results = results.lock();
                for info in shared.local_matches(&predicate) {
                    results.insert(info.uid().to_string(), (info, now));
                }
                prune(&mut results, shared.config.forget_after);
            }
            received = rx.recv_async() => {
                let Ok(info) = received else { break };
                results.lock().insert(info.uid().to_string(), (info, Instant::now()));
            }
        }

        let snapshot: Vec<StreamInfo> = results.lock().values().map(|(info, _)| info.clone()).collect();
        updates.send_if_modified(|current| {
            let changed = current.iter().map(StreamInfo::uid).ne(snapshot.iter().map(StreamInfo::uid));
            if changed {
                *current = snapshot;
            }
            changed
        });
    }
}

fn prune(results: &mut IndexMap<String, (StreamInfo, Instant)>, forget_after: Duration) {
    let now = Instant::now();
    let stale = results
        .iter()
        .filter(|(_, (_, seen))| now.duration_since(*seen) > forget_after)
        .map(|(uid, _)| uid.clone())
        .collect_vec();
    for uid in stale {
        debug!(%uid, "forgetting stream");
        results.shift_remove(&uid);
    }
}

fn deadline_after(wait: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(wait).unwrap_or_else(|| now + FOREVER)
}

/// Starting point for query ids, so that restarted processes do not
/// reuse the ids of their predecessors.
fn rand_seed() -> u64 {
    let uuid = uuid::Uuid::new_v4();
    uuid.as_u64_pair().0 >> 16
}
