use crate::actor::{self, SerialToken};
use crate::common::{Clock, HybridTime, MemTracker, OpId, RealClock, ReplicationError, Result};
use crate::consensus::log_cache::{LogCache, ReadOpsResult};
use crate::consensus::watermark::{
    compute_watermark, HtLeasePolicy, LeaderLeasePolicy, NumSstFilesPolicy, OpIdPolicy, WatermarkPolicy,
};
use crate::consensus::{
    CommitProgress, ConsensusErrorCode, ConsensusRequest, ConsensusResponse, ConsensusStatus, LeaseWatermark,
    LogCacheOptions, MajorityReplicatedData, MemberType, QueueObserver, QueueOptions, RaftConfig,
    RemoteBootstrapRequest, TabletErrorCode, TrackedPeer,
};
use crate::grpc::ConsensusRequestPb;
use crate::wal::{Log, LogRecord, StatusCallback};
use parking_lot::Mutex;
use prost::Message;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::time::{Duration, Instant};

/// Our copy of a follower's leader lease has to run out before the follower's own.
const LEASE_CLOCK_MARGIN: Duration = Duration::from_millis(2);

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueState {
    Constructed,
    Open,
    Closed,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum QueueMode {
    NonLeader,
    Leader,
}

/// Supplies the leader's safe time for followers that are fully caught up.
pub type SafeTimeProvider = Arc<dyn Fn() -> HybridTime + Send + Sync>;

/// The next request for one follower, and what the caller needs to know to send it.
#[derive(Clone, Debug)]
pub struct PeerRequest {
    pub request: ConsensusRequest,
    /// The request is status-only; the follower has to be remotely bootstrapped.
    pub needs_remote_bootstrap: bool,
    pub member_type: MemberType,
    pub last_exchange_successful: bool,
}

struct QueueInner {
    state: QueueState,
    mode: QueueMode,
    peers: HashMap<String, TrackedPeer>,
    current_term: i64,
    committed_op_id: OpId,
    majority_replicated_op_id: OpId,
    all_replicated_op_id: OpId,
    all_nonlagging_replicated_op_id: OpId,
    all_applied_op_id: OpId,
    last_applied_op_id: OpId,
    last_appended: OpId,
    majority_size: Option<usize>,
    active_config: Option<RaftConfig>,
    cdc_consumer_op_id: OpId,
    cdc_consumer_op_id_updated_at: Option<Instant>,
    observers: Vec<Arc<dyn QueueObserver>>,
}

impl QueueInner {
    fn watermark<P: WatermarkPolicy>(&self, logger: &slog::Logger, local_uuid: &str) -> P::Value {
        compute_watermark::<P, _>(logger, self.peers.values(), local_uuid, self.majority_size)
    }

    fn num_sst_files_watermark(&self, logger: &slog::Logger, local_uuid: &str) -> u64 {
        let watermark = self.watermark::<NumSstFilesPolicy>(logger, local_uuid);
        let local = self.peers.get(local_uuid).map_or(0, |p| p.num_sst_files);
        watermark.max(local)
    }

    /// Unchanged while any peer lacks a successful exchange.
    fn update_all_replicated_op_id(&mut self) {
        let mut new_op_id = OpId::MAX;
        for peer in self.peers.values() {
            if !peer.is_last_exchange_successful {
                return;
            }
            if peer.last_received.index < new_op_id.index {
                new_op_id = peer.last_received;
            }
        }
        if new_op_id != OpId::MAX {
            self.all_replicated_op_id = new_op_id;
        }
    }

    fn update_all_applied_op_id(&mut self) {
        let mut new_op_id = OpId::MAX;
        for peer in self.peers.values() {
            if !peer.is_last_exchange_successful {
                return;
            }
            new_op_id = new_op_id.min(peer.last_applied);
        }
        if new_op_id != OpId::MAX {
            self.all_applied_op_id = new_op_id;
        }
    }

    /// Never moves backwards, so a follower that stops lagging cannot pull eviction back.
    fn update_all_nonlagging_replicated_op_id(&mut self, logger: &slog::Logger, threshold: u32) {
        let new_op_id = self
            .peers
            .values()
            .filter(|peer| !peer.is_lagging(threshold))
            .map(|peer| peer.last_received)
            .min_by_key(|op_id| op_id.index)
            .unwrap_or_else(|| {
                slog::info!(logger, "Non lagging peer(s) not found");
                self.all_replicated_op_id
            });
        if self.all_nonlagging_replicated_op_id.index < new_op_id.index {
            self.all_nonlagging_replicated_op_id = new_op_id;
        }
    }

    fn cdc_consumer_op_id_to_evict(&self, now: Instant, interval: Duration) -> OpId {
        match self.cdc_consumer_op_id_updated_at {
            Some(updated_at) if updated_at + interval > now => self.cdc_consumer_op_id,
            _ => OpId::MAX,
        }
    }
}

/// What `response_from_peer` decided while holding the queue lock.
enum ResponseOutcome {
    Done(bool),
    TermChanged(i64),
    Progress {
        next_index: i64,
        peer_committed_idx: i64,
        committed_idx: i64,
        evict_index: i64,
        majority_replicated: Option<MajorityReplicatedData>,
    },
}

/// ReplicationQueue fans the leader's log out to every tracked peer, tracks what each one has
/// acknowledged, and turns those acknowledgements into majority watermarks for the commit index and
/// leases. As a follower it only does the local bookkeeping.
///
/// Queue state is guarded by one lock, which is never held while calling into the log cache or an
/// observer. Observer notifications for the tablet run on its serial token, in the order they were
/// triggered.
pub struct ReplicationQueue<C: Clock = RealClock> {
    logger: slog::Logger,
    weak_self: Weak<Self>,
    tablet_id: String,
    local_uuid: String,
    clock: C,
    options: QueueOptions,
    log_cache: LogCache,
    inner: Mutex<QueueInner>,
    notifications: SerialToken,
    append_in_progress: AtomicBool,
    safe_time_provider: Mutex<Option<SafeTimeProvider>>,
}

impl ReplicationQueue<RealClock> {
    pub fn new(
        logger: slog::Logger,
        local_uuid: impl Into<String>,
        log: Arc<Log>,
        server_tracker: &Arc<MemTracker>,
        cache_options: &LogCacheOptions,
        options: QueueOptions,
    ) -> Arc<Self> {
        Self::with_clock(logger, local_uuid, log, server_tracker, cache_options, options, RealClock)
    }
}

impl<C: Clock> ReplicationQueue<C> {
    /// Must be called from within a Tokio runtime.
    pub fn with_clock(
        logger: slog::Logger,
        local_uuid: impl Into<String>,
        log: Arc<Log>,
        server_tracker: &Arc<MemTracker>,
        cache_options: &LogCacheOptions,
        options: QueueOptions,
        clock: C,
    ) -> Arc<Self> {
        let local_uuid = local_uuid.into();
        let tablet_id = log.tablet_id().to_string();
        let logger = logger.new(slog::o!(
            "tablet_id" => tablet_id.clone(),
            "peer_id" => local_uuid.clone(),
            "component" => "queue",
        ));
        let log_cache = LogCache::new(logger.clone(), log, server_tracker, cache_options);
        let notifications = actor::spawn(logger.new(slog::o!("token" => "queue_observers")));

        Arc::new_cyclic(|weak_self| ReplicationQueue {
            logger,
            weak_self: weak_self.clone(),
            tablet_id,
            local_uuid,
            clock,
            options,
            log_cache,
            inner: Mutex::new(QueueInner {
                state: QueueState::Constructed,
                mode: QueueMode::NonLeader,
                peers: HashMap::new(),
                current_term: 0,
                committed_op_id: OpId::MIN,
                majority_replicated_op_id: OpId::MIN,
                all_replicated_op_id: OpId::MIN,
                all_nonlagging_replicated_op_id: OpId::MIN,
                all_applied_op_id: OpId::MIN,
                last_applied_op_id: OpId::MIN,
                last_appended: OpId::MIN,
                majority_size: None,
                active_config: None,
                cdc_consumer_op_id: OpId::MAX,
                cdc_consumer_op_id_updated_at: None,
                observers: Vec::new(),
            }),
            notifications,
            append_in_progress: AtomicBool::new(false),
            safe_time_provider: Mutex::new(None),
        })
    }

    /// Opens the queue after everything up to `last_locally_replicated` was replayed locally.
    pub fn init(&self, last_locally_replicated: OpId) -> Result<()> {
        if self.inner.lock().state != QueueState::Constructed {
            return Err(ReplicationError::IllegalState("Queue was already initialized".to_string()));
        }
        self.log_cache.init(last_locally_replicated)?;

        let mut inner = self.inner.lock();
        inner.last_appended = last_locally_replicated;
        inner.state = QueueState::Open;
        self.track_peer_locked(&mut inner, &self.local_uuid);
        Ok(())
    }

    /// Switches to leader mode for `term`. The local peer has to be a voter in `active_config`.
    pub fn set_leader_mode(&self, committed_op_id: OpId, term: i64, active_config: RaftConfig) -> Result<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        if !active_config.is_voter(&self.local_uuid) {
            slog::crit!(self.logger, "Local peer is not a voter in the active config {:?}", active_config);
            return Err(ReplicationError::Internal(format!(
                "Local peer {} is not a voter in the active config",
                self.local_uuid
            )));
        }

        inner.current_term = term;
        inner.committed_op_id = committed_op_id;
        inner.majority_replicated_op_id = committed_op_id;
        inner.majority_size = Some(active_config.count_voters() / 2 + 1);
        inner.mode = QueueMode::Leader;
        for peer in inner.peers.values_mut() {
            peer.reset_leases();
            peer.mark_communicated(now);
            if let Some(member) = active_config.member(&peer.uuid) {
                peer.member_type = member.member_type;
            }
        }
        inner.active_config = Some(active_config);
        slog::info!(
            self.logger,
            "Queue going to LEADER mode, term {}, committed {}, majority size {:?}",
            term,
            committed_op_id,
            inner.majority_size
        );
        Ok(())
    }

    pub fn set_non_leader_mode(&self) {
        let mut inner = self.inner.lock();
        inner.active_config = None;
        inner.majority_size = None;
        inner.mode = QueueMode::NonLeader;
        slog::info!(self.logger, "Queue going to NON_LEADER mode");
    }

    pub fn track_peer(&self, uuid: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != QueueState::Open {
            return Err(ReplicationError::IllegalState(format!(
                "Can't track peer {} in queue state {:?}",
                uuid, inner.state
            )));
        }
        if inner.peers.contains_key(uuid) {
            return Err(ReplicationError::AlreadyPresent(format!("Peer {} is already tracked", uuid)));
        }
        self.track_peer_locked(&mut inner, uuid);
        Ok(())
    }

    fn track_peer_locked(&self, inner: &mut QueueInner, uuid: &str) {
        let mut peer = TrackedPeer::new(uuid, inner.last_appended.index + 1, self.clock.now());
        if let Some(member) = inner.active_config.as_ref().and_then(|c| c.member(uuid)) {
            peer.member_type = member.member_type;
        }
        inner.peers.insert(uuid.to_string(), peer);
        // How far behind the new peer is remains unknown until it answers.
        inner.all_replicated_op_id = OpId::MIN;
    }

    pub fn untrack_peer(&self, uuid: &str) {
        if self.inner.lock().peers.remove(uuid).is_some() {
            slog::info!(self.logger, "Untracked peer {}", uuid);
        }
    }

    /// Appends locally led records. `callback` fires once they are durable, after the local peer's
    /// progress was recorded. Appends must come from one caller at a time.
    pub fn append_operations(
        &self,
        records: Vec<Arc<LogRecord>>,
        committed_op_id: OpId,
        batch_time: Instant,
        callback: StatusCallback,
    ) -> Result<()> {
        if self.append_in_progress.swap(true, Ordering::AcqRel) {
            slog::crit!(self.logger, "Concurrent append to the queue");
            return Err(ReplicationError::Internal(
                "Operations may only be appended by one caller at a time".to_string(),
            ));
        }
        let result = self.do_append_operations(records, committed_op_id, batch_time, callback);
        self.append_in_progress.store(false, Ordering::Release);
        result
    }

    fn do_append_operations(
        &self,
        records: Vec<Arc<LogRecord>>,
        committed_op_id: OpId,
        batch_time: Instant,
        callback: StatusCallback,
    ) -> Result<()> {
        let last_id = match records.last() {
            Some(record) => record.op_id,
            None => self.inner.lock().last_appended,
        };
        {
            let mut inner = self.inner.lock();
            if last_id.term > inner.current_term {
                inner.current_term = last_id.term;
            }
        }

        let op_ids: Vec<OpId> = records.iter().map(|r| r.op_id).collect();
        let weak_self = self.weak_self.clone();
        let local_callback: StatusCallback = Box::new(move |result| {
            if let Some(queue) = weak_self.upgrade() {
                queue.local_peer_append_finished(last_id, &op_ids, &result);
            }
            callback(result);
        });

        // The lock is not held here: the append pipeline calls back into the queue.
        self.log_cache
            .append_operations(records, committed_op_id, batch_time, local_callback)?;

        self.inner.lock().last_appended = last_id;
        Ok(())
    }

    /// Runs on the WAL appender once a local append is durable.
    fn local_peer_append_finished(&self, id: OpId, op_ids: &[OpId], result: &Result<()>) {
        if let Err(e) = result {
            slog::error!(self.logger, "Local append of {} failed: {}", id, e);
            return;
        }
        self.log_cache.track_operations_memory(op_ids);

        let fake_response = {
            let inner = self.inner.lock();
            if inner.state != QueueState::Open {
                return;
            }
            if inner.mode != QueueMode::Leader {
                drop(inner);
                self.log_cache.evict_through_op(id.index, i64::MAX);
                return;
            }
            ConsensusResponse {
                responder_uuid: self.local_uuid.clone(),
                responder_term: Some(inner.current_term),
                status: Some(ConsensusStatus {
                    last_received: id,
                    last_received_current_leader: id,
                    last_committed_idx: inner.committed_op_id.index,
                    last_applied: inner.last_applied_op_id,
                    error: None,
                }),
                error: None,
                num_sst_files: inner.peers.get(&self.local_uuid).map_or(0, |p| p.num_sst_files),
            }
        };

        if let Err(e) = self.response_from_peer(&self.local_uuid, &fake_response) {
            slog::error!(self.logger, "Unable to record local append of {}: {}", id, e);
        }
    }

    /// Builds the next request for follower `uuid`.
    pub fn request_for_peer(&self, uuid: &str) -> Result<PeerRequest> {
        if uuid == self.local_uuid {
            return Err(ReplicationError::InvalidArgument(
                "Requests are never built for the local peer".to_string(),
            ));
        }
        // Taken first so it never exceeds the propagated hybrid time.
        let safe_time = self.safe_time_provider.lock().as_ref().map(|provider| provider());
        let now = self.clock.now();
        let now_ht = self.clock.hybrid_now();

        let mut request = ConsensusRequest {
            tablet_id: self.tablet_id.clone(),
            caller_uuid: self.local_uuid.clone(),
            dest_uuid: uuid.to_string(),
            propagated_hybrid_time: now_ht,
            ..ConsensusRequest::default()
        };

        let (is_new, next_index, to_index, needs_remote_bootstrap, member_type, last_exchange_successful, failed) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if inner.state != QueueState::Open {
                return Err(ReplicationError::IllegalState(format!("Queue is {:?}", inner.state)));
            }
            let voters = inner.active_config.as_ref().map_or(0, |c| c.count_voters());
            let mode = inner.mode;
            let peer = match inner.peers.get_mut(uuid) {
                Some(peer) if mode == QueueMode::Leader => peer,
                _ => {
                    return Err(ReplicationError::NotFound(
                        "Peer not tracked or queue not in leader mode".to_string(),
                    ))
                }
            };

            if !peer.is_new {
                let lease_duration = self.options.leader_lease_duration;
                let ht_lease_expiration =
                    now_ht.physical_micros() + self.options.ht_lease_duration.as_micros() as u64;
                request.leader_lease_duration_ms = Some(lease_duration.as_millis() as u64);
                request.ht_lease_expiration = Some(ht_lease_expiration);
                peer.leader_lease_expiration.last_sent = Some(now + lease_duration - LEASE_CLOCK_MARGIN);
                peer.leader_ht_lease_expiration.last_sent = ht_lease_expiration;
            } else {
                peer.reset_leases();
            }

            // Replaced by the op preceding the first record, once records are found.
            request.preceding_id = inner.last_appended;
            request.committed_op_id = inner.committed_op_id;
            request.caller_term = inner.current_term;

            let to_index = if self.options.enable_exponential_backoff && peer.last_num_messages_sent >= 0 {
                // The previous request was not acknowledged, send fewer records. Inclusive.
                peer.next_index + ((peer.last_num_messages_sent >> 1) - 1).max(0)
            } else {
                0
            };
            peer.current_retransmissions += 1;

            let unreachable_time = now.saturating_duration_since(peer.last_successful_communication_time);
            let failed = if unreachable_time > self.options.follower_unavailable_considered_failed
                && !peer.failed_follower_notified
                && (peer.member_type != MemberType::Voter || voters > 2)
            {
                peer.failed_follower_notified = true;
                Some(format!(
                    "Leader has been unable to successfully communicate with peer {} for more than {:?} ({:?})",
                    uuid, self.options.follower_unavailable_considered_failed, unreachable_time
                ))
            } else {
                None
            };

            (
                peer.is_new,
                peer.next_index,
                to_index,
                peer.needs_remote_bootstrap,
                peer.member_type,
                peer.is_last_exchange_successful,
                failed,
            )
        };

        if let Some(reason) = failed {
            slog::warn!(self.logger, "{}", reason);
            self.notify_observers_of_failed_follower(uuid, request.caller_term, reason);
        }

        let mut peer_request = PeerRequest {
            request,
            needs_remote_bootstrap,
            member_type,
            last_exchange_successful,
        };
        if needs_remote_bootstrap {
            slog::info!(self.logger, "Peer needs remote bootstrap: {}", uuid);
            return Ok(peer_request);
        }

        // Nothing is known about a new peer yet, it gets a status-only request.
        if !is_new {
            let request = &mut peer_request.request;
            let overhead = ConsensusRequestPb::from(&*request).encoded_len();
            let max_batch_size = self.options.max_batch_size_bytes().saturating_sub(overhead);
            let result = match self.read_from_log_cache(next_index - 1, to_index, max_batch_size) {
                Ok(result) => result,
                Err(e) => {
                    if e.is_not_found() {
                        let reason = format!(
                            "The logs necessary to catch up peer {} have been garbage collected. \
                             The follower will never be able to catch up ({})",
                            uuid, e
                        );
                        self.notify_observers_of_failed_follower(uuid, request.caller_term, reason);
                    }
                    return Err(e);
                }
            };

            if let Some(last) = result.messages.last() {
                // A lagging follower must not learn of a commit beyond what it is sent.
                if last.op_id.index < request.committed_op_id.index {
                    request.committed_op_id = last.op_id;
                }
            }
            request.preceding_id = result.preceding_op;

            {
                let mut inner = self.inner.lock();
                let peer = inner
                    .peers
                    .get_mut(uuid)
                    .ok_or_else(|| ReplicationError::NotFound("Peer not tracked".to_string()))?;
                peer.last_num_messages_sent = result.messages.len() as i64;
            }

            if !result.have_more_messages && to_index == 0 {
                request.propagated_safe_time = safe_time;
            }
            slog::trace!(
                self.logger,
                "Sending request to {} with {} ops after {}",
                uuid,
                result.messages.len(),
                request.preceding_id
            );
            request.ops = result.messages;
        }

        Ok(peer_request)
    }

    fn read_from_log_cache(&self, after_index: i64, to_index: i64, max_batch_size: usize) -> Result<ReadOpsResult> {
        self.log_cache
            .read_ops(after_index, to_index, max_batch_size)
            .map_err(|e| {
                if e.is_incomplete() {
                    slog::error!(self.logger, "Tried to read ops past the end of the log after {}: {}", after_index, e);
                } else if !e.is_not_found() {
                    slog::error!(self.logger, "Error reading the log after {}: {}", after_index, e);
                }
                e
            })
    }

    /// True when our log holds exactly `op_id`.
    fn is_op_in_log(&self, op_id: OpId) -> bool {
        match self.log_cache.lookup_op_id(op_id.index) {
            Ok(found) => found == op_id,
            Err(e) if e.is_incomplete() || e.is_not_found() => false,
            Err(e) => {
                slog::error!(self.logger, "Error looking up {} in the log: {}", op_id, e);
                false
            }
        }
    }

    /// Processes follower `uuid`'s answer. Returns whether there is more to send it right away.
    pub fn response_from_peer(&self, uuid: &str, response: &ConsensusResponse) -> Result<bool> {
        let in_log = response
            .status
            .as_ref()
            .map_or(false, |status| self.is_op_in_log(status.last_received));
        let now = self.clock.now();

        let outcome = {
            let mut inner = self.inner.lock();
            self.process_response_locked(&mut inner, uuid, response, in_log, now)?
        };

        match outcome {
            ResponseOutcome::Done(more_pending) => Ok(more_pending),
            ResponseOutcome::TermChanged(term) => {
                self.notify_observers_of_term_change(term);
                Ok(false)
            }
            ResponseOutcome::Progress {
                next_index,
                peer_committed_idx,
                committed_idx,
                evict_index,
                majority_replicated,
            } => {
                let more_pending = self.log_cache.has_op_been_written(next_index) || peer_committed_idx < committed_idx;
                self.log_cache.evict_through_op(evict_index, i64::MAX);
                if let Some(data) = majority_replicated {
                    self.notify_observers_of_majority_repl_op_change(data);
                }
                Ok(more_pending)
            }
        }
    }

    fn process_response_locked(
        &self,
        inner: &mut QueueInner,
        uuid: &str,
        response: &ConsensusResponse,
        in_log: bool,
        now: Instant,
    ) -> Result<ResponseOutcome> {
        if inner.state != QueueState::Open || !inner.peers.contains_key(uuid) {
            slog::warn!(
                self.logger,
                "Queue is closed or peer was untracked, disregarding peer response: {}",
                response
            );
            return Ok(ResponseOutcome::Done(false));
        }

        let member_type = match &inner.active_config {
            Some(config) => match config.member(uuid) {
                Some(member) => member.member_type,
                None => {
                    slog::crit!(self.logger, "Peer {} not in active config", uuid);
                    return Err(ReplicationError::Internal(format!("Peer {} not in active config", uuid)));
                }
            },
            None => MemberType::Unknown,
        };
        let current_term = inner.current_term;
        let mode = inner.mode;
        let peer = match inner.peers.get_mut(uuid) {
            Some(peer) => peer,
            None => return Ok(ResponseOutcome::Done(false)),
        };

        if let Some(error) = &response.error {
            if error.code != TabletErrorCode::TabletNotFound {
                slog::crit!(self.logger, "Unexpected tablet error from {}: {}", uuid, response);
                return Err(ReplicationError::Internal(format!(
                    "Unexpected tablet error {:?} from peer {}",
                    error.code, uuid
                )));
            }
            peer.needs_remote_bootstrap = true;
            // The peer is alive, it must not be failed over while bootstrapping.
            peer.mark_communicated(now);
            slog::info!(self.logger, "Marked peer as needing remote bootstrap: {}", peer);
            return Ok(ResponseOutcome::Done(true));
        }

        peer.member_type = member_type;
        let previous_is_new = peer.is_new;
        peer.is_new = false;
        peer.mark_communicated(now);
        peer.last_num_messages_sent = -1;
        peer.current_retransmissions = -1;

        if let Some(status) = &response.status {
            peer.last_known_committed_idx = status.last_committed_idx;
            peer.last_applied = status.last_applied;

            if in_log {
                peer.last_received = status.last_received;
                peer.next_index = peer.last_received.index + 1;
            } else if status.last_received_current_leader != OpId::MIN {
                // Diverged, but this leader is already overwriting the divergent suffix.
                peer.last_received = status.last_received_current_leader;
                peer.next_index = peer.last_received.index + 1;
            } else {
                // Diverged and nothing received from us yet: restart from the peer's commit point
                // instead of stepping back one op at a time.
                peer.next_index = peer.last_known_committed_idx + 1;
            }

            if let Some(error) = &status.error {
                peer.is_last_exchange_successful = false;
                match error.code {
                    ConsensusErrorCode::PrecedingEntryDidntMatch => {
                        if previous_is_new {
                            slog::info!(self.logger, "Connected to new peer: {}", peer);
                        } else {
                            slog::info!(self.logger, "Got LMP mismatch error from peer: {}", peer);
                        }
                        return Ok(ResponseOutcome::Done(true));
                    }
                    ConsensusErrorCode::InvalidTerm => {
                        let term = response.responder_term.ok_or_else(|| {
                            ReplicationError::Internal(format!("Invalid term response from {} without a term", uuid))
                        })?;
                        slog::info!(self.logger, "Peer responded invalid term: {}. Peer's new term: {}", peer, term);
                        return Ok(ResponseOutcome::TermChanged(term));
                    }
                    ConsensusErrorCode::Unknown => {
                        slog::crit!(self.logger, "Unexpected consensus error: {}", response);
                        return Err(ReplicationError::Internal(format!(
                            "Unexpected consensus error from peer {}: {}",
                            uuid, error.message
                        )));
                    }
                }
            }
        }

        peer.is_last_exchange_successful = true;
        peer.num_sst_files = response.num_sst_files;

        if let Some(term) = response.responder_term {
            // Without an error the responder cannot be ahead of us.
            if term > current_term {
                slog::crit!(self.logger, "Peer {} answered term {} without error, ours is {}", uuid, term, current_term);
                return Err(ReplicationError::Internal(format!(
                    "Peer {} is at term {} beyond the queue's term {}",
                    uuid, term, current_term
                )));
            }
        }

        if mode == QueueMode::Leader {
            peer.leader_lease_expiration.on_reply();
            peer.leader_ht_lease_expiration.on_reply();
        }
        let next_index = peer.next_index;
        let peer_committed_idx = peer.last_known_committed_idx;
        slog::trace!(self.logger, "Received response from peer {}: {}", peer, response);

        let majority_replicated = if mode == QueueMode::Leader {
            let new_majority_replicated = inner.watermark::<OpIdPolicy>(&self.logger, &self.local_uuid);
            if new_majority_replicated != OpId::MIN {
                inner.majority_replicated_op_id = new_majority_replicated;
            }
            Some(MajorityReplicatedData {
                op_id: inner.majority_replicated_op_id,
                leader_lease_expiration: inner.watermark::<LeaderLeasePolicy>(&self.logger, &self.local_uuid),
                ht_lease_expiration: inner.watermark::<HtLeasePolicy>(&self.logger, &self.local_uuid),
                num_sst_files: inner.num_sst_files_watermark(&self.logger, &self.local_uuid),
            })
        } else {
            None
        };

        inner.update_all_replicated_op_id();
        inner.update_all_applied_op_id();

        let mut evict_index = inner
            .cdc_consumer_op_id_to_evict(now, self.options.cdc_checkpoint_interval)
            .index;
        let threshold = self.options.lagging_follower_threshold;
        if threshold > 0 {
            inner.update_all_nonlagging_replicated_op_id(&self.logger, threshold);
            evict_index = evict_index.min(inner.all_nonlagging_replicated_op_id.index);
        } else {
            evict_index = evict_index.min(inner.all_replicated_op_id.index);
        }

        Ok(ResponseOutcome::Progress {
            next_index,
            peer_committed_idx,
            committed_idx: inner.committed_op_id.index,
            evict_index,
            majority_replicated,
        })
    }

    /// An error came back, but the peer is evidently alive.
    pub fn notify_peer_is_responsive_despite_error(&self, uuid: &str) {
        let now = self.clock.now();
        if let Some(peer) = self.inner.lock().peers.get_mut(uuid) {
            peer.mark_communicated(now);
        }
    }

    /// Hands out the remote bootstrap trigger for `uuid`, once per time the need was detected.
    pub fn get_remote_bootstrap_request_for_peer(&self, uuid: &str) -> Result<RemoteBootstrapRequest> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mode = inner.mode;
        let peer = match inner.peers.get_mut(uuid) {
            Some(peer) if mode == QueueMode::Leader => peer,
            _ => {
                return Err(ReplicationError::NotFound(
                    "Peer not tracked or queue not in leader mode".to_string(),
                ))
            }
        };
        if !peer.needs_remote_bootstrap {
            return Err(ReplicationError::IllegalState(format!(
                "Peer {} does not need to remotely bootstrap",
                uuid
            )));
        }

        if peer.member_type == MemberType::Voter || peer.member_type == MemberType::Observer {
            slog::info!(
                self.logger,
                "Remote bootstrapping peer {} with type {:?}",
                uuid,
                peer.member_type
            );
        }
        peer.needs_remote_bootstrap = false;

        let bootstrap_peer_addr = inner
            .active_config
            .as_ref()
            .and_then(|c| c.member(&self.local_uuid))
            .and_then(|m| m.last_known_addr.clone());
        Ok(RemoteBootstrapRequest {
            dest_uuid: uuid.to_string(),
            tablet_id: self.tablet_id.clone(),
            bootstrap_peer_uuid: self.local_uuid.clone(),
            bootstrap_peer_addr,
            caller_term: inner.current_term,
        })
    }

    /// Follower `uuid` acknowledged a leader lease from us.
    pub fn peer_accepted_our_lease(&self, uuid: &str) -> bool {
        self.inner
            .lock()
            .peers
            .get(uuid)
            .map_or(false, |peer| peer.leader_lease_expiration.last_received.is_some())
    }

    /// Whether `uuid` has everything the majority has, so it could take over leadership.
    pub fn can_peer_become_leader(&self, uuid: &str) -> bool {
        let inner = self.inner.lock();
        match inner.peers.get(uuid) {
            Some(peer) => {
                let can_be_leader = peer.last_received >= inner.majority_replicated_op_id;
                slog::info!(
                    self.logger,
                    "Peer {} {} become leader, last received {}, majority replicated {}",
                    uuid,
                    if can_be_leader { "can" } else { "cannot" },
                    peer.last_received,
                    inner.majority_replicated_op_id
                );
                can_be_leader
            }
            None => false,
        }
    }

    /// A random remote peer among those with the most recent last-received op.
    pub fn get_up_to_date_peer(&self) -> Option<String> {
        let inner = self.inner.lock();
        let remotes: Vec<&TrackedPeer> = inner.peers.values().filter(|p| p.uuid != self.local_uuid).collect();
        let highest = remotes.iter().map(|p| p.last_received).max()?;
        let candidates: Vec<&str> = remotes
            .iter()
            .filter(|p| p.last_received == highest)
            .map(|p| p.uuid.as_str())
            .collect();
        candidates.choose(&mut rand::thread_rng()).map(|uuid| uuid.to_string())
    }

    /// Committed records after `last_op_id` for a change data capture consumer. An empty
    /// `last_op_id` starts at the oldest record still available.
    pub fn read_replicated_messages_for_cdc(&self, last_op_id: OpId) -> Result<ReadOpsResult> {
        let (to_index, pending_messages) = {
            let inner = self.inner.lock();
            (
                inner.committed_op_id.index,
                inner.committed_op_id != inner.majority_replicated_op_id,
            )
        };

        if last_op_id.index >= to_index {
            return Ok(ReadOpsResult {
                preceding_op: last_op_id,
                have_more_messages: pending_messages,
                ..ReadOpsResult::default()
            });
        }

        let after_index = if last_op_id.is_empty() {
            self.log_cache.earliest_op_index().max(last_op_id.index)
        } else {
            last_op_id.index
        };
        let mut result = self
            .read_from_log_cache(after_index, to_index, self.options.max_batch_size_bytes())
            .map_err(|e| {
                if e.is_not_found() {
                    slog::info!(self.logger, "Records after {} for CDC were garbage collected: {}", after_index, e);
                }
                e
            })?;
        result.have_more_messages |= pending_messages;
        Ok(result)
    }

    /// Records where a change data capture consumer has read up to. While fresh it holds back
    /// log cache eviction.
    pub fn update_cdc_consumer_op_id(&self, op_id: OpId) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.cdc_consumer_op_id = op_id;
        inner.cdc_consumer_op_id_updated_at = Some(now);
    }

    /// The local storage flushed or compacted, leaving `num_sst_files` files.
    pub fn num_sst_files_changed(&self, num_sst_files: u64) {
        let majority_num_sst_files = {
            let mut inner = self.inner.lock();
            if let Some(local) = inner.peers.get_mut(&self.local_uuid) {
                local.num_sst_files = num_sst_files;
            }
            if inner.mode != QueueMode::Leader {
                return;
            }
            inner.num_sst_files_watermark(&self.logger, &self.local_uuid)
        };

        self.submit_to_observers("num SST files changed", move |observer| {
            observer.majority_replicated_num_sst_files_changed(majority_num_sst_files);
        });
    }

    pub fn set_safe_time_provider(&self, provider: SafeTimeProvider) {
        *self.safe_time_provider.lock() = Some(provider);
    }

    pub fn register_observer(&self, observer: Arc<dyn QueueObserver>) {
        let mut inner = self.inner.lock();
        if !inner.observers.iter().any(|o| same_observer(o, &observer)) {
            inner.observers.push(observer);
        }
    }

    pub fn unregister_observer(&self, observer: &Arc<dyn QueueObserver>) -> Result<()> {
        let mut inner = self.inner.lock();
        match inner.observers.iter().position(|o| same_observer(o, observer)) {
            Some(position) => {
                inner.observers.remove(position);
                Ok(())
            }
            None => Err(ReplicationError::NotFound("Can't find observer".to_string())),
        }
    }

    /// Evicts up to `bytes_to_evict` of records every peer already has.
    pub fn evict_log_cache(&self, bytes_to_evict: i64) -> i64 {
        let all_replicated_index = self.inner.lock().all_replicated_op_id.index;
        self.log_cache.evict_through_op(all_replicated_index, bytes_to_evict)
    }

    pub fn log_cache_size(&self) -> i64 {
        self.log_cache.bytes_used()
    }

    pub fn log_cache(&self) -> &LogCache {
        &self.log_cache
    }

    /// Stops observer notifications and forgets every peer. Permanent.
    pub fn close(&self) {
        self.notifications.shutdown();
        let mut inner = self.inner.lock();
        inner.peers.clear();
        inner.state = QueueState::Closed;
    }

    /// Resolves once every notification triggered so far was delivered.
    pub async fn wait_for_notifications(&self) -> Result<()> {
        self.notifications.wait_idle().await
    }

    // ------- Observer notifications --------

    fn notify_observers_of_majority_repl_op_change(&self, data: MajorityReplicatedData) {
        let weak_self = self.weak_self.clone();
        let submitted = self.notifications.submit(move || {
            if let Some(queue) = weak_self.upgrade() {
                queue.notify_observers_of_majority_repl_op_change_task(data);
            }
        });
        if let Err(e) = submitted {
            slog::warn!(self.logger, "Unable to notify observers of majority replicated {}: {}", data, e);
        }
    }

    fn notify_observers_of_majority_repl_op_change_task(&self, data: MajorityReplicatedData) {
        let observers = self.inner.lock().observers.clone();

        let mut new_committed_op_id = OpId::MIN;
        let mut last_applied_op_id = OpId::MIN;
        for observer in &observers {
            match observer.update_majority_replicated(&data) {
                Ok(CommitProgress {
                    committed_op_id,
                    last_applied_op_id: applied,
                }) => {
                    if committed_op_id.index > new_committed_op_id.index {
                        new_committed_op_id = committed_op_id;
                    }
                    last_applied_op_id.make_at_least(applied);
                }
                Err(e) => slog::warn!(self.logger, "Observer failed to handle majority replicated {}: {}", data, e),
            }
        }

        let mut inner = self.inner.lock();
        if new_committed_op_id.index > inner.committed_op_id.index {
            inner.committed_op_id = new_committed_op_id;
        }
        inner.last_applied_op_id.make_at_least(last_applied_op_id);
        let last_applied = inner.last_applied_op_id;
        if let Some(local) = inner.peers.get_mut(&self.local_uuid) {
            local.last_applied = last_applied;
        }
        inner.update_all_applied_op_id();
    }

    fn notify_observers_of_term_change(&self, term: i64) {
        self.submit_to_observers("term change", move |observer| observer.notify_term_change(term));
    }

    fn notify_observers_of_failed_follower(&self, uuid: &str, term: i64, reason: String) {
        let uuid = uuid.to_string();
        self.submit_to_observers("failed follower", move |observer| {
            observer.notify_failed_follower(&uuid, term, &reason)
        });
    }

    fn submit_to_observers<F>(&self, what: &'static str, notify: F)
    where
        F: Fn(&dyn QueueObserver) + Send + 'static,
    {
        let weak_self = self.weak_self.clone();
        let submitted = self.notifications.submit(move || {
            if let Some(queue) = weak_self.upgrade() {
                let observers = queue.inner.lock().observers.clone();
                for observer in &observers {
                    notify(observer.as_ref());
                }
            }
        });
        if let Err(e) = submitted {
            slog::warn!(self.logger, "Unable to notify observers of {}: {}", what, e);
        }
    }

    // ------- Accessors --------

    pub fn local_uuid(&self) -> &str {
        &self.local_uuid
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    pub fn state(&self) -> QueueState {
        self.inner.lock().state
    }

    pub fn mode(&self) -> QueueMode {
        self.inner.lock().mode
    }

    pub fn current_term(&self) -> i64 {
        self.inner.lock().current_term
    }

    pub fn tracked_peer(&self, uuid: &str) -> Option<TrackedPeer> {
        self.inner.lock().peers.get(uuid).cloned()
    }

    pub fn all_replicated_op_id(&self) -> OpId {
        self.inner.lock().all_replicated_op_id
    }

    pub fn majority_replicated_op_id(&self) -> OpId {
        self.inner.lock().majority_replicated_op_id
    }

    pub fn committed_op_id(&self) -> OpId {
        self.inner.lock().committed_op_id
    }

    pub fn last_appended(&self) -> OpId {
        self.inner.lock().last_appended
    }

    pub fn all_applied_op_id(&self) -> OpId {
        self.inner.lock().all_applied_op_id
    }

    pub fn last_applied_op_id(&self) -> OpId {
        self.inner.lock().last_applied_op_id
    }

    pub fn op_id_watermark(&self) -> OpId {
        self.inner.lock().watermark::<OpIdPolicy>(&self.logger, &self.local_uuid)
    }

    pub fn leader_lease_expiration_watermark(&self) -> LeaseWatermark {
        self.inner.lock().watermark::<LeaderLeasePolicy>(&self.logger, &self.local_uuid)
    }

    pub fn ht_lease_expiration_watermark(&self) -> u64 {
        self.inner.lock().watermark::<HtLeasePolicy>(&self.logger, &self.local_uuid)
    }

    pub fn num_sst_files_watermark(&self) -> u64 {
        self.inner.lock().num_sst_files_watermark(&self.logger, &self.local_uuid)
    }
}

impl<C: Clock> fmt::Display for ReplicationQueue<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (majority_done, in_progress) = {
            let inner = self.inner.lock();
            (
                inner.committed_op_id.index - inner.all_replicated_op_id.index,
                inner.last_appended.index - inner.committed_op_id.index,
            )
        };
        write!(
            f,
            "Consensus queue metrics: Only Majority Done Ops: {}, In Progress Ops: {}, Cache: {}",
            majority_done,
            in_progress,
            self.log_cache.stats_string()
        )
    }
}

fn same_observer(a: &Arc<dyn QueueObserver>, b: &Arc<dyn QueueObserver>) -> bool {
    Arc::as_ptr(a) as *const () == Arc::as_ptr(b) as *const ()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{mocked_clock, MockClock, MockClockController};
    use crate::consensus::{ConsensusError, RaftPeer, TabletServerError};
    use crate::wal::{append_completion, DurabilityPolicy, LogOptions, Payload};
    use bytes::Bytes;
    use std::ops::RangeInclusive;
    use tempfile::TempDir;

    const LOCAL: &str = "peer-local";
    const A: &str = "peer-a";
    const B: &str = "peer-b";
    const LOCAL_ADDR: &str = "http://127.0.0.1:7100";

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[derive(Default)]
    struct RecordingObserver {
        majority: Mutex<Vec<MajorityReplicatedData>>,
        terms: Mutex<Vec<i64>>,
        failed: Mutex<Vec<(String, String)>>,
        num_sst_files: Mutex<Vec<u64>>,
    }

    impl QueueObserver for RecordingObserver {
        fn update_majority_replicated(&self, data: &MajorityReplicatedData) -> Result<CommitProgress> {
            self.majority.lock().push(*data);
            Ok(CommitProgress {
                committed_op_id: data.op_id,
                last_applied_op_id: data.op_id,
            })
        }

        fn notify_term_change(&self, term: i64) {
            self.terms.lock().push(term);
        }

        fn notify_failed_follower(&self, peer_uuid: &str, _term: i64, reason: &str) {
            self.failed.lock().push((peer_uuid.to_string(), reason.to_string()));
        }

        fn majority_replicated_num_sst_files_changed(&self, majority_num_sst_files: u64) {
            self.num_sst_files.lock().push(majority_num_sst_files);
        }
    }

    struct Fixture {
        _dir: TempDir,
        queue: Arc<ReplicationQueue<MockClock>>,
        clock: MockClockController,
        observer: Arc<RecordingObserver>,
    }

    fn config() -> RaftConfig {
        RaftConfig::new(vec![
            RaftPeer::voter(LOCAL, Some(LOCAL_ADDR.to_string())),
            RaftPeer::voter(A, None),
            RaftPeer::voter(B, None),
        ])
    }

    fn new_fixture(options: QueueOptions) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let log_options = LogOptions {
            durability: DurabilityPolicy::Always,
            async_preallocate_segments: false,
            ..LogOptions::default()
        };
        let log = Arc::new(Log::open(test_logger(), "tablet-1", dir.path(), log_options, Bytes::new(), 0).unwrap());
        let cache_options = LogCacheOptions::default();
        let server_tracker = LogCache::server_tracker(&cache_options);
        let (clock, controller) = mocked_clock();

        let queue =
            ReplicationQueue::with_clock(test_logger(), LOCAL, log, &server_tracker, &cache_options, options, clock);
        queue.init(OpId::MIN).unwrap();
        let observer = Arc::new(RecordingObserver::default());
        queue.register_observer(observer.clone());

        Fixture {
            _dir: dir,
            queue,
            clock: controller,
            observer,
        }
    }

    /// Leader of term 1 over three voters, with both followers tracked.
    fn leader_fixture(options: QueueOptions) -> Fixture {
        let fixture = new_fixture(options);
        fixture.queue.set_leader_mode(OpId::MIN, 1, config()).unwrap();
        fixture.queue.track_peer(A).unwrap();
        fixture.queue.track_peer(B).unwrap();
        fixture
    }

    fn record(term: i64, index: i64) -> Arc<LogRecord> {
        Arc::new(LogRecord::new(
            OpId::new(term, index),
            HybridTime::from_micros(index as u64),
            Payload::ChangeConfig(Bytes::from(vec![b'q'; 32])),
        ))
    }

    async fn append(queue: &ReplicationQueue<MockClock>, term: i64, indexes: RangeInclusive<i64>) {
        let records = indexes.map(|i| record(term, i)).collect();
        let (callback, rx) = append_completion();
        queue
            .append_operations(records, queue.committed_op_id(), queue.clock().now(), callback)
            .unwrap();
        rx.await.unwrap().unwrap();
        queue.wait_for_notifications().await.unwrap();
    }

    fn ack(uuid: &str, index: i64, committed_idx: i64) -> ConsensusResponse {
        ConsensusResponse::success(uuid, 1, OpId::new(1, index), committed_idx)
    }

    fn lmp_mismatch(uuid: &str, last_received: OpId, committed_idx: i64) -> ConsensusResponse {
        ConsensusResponse {
            responder_uuid: uuid.to_string(),
            responder_term: Some(1),
            status: Some(ConsensusStatus {
                last_received,
                last_received_current_leader: OpId::MIN,
                last_committed_idx: committed_idx,
                last_applied: OpId::MIN,
                error: Some(ConsensusError {
                    code: ConsensusErrorCode::PrecedingEntryDidntMatch,
                    message: "Log matching property violated".to_string(),
                }),
            }),
            error: None,
            num_sst_files: 0,
        }
    }

    #[tokio::test]
    async fn majority_watermark_follows_acknowledgements() {
        // -- setup --
        let f = leader_fixture(QueueOptions::default());
        append(&f.queue, 1, 1..=5).await;
        assert_eq!(f.queue.tracked_peer(LOCAL).unwrap().last_received, OpId::new(1, 5));
        // Only the leader has the records.
        assert_eq!(f.queue.majority_replicated_op_id(), OpId::MIN);

        // -- execute & verify --
        assert!(f.queue.response_from_peer(B, &ack(B, 3, 0)).unwrap());
        f.queue.wait_for_notifications().await.unwrap();
        assert_eq!(f.queue.majority_replicated_op_id(), OpId::new(1, 3));
        assert_eq!(f.queue.committed_op_id(), OpId::new(1, 3));
        // A never answered.
        assert_eq!(f.queue.all_replicated_op_id(), OpId::MIN);

        // A has everything; the commit it knows of is current.
        assert!(!f.queue.response_from_peer(A, &ack(A, 5, 3)).unwrap());
        f.queue.wait_for_notifications().await.unwrap();
        assert_eq!(f.queue.majority_replicated_op_id(), OpId::new(1, 5));
        assert_eq!(f.queue.committed_op_id(), OpId::new(1, 5));
        assert_eq!(f.queue.all_replicated_op_id(), OpId::new(1, 3));

        assert!(!f.queue.response_from_peer(B, &ack(B, 5, 5)).unwrap());
        assert_eq!(f.queue.all_replicated_op_id(), OpId::new(1, 5));
        assert!(f.queue.all_replicated_op_id() <= f.queue.majority_replicated_op_id());

        let last = *f.observer.majority.lock().last().unwrap();
        assert_eq!(last.op_id, OpId::new(1, 5));
        assert_eq!(f.queue.last_applied_op_id(), OpId::new(1, 5));
        assert!(f.queue.to_string().contains("In Progress Ops: 0"));
    }

    #[tokio::test]
    async fn new_peer_is_probed_then_caught_up() {
        // -- setup --
        let f = leader_fixture(QueueOptions::default());
        f.queue.set_safe_time_provider(Arc::new(|| HybridTime::from_micros(42)));
        append(&f.queue, 1, 1..=5).await;

        // -- execute & verify --
        // A new peer gets a status-only request without a lease.
        let probe = f.queue.request_for_peer(A).unwrap();
        assert!(probe.request.ops.is_empty());
        assert_eq!(probe.request.preceding_id, OpId::new(1, 5));
        assert_eq!(probe.request.caller_term, 1);
        assert_eq!(probe.request.leader_lease_duration_ms, None);
        assert!(!probe.needs_remote_bootstrap);
        assert_eq!(probe.member_type, MemberType::Voter);

        // The peer is empty: it has the sentinel and nothing else.
        assert!(f.queue.response_from_peer(A, &lmp_mismatch(A, OpId::MIN, 0)).unwrap());
        let peer = f.queue.tracked_peer(A).unwrap();
        assert_eq!(peer.next_index, 1);
        assert!(!peer.is_new);
        assert!(!peer.is_last_exchange_successful);

        let catch_up = f.queue.request_for_peer(A).unwrap();
        let indexes: Vec<i64> = catch_up.request.ops.iter().map(|r| r.op_id.index).collect();
        assert_eq!(indexes, vec![1, 2, 3, 4, 5]);
        assert_eq!(catch_up.request.preceding_id, OpId::MIN);
        assert_eq!(catch_up.request.leader_lease_duration_ms, Some(2000));
        assert!(catch_up.request.ht_lease_expiration.is_some());
        assert_eq!(catch_up.request.propagated_safe_time, Some(HybridTime::from_micros(42)));
        assert!(!f.queue.peer_accepted_our_lease(A));

        assert!(!f.queue.response_from_peer(A, &ack(A, 5, 0)).unwrap());
        assert!(f.queue.peer_accepted_our_lease(A));
        assert!(f.queue.can_peer_become_leader(A));
        assert!(!f.queue.can_peer_become_leader(B));
        assert_eq!(f.queue.get_up_to_date_peer().as_deref(), Some(A));
    }

    #[tokio::test]
    async fn unacknowledged_requests_back_off() {
        // -- setup --
        let f = leader_fixture(QueueOptions::default());
        f.queue.set_leader_mode(OpId::new(1, 3), 1, config()).unwrap();
        append(&f.queue, 1, 1..=5).await;
        f.queue.request_for_peer(A).unwrap();
        f.queue.response_from_peer(A, &lmp_mismatch(A, OpId::MIN, 0)).unwrap();

        // -- execute & verify --
        let first = f.queue.request_for_peer(A).unwrap();
        assert_eq!(first.request.ops.len(), 5);
        assert_eq!(first.request.committed_op_id, OpId::new(1, 3));

        // No answer: half as many, and the commit point is capped at what is sent.
        let retry = f.queue.request_for_peer(A).unwrap();
        let indexes: Vec<i64> = retry.request.ops.iter().map(|r| r.op_id.index).collect();
        assert_eq!(indexes, vec![1, 2]);
        assert_eq!(retry.request.committed_op_id, OpId::new(1, 2));
        assert_eq!(retry.request.propagated_safe_time, None);

        let retry = f.queue.request_for_peer(A).unwrap();
        assert_eq!(retry.request.ops.len(), 1);
        assert_eq!(f.queue.tracked_peer(A).unwrap().current_retransmissions, 2);
    }

    #[tokio::test]
    async fn divergent_follower_restarts_from_its_commit_point() {
        let f = leader_fixture(QueueOptions::default());
        append(&f.queue, 1, 1..=5).await;
        f.queue.request_for_peer(B).unwrap();

        // B has ops from a deposed leader that we never wrote.
        let response = lmp_mismatch(B, OpId::new(0, 9), 2);
        assert!(f.queue.response_from_peer(B, &response).unwrap());

        let peer = f.queue.tracked_peer(B).unwrap();
        assert_eq!(peer.next_index, 3);
        assert_eq!(peer.last_known_committed_idx, 2);
        let request = f.queue.request_for_peer(B).unwrap();
        assert_eq!(request.request.preceding_id, OpId::new(1, 2));
        assert_eq!(request.request.ops[0].op_id, OpId::new(1, 3));
    }

    #[tokio::test]
    async fn higher_term_notifies_observers() {
        let f = leader_fixture(QueueOptions::default());
        let mut response = ack(A, 0, 0);
        response.responder_term = Some(5);
        if let Some(status) = response.status.as_mut() {
            status.error = Some(ConsensusError {
                code: ConsensusErrorCode::InvalidTerm,
                message: "Stale leader".to_string(),
            });
        }

        assert!(!f.queue.response_from_peer(A, &response).unwrap());
        f.queue.wait_for_notifications().await.unwrap();

        assert_eq!(*f.observer.terms.lock(), vec![5]);
    }

    #[tokio::test]
    async fn missing_tablet_triggers_one_remote_bootstrap() {
        let f = leader_fixture(QueueOptions::default());
        let response = ConsensusResponse {
            responder_uuid: B.to_string(),
            responder_term: None,
            status: None,
            error: Some(TabletServerError {
                code: TabletErrorCode::TabletNotFound,
                message: "Tablet not found".to_string(),
            }),
            num_sst_files: 0,
        };

        assert!(f.queue.response_from_peer(B, &response).unwrap());
        let request = f.queue.request_for_peer(B).unwrap();
        assert!(request.needs_remote_bootstrap);
        assert!(request.request.ops.is_empty());

        let bootstrap = f.queue.get_remote_bootstrap_request_for_peer(B).unwrap();
        assert_eq!(bootstrap.dest_uuid, B);
        assert_eq!(bootstrap.bootstrap_peer_uuid, LOCAL);
        assert_eq!(bootstrap.bootstrap_peer_addr.as_deref(), Some(LOCAL_ADDR));
        assert_eq!(bootstrap.caller_term, 1);

        let again = f.queue.get_remote_bootstrap_request_for_peer(B).unwrap_err();
        assert!(matches!(again, ReplicationError::IllegalState(_)));
    }

    #[tokio::test]
    async fn unreachable_follower_is_reported_once() {
        // -- setup --
        let mut options = QueueOptions::default();
        options.follower_unavailable_considered_failed = Duration::from_secs(10);
        let mut f = leader_fixture(options);

        // -- execute & verify --
        f.clock.advance(Duration::from_secs(5));
        f.queue.request_for_peer(A).unwrap();
        f.queue.wait_for_notifications().await.unwrap();
        assert!(f.observer.failed.lock().is_empty());

        f.clock.advance(Duration::from_secs(6));
        f.queue.request_for_peer(A).unwrap();
        f.queue.request_for_peer(A).unwrap();
        f.queue.wait_for_notifications().await.unwrap();
        assert_eq!(f.observer.failed.lock().len(), 1);
        assert_eq!(f.observer.failed.lock()[0].0, A);

        // Hearing back restarts the clock, a later outage is reported again.
        f.queue.notify_peer_is_responsive_despite_error(A);
        f.clock.advance(Duration::from_secs(11));
        f.queue.request_for_peer(A).unwrap();
        f.queue.wait_for_notifications().await.unwrap();
        assert_eq!(f.observer.failed.lock().len(), 2);
    }

    #[tokio::test]
    async fn requests_need_an_open_leader_queue() {
        let f = new_fixture(QueueOptions::default());
        f.queue.track_peer(A).unwrap();
        assert!(f.queue.track_peer(A).unwrap_err().is_already_present());

        assert!(f.queue.request_for_peer(A).unwrap_err().is_not_found());
        assert!(matches!(
            f.queue.request_for_peer(LOCAL).unwrap_err(),
            ReplicationError::InvalidArgument(_)
        ));
        let not_voter = RaftConfig::new(vec![RaftPeer::voter(A, None)]);
        assert!(f
            .queue
            .set_leader_mode(OpId::MIN, 1, not_voter)
            .unwrap_err()
            .is_invariant_violation());
        assert!(matches!(f.queue.init(OpId::MIN), Err(ReplicationError::IllegalState(_))));

        let observer: Arc<dyn QueueObserver> = f.observer.clone();
        f.queue.unregister_observer(&observer).unwrap();
        assert!(f.queue.unregister_observer(&observer).unwrap_err().is_not_found());

        f.queue.close();
        assert_eq!(f.queue.state(), QueueState::Closed);
        assert!(!f.queue.response_from_peer(A, &ack(A, 1, 0)).unwrap());
        assert!(f.queue.tracked_peer(LOCAL).is_none());
    }

    #[tokio::test]
    async fn follower_mode_evicts_after_local_append() {
        let f = new_fixture(QueueOptions::default());
        append(&f.queue, 1, 1..=3).await;

        assert_eq!(f.queue.last_appended(), OpId::new(1, 3));
        assert_eq!(f.queue.log_cache().num_cached_ops(), 0);
        assert!(f.observer.majority.lock().is_empty());
    }

    #[tokio::test]
    async fn cdc_reads_committed_records() {
        let f = leader_fixture(QueueOptions::default());
        append(&f.queue, 1, 1..=5).await;
        f.queue.response_from_peer(A, &ack(A, 4, 0)).unwrap();
        f.queue.wait_for_notifications().await.unwrap();
        assert_eq!(f.queue.committed_op_id(), OpId::new(1, 4));

        let read = f.queue.read_replicated_messages_for_cdc(OpId::MIN).unwrap();
        let indexes: Vec<i64> = read.messages.iter().map(|r| r.op_id.index).collect();
        assert_eq!(indexes, vec![1, 2, 3, 4]);

        let read = f.queue.read_replicated_messages_for_cdc(OpId::new(1, 4)).unwrap();
        assert!(read.messages.is_empty());
        assert_eq!(read.preceding_op, OpId::new(1, 4));

        // A fresh checkpoint holds back eviction of what the consumer has not read.
        f.queue.update_cdc_consumer_op_id(OpId::new(1, 2));
        f.queue.response_from_peer(B, &ack(B, 5, 4)).unwrap();
        f.queue.response_from_peer(A, &ack(A, 5, 4)).unwrap();
        assert_eq!(f.queue.all_replicated_op_id(), OpId::new(1, 5));
        assert_eq!(f.queue.log_cache().num_cached_ops(), 3);
    }

    #[tokio::test]
    async fn num_sst_files_reach_observers_as_leader() {
        // -- setup --
        let f = leader_fixture(QueueOptions::default());
        // Nothing appended yet: no majority, only the local count is known.
        f.queue.num_sst_files_changed(3);
        append(&f.queue, 1, 1..=1).await;
        let mut response = ack(A, 1, 0);
        response.num_sst_files = 7;
        f.queue.response_from_peer(A, &response).unwrap();

        // -- execute --
        f.queue.num_sst_files_changed(3);
        f.queue.wait_for_notifications().await.unwrap();

        // -- verify --
        // Local (3) and A (7) form a majority: the larger count a majority is at or below.
        assert_eq!(*f.observer.num_sst_files.lock(), vec![3, 7]);
    }

    fn ack_applied(uuid: &str, index: i64, applied: i64) -> ConsensusResponse {
        let mut response = ack(uuid, index, 0);
        if let Some(status) = response.status.as_mut() {
            status.last_applied = OpId::new(1, applied);
        }
        response
    }

    fn assert_watermark_chain(queue: &ReplicationQueue<MockClock>) {
        let all_applied = queue.all_applied_op_id();
        let all_replicated = queue.all_replicated_op_id();
        let majority_replicated = queue.majority_replicated_op_id();
        let last_appended = queue.last_appended();
        assert!(
            all_applied.index <= all_replicated.index
                && all_replicated.index <= majority_replicated.index
                && majority_replicated.index <= last_appended.index,
            "applied {} replicated {} majority {} appended {}",
            all_applied,
            all_replicated,
            majority_replicated,
            last_appended
        );
    }

    #[tokio::test]
    async fn watermarks_stay_ordered_across_mixed_responses() {
        // -- setup --
        let f = leader_fixture(QueueOptions::default());
        append(&f.queue, 1, 1..=6).await;
        assert_watermark_chain(&f.queue);

        let responses = vec![
            ack_applied(B, 4, 2),
            lmp_mismatch(A, OpId::new(1, 2), 0),
            ack_applied(A, 6, 3),
            lmp_mismatch(B, OpId::new(1, 4), 2),
            ack_applied(B, 5, 4),
            ack_applied(A, 6, 5),
        ];

        // -- execute & verify --
        for response in responses {
            let uuid = response.responder_uuid.clone();
            f.queue.response_from_peer(&uuid, &response).unwrap();
            f.queue.wait_for_notifications().await.unwrap();
            assert_watermark_chain(&f.queue);
        }
        assert_eq!(f.queue.majority_replicated_op_id(), OpId::new(1, 6));
        assert_eq!(f.queue.all_replicated_op_id(), OpId::new(1, 5));
        assert_eq!(f.queue.last_appended(), OpId::new(1, 6));
    }

    #[tokio::test]
    async fn recovered_follower_does_not_pull_nonlagging_watermark_back() {
        // -- setup --
        let mut options = QueueOptions::default();
        options.lagging_follower_threshold = 2;
        let f = leader_fixture(options);
        append(&f.queue, 1, 1..=5).await;
        f.queue.response_from_peer(A, &ack(A, 5, 0)).unwrap();
        f.queue.response_from_peer(B, &ack(B, 2, 0)).unwrap();
        assert_eq!(f.queue.inner.lock().all_nonlagging_replicated_op_id, OpId::new(1, 2));

        // B stops answering and falls behind.
        for _ in 0..3 {
            f.queue.request_for_peer(B).unwrap();
        }
        assert!(f.queue.tracked_peer(B).unwrap().is_lagging(2));
        f.queue.response_from_peer(A, &ack(A, 5, 5)).unwrap();
        assert_eq!(f.queue.inner.lock().all_nonlagging_replicated_op_id, OpId::new(1, 5));

        // -- execute --
        f.queue.response_from_peer(B, &ack(B, 3, 5)).unwrap();

        // -- verify --
        assert!(!f.queue.tracked_peer(B).unwrap().is_lagging(2));
        assert_eq!(f.queue.inner.lock().all_nonlagging_replicated_op_id, OpId::new(1, 5));
    }

    #[tokio::test]
    async fn all_peers_lagging_falls_back_to_all_replicated() {
        // -- setup --
        let mut options = QueueOptions::default();
        options.lagging_follower_threshold = 0;
        let f = leader_fixture(options);
        append(&f.queue, 1, 1..=5).await;
        f.queue.response_from_peer(A, &ack(A, 4, 0)).unwrap();
        f.queue.response_from_peer(B, &ack(B, 3, 0)).unwrap();
        assert_eq!(f.queue.all_replicated_op_id(), OpId::new(1, 3));

        // -- execute --
        let mut inner = f.queue.inner.lock();
        assert_eq!(inner.all_nonlagging_replicated_op_id, OpId::MIN);
        for peer in inner.peers.values_mut() {
            peer.current_retransmissions = 2;
        }
        inner.update_all_nonlagging_replicated_op_id(&test_logger(), 2);

        // -- verify --
        assert_eq!(inner.all_nonlagging_replicated_op_id, OpId::new(1, 3));
    }
}
