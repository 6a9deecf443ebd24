use crate::api::options::ReplicationOptionsValidated;
use crate::api::storage::TabletStorage;
use crate::api::ReplicationOptions;
use crate::common::{Clock, MemTracker, OpId, RealClock, ReplicationError, Result};
use crate::consensus::{
    CommitProgress, MajorityReplicatedData, PeerHandle, PeerOptions, PeerProxy, QueueObserver, RaftConfig,
    ReplicationQueue,
};
use crate::frontier::{ConsensusFrontier, FlushedFrontierTracker};
use crate::retryable::{ConsensusRound, RetryableRequests};
use crate::wal::{Log, LogRecord, Payload, StatusCallback};
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::convert::TryFrom;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;

/// Committed records are read back for applying in chunks of about this size.
const APPLY_BATCH_BYTES: usize = 16 * 1024 * 1024;

pub struct TabletReplicationConfig {
    pub tablet_id: String,
    pub local_uuid: String,
    /// Directory holding this tablet's WAL segments. Created if missing.
    pub wal_dir: PathBuf,
    pub logger: slog::Logger,
    pub options: ReplicationOptions,
}

#[derive(Debug, thiserror::Error)]
pub enum TabletReplicationError {
    #[error("Illegal options for configuring tablet replication: {0}")]
    IllegalOptions(String),
    #[error("Log initialization failure: {0}")]
    LogInitialization(ReplicationError),
    #[error("Unable to bootstrap from the log: {0}")]
    Bootstrap(ReplicationError),
}

/// TabletReplication assembles one tablet's WAL, log cache, replication queue and retryable
/// request tracker, and applies what commits to the tablet's storage.
pub struct TabletReplication<C: Clock = RealClock> {
    logger: slog::Logger,
    local_uuid: String,
    log: Arc<Log>,
    queue: Arc<ReplicationQueue<C>>,
    retryable: Arc<RetryableRequests<C>>,
    commit: Arc<CommitObserver<C>>,
    storage: Arc<dyn TabletStorage>,
    flushed_frontier: FlushedFrontierTracker,
    peer_options: PeerOptions,
    peers: Mutex<HashMap<String, PeerHandle>>,
    // Op ids are assigned and appended under this lock.
    append_lock: Mutex<()>,
}

impl TabletReplication<RealClock> {
    pub fn open(
        config: TabletReplicationConfig,
        storage: Arc<dyn TabletStorage>,
        server_tracker: &Arc<MemTracker>,
    ) -> std::result::Result<Self, TabletReplicationError> {
        Self::open_with_clock(config, storage, server_tracker, RealClock)
    }
}

impl<C: Clock> TabletReplication<C> {
    /// Opens (or creates) the tablet's log and replays it. Must be called from within a Tokio runtime.
    pub fn open_with_clock(
        config: TabletReplicationConfig,
        storage: Arc<dyn TabletStorage>,
        server_tracker: &Arc<MemTracker>,
        clock: C,
    ) -> std::result::Result<Self, TabletReplicationError> {
        let options = ReplicationOptionsValidated::try_from(config.options)
            .map_err(|e| TabletReplicationError::IllegalOptions(e.to_string()))?;
        let peer_logger = config.logger.new(slog::o!("peer_id" => config.local_uuid.clone()));
        let logger = peer_logger.new(slog::o!("tablet_id" => config.tablet_id.clone()));

        let log = Log::open(
            peer_logger,
            config.tablet_id.clone(),
            &config.wal_dir,
            options.log,
            Bytes::new(),
            0,
        )
        .map_err(TabletReplicationError::LogInitialization)?;
        let log = Arc::new(log);

        let retryable = Arc::new(RetryableRequests::new(logger.clone(), clock.clone(), options.retryable));
        let last_applied = storage.last_applied_op_id();
        bootstrap_retryable_requests(&log, &retryable, last_applied).map_err(TabletReplicationError::Bootstrap)?;

        let queue = ReplicationQueue::with_clock(
            config.logger.clone(),
            config.local_uuid.clone(),
            log.clone(),
            server_tracker,
            &options.cache,
            options.queue,
            clock,
        );
        queue
            .init(log.last_appended_op_id())
            .map_err(TabletReplicationError::Bootstrap)?;

        let commit = Arc::new(CommitObserver {
            logger: logger.new(slog::o!("component" => "commit")),
            queue: Arc::downgrade(&queue),
            storage: storage.clone(),
            retryable: retryable.clone(),
            state: Mutex::new(CommitState {
                leader_term: None,
                committed_op_id: last_applied,
                last_applied_op_id: last_applied,
                pending: BTreeMap::new(),
                highest_peer_term: None,
            }),
        });
        queue.register_observer(commit.clone());

        slog::info!(
            logger,
            "Opened tablet replication, last appended {}, last applied {}",
            log.last_appended_op_id(),
            last_applied
        );
        let flushed_frontier = FlushedFrontierTracker::new(logger.new(slog::o!("component" => "frontier")));
        Ok(TabletReplication {
            logger,
            local_uuid: config.local_uuid,
            log,
            queue,
            retryable,
            commit,
            storage,
            flushed_frontier,
            peer_options: options.peer,
            peers: Mutex::new(HashMap::new()),
            append_lock: Mutex::new(()),
        })
    }

    /// Starts leading `term`: tracks every remote member of `config`, starts replicating to those
    /// with a proxy, and appends a no-op so earlier terms' records can commit.
    pub fn become_leader(
        &self,
        term: i64,
        config: RaftConfig,
        proxies: HashMap<String, Arc<dyn PeerProxy>>,
    ) -> Result<oneshot::Receiver<Result<()>>> {
        let committed = {
            let mut state = self.commit.state.lock();
            state.leader_term = Some(term);
            state.committed_op_id
        };
        self.queue.set_leader_mode(committed, term, config.clone())?;

        {
            let mut peers = self.peers.lock();
            for member in config.peers.iter().filter(|p| p.uuid != self.local_uuid) {
                match self.queue.track_peer(&member.uuid) {
                    Err(e) if !e.is_already_present() => return Err(e),
                    _ => {}
                }
                match proxies.get(&member.uuid) {
                    Some(proxy) => {
                        let handle = PeerHandle::spawn(
                            self.logger.clone(),
                            member.uuid.clone(),
                            &self.queue,
                            proxy.clone(),
                            self.peer_options,
                        );
                        peers.insert(member.uuid.clone(), handle);
                    }
                    None => slog::warn!(self.logger, "No proxy for peer {}, it will not be replicated to", member.uuid),
                }
            }
        }

        slog::info!(self.logger, "Became leader for term {}, committed {}", term, committed);
        self.replicate(Payload::NoOp)
    }

    /// Stops leading. Operations still in flight fail with `IllegalState`.
    pub fn become_follower(&self) {
        let remote_peers: Vec<String> = self.peers.lock().drain().map(|(uuid, _)| uuid).collect();
        for uuid in &remote_peers {
            self.queue.untrack_peer(uuid);
        }
        self.commit.abort_all("Leadership lost before the operation committed");
        self.queue.set_non_leader_mode();
    }

    /// Replicates one operation. The receiver resolves once it is applied, or with the reason it
    /// never will be. Duplicate writes are resolved by the retryable request tracker.
    pub fn replicate(&self, payload: Payload) -> Result<oneshot::Receiver<Result<()>>> {
        let _append = self.append_lock.lock();
        let (term, committed) = {
            let state = self.commit.state.lock();
            match state.leader_term {
                Some(term) => (term, state.committed_op_id),
                None => return Err(ReplicationError::IllegalState("Not the leader".to_string())),
            }
        };

        let op_id = OpId::new(term, self.queue.last_appended().index + 1);
        let clock = self.queue.clock();
        let record = Arc::new(LogRecord::new(op_id, clock.hybrid_now(), payload));
        let (round, rx) = ConsensusRound::with_completion(record.clone(), term);
        if !self.retryable.register(&round, None) {
            return Ok(rx);
        }
        self.commit.state.lock().pending.insert(op_id.index, round);

        let weak_commit = Arc::downgrade(&self.commit);
        let callback: StatusCallback = Box::new(move |result| {
            if let Err(e) = result {
                if let Some(commit) = weak_commit.upgrade() {
                    commit.abort(op_id.index, e, term);
                }
            }
        });
        if let Err(e) = self
            .queue
            .append_operations(vec![record], committed, clock.now(), callback)
        {
            self.commit.abort(op_id.index, e.clone(), term);
            return Err(e);
        }

        for peer in self.peers.lock().values() {
            peer.signal_request();
        }
        Ok(rx)
    }

    /// Storage flushed: validates its frontier and updates the majority flushed-file count.
    pub fn notify_flushed_frontier(&self, frontier: ConsensusFrontier) -> Result<()> {
        self.flushed_frontier.notify_flushed_frontier(frontier)?;
        self.queue.num_sst_files_changed(self.storage.num_sst_files());
        Ok(())
    }

    /// Deletes log segments nothing needs anymore. Returns how many were deleted.
    pub fn gc_log(&self) -> Result<usize> {
        let retryable_min = self.retryable.clean_expired_replicated_and_get_min_op_id();
        let last_applied = self.commit.state.lock().last_applied_op_id;
        let mut min_index = retryable_min.index.min(last_applied.index);
        if !self.peers.lock().is_empty() {
            min_index = min_index.min(self.queue.all_replicated_op_id().index);
        }
        self.log.gc(min_index)
    }

    pub fn committed_op_id(&self) -> OpId {
        self.commit.state.lock().committed_op_id
    }

    pub fn last_applied_op_id(&self) -> OpId {
        self.commit.state.lock().last_applied_op_id
    }

    /// Highest term a follower reported beyond ours, if any.
    pub fn highest_peer_term(&self) -> Option<i64> {
        self.commit.state.lock().highest_peer_term
    }

    pub fn queue(&self) -> &Arc<ReplicationQueue<C>> {
        &self.queue
    }

    pub fn log(&self) -> &Arc<Log> {
        &self.log
    }

    pub fn retryable_requests(&self) -> &Arc<RetryableRequests<C>> {
        &self.retryable
    }

    pub async fn close(&self) -> Result<()> {
        self.become_follower();
        self.queue.close();
        self.retryable.clear();
        self.log.close().await
    }
}

/// Records on disk that storage already applied are remembered as replicated, so their retries
/// are still recognized.
fn bootstrap_retryable_requests<C: Clock>(
    log: &Log,
    retryable: &RetryableRequests<C>,
    last_applied: OpId,
) -> Result<()> {
    let first = match log.min_replicate_index() {
        Some(first) => first,
        None => return Ok(()),
    };
    let last = last_applied.index.min(log.last_appended_op_id().index);
    if last < first {
        return Ok(());
    }

    let now = retryable.clock().now();
    for record in log.reader().read_replicates_in_range(first, last, usize::MAX)? {
        retryable.bootstrap(&record, now)?;
    }
    Ok(())
}

struct CommitState {
    leader_term: Option<i64>,
    committed_op_id: OpId,
    last_applied_op_id: OpId,
    pending: BTreeMap<i64, Arc<ConsensusRound>>,
    highest_peer_term: Option<i64>,
}

/// Turns majority-replicated watermarks into commits and applies them in order.
struct CommitObserver<C: Clock> {
    logger: slog::Logger,
    queue: Weak<ReplicationQueue<C>>,
    storage: Arc<dyn TabletStorage>,
    retryable: Arc<RetryableRequests<C>>,
    state: Mutex<CommitState>,
}

impl<C: Clock> CommitObserver<C> {
    fn progress(&self) -> CommitProgress {
        let state = self.state.lock();
        CommitProgress {
            committed_op_id: state.committed_op_id,
            last_applied_op_id: state.last_applied_op_id,
        }
    }

    fn apply_through(&self, committed: OpId, term: i64) -> Result<()> {
        let queue = self
            .queue
            .upgrade()
            .ok_or_else(|| ReplicationError::ServiceUnavailable("Replication queue is gone".to_string()))?;

        let mut after_index = self.state.lock().last_applied_op_id.index;
        while after_index < committed.index {
            let result = queue
                .log_cache()
                .read_ops(after_index, committed.index, APPLY_BATCH_BYTES)?;
            if result.messages.is_empty() {
                return Err(ReplicationError::Internal(format!(
                    "No committed records to apply after index {}",
                    after_index
                )));
            }

            for record in &result.messages {
                self.storage.apply_committed_record(record)?;
                let round = self.state.lock().pending.remove(&record.op_id.index);
                match round {
                    Some(round) => {
                        self.retryable.replication_finished(record, &Ok(()), term)?;
                        round.notify_replication_finished(Ok(()), term);
                    }
                    None => self.retryable.bootstrap(record, self.retryable.clock().now())?,
                }
                self.state.lock().last_applied_op_id = record.op_id;
                after_index = record.op_id.index;
            }
        }
        Ok(())
    }

    fn abort(&self, index: i64, error: ReplicationError, term: i64) {
        let round = self.state.lock().pending.remove(&index);
        if let Some(round) = round {
            self.fail_round(&round, error, term);
        }
    }

    fn abort_all(&self, reason: &str) {
        let (pending, term) = {
            let mut state = self.state.lock();
            let term = state.leader_term.take().unwrap_or(0);
            (std::mem::take(&mut state.pending), term)
        };
        let error = ReplicationError::IllegalState(reason.to_string());
        for round in pending.values() {
            self.fail_round(round, error.clone(), term);
        }
    }

    fn fail_round(&self, round: &ConsensusRound, error: ReplicationError, term: i64) {
        if let Err(e) = self.retryable.replication_finished(round.record(), &Err(error.clone()), term) {
            slog::error!(self.logger, "Unable to abort {:?}: {}", round, e);
        }
        round.notify_replication_finished(Err(error), term);
    }
}

impl<C: Clock> QueueObserver for CommitObserver<C> {
    fn update_majority_replicated(&self, data: &MajorityReplicatedData) -> Result<CommitProgress> {
        let term = {
            let mut state = self.state.lock();
            let term = match state.leader_term {
                Some(term) => term,
                None => return Ok(progress_of(&state)),
            };
            // Records of earlier terms commit only through one of the current term.
            if data.op_id.term != term || data.op_id.index <= state.committed_op_id.index {
                return Ok(progress_of(&state));
            }
            state.committed_op_id = data.op_id;
            term
        };

        slog::debug!(self.logger, "Committed through {}", data.op_id);
        self.apply_through(data.op_id, term)?;
        Ok(self.progress())
    }

    fn notify_term_change(&self, term: i64) {
        slog::warn!(self.logger, "A peer is at term {}, this leader is stale", term);
        let mut state = self.state.lock();
        if state.highest_peer_term.map_or(true, |highest| term > highest) {
            state.highest_peer_term = Some(term);
        }
    }

    fn notify_failed_follower(&self, peer_uuid: &str, term: i64, reason: &str) {
        slog::warn!(self.logger, "Follower {} failed in term {}: {}", peer_uuid, term, reason);
    }

    fn majority_replicated_num_sst_files_changed(&self, majority_num_sst_files: u64) {
        slog::debug!(self.logger, "Majority has at most {} SST files", majority_num_sst_files);
    }
}

fn progress_of(state: &CommitState) -> CommitProgress {
    CommitProgress {
        committed_op_id: state.committed_op_id,
        last_applied_op_id: state.last_applied_op_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::HybridTime;
    use crate::consensus::{LogCache, LogCacheOptions, RaftPeer};
    use crate::wal::{ClientId, DurabilityPolicy, WriteRequest};

    const LOCAL: &str = "peer-local";

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    #[derive(Default)]
    struct MemStorage {
        applied: Mutex<Vec<LogRecord>>,
    }

    impl TabletStorage for MemStorage {
        fn apply_committed_record(&self, record: &LogRecord) -> Result<()> {
            self.applied.lock().push(record.clone());
            Ok(())
        }

        fn num_sst_files(&self) -> u64 {
            1
        }

        fn last_applied_op_id(&self) -> OpId {
            self.applied.lock().last().map_or(OpId::MIN, |r| r.op_id)
        }
    }

    fn config(dir: &tempfile::TempDir) -> TabletReplicationConfig {
        TabletReplicationConfig {
            tablet_id: "tablet-1".to_string(),
            local_uuid: LOCAL.to_string(),
            wal_dir: dir.path().to_path_buf(),
            logger: test_logger(),
            options: ReplicationOptions {
                durability: Some(DurabilityPolicy::Always),
                async_preallocate_segments: Some(false),
                ..ReplicationOptions::default()
            },
        }
    }

    fn write(request_id: i64) -> Payload {
        Payload::Write(WriteRequest {
            client_id: ClientId::new("client-1"),
            request_id,
            min_running_request_id: 1,
            write_batch: Bytes::from(format!("row-{}", request_id)),
        })
    }

    fn single_voter() -> RaftConfig {
        RaftConfig::new(vec![RaftPeer::voter(LOCAL, None)])
    }

    #[tokio::test]
    async fn single_voter_applies_writes_once() {
        // -- setup --
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(MemStorage::default());
        let server_tracker = LogCache::server_tracker(&LogCacheOptions::default());
        let tablet = TabletReplication::open(config(&dir), storage.clone(), &server_tracker).unwrap();

        // -- execute & verify --
        let no_op = tablet.become_leader(1, single_voter(), HashMap::new()).unwrap();
        no_op.await.unwrap().unwrap();

        for request_id in 1..=3 {
            tablet.replicate(write(request_id)).unwrap().await.unwrap().unwrap();
        }
        assert_eq!(tablet.committed_op_id(), OpId::new(1, 4));
        assert_eq!(tablet.last_applied_op_id(), OpId::new(1, 4));
        let applied: Vec<i64> = storage.applied.lock().iter().map(|r| r.op_id.index).collect();
        assert_eq!(applied, vec![1, 2, 3, 4]);

        // A retry of an applied write is recognized without being appended.
        let retry = tablet.replicate(write(2)).unwrap().await.unwrap();
        assert!(retry.unwrap_err().is_already_present());
        assert_eq!(tablet.queue().last_appended(), OpId::new(1, 4));

        let frontier = ConsensusFrontier::new(OpId::new(1, 4), HybridTime::from_micros(4), HybridTime::MIN);
        tablet.notify_flushed_frontier(frontier).unwrap();
        let stale = ConsensusFrontier::new(OpId::new(1, 2), HybridTime::from_micros(2), HybridTime::MIN);
        assert!(tablet.notify_flushed_frontier(stale).is_err());

        tablet.become_follower();
        assert!(matches!(
            tablet.replicate(write(9)),
            Err(ReplicationError::IllegalState(_))
        ));
        tablet.close().await.unwrap();
    }

    #[tokio::test]
    async fn reopen_remembers_applied_requests() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(MemStorage::default());
        let server_tracker = LogCache::server_tracker(&LogCacheOptions::default());

        {
            let tablet = TabletReplication::open(config(&dir), storage.clone(), &server_tracker).unwrap();
            tablet.become_leader(1, single_voter(), HashMap::new()).unwrap().await.unwrap().unwrap();
            tablet.replicate(write(1)).unwrap().await.unwrap().unwrap();
            tablet.close().await.unwrap();
        }

        let tablet = TabletReplication::open(config(&dir), storage.clone(), &server_tracker).unwrap();
        assert_eq!(tablet.queue().last_appended(), OpId::new(1, 2));
        assert_eq!(tablet.retryable_requests().counts().replicated, 1);

        tablet.become_leader(2, single_voter(), HashMap::new()).unwrap().await.unwrap().unwrap();
        let retry = tablet.replicate(write(1)).unwrap().await.unwrap();
        assert!(retry.unwrap_err().is_already_present());
        tablet.replicate(write(2)).unwrap().await.unwrap().unwrap();
        assert_eq!(tablet.last_applied_op_id(), OpId::new(2, 4));
        tablet.close().await.unwrap();
    }

    #[tokio::test]
    async fn rejects_invalid_options() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(&dir);
        config.options.max_segment_size_bytes = Some(1);
        let server_tracker = LogCache::server_tracker(&LogCacheOptions::default());

        let result = TabletReplication::open(config, Arc::new(MemStorage::default()), &server_tracker);

        assert!(matches!(result, Err(TabletReplicationError::IllegalOptions(_))));
    }
}
