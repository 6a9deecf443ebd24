use crate::common::{Clock, OpId, RealClock, ReplicationError, Result};
use crate::retryable::ranges::ReplicatedRanges;
use crate::retryable::RetryableRequestsOptions;
use crate::wal::{ClientId, LogRecord, WriteRequest};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::{Duration, Instant};

/// Receives the outcome of a round together with the term of the leader that resolved it.
pub type ReplicationFinishedCallback = Box<dyn FnOnce(Result<()>, i64) + Send + 'static>;

/// ConsensusRound is one client operation on its way through replication. Its outcome is
/// reported at most once.
pub struct ConsensusRound {
    record: Arc<LogRecord>,
    bound_term: i64,
    callback: Mutex<Option<ReplicationFinishedCallback>>,
}

impl ConsensusRound {
    pub fn new(record: Arc<LogRecord>, bound_term: i64, callback: ReplicationFinishedCallback) -> Arc<Self> {
        Arc::new(ConsensusRound {
            record,
            bound_term,
            callback: Mutex::new(Some(callback)),
        })
    }

    /// Like `new`, but the outcome is delivered through the returned receiver.
    pub fn with_completion(record: Arc<LogRecord>, bound_term: i64) -> (Arc<Self>, oneshot::Receiver<Result<()>>) {
        let (tx, rx) = oneshot::channel();
        let round = ConsensusRound::new(
            record,
            bound_term,
            Box::new(move |result, _leader_term| {
                let _ = tx.send(result);
            }),
        );
        (round, rx)
    }

    pub fn record(&self) -> &Arc<LogRecord> {
        &self.record
    }

    pub fn bound_term(&self) -> i64 {
        self.bound_term
    }

    pub fn notify_replication_finished(&self, result: Result<()>, leader_term: i64) {
        let callback = self.callback.lock().take();
        if let Some(callback) = callback {
            callback(result, leader_term);
        }
    }
}

impl fmt::Debug for ConsensusRound {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConsensusRound {{ op_id: {} term: {} }}", self.record.op_id, self.bound_term)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct RetryableRequestsCounts {
    pub running: usize,
    pub replicated: usize,
}

struct RunningRequest {
    op_id: OpId,
    time: Instant,
    duplicate_rounds: Vec<Arc<ConsensusRound>>,
}

#[derive(Default)]
struct ClientRequests {
    running: HashMap<i64, RunningRequest>,
    running_by_op_id: BTreeMap<OpId, i64>,
    replicated: ReplicatedRanges,
    min_running_request_id: i64,
    empty_since: Option<Instant>,
}

impl ClientRequests {
    fn is_empty(&self) -> bool {
        self.running.is_empty() && self.replicated.is_empty()
    }

    fn remove_running(&mut self, request_id: i64) -> Option<RunningRequest> {
        let running = self.running.remove(&request_id)?;
        self.running_by_op_id.remove(&running.op_id);
        Some(running)
    }

    fn advance_min_running_request_id(&mut self, new_min: i64) {
        if new_min > self.min_running_request_id {
            self.replicated.discard_below(new_min);
            self.min_running_request_id = new_min;
        }
    }
}

struct State {
    clients: HashMap<ClientId, ClientRequests>,
    options: RetryableRequestsOptions,
}

/// RetryableRequests keeps every client write applied at most once.
///
/// Requests are tracked per client as running (registered, not yet resolved) or replicated
/// (compacted into id ranges). Replicated ranges expire after the request timeout; the oldest op
/// id still referenced is the floor below which the log must not be collected.
pub struct RetryableRequests<C: Clock = RealClock> {
    logger: slog::Logger,
    clock: C,
    state: Mutex<State>,
}

impl<C: Clock> RetryableRequests<C> {
    pub fn new(logger: slog::Logger, clock: C, options: RetryableRequestsOptions) -> Self {
        RetryableRequests {
            logger: logger.new(slog::o!("component" => "retryable_requests")),
            clock,
            state: Mutex::new(State {
                clients: HashMap::new(),
                options,
            }),
        }
    }

    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// Tries to start tracking `round`. Returns true if the caller should go on and replicate it.
    ///
    /// When false the round is already taken care of: it was failed with `Expired` or
    /// `AlreadyPresent`, or it was attached to the running request with the same id and will be
    /// resolved together with it.
    pub fn register(&self, round: &Arc<ConsensusRound>, entry_time: Option<Instant>) -> bool {
        let data = match round.record().write_request() {
            Some(data) => data,
            None => return true,
        };
        let entry_time = entry_time.unwrap_or_else(|| self.clock.now());

        let rejection = {
            let mut state = self.state.lock();
            let client = state.clients.entry(data.client_id.clone()).or_default();
            client.empty_since = None;
            client.advance_min_running_request_id(data.min_running_request_id);

            if data.request_id < client.min_running_request_id {
                Some(ReplicationError::Expired {
                    message: format!(
                        "Request id {} is less than min running {}",
                        data.request_id, client.min_running_request_id
                    ),
                    min_running_request_id: client.min_running_request_id,
                })
            } else if client.replicated.contains(data.request_id) {
                Some(duplicate_request())
            } else if let Some(running) = client.running.get_mut(&data.request_id) {
                running.duplicate_rounds.push(round.clone());
                slog::debug!(
                    self.logger,
                    "Coalesced duplicate of running request {:?}/{}",
                    data.client_id,
                    data.request_id
                );
                return false;
            } else {
                let op_id = round.record().op_id;
                client.running.insert(
                    data.request_id,
                    RunningRequest {
                        op_id,
                        time: entry_time,
                        duplicate_rounds: Vec::new(),
                    },
                );
                client.running_by_op_id.insert(op_id, data.request_id);
                slog::trace!(self.logger, "Running added {:?}/{}", data.client_id, data.request_id);
                None
            }
        };

        match rejection {
            Some(error) => {
                round.notify_replication_finished(Err(error), round.bound_term());
                false
            }
            None => true,
        }
    }

    /// Moves the request of `record` out of the running set. On success it becomes replicated and
    /// coalesced duplicates learn it is `AlreadyPresent`; on failure they receive the same error.
    ///
    /// Finishing a request that was never registered is an invariant violation.
    pub fn replication_finished(&self, record: &LogRecord, result: &Result<()>, leader_term: i64) -> Result<()> {
        let data = match record.write_request() {
            Some(data) => data,
            None => return Ok(()),
        };

        let duplicates = {
            let mut state = self.state.lock();
            let range_time_limit = state.options.range_time_limit;
            let client = state.clients.entry(data.client_id.clone()).or_default();
            let running = match client.remove_running(data.request_id) {
                Some(running) => running,
                None => {
                    slog::crit!(
                        self.logger,
                        "Replication finished for request with unknown id {:?}/{} op_id: {}",
                        data.client_id,
                        data.request_id,
                        record.op_id
                    );
                    return Err(ReplicationError::Internal(format!(
                        "Replication finished for unknown request {:?}/{}",
                        data.client_id, data.request_id
                    )));
                }
            };
            slog::trace!(
                self.logger,
                "Running {} {:?}/{}",
                if result.is_ok() { "replicated" } else { "aborted" },
                data.client_id,
                data.request_id
            );

            if result.is_ok() {
                self.add_replicated(client, record.op_id, data, running.time, range_time_limit)?;
            }
            running.duplicate_rounds
        };

        let duplicate_result = match result {
            Ok(()) => Err(duplicate_request()),
            Err(e) => Err(e.clone()),
        };
        for duplicate in duplicates {
            duplicate.notify_replication_finished(duplicate_result.clone(), leader_term);
        }
        Ok(())
    }

    /// Records a request found while replaying the log. No registration is needed.
    pub fn bootstrap(&self, record: &LogRecord, entry_time: Instant) -> Result<()> {
        let data = match record.write_request() {
            Some(data) => data,
            None => return Ok(()),
        };

        let mut state = self.state.lock();
        let range_time_limit = state.options.range_time_limit;
        let client = state.clients.entry(data.client_id.clone()).or_default();
        if client.running.contains_key(&data.request_id) {
            slog::error!(
                self.logger,
                "Bootstrapped running request {:?}/{}",
                data.client_id,
                data.request_id
            );
            return Err(ReplicationError::IllegalState(format!(
                "Request {:?}/{} is still running",
                data.client_id, data.request_id
            )));
        }
        client.empty_since = None;
        client.advance_min_running_request_id(data.min_running_request_id);
        self.add_replicated(client, record.op_id, data, entry_time, range_time_limit)
    }

    /// Drops replicated ranges older than the request timeout and returns the lowest op id still
    /// referenced by a running request or a remaining range, or `OpId::MAX` if there is none.
    ///
    /// Clients left with nothing are forgotten only once they stayed empty for a whole timeout,
    /// so late retries are still checked against their min running request id.
    pub fn clean_expired_replicated_and_get_min_op_id(&self) -> OpId {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let clean_start = now.checked_sub(state.options.request_timeout);

        let mut result = OpId::MAX;
        let mut expired_ranges = 0;
        state.clients.retain(|_, client| {
            if let Some(clean_start) = clean_start {
                expired_ranges += client.replicated.expire_older_than(clean_start);
            }
            if let Some(min) = client.replicated.min_op_id() {
                result = result.min(min);
            }
            if let Some(min) = client.running_by_op_id.keys().next() {
                result = result.min(*min);
            }

            if !client.is_empty() {
                return true;
            }
            match (client.empty_since, clean_start) {
                (None, _) => {
                    client.empty_since = Some(now);
                    true
                }
                (Some(empty_since), Some(clean_start)) => empty_since >= clean_start,
                (Some(_), None) => true,
            }
        });

        if expired_ranges > 0 {
            slog::debug!(self.logger, "Expired {} replicated request ranges", expired_ranges);
        }
        result
    }

    pub fn min_running_request_id(&self, client_id: &ClientId) -> Result<i64> {
        self.state
            .lock()
            .clients
            .get(client_id)
            .map(|client| client.min_running_request_id)
            .ok_or_else(|| ReplicationError::NotFound(format!("Client requests data not found for client {:?}", client_id)))
    }

    pub fn set_request_timeout(&self, timeout: Duration) {
        self.state.lock().options.request_timeout = timeout;
    }

    /// Forgets every client. Coalesced duplicates still waiting are failed.
    pub fn clear(&self) {
        let clients = std::mem::take(&mut self.state.lock().clients);
        let error = ReplicationError::IllegalState("Retryable requests are being cleared".to_string());
        for (_, client) in clients {
            for (_, running) in client.running {
                for duplicate in running.duplicate_rounds {
                    duplicate.notify_replication_finished(Err(error.clone()), duplicate.bound_term());
                }
            }
        }
    }

    pub fn counts(&self) -> RetryableRequestsCounts {
        let state = self.state.lock();
        state
            .clients
            .values()
            .fold(RetryableRequestsCounts::default(), |mut counts, client| {
                counts.running += client.running.len();
                counts.replicated += client.replicated.len();
                counts
            })
    }

    fn add_replicated(
        &self,
        client: &mut ClientRequests,
        op_id: OpId,
        data: &WriteRequest,
        time: Instant,
        range_time_limit: Duration,
    ) -> Result<()> {
        if client.replicated.add(data.request_id, op_id, time, range_time_limit) {
            return Ok(());
        }

        slog::crit!(
            self.logger,
            "Request already replicated: {:?}/{} op_id: {}, ranges: {:?}",
            data.client_id,
            data.request_id,
            op_id,
            client.replicated
        );
        Err(ReplicationError::Internal(format!(
            "Request {:?}/{} already replicated",
            data.client_id, data.request_id
        )))
    }
}

fn duplicate_request() -> ReplicationError {
    ReplicationError::AlreadyPresent("Duplicate request".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{mocked_clock, HybridTime, MockClock, MockClockController};
    use crate::wal::Payload;
    use bytes::Bytes;

    fn test_logger() -> slog::Logger {
        slog::Logger::root(slog::Discard, slog::o!())
    }

    fn setup() -> (RetryableRequests<MockClock>, MockClockController) {
        let (clock, controller) = mocked_clock();
        let requests = RetryableRequests::new(test_logger(), clock, RetryableRequestsOptions::default());
        (requests, controller)
    }

    fn write(client: &str, request_id: i64, min_running: i64, index: i64) -> Arc<LogRecord> {
        Arc::new(LogRecord::new(
            OpId::new(1, index),
            HybridTime::from_micros(1),
            Payload::Write(WriteRequest {
                client_id: ClientId::new(client.to_string()),
                request_id,
                min_running_request_id: min_running,
                write_batch: Bytes::from_static(b"x"),
            }),
        ))
    }

    fn round(record: Arc<LogRecord>) -> (Arc<ConsensusRound>, oneshot::Receiver<Result<()>>) {
        ConsensusRound::with_completion(record, 1)
    }

    #[test]
    fn duplicate_of_running_request_is_coalesced() {
        // -- setup --
        let (requests, _controller) = setup();
        let record = write("c1", 5, 0, 1);
        let (first, mut first_rx) = round(record.clone());
        let (second, mut second_rx) = round(write("c1", 5, 0, 2));

        // -- execute & verify --
        assert!(requests.register(&first, None));
        assert!(!requests.register(&second, None));
        assert!(second_rx.try_recv().is_err());
        assert_eq!(requests.counts(), RetryableRequestsCounts { running: 1, replicated: 0 });

        requests.replication_finished(&record, &Ok(()), 1).unwrap();
        assert!(second_rx.try_recv().unwrap().unwrap_err().is_already_present());
        // The tracker never resolves the original round, its owner does.
        assert!(first_rx.try_recv().is_err());
        assert_eq!(requests.counts(), RetryableRequestsCounts { running: 0, replicated: 1 });

        let (third, mut third_rx) = round(write("c1", 5, 0, 3));
        assert!(!requests.register(&third, None));
        assert!(third_rx.try_recv().unwrap().unwrap_err().is_already_present());
    }

    #[test]
    fn failed_replication_fails_duplicates_and_allows_retry() {
        let (requests, _controller) = setup();
        let record = write("c1", 1, 0, 1);
        let (first, _first_rx) = round(record.clone());
        let (second, mut second_rx) = round(write("c1", 1, 0, 2));
        assert!(requests.register(&first, None));
        assert!(!requests.register(&second, None));

        let failure = Err(ReplicationError::TimedOut("leader changed".to_string()));
        requests.replication_finished(&record, &failure, 2).unwrap();
        assert!(matches!(second_rx.try_recv().unwrap(), Err(ReplicationError::TimedOut(_))));

        let (retry, _retry_rx) = round(write("c1", 1, 0, 3));
        assert!(requests.register(&retry, None));
    }

    #[test]
    fn request_below_min_running_is_expired() {
        let (requests, _controller) = setup();
        let (first, _rx) = round(write("c1", 10, 7, 1));
        assert!(requests.register(&first, None));
        assert_eq!(requests.min_running_request_id(&ClientId::new("c1")).unwrap(), 7);

        let (late, mut late_rx) = round(write("c1", 6, 0, 2));
        assert!(!requests.register(&late, None));
        match late_rx.try_recv().unwrap() {
            Err(ReplicationError::Expired {
                min_running_request_id, ..
            }) => assert_eq!(min_running_request_id, 7),
            other => panic!("Unexpected {:?}", other),
        }

        assert!(requests
            .min_running_request_id(&ClientId::new("unknown"))
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn finishing_unknown_request_is_invariant_violation() {
        let (requests, _controller) = setup();
        let result = requests.replication_finished(&write("c1", 1, 0, 1), &Ok(()), 1);
        assert!(result.unwrap_err().is_invariant_violation());

        // Records without a client write are not tracked at all.
        let no_op = LogRecord::new(OpId::new(1, 2), HybridTime::from_micros(1), Payload::NoOp);
        assert!(requests.replication_finished(&no_op, &Ok(()), 1).is_ok());
    }

    #[test]
    fn expired_ranges_release_log_and_allow_reuse() {
        // -- setup --
        let (requests, mut controller) = setup();
        for (request_id, index) in &[(1, 10), (2, 11)] {
            let record = write("c1", *request_id, 0, *index);
            let (r, _rx) = round(record.clone());
            assert!(requests.register(&r, None));
            requests.replication_finished(&record, &Ok(()), 1).unwrap();
        }
        let running = write("c2", 1, 0, 12);
        let (r, _rx) = round(running.clone());
        assert!(requests.register(&r, None));

        // -- execute & verify --
        assert_eq!(requests.clean_expired_replicated_and_get_min_op_id(), OpId::new(1, 10));

        controller.advance(Duration::from_secs(121));
        assert_eq!(requests.clean_expired_replicated_and_get_min_op_id(), OpId::new(1, 12));
        assert_eq!(requests.counts(), RetryableRequestsCounts { running: 1, replicated: 0 });

        // The id is no longer a known duplicate.
        let (again, _rx) = round(write("c1", 2, 0, 13));
        assert!(requests.register(&again, None));
    }

    #[test]
    fn empty_clients_are_forgotten_after_a_full_timeout() {
        let (requests, mut controller) = setup();
        let record = write("c1", 3, 3, 1);
        let (r, _rx) = round(record.clone());
        assert!(requests.register(&r, None));
        requests.replication_finished(&record, &Ok(()), 1).unwrap();

        controller.advance(Duration::from_secs(121));
        assert_eq!(requests.clean_expired_replicated_and_get_min_op_id(), OpId::MAX);
        // Empty now, but still remembered.
        assert_eq!(requests.min_running_request_id(&ClientId::new("c1")).unwrap(), 3);

        controller.advance(Duration::from_secs(121));
        requests.clean_expired_replicated_and_get_min_op_id();
        assert!(requests.min_running_request_id(&ClientId::new("c1")).is_err());
    }

    #[test]
    fn bootstrap_rebuilds_replicated_state() {
        let (requests, controller) = setup();
        let now = controller.current_time();
        requests.bootstrap(&write("c1", 1, 0, 1), now).unwrap();
        requests.bootstrap(&write("c1", 2, 0, 2), now).unwrap();
        assert_eq!(requests.counts(), RetryableRequestsCounts { running: 0, replicated: 1 });

        let (dup, mut dup_rx) = round(write("c1", 2, 0, 3));
        assert!(!requests.register(&dup, None));
        assert!(dup_rx.try_recv().unwrap().unwrap_err().is_already_present());

        let record = write("c1", 3, 0, 4);
        let (running, _rx) = round(record.clone());
        assert!(requests.register(&running, None));
        assert!(matches!(
            requests.bootstrap(&record, now),
            Err(ReplicationError::IllegalState(_))
        ));
    }
}
