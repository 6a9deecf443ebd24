use crate::common::Clock;
use crate::consensus::{PeerOptions, PeerProxy, PeerProxyError, ReplicationQueue};
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::sync::Notify;
use tokio::time::Duration;

/// PeerHandle keeps one remote peer's replication task alive. Dropping it stops the task.
pub struct PeerHandle {
    shared: Arc<Shared>,
}

struct Shared {
    signal: Notify,
}

struct PeerTask<C: Clock> {
    logger: slog::Logger,
    peer_uuid: String,
    weak_shared: Weak<Shared>,
    queue: Weak<ReplicationQueue<C>>,
    proxy: Arc<dyn PeerProxy>,
    heartbeat_interval: Duration,
    rpc_timeout: Duration,
    clock: C,
}

impl PeerHandle {
    pub fn spawn<C: Clock>(
        logger: slog::Logger,
        peer_uuid: impl Into<String>,
        queue: &Arc<ReplicationQueue<C>>,
        proxy: Arc<dyn PeerProxy>,
        options: PeerOptions,
    ) -> Self {
        let (task, handle) = PeerTask::new(logger, peer_uuid.into(), queue, proxy, options);
        tokio::task::spawn(task.run());

        handle
    }

    /// There is something new to send; the peer does not wait for its heartbeat.
    pub fn signal_request(&self) {
        self.shared.signal.notify_one();
    }
}

impl Drop for PeerHandle {
    fn drop(&mut self) {
        // Wakes the task so it notices the handle is gone.
        self.shared.signal.notify_one();
    }
}

impl<C: Clock> PeerTask<C> {
    fn new(
        logger: slog::Logger,
        peer_uuid: String,
        queue: &Arc<ReplicationQueue<C>>,
        proxy: Arc<dyn PeerProxy>,
        options: PeerOptions,
    ) -> (Self, PeerHandle) {
        let shared = Arc::new(Shared { signal: Notify::new() });

        let task = PeerTask {
            logger: logger.new(slog::o!("remote_peer" => peer_uuid.clone())),
            peer_uuid,
            weak_shared: Arc::downgrade(&shared),
            queue: Arc::downgrade(queue),
            proxy,
            heartbeat_interval: options.heartbeat_interval,
            rpc_timeout: options.rpc_timeout,
            clock: queue.clock().clone(),
        };
        let handle = PeerHandle { shared };

        (task, handle)
    }

    async fn run(mut self) {
        // The first pass sends right away, so a new leader or a new peer exchanges status early.
        loop {
            let shared = match self.weak_shared.upgrade() {
                Some(shared) => shared,
                None => {
                    slog::debug!(self.logger, "Peer handle dropped, stopping");
                    return;
                }
            };
            let queue = match self.queue.upgrade() {
                Some(queue) => queue,
                None => return,
            };
            while self.send_next_request(&queue).await {}
            drop(queue);

            let next_heartbeat = self.clock.now() + self.heartbeat_interval;
            tokio::select! {
                _ = shared.signal.notified() => {}
                _ = self.clock.sleep_until(next_heartbeat) => {}
            }
        }
    }

    /// Returns whether the peer should be sent more right away.
    async fn send_next_request(&self, queue: &ReplicationQueue<C>) -> bool {
        let peer_request = match queue.request_for_peer(&self.peer_uuid) {
            Ok(peer_request) => peer_request,
            Err(e) => {
                slog::debug!(self.logger, "No request for peer: {}", e);
                return false;
            }
        };

        if peer_request.needs_remote_bootstrap {
            match queue.get_remote_bootstrap_request_for_peer(&self.peer_uuid) {
                Ok(request) => {
                    let result = self.with_timeout(self.proxy.start_remote_bootstrap(request)).await;
                    if let Err(e) = result {
                        slog::warn!(self.logger, "Unable to start remote bootstrap: {}", e);
                    }
                }
                Err(e) => slog::debug!(self.logger, "Remote bootstrap already triggered: {}", e),
            }
            return false;
        }

        match self.with_timeout(self.proxy.update_consensus(peer_request.request)).await {
            Ok(response) => match queue.response_from_peer(&self.peer_uuid, &response) {
                Ok(more_pending) => more_pending,
                Err(e) => {
                    slog::error!(self.logger, "Unable to process peer response {}: {}", response, e);
                    false
                }
            },
            Err(e) => {
                if e.peer_is_responsive() {
                    queue.notify_peer_is_responsive_despite_error(&self.peer_uuid);
                }
                if peer_request.last_exchange_successful {
                    slog::warn!(self.logger, "Couldn't send request to peer: {}", e);
                } else {
                    slog::debug!(self.logger, "Couldn't send request to peer: {}", e);
                }
                false
            }
        }
    }

    async fn with_timeout<T>(&self, call: impl Future<Output = Result<T, PeerProxyError>>) -> Result<T, PeerProxyError> {
        let mut clock = self.clock.clone();
        tokio::select! {
            result = call => result,
            _ = clock.sleep(self.rpc_timeout) => Err(PeerProxyError::TimedOut(self.rpc_timeout)),
        }
    }
}
