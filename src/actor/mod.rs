use crate::common::{ReplicationError, Result};
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

pub(crate) fn create(logger: slog::Logger) -> (SerialToken, SerialTokenActor) {
    let (tx, rx) = mpsc::unbounded_channel();
    let token = SerialToken {
        sender: Mutex::new(Some(tx)),
    };
    let actor = SerialTokenActor { logger, receiver: rx };

    (token, actor)
}

/// Spawns the event loop on the current runtime.
pub(crate) fn spawn(logger: slog::Logger) -> SerialToken {
    let (token, actor) = create(logger);
    tokio::task::spawn(actor.run_event_loop());
    token
}

enum Event {
    Run(Task),
    // Resolves once everything submitted before it ran.
    Barrier(oneshot::Sender<()>),
}

/// SerialToken runs submitted tasks one at a time, in submission order, on the shared runtime.
/// Many tokens run in parallel; one token never does.
pub(crate) struct SerialToken {
    sender: Mutex<Option<mpsc::UnboundedSender<Event>>>,
}

impl SerialToken {
    /// Callable from any thread, including the WAL appender.
    pub(crate) fn submit(&self, task: impl FnOnce() + Send + 'static) -> Result<()> {
        self.send(Event::Run(Box::new(task)))
    }

    /// Waits for everything submitted so far to run.
    pub(crate) async fn wait_idle(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.send(Event::Barrier(tx))?;
        rx.await.map_err(|_| shut_down())
    }

    /// New submissions fail from now on. Tasks already queued still run.
    pub(crate) fn shutdown(&self) {
        self.sender.lock().take();
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.sender.lock().is_none()
    }

    fn send(&self, event: Event) -> Result<()> {
        match self.sender.lock().as_ref() {
            Some(sender) => sender.send(event).map_err(|_| shut_down()),
            None => Err(shut_down()),
        }
    }
}

pub(crate) struct SerialTokenActor {
    logger: slog::Logger,
    receiver: mpsc::UnboundedReceiver<Event>,
}

impl SerialTokenActor {
    pub(crate) async fn run_event_loop(mut self) {
        while let Some(event) = self.receiver.recv().await {
            self.handle_event(event);
        }
        slog::debug!(self.logger, "Serial token drained");
    }

    // This must NOT be async. Tasks are short, in-memory bookkeeping.
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Run(task) => task(),
            Event::Barrier(tx) => {
                let _ = tx.send(());
            }
        }
    }
}

fn shut_down() -> ReplicationError {
    ReplicationError::ServiceUnavailable("Serial token is shut down".to_string())
}
