//! Single-consumer FIFO command queue with cancellation tokens, sitting
//! in front of the engine thread so every public API call becomes one
//! queued command with its own reply channel.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender as OneShotSender};
use std::sync::Arc;

use chan::{chan_select, Receiver, Sender};
use uuid::Uuid;

use crate::error::Error;
use crate::metadata::Target;

/// The kind of work one queued command performs. `CheckUpdates`/`Download`/
/// `Install` carry the target set they operate over; `Shutdown` is the
/// queue's poison pill.
#[derive(Debug, Clone)]
pub enum CommandKind {
    Initialize,
    CheckUpdates,
    Download(Vec<Target>),
    Install(Vec<Target>),
    SendManifest(Option<String>),
    SendDeviceData(Option<String>),
    Pause,
    Resume,
    Abort,
    Shutdown,
}

/// A cooperative cancellation flag checked at every suspension point
///. Cloning shares the same underlying flag.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> CancelFlag {
        CancelFlag(Arc::new(AtomicBool::new(false)))
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// What a completed (or cancelled) command resolves to, delivered over a
/// one-shot channel to whichever caller enqueued it.
#[derive(Debug, Clone)]
pub enum Completion {
    Success,
    Cancelled,
    Failed(String),
}

/// One entry in the queue: the work itself, plus the machinery to cancel
/// it and to notify the caller once it settles.
pub struct Command {
    pub id: Uuid,
    pub kind: CommandKind,
    pub cancel: CancelFlag,
    reply: OneShotSender<Completion>,
}

impl Command {
    pub fn complete(self, completion: Completion) {
        let _ = self.reply.send(completion);
    }
}

/// A handle a producer uses to enqueue work and await its result.
#[derive(Clone)]
pub struct CommandQueueHandle {
    tx: Sender<Command>,
}

impl CommandQueueHandle {
    /// Enqueue `kind`, returning its cancellation token and a receiver for
    /// its eventual `Completion`.
    pub fn enqueue(&self, kind: CommandKind) -> (CancelFlag, mpsc::Receiver<Completion>) {
        let cancel = CancelFlag::new();
        let (reply_tx, reply_rx) = mpsc::channel();
        let command = Command {
            id: Uuid::new_v4(),
            kind,
            cancel: cancel.clone(),
            reply: reply_tx,
        };
        self.tx.send(command);
        (cancel, reply_rx)
    }

    pub fn shutdown(&self) {
        let _ = self.enqueue(CommandKind::Shutdown);
    }
}

/// Constructs the bounded channel pair backing the queue: a handle for
/// producers and the receiving half the engine thread drains.
pub fn channel() -> (CommandQueueHandle, Receiver<Command>) {
    let (tx, rx) = chan::sync(16);
    (CommandQueueHandle { tx }, rx)
}

/// Drains every command already queued on `rx`, cancelling and completing
/// each with `Completion::Cancelled`. Stops as soon
/// as the channel has nothing immediately ready, using `chan_select!`'s
/// `default` arm for a non-blocking receive.
pub fn drain_as_cancelled(rx: &Receiver<Command>) {
    loop {
        let mut drained = None;
        chan_select! {
            default => break,
            rx.recv() -> command => drained = command,
        }
        match drained {
            Some(command) => {
                command.cancel.cancel();
                command.complete(Completion::Cancelled);
            }
            None => break,
        }
    }
}

impl From<Error> for Completion {
    fn from(err: Error) -> Completion {
        Completion::Failed(err.to_string())
    }
}
