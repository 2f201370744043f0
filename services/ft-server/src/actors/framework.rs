//! Actor trait, mailboxes and the per-actor message loop.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

/// Marker trait for actor messages.
pub trait Message: Send + fmt::Debug + 'static {}

impl<T: Send + fmt::Debug + 'static> Message for T {}

/// What the loop does after a message has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// An owner of mutable state that only changes through its mailbox.
///
/// Messages are handled strictly one after another; anything slow is
/// spawned as a task that reports back through a [`WeakActorHandle`].
#[async_trait]
pub trait Actor: Send + 'static {
    type Message: Message;

    /// Kind of actor, used in its [`ActorId`].
    const KIND: &'static str;

    async fn handle(&mut self, msg: Self::Message, ctx: &mut ActorContext)
        -> Result<Flow, ActorError>;

    async fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), ActorError> {
        Ok(())
    }

    /// Runs once after the loop exits, whatever the reason.
    async fn on_stop(&mut self, _ctx: &mut ActorContext) {}
}

/// Process-unique actor name, `{kind}#{n}`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ActorId {
    kind: &'static str,
    n: u64,
}

impl ActorId {
    pub(crate) fn next(kind: &'static str) -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self {
            kind,
            n: NEXT.fetch_add(1, Ordering::Relaxed),
        }
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }
}

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind, self.n)
    }
}

/// Per-actor bookkeeping handed to every callback.
#[derive(Debug)]
pub struct ActorContext {
    id: ActorId,
    handled: u64,
}

impl ActorContext {
    pub fn id(&self) -> &ActorId {
        &self.id
    }

    /// Messages handled so far, including the current one.
    pub fn handled(&self) -> u64 {
        self.handled
    }
}

/// Errors from actors and their mailboxes.
#[derive(Debug, Error)]
pub enum ActorError {
    /// The message failed; the actor keeps running.
    #[error("transient error: {0}")]
    Transient(String),

    /// The actor cannot continue and stops.
    #[error("permanent error: {0}")]
    Permanent(String),

    /// The mailbox is closed.
    #[error("actor stopped")]
    Stopped,
}

/// Sending side of an actor's mailbox.
pub struct ActorHandle<M: Message> {
    tx: mpsc::Sender<M>,
    id: ActorId,
}

impl<M: Message> Clone for ActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            id: self.id.clone(),
        }
    }
}

impl<M: Message> ActorHandle<M> {
    /// Waits for mailbox room, then enqueues `msg`.
    pub async fn send(&self, msg: M) -> Result<(), ActorError> {
        self.tx.send(msg).await.map_err(|_| ActorError::Stopped)
    }

    pub fn id(&self) -> &ActorId {
        &self.id
    }

    /// A handle that does not keep the mailbox open.
    pub fn downgrade(&self) -> WeakActorHandle<M> {
        WeakActorHandle {
            tx: self.tx.downgrade(),
            id: self.id.clone(),
        }
    }
}

/// Non-owning handle, given to an actor that needs to message itself from
/// tasks it spawns.
pub struct WeakActorHandle<M: Message> {
    tx: mpsc::WeakSender<M>,
    id: ActorId,
}

impl<M: Message> Clone for WeakActorHandle<M> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            id: self.id.clone(),
        }
    }
}

impl<M: Message> WeakActorHandle<M> {
    /// Returns a full handle while any other handle is still alive.
    pub fn upgrade(&self) -> Option<ActorHandle<M>> {
        self.tx.upgrade().map(|tx| ActorHandle {
            tx,
            id: self.id.clone(),
        })
    }
}

/// Creates a mailbox for an actor of kind `A`.
pub(crate) fn mailbox<A: Actor>(size: usize) -> (ActorHandle<A::Message>, mpsc::Receiver<A::Message>) {
    let (tx, rx) = mpsc::channel(size.max(1));
    let handle = ActorHandle {
        tx,
        id: ActorId::next(A::KIND),
    };
    (handle, rx)
}

/// Why a message loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Exit {
    Shutdown,
    Requested,
    Failed,
    MailboxClosed,
}

/// Drives `actor` until shutdown, a stop request, a permanent error, or
/// until every handle is gone.
///
/// A dropped shutdown sender counts as a shutdown signal.
pub(crate) async fn run<A: Actor>(
    mut actor: A,
    id: ActorId,
    mut rx: mpsc::Receiver<A::Message>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ctx = ActorContext { id, handled: 0 };

    if let Err(e) = actor.on_start(&mut ctx).await {
        error!(actor_id = %ctx.id, error = %e, "Actor failed to start");
        return;
    }
    debug!(actor_id = %ctx.id, "Actor started");

    let exit = loop {
        let msg = tokio::select! {
            biased;

            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break Exit::Shutdown;
                }
                continue;
            }
            msg = rx.recv() => msg,
        };
        let Some(msg) = msg else {
            break Exit::MailboxClosed;
        };

        ctx.handled += 1;
        match actor.handle(msg, &mut ctx).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Stop) => break Exit::Requested,
            Err(e @ ActorError::Permanent(_)) => {
                error!(actor_id = %ctx.id, error = %e, "Actor failed");
                break Exit::Failed;
            }
            Err(e) => error!(actor_id = %ctx.id, error = %e, "Message failed"),
        }
    };

    actor.on_stop(&mut ctx).await;
    info!(
        actor_id = %ctx.id,
        exit = ?exit,
        messages = ctx.handled,
        "Actor stopped"
    );
}
