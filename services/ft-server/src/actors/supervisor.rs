//! Spawning actors and stopping them as a group.

use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use super::framework::{self, Actor, ActorHandle, ActorId, WeakActorHandle};

/// How long [`Supervisor::stop_all`] waits before aborting.
const STOP_GRACE: Duration = Duration::from_secs(10);

struct Child {
    id: ActorId,
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

/// Owns the tasks of the actors it spawned.
///
/// Every child watches a shutdown channel held here, so dropping the
/// supervisor stops its actors too.
#[derive(Default)]
pub struct Supervisor {
    children: Vec<Child>,
}

impl Supervisor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn spawn<A: Actor>(&mut self, actor: A, mailbox_size: usize) -> ActorHandle<A::Message> {
        self.spawn_with(|_| actor, mailbox_size)
    }

    /// Spawns an actor built from a weak handle to its own mailbox.
    pub fn spawn_with<A, F>(&mut self, build: F, mailbox_size: usize) -> ActorHandle<A::Message>
    where
        A: Actor,
        F: FnOnce(WeakActorHandle<A::Message>) -> A,
    {
        let (handle, rx) = framework::mailbox::<A>(mailbox_size);
        let (shutdown, shutdown_rx) = watch::channel(false);
        let actor = build(handle.downgrade());
        let id = handle.id().clone();

        let task = tokio::spawn(framework::run(actor, id.clone(), rx, shutdown_rx));
        info!(actor_id = %id, "Spawned actor");
        self.children.push(Child { id, task, shutdown });

        handle
    }

    /// Signals every child, waits for them, and aborts whoever is still
    /// running once the grace period is over.
    pub async fn stop_all(&mut self) {
        info!(count = self.children.len(), "Stopping all actors");
        for child in &self.children {
            let _ = child.shutdown.send(true);
        }

        let deadline = tokio::time::Instant::now() + STOP_GRACE;
        for Child { id, mut task, .. } in self.children.drain(..) {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(actor_id = %id, error = %e, "Actor task ended abnormally"),
                Err(_) => {
                    warn!(actor_id = %id, "Actor did not stop in time, aborting");
                    task.abort();
                }
            }
        }
    }

    /// Number of children whose task has not finished.
    pub fn running_count(&self) -> usize {
        self.children.iter().filter(|c| !c.task.is_finished()).count()
    }
}
