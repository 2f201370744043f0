//! Actor runtime for the fault-tolerance server.
//!
//! A mailbox per actor, handled one message at a time. The node source
//! runs on it so that every add, remove and down report for a pool is
//! applied in arrival order without locks.

mod framework;
mod supervisor;

pub use framework::{
    Actor, ActorContext, ActorError, ActorHandle, ActorId, Flow, Message, WeakActorHandle,
};
pub use supervisor::Supervisor;
