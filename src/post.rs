//! Command post: one-way and two-way delivery into a machine's mailbox.

use crate::control::Control;
use crate::error::PostError;
use crate::machine::mailbox::Envelope;
use crate::machine::{Machine, MachineLogic};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// Addresses the machines of one group by identifier.
///
/// Commands for a machine are delivered in the order they were posted, each
/// under the machine's lock, never concurrently with a run or another
/// command.
pub struct CommandPost<L: MachineLogic> {
    group: Arc<Control<L>>,
}

impl<L: MachineLogic> CommandPost<L> {
    pub(crate) fn new(group: Arc<Control<L>>) -> Self {
        Self { group }
    }

    fn target(&self, id: &L::Id) -> Result<Arc<Machine<L>>, PostError> {
        self.group.lookup(id).ok_or_else(|| PostError::NotFound {
            machine: self.group.tag(),
            identifier: format!("{id:?}"),
        })
    }

    /// Enqueues `command` and returns immediately.
    ///
    /// A command that would close a loop is dropped under the breaking loop
    /// policy and still reports success.
    pub fn send(&self, id: &L::Id, command: &L::Command) -> Result<(), PostError> {
        let machine = self.target(id)?;
        send_to(&machine, command)
    }

    /// Enqueues `command` and waits at most `timeout` for the reply.
    pub async fn send_two_way(
        &self,
        id: &L::Id,
        command: &L::Command,
        timeout: Duration,
    ) -> Result<L::Reply, PostError> {
        let machine = self.target(id)?;
        ask(&machine, command, timeout).await
    }

    /// Sends to the only member of the group.
    pub fn send_single(&self, command: &L::Command) -> Result<(), PostError> {
        let machine = self.single()?;
        send_to(&machine, command)
    }

    pub async fn ask_single(&self, command: &L::Command, timeout: Duration) -> Result<L::Reply, PostError> {
        let machine = self.single()?;
        ask(&machine, command, timeout).await
    }

    fn single(&self) -> Result<Arc<Machine<L>>, PostError> {
        self.group.first().ok_or_else(|| PostError::NotFound {
            machine: self.group.tag(),
            identifier: "<single>".to_string(),
        })
    }
}

impl<L: MachineLogic> Clone for CommandPost<L> {
    fn clone(&self) -> Self {
        Self {
            group: Arc::clone(&self.group),
        }
    }
}

impl<L: MachineLogic> fmt::Debug for CommandPost<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandPost")
            .field("machine", &self.group.tag())
            .finish()
    }
}

pub(crate) fn send_to<L: MachineLogic>(machine: &Machine<L>, command: &L::Command) -> Result<(), PostError> {
    let Some(chain) = machine.relay_chain(L::call_id(command), false)? else {
        return Ok(());
    };
    machine.deliver(Envelope {
        command: command.clone(),
        reply: None,
        chain,
    })
}

/// The caller waits on a oneshot channel; a closed channel means the machine
/// terminated before answering.
pub(crate) async fn ask<L: MachineLogic>(
    machine: &Machine<L>,
    command: &L::Command,
    timeout: Duration,
) -> Result<L::Reply, PostError> {
    let call_id = L::call_id(command);
    let Some(chain) = machine.relay_chain(call_id, true)? else {
        return Err(PostError::CycleBroken {
            hop: format!("{}#{}({call_id:016x})", machine.tag(), machine.serial()),
        });
    };
    let (reply, answer) = oneshot::channel();
    machine.deliver(Envelope {
        command: command.clone(),
        reply: Some(reply),
        chain,
    })?;
    match tokio::time::timeout(timeout, answer).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(_)) => Err(PostError::Dropped),
        Err(_) => {
            debug!(
                machine = machine.tag(),
                serial = machine.serial(),
                ?timeout,
                "two-way command timed out"
            );
            Err(PostError::Timeout(timeout))
        }
    }
}
