use async_broadcast::{broadcast, InactiveReceiver, Receiver, Sender, TrySendError};
use tracing::{trace, warn};

use crate::{device::DeviceSnapshot, protocol::UnitId};


/// One unit's state after a `Changed` result.
#[derive(Clone, Debug)]
pub struct Change {
    pub unit_id: UnitId,
    pub snapshot: DeviceSnapshot,
}


/// Fan-out of change notifications to any number of subscribers.
///
/// Publishing never blocks: a subscriber that falls more than `capacity`
/// changes behind loses the oldest ones.
pub struct ChangeBus {
    changes_send: Sender<Change>,

    // keeps the channel open while nobody is subscribed
    _changes_recv: InactiveReceiver<Change>,
}

impl ChangeBus {
    pub fn new(capacity: usize) -> Self {
        let (mut changes_send, changes_recv) = broadcast(capacity.max(1));
        changes_send.set_overflow(true);

        Self {
            changes_send,
            _changes_recv: changes_recv.deactivate(),
        }
    }

    pub fn subscribe(&self) -> Receiver<Change> {
        self.changes_send.new_receiver()
    }

    pub fn publish(&self, change: Change) {
        let unit_id = change.unit_id;

        match self.changes_send.try_broadcast(change) {
            Ok(None) => trace!(unit = %unit_id, "change published"),
            Ok(Some(dropped)) => trace!(unit = %dropped.unit_id, "slow subscriber, oldest change dropped"),
            Err(TrySendError::Inactive(_)) => trace!(unit = %unit_id, "change published with no subscribers"),
            Err(err) => warn!(unit = %unit_id, "failed to publish change: {err}"),
        }
    }
}
