use crossbeam_channel::{Receiver, Select, TryRecvError, unbounded};

use super::{PRIORITY_COUNT, ZoneHandle, ZoneId, ZoneMessage};


/// The consumer side of a zone's queues: one unbounded channel per priority,
/// drained highest-priority-first.
#[derive(Debug)]
pub(crate) struct ZoneQueue {
    receivers: [Receiver<ZoneMessage>; PRIORITY_COUNT],
}

pub(crate) fn make_zone(id: ZoneId) -> (ZoneHandle, ZoneQueue) {
    let (senders, receivers): (Vec<_>, Vec<_>) =
        (0..PRIORITY_COUNT).map(|_| unbounded()).unzip();

    let senders = senders
        .try_into()
        .expect("exactly PRIORITY_COUNT channels were created");
    let receivers = receivers
        .try_into()
        .expect("exactly PRIORITY_COUNT channels were created");

    (ZoneHandle { id, senders }, ZoneQueue { receivers })
}

impl ZoneQueue {
    /// Receive the next message, blocking while all queues are empty.
    ///
    /// Messages at a higher priority always overtake lower-priority messages
    /// that have not started executing, which is exactly the reordering the
    /// data path is designed to tolerate.
    pub(crate) fn recv(&self) -> ZoneMessage {
        loop {
            // Highest priority first.
            for receiver in self.receivers.iter().rev() {
                match receiver.try_recv() {
                    Ok(message)                     => return message,
                    Err(TryRecvError::Empty)        => {}
                    Err(TryRecvError::Disconnected) => return ZoneMessage::Shutdown,
                }
            }

            // Everything is empty; sleep until any queue has traffic, then
            // rescan in priority order.
            let mut select = Select::new();
            for receiver in &self.receivers {
                select.recv(receiver);
            }
            let _ready_index = select.ready();
        }
    }
}
