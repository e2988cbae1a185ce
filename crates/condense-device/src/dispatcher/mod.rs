//! The zone dispatcher: a fixed set of single-consumer callback queues, one
//! per zone, each drained by its own thread in priority order.
//!
//! All cross-zone communication goes through these queues; enqueueing is the
//! only way to hand an operation (or any other work) to another zone, and it
//! never blocks the producer.

mod queue;


use std::cell::Cell;
use std::fmt::{Display, Formatter, Result as FmtResult};

use crossbeam_channel::Sender;

use crate::data_op::DataOp;
use crate::types::Pbn;


pub(crate) use self::queue::{ZoneQueue, make_zone};


/// The classes of zones the data path runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum ZoneClass {
    Logical,
    Physical,
    Hash,
    Cpu,
    Journal,
    Packer,
    BioAck,
    BioSubmit,
}

/// One zone: a class plus an index within that class. Classes with a single
/// zone always use index 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct ZoneId {
    pub(crate) class: ZoneClass,
    pub(crate) index: u8,
}

impl ZoneId {
    #[inline]
    #[must_use]
    pub(crate) fn new(class: ZoneClass, index: u8) -> Self {
        Self { class, index }
    }

    #[inline]
    #[must_use]
    pub(crate) fn solo(class: ZoneClass) -> Self {
        Self { class, index: 0 }
    }
}

impl Display for ZoneId {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self.class {
            ZoneClass::Logical   => write!(f, "logical{}", self.index),
            ZoneClass::Physical  => write!(f, "physical{}", self.index),
            ZoneClass::Hash      => write!(f, "hash{}", self.index),
            ZoneClass::Cpu       => write!(f, "cpu{}", self.index),
            ZoneClass::Journal   => write!(f, "journal"),
            ZoneClass::Packer    => write!(f, "packer"),
            ZoneClass::BioAck    => write!(f, "bio-ack"),
            ZoneClass::BioSubmit => write!(f, "bio-submit"),
        }
    }
}


pub(crate) const PRIORITY_COUNT: usize = 4;

/// Queue priorities. Higher-priority work overtakes lower-priority work that
/// is enqueued but not yet executing. The top level is reserved for
/// dispatcher-internal traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Priority {
    Low      = 0,
    Data     = 1,
    High     = 2,
    #[expect(dead_code, reason = "reserved for dispatcher-internal traffic")]
    Reserved = 3,
}


/// Everything a zone thread can be asked to do.
///
/// `Run` transfers exclusive ownership of the operation to the receiving
/// zone; the remaining variants are control traffic that is not tied to an
/// operation the sender owns.
#[derive(Debug)]
pub(crate) enum ZoneMessage {
    /// Execute the operation's current phase on this zone.
    Run(Box<DataOp>),
    /// Packer only: a canceller wants the identified operation out of its
    /// bin.
    CancelCompression { op_id: u64 },
    /// Physical only: drop one share of the lock on `pbn`.
    ReleaseSharedPbnLock { pbn: Pbn },
    /// Journal only: a provisional reference was abandoned; journal the
    /// decrement that returns the block to the allocator.
    ReleaseProvisionalReference { pbn: Pbn },
    /// Packer only: advance the flush generation and write out every bin
    /// from an older generation.
    FlushPacker,
    /// Journal only: a barrier; reply once every prior entry is committed.
    FlushJournal { done: Sender<()> },
    Shutdown,
}


/// The producer side of a zone's queues.
#[derive(Debug, Clone)]
pub(crate) struct ZoneHandle {
    id:      ZoneId,
    senders: [Sender<ZoneMessage>; PRIORITY_COUNT],
}

impl ZoneHandle {
    /// Enqueue without blocking. The queues are unbounded, so a send can
    /// only fail during teardown, after the zone thread has already exited;
    /// the message is dropped along with everything else in flight.
    pub(crate) fn send(&self, priority: Priority, message: ZoneMessage) {
        let sender = &self.senders[priority as usize];
        if sender.send(message).is_err() {
            tracing::event!(
                tracing::Level::DEBUG,
                "dropped a message for zone {} during shutdown", self.id,
            );
        }
    }
}


thread_local! {
    static CURRENT_ZONE: Cell<Option<ZoneId>> = const { Cell::new(None) };
}

/// Record the zone the calling thread runs; called once by each zone thread
/// before it starts draining its queue.
pub(crate) fn set_current_zone(id: ZoneId) {
    CURRENT_ZONE.with(|zone| zone.set(Some(id)));
}

#[must_use]
pub(crate) fn current_zone() -> Option<ZoneId> {
    CURRENT_ZONE.with(Cell::get)
}

/// Every pipeline step asserts the zone it expects to run on. A violation is
/// a process-wide fatal error, never something to limp past.
#[track_caller]
pub(crate) fn assert_on_zone(expected: ZoneId) {
    let running = current_zone();
    assert!(
        running == Some(expected),
        "expected to run on zone {expected}, but running on {running:?}",
    );
}


#[cfg(test)]
mod tests {
    use super::{Priority, ZoneClass, ZoneId, ZoneMessage, make_zone};

    #[test]
    fn priorities_overtake() {
        let (handle, queue) = make_zone(ZoneId::solo(ZoneClass::Packer));
        handle.send(Priority::Low, ZoneMessage::FlushPacker);
        handle.send(Priority::Data, ZoneMessage::Shutdown);
        handle.send(Priority::High, ZoneMessage::CancelCompression { op_id: 7 });

        assert!(matches!(
            queue.recv(),
            ZoneMessage::CancelCompression { op_id: 7 },
        ));
        assert!(matches!(queue.recv(), ZoneMessage::Shutdown));
        assert!(matches!(queue.recv(), ZoneMessage::FlushPacker));
    }

    #[test]
    fn zone_names() {
        assert_eq!(ZoneId::new(ZoneClass::Logical, 3).to_string(), "logical3");
        assert_eq!(ZoneId::solo(ZoneClass::BioSubmit).to_string(), "bio-submit");
    }
}
