use std::collections::VecDeque;
use std::fmt;

use crate::CharacteristicHandle;

/// One pending GATT request against a connected peripheral
///
/// Operations are plain values; all bookkeeping (pending vs in-flight) lives
/// in the [`OperationQueue`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Operation {
    SubscribeNotification(CharacteristicHandle),
    ReadCharacteristic(CharacteristicHandle),
}

impl Operation {
    pub fn characteristic(&self) -> CharacteristicHandle {
        match self {
            Operation::SubscribeNotification(handle) => *handle,
            Operation::ReadCharacteristic(handle) => *handle,
        }
    }

    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::SubscribeNotification(_) => OperationKind::Subscribe,
            Operation::ReadCharacteristic(_) => OperationKind::Read,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationKind {
    Subscribe,
    Read,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Subscribe => write!(f, "subscribe"),
            OperationKind::Read => write!(f, "read"),
        }
    }
}

/// A FIFO of pending [`Operation`]s with a single in-flight slot
///
/// The transport underneath only tolerates one outstanding GATT request per
/// connection, so [`dispatch_next`] hands out the head entry only while
/// nothing is in flight, and the in-flight slot is freed only by
/// [`complete_in_flight`] (on the completion callback for that request) or
/// [`clear`] (on disconnect). Entries are never reordered or implicitly
/// dropped.
///
/// [`dispatch_next`]: OperationQueue::dispatch_next
/// [`complete_in_flight`]: OperationQueue::complete_in_flight
/// [`clear`]: OperationQueue::clear
#[derive(Debug, Default)]
pub struct OperationQueue {
    pending: VecDeque<Operation>,
    in_flight: Option<Operation>,
}

impl OperationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the queue content with a freshly derived plan.
    ///
    /// This happens once per session, when discovery completes; the queue is
    /// not incrementally appended to during normal operation.
    pub fn load(&mut self, plan: Vec<Operation>) {
        self.pending = plan.into();
        self.in_flight = None;
    }

    /// Removes and returns the head entry, marking it in flight, if the
    /// queue is non-empty and nothing is currently in flight.
    pub fn dispatch_next(&mut self) -> Option<Operation> {
        if self.in_flight.is_some() {
            return None;
        }
        let operation = self.pending.pop_front()?;
        self.in_flight = Some(operation);
        Some(operation)
    }

    /// Frees the in-flight slot, returning the operation that completed.
    pub fn complete_in_flight(&mut self) -> Option<Operation> {
        self.in_flight.take()
    }

    pub fn in_flight(&self) -> Option<Operation> {
        self.in_flight
    }

    /// Discards all remaining entries and any in-flight bookkeeping.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.in_flight = None;
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plan() -> Vec<Operation> {
        vec![Operation::SubscribeNotification(CharacteristicHandle(1)),
             Operation::ReadCharacteristic(CharacteristicHandle(1)),
             Operation::ReadCharacteristic(CharacteristicHandle(2))]
    }

    #[test]
    fn drains_in_insertion_order() {
        let mut queue = OperationQueue::new();
        queue.load(plan());

        let mut drained = vec![];
        while let Some(operation) = queue.dispatch_next() {
            drained.push(operation);
            queue.complete_in_flight();
        }
        assert_eq!(drained, plan());
        assert!(queue.is_empty());
    }

    #[test]
    fn at_most_one_operation_in_flight() {
        let mut queue = OperationQueue::new();
        queue.load(plan());

        let first = queue.dispatch_next().unwrap();
        assert_eq!(queue.in_flight(), Some(first));

        // Nothing more may be dispatched until the completion callback for
        // the first operation has been observed
        assert_eq!(queue.dispatch_next(), None);
        assert_eq!(queue.len(), 2);

        assert_eq!(queue.complete_in_flight(), Some(first));
        assert!(queue.dispatch_next().is_some());
    }

    #[test]
    fn clear_discards_pending_and_in_flight() {
        let mut queue = OperationQueue::new();
        queue.load(plan());
        queue.dispatch_next().unwrap();

        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.in_flight(), None);
        assert_eq!(queue.dispatch_next(), None);
    }

    #[test]
    fn load_replaces_previous_content() {
        let mut queue = OperationQueue::new();
        queue.load(plan());
        queue.dispatch_next().unwrap();

        let replacement = vec![Operation::ReadCharacteristic(CharacteristicHandle(9))];
        queue.load(replacement.clone());
        assert_eq!(queue.in_flight(), None);
        assert_eq!(queue.dispatch_next(), Some(replacement[0]));
    }
}
