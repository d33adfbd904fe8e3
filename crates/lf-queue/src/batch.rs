//! Batches handed from a queue to one consumer invocation.

use lf_common::Message;

/// Per-element processing state. Transitions only leave `Pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementState {
    Pending,
    Discard,
    Committed,
}

#[derive(Debug)]
pub struct BatchElement {
    pub message: Message,
    state: ElementState,
}

impl BatchElement {
    pub fn state(&self) -> ElementState {
        self.state
    }

    pub fn is_pending(&self) -> bool {
        self.state == ElementState::Pending
    }
}

/// An ordered group of messages owned by the worker that dequeued it.
#[derive(Debug, Default)]
pub struct Batch {
    elements: Vec<BatchElement>,
}

impl Batch {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            elements: messages
                .into_iter()
                .map(|message| BatchElement { message, state: ElementState::Pending })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn elements(&self) -> &[BatchElement] {
        &self.elements
    }

    pub fn message(&self, index: usize) -> &Message {
        &self.elements[index].message
    }

    pub fn message_mut(&mut self, index: usize) -> &mut Message {
        &mut self.elements[index].message
    }

    pub fn state(&self, index: usize) -> ElementState {
        self.elements[index].state
    }

    /// Returns false if the element already reached a terminal state.
    pub fn mark_discard(&mut self, index: usize) -> bool {
        self.transition(index, ElementState::Discard)
    }

    /// Returns false if the element already reached a terminal state.
    pub fn mark_committed(&mut self, index: usize) -> bool {
        self.transition(index, ElementState::Committed)
    }

    fn transition(&mut self, index: usize, to: ElementState) -> bool {
        let element = &mut self.elements[index];
        if element.state != ElementState::Pending {
            return false;
        }
        element.state = to;
        true
    }

    /// Commits every element that is still pending.
    pub fn commit_pending(&mut self) -> usize {
        let mut committed = 0;
        for element in self.elements.iter_mut().filter(|e| e.is_pending()) {
            element.state = ElementState::Committed;
            committed += 1;
        }
        committed
    }

    pub fn count(&self, state: ElementState) -> usize {
        self.elements.iter().filter(|e| e.state == state).count()
    }

    /// Removes and returns the still-pending messages, in order.
    pub fn take_pending(&mut self) -> Vec<Message> {
        let (pending, done): (Vec<_>, Vec<_>) = std::mem::take(&mut self.elements)
            .into_iter()
            .partition(|e| e.is_pending());
        self.elements = done;
        pending.into_iter().map(|e| e.message).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch_of(n: usize) -> Batch {
        Batch::new((0..n).map(|i| Message::new(format!("msg-{}", i))).collect())
    }

    #[test]
    fn test_states_are_monotonic() {
        let mut batch = batch_of(2);
        assert!(batch.mark_discard(0));
        assert!(!batch.mark_committed(0));
        assert_eq!(batch.state(0), ElementState::Discard);

        assert!(batch.mark_committed(1));
        assert!(!batch.mark_discard(1));
        assert_eq!(batch.state(1), ElementState::Committed);
    }

    #[test]
    fn test_commit_pending_skips_discarded() {
        let mut batch = batch_of(4);
        batch.mark_discard(2);
        assert_eq!(batch.commit_pending(), 3);
        assert_eq!(batch.count(ElementState::Committed), 3);
        assert_eq!(batch.count(ElementState::Discard), 1);
        assert_eq!(batch.count(ElementState::Pending), 0);
    }

    #[test]
    fn test_take_pending_preserves_order() {
        let mut batch = batch_of(5);
        batch.mark_committed(0);
        batch.mark_discard(2);
        let pending = batch.take_pending();
        let payloads: Vec<_> = pending.iter().map(|m| m.payload().into_owned()).collect();
        assert_eq!(payloads, vec!["msg-1", "msg-3", "msg-4"]);
        assert_eq!(batch.len(), 2);
    }
}
