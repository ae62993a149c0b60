//! Ordered batches of committable messages.

use crate::message::{CommittableMessage, MessageOffset};

/// An ordered group of messages emitted by the batching stage.
///
/// Aggregates handles from one or more partitions in arrival order.
/// Committing the batch commits every member; each member's own
/// memoization and suppression flags still apply.
pub struct MessageBatch<T> {
    messages: Vec<CommittableMessage<T>>,
}

impl<T> MessageBatch<T> {
    pub(crate) fn new(messages: Vec<CommittableMessage<T>>) -> Self {
        Self { messages }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn messages(&self) -> &[CommittableMessage<T>] {
        &self.messages
    }

    pub fn messages_mut(&mut self) -> &mut [CommittableMessage<T>] {
        &mut self.messages
    }

    pub fn iter(&self) -> std::slice::Iter<'_, CommittableMessage<T>> {
        self.messages.iter()
    }

    pub fn into_messages(self) -> Vec<CommittableMessage<T>> {
        self.messages
    }
}

impl<T> IntoIterator for MessageBatch<T> {
    type Item = CommittableMessage<T>;
    type IntoIter = std::vec::IntoIter<CommittableMessage<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.into_iter()
    }
}

impl<'a, T> IntoIterator for &'a MessageBatch<T> {
    type Item = &'a CommittableMessage<T>;
    type IntoIter = std::slice::Iter<'a, CommittableMessage<T>>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}

impl<T> MessageOffset for MessageBatch<T> {
    fn commit(&mut self, force: bool) -> bool {
        let mut all_committed = true;
        for message in &mut self.messages {
            all_committed &= message.commit(force);
        }
        all_committed
    }

    fn suppress_commit(&mut self) {
        for message in &mut self.messages {
            message.suppress_commit();
        }
    }
}
