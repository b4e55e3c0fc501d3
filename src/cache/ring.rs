use std::collections::VecDeque;

use crate::model::{Message, MessageId};

/// Bounded per-channel message history, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRing {
    capacity: usize,
    messages: VecDeque<Message>,
}

impl MessageRing {
    /// Creates a ring holding at most `capacity` messages (`capacity >= 1`).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            messages: VecDeque::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|message| message.id == id)
    }

    /// Appends `message`, returning the evicted oldest message when full.
    pub(crate) fn push(&mut self, message: Message) -> Option<Message> {
        let evicted = if self.messages.len() >= self.capacity {
            self.messages.pop_front()
        } else {
            None
        };
        self.messages.push_back(message);
        evicted
    }

    pub(crate) fn remove(&mut self, id: MessageId) -> Option<Message> {
        let index = self.messages.iter().position(|message| message.id == id)?;
        self.messages.remove(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::MessageRing;
    use crate::model::{Message, MessageKind, Snowflake, User};

    fn message(id: u64) -> Message {
        Message {
            id: Snowflake::new(id),
            channel_id: Snowflake::new(1),
            author: User {
                id: Snowflake::new(2),
                username: "someone".to_string(),
                global_name: None,
                bot: false,
            },
            content: format!("message {id}"),
            timestamp: None,
            edited_timestamp: None,
            reactions: Vec::new(),
            kind: MessageKind::Private,
        }
    }

    #[test]
    fn evicts_oldest_when_full() {
        let mut ring = MessageRing::new(2);
        assert!(ring.push(message(1)).is_none());
        assert!(ring.push(message(2)).is_none());
        let evicted = ring.push(message(3)).expect("oldest evicted");
        assert_eq!(evicted.id, Snowflake::new(1));
        let ids: Vec<u64> = ring.iter().map(|m| m.id.get()).collect();
        assert_eq!(ids, vec![2, 3]);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let mut ring = MessageRing::new(0);
        ring.push(message(1));
        ring.push(message(2));
        assert_eq!(ring.capacity(), 1);
        assert_eq!(ring.len(), 1);
        assert!(ring.get(Snowflake::new(2)).is_some());
    }

    #[test]
    fn remove_by_id() {
        let mut ring = MessageRing::new(4);
        ring.push(message(1));
        ring.push(message(2));
        assert!(ring.remove(Snowflake::new(1)).is_some());
        assert!(ring.remove(Snowflake::new(1)).is_none());
        assert_eq!(ring.len(), 1);
    }
}
