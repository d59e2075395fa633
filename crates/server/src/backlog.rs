//! Bounded replay history of recent events for one session.

use std::collections::VecDeque;

use vibecheck_protocol::Event;

pub const BACKLOG_CAPACITY: usize = 50;

/// Ring buffer of `(sequence, event)` pairs, oldest first.
#[derive(Debug)]
pub struct Backlog {
    entries: VecDeque<(u64, Event)>,
    capacity: usize,
}

impl Default for Backlog {
    fn default() -> Self {
        Self::with_capacity(BACKLOG_CAPACITY)
    }
}

impl Backlog {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn push(&mut self, seq: u64, event: Event) {
        if self.capacity == 0 {
            return;
        }
        while self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back((seq, event));
    }

    /// The most recent `limit` events (all when `None`), oldest first.
    pub fn events(&self, limit: Option<usize>) -> Vec<Event> {
        let skip = match limit {
            Some(limit) => self.entries.len().saturating_sub(limit),
            None => 0,
        };
        self.entries
            .iter()
            .skip(skip)
            .map(|(_, event)| event.clone())
            .collect()
    }

    /// Retained events with a sequence number up to and including `seq`.
    pub fn events_through(&self, seq: u64) -> Vec<Event> {
        self.entries
            .iter()
            .take_while(|(s, _)| *s <= seq)
            .map(|(_, event)| event.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vibecheck_protocol::EventKind;

    fn content(event: &Event) -> &str {
        match &event.kind {
            EventKind::Assistant { content } => content,
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn keeps_only_the_most_recent_fifty() {
        let mut backlog = Backlog::default();
        for i in 0..60 {
            backlog.push(i, Event::assistant(format!("message-{i}")));
        }
        let events = backlog.events(None);
        assert_eq!(events.len(), 50);
        assert_eq!(content(&events[0]), "message-10");
        assert_eq!(content(&events[49]), "message-59");
    }

    #[test]
    fn limit_returns_the_tail() {
        let mut backlog = Backlog::default();
        for i in 0..5 {
            backlog.push(i, Event::assistant(format!("message-{i}")));
        }
        let events = backlog.events(Some(2));
        assert_eq!(events.len(), 2);
        assert_eq!(content(&events[0]), "message-3");
        assert_eq!(content(&events[1]), "message-4");
        assert_eq!(backlog.events(Some(100)).len(), 5);
    }

    #[test]
    fn events_through_stops_at_sequence() {
        let mut backlog = Backlog::default();
        for i in 1..=4 {
            backlog.push(i, Event::assistant(format!("message-{i}")));
        }
        let events = backlog.events_through(2);
        assert_eq!(events.len(), 2);
        assert_eq!(content(&events[1]), "message-2");
        assert!(backlog.events_through(0).is_empty());
    }
}
