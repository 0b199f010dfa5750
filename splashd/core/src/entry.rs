//! Interactive Request Queues
//!
//! Password prompts, questions and keystroke watches are owned by the queues
//! below, each together with the [`Trigger`] that completes it. Removing a
//! request from its queue is the only way it is completed or destroyed, so
//! no trigger outlives its request.
//!
//! Only the head of the [`EntryQueue`] receives typed input; its partial
//! answer lives in the queue's single buffer, which is cleared whenever the
//! head changes.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::keyboard::{character_count, last_character_len};
use crate::trigger::Trigger;

/// Payload delivered through prompt and keystroke triggers
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Answer {
    /// Typed text, or the keystroke that matched a watch
    Text(String),
    /// The user pressed Ctrl-C or Ctrl-D
    Cancelled,
}

/// Kind of interactive prompt
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EntryKind {
    /// Input is shown as bullets
    Password,
    /// Input is shown verbatim
    Question,
}

/// A queued prompt awaiting an answer
#[derive(Debug)]
pub struct EntryRequest {
    /// Password or question
    pub kind: EntryKind,
    /// Prompt shown to the user
    pub prompt: String,
    /// Pulled with the answer
    pub trigger: Trigger<Answer>,
}

/// FIFO of prompts plus the partial answer for the head prompt
#[derive(Debug, Default)]
pub struct EntryQueue {
    requests: VecDeque<EntryRequest>,
    buffer: Vec<u8>,
}

impl EntryQueue {
    /// Create an empty queue
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a prompt at the tail
    pub fn push(&mut self, kind: EntryKind, prompt: impl Into<String>, trigger: Trigger<Answer>) {
        self.requests.push_back(EntryRequest {
            kind,
            prompt: prompt.into(),
            trigger,
        });
    }

    /// Whether no prompt is pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// Number of pending prompts
    #[must_use]
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    /// The prompt currently receiving input
    #[must_use]
    pub fn head(&self) -> Option<&EntryRequest> {
        self.requests.front()
    }

    /// Raw bytes typed for the head prompt
    #[must_use]
    pub fn buffer(&self) -> &[u8] {
        &self.buffer
    }

    /// Typed text for the head prompt
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.buffer).into_owned()
    }

    /// Number of characters typed, for password bullets
    #[must_use]
    pub fn character_count(&self) -> usize {
        character_count(&self.buffer)
    }

    /// Append typed bytes; ignored when no prompt is pending
    pub fn append(&mut self, bytes: &[u8]) {
        if self.requests.is_empty() {
            return;
        }
        self.buffer.extend_from_slice(bytes);
    }

    /// Remove the last complete character from the buffer
    ///
    /// Returns `false` when no prompt is pending.
    pub fn backspace(&mut self) -> bool {
        if self.requests.is_empty() {
            return false;
        }
        let len = last_character_len(&self.buffer);
        self.buffer.truncate(self.buffer.len() - len);
        true
    }

    /// Answer the head prompt with the buffer and dequeue it
    pub fn complete_head(&mut self) -> bool {
        let answer = Answer::Text(self.text());
        self.finish_head(answer)
    }

    /// Cancel the head prompt and dequeue it
    pub fn cancel_head(&mut self) -> bool {
        self.finish_head(Answer::Cancelled)
    }

    fn finish_head(&mut self, answer: Answer) -> bool {
        let Some(request) = self.requests.pop_front() else {
            return false;
        };
        self.buffer.clear();
        trace!(kind = ?request.kind, "completing entry request");
        request.trigger.pull(Some(&answer));
        true
    }
}

// =============================================================================
// Keystroke watches
// =============================================================================

/// A client waiting for a key
#[derive(Debug)]
pub struct KeystrokeWatch {
    /// Keys of interest; `None` matches any key
    pub keys: Option<String>,
    /// Pulled with the matching input
    pub trigger: Trigger<Answer>,
}

impl KeystrokeWatch {
    fn matches(&self, input: &str) -> bool {
        self.keys.as_deref().map_or(true, |keys| keys.contains(input))
    }
}

/// FIFO of keystroke watches
#[derive(Debug, Default)]
pub struct KeystrokeWatches {
    watches: VecDeque<KeystrokeWatch>,
}

impl KeystrokeWatches {
    /// Create an empty list
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a watch at the tail
    pub fn add(&mut self, keys: Option<String>, trigger: Trigger<Answer>) {
        self.watches.push_back(KeystrokeWatch { keys, trigger });
    }

    /// Number of pending watches
    #[must_use]
    pub fn len(&self) -> usize {
        self.watches.len()
    }

    /// Whether no watch is pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.watches.is_empty()
    }

    /// Complete the first watch whose keys contain `input`
    ///
    /// The trigger receives `answer`. Returns `true` if a watch matched.
    pub fn match_input(&mut self, input: &str, answer: &Answer) -> bool {
        let Some(position) = self.watches.iter().position(|watch| watch.matches(input)) else {
            return false;
        };
        if let Some(watch) = self.watches.remove(position) {
            watch.trigger.pull(Some(answer));
        }
        true
    }

    /// Drop the first watch registered for exactly `keys`, pulling it with
    /// no payload
    pub fn ignore(&mut self, keys: Option<&str>) -> bool {
        let Some(position) = self
            .watches
            .iter()
            .position(|watch| watch.keys.as_deref() == keys)
        else {
            return false;
        };
        if let Some(watch) = self.watches.remove(position) {
            watch.trigger.pull(None);
        }
        true
    }
}
