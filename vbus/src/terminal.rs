//! Byte-stream terminal between the emulation and its observers.
//!
//! The emulation worker appends output with [`Terminal::write`] and reads
//! keystrokes with [`Terminal::read_input`]. The host thread flushes output
//! once per tick with [`Terminal::take_output`] and forwards observer input
//! with [`Terminal::send_input`]. Content is opaque: escape sequences and
//! screen layout are the observer's concern.
//!
//! ```text
//!  observer ──send_input──▶ staged ──deliver_input (tick)──▶ input ──▶ worker
//!  worker ──write──▶ pending ──take_output (tick)──▶ Update::TerminalOutput
//!                 └─▶ history (visible window, snapshots, persistence)
//! ```

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::config::TerminalConfig;

#[derive(Debug, Default)]
struct Buffers {
    pending: Vec<u8>,
    history: VecDeque<u8>,
    staged: VecDeque<u8>,
    input: VecDeque<u8>,
}

/// Bounded terminal buffers shared by the host thread and the worker.
#[derive(Debug)]
pub struct Terminal {
    config: TerminalConfig,
    display_only: AtomicBool,
    buffers: Mutex<Buffers>,
}

impl Terminal {
    /// Creates an empty terminal.
    pub fn new(config: TerminalConfig) -> Self {
        Self {
            config,
            display_only: AtomicBool::new(false),
            buffers: Mutex::new(Buffers::default()),
        }
    }

    /// Creates an empty terminal that ignores input, for passive viewers.
    pub fn display_only(config: TerminalConfig) -> Self {
        let terminal = Self::new(config);
        terminal.set_display_only(true);
        terminal
    }

    /// Enables or disables display-only mode.
    pub fn set_display_only(&self, value: bool) {
        self.display_only.store(value, Ordering::Relaxed);
    }

    /// Whether input is being dropped.
    pub fn is_display_only(&self) -> bool {
        self.display_only.load(Ordering::Relaxed)
    }

    /// Appends emulation output. Returns how many bytes were accepted; the
    /// rest must be retried after the next flush.
    pub fn write(&self, data: &[u8]) -> usize {
        let mut b = self.buffers();
        let room = self.config.output_capacity.saturating_sub(b.pending.len());
        let accepted = &data[..data.len().min(room)];
        b.pending.extend_from_slice(accepted);
        push_history(&mut b.history, accepted, self.config.history_capacity);
        accepted.len()
    }

    /// Pops the next delivered input byte.
    pub fn read_input(&self) -> Option<u8> {
        self.buffers().input.pop_front()
    }

    /// Queues observer input for delivery on the next tick. Returns how many
    /// bytes were accepted; display-only terminals accept none.
    pub fn send_input(&self, data: &[u8]) -> usize {
        if self.is_display_only() {
            return 0;
        }
        let mut b = self.buffers();
        let queued = b.staged.len() + b.input.len();
        let room = self.config.input_capacity.saturating_sub(queued);
        let accepted = &data[..data.len().min(room)];
        b.staged.extend(accepted);
        accepted.len()
    }

    /// Makes staged input visible to the emulation, preserving order.
    pub(crate) fn deliver_input(&self) {
        let mut b = self.buffers();
        let staged = std::mem::take(&mut b.staged);
        b.input.extend(staged);
    }

    /// Extracts everything written since the previous flush.
    pub fn take_output(&self) -> Option<Vec<u8>> {
        let mut b = self.buffers();
        if b.pending.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut b.pending))
        }
    }

    /// Mirrors a chunk received from a remote machine into the visible
    /// window.
    pub fn apply_output(&self, chunk: &[u8]) {
        let mut b = self.buffers();
        push_history(&mut b.history, chunk, self.config.history_capacity);
    }

    /// Returns the visible window.
    pub fn history(&self) -> Vec<u8> {
        self.buffers().history.iter().copied().collect()
    }

    /// Replaces the visible window, keeping the most recent bytes.
    pub fn restore_history(&self, data: &[u8]) {
        let mut b = self.buffers();
        b.history.clear();
        push_history(&mut b.history, data, self.config.history_capacity);
    }

    /// Clears every buffer.
    pub fn reset(&self) {
        *self.buffers() = Buffers::default();
    }

    fn buffers(&self) -> MutexGuard<'_, Buffers> {
        self.buffers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn push_history(history: &mut VecDeque<u8>, data: &[u8], capacity: usize) {
    let keep = &data[data.len().saturating_sub(capacity)..];
    let overflow = (history.len() + keep.len()).saturating_sub(capacity);
    history.drain(..overflow.min(history.len()));
    history.extend(keep);
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn small() -> TerminalConfig {
        TerminalConfig {
            history_capacity: 8,
            output_capacity: 5,
            input_capacity: 4,
        }
    }

    #[test]
    fn chunks_reconstruct_stream() {
        let term = Terminal::new(small());
        let stream: Vec<u8> = (0u8..23).collect();
        let mut received = Vec::new();

        let mut rest = &stream[..];
        while !rest.is_empty() {
            let n = term.write(rest);
            rest = &rest[n..];
            if let Some(chunk) = term.take_output() {
                received.extend(chunk);
            }
        }
        received.extend(term.take_output().unwrap_or_default());
        assert_eq!(received, stream);
    }

    #[test]
    fn output_backpressure() {
        let term = Terminal::new(small());
        assert_eq!(term.write(b"abcdefg"), 5);
        assert_eq!(term.write(b"x"), 0);
        assert_eq!(term.take_output().unwrap(), b"abcde");
        assert!(term.take_output().is_none());
        assert_eq!(term.write(b"fg"), 2);
    }

    #[test]
    fn input_waits_for_delivery() {
        let term = Terminal::new(small());
        assert_eq!(term.send_input(b"ls\n"), 3);
        assert_eq!(term.read_input(), None);
        term.deliver_input();
        assert_eq!(term.send_input(b"abc"), 1);
        assert_eq!(term.read_input(), Some(b'l'));
        assert_eq!(term.read_input(), Some(b's'));
        assert_eq!(term.read_input(), Some(b'\n'));
        assert_eq!(term.read_input(), None);
        term.deliver_input();
        assert_eq!(term.read_input(), Some(b'a'));
    }

    #[test]
    fn display_only_drops_input() {
        let term = Terminal::display_only(small());
        assert_eq!(term.send_input(b"rm -rf"), 0);
        term.deliver_input();
        assert_eq!(term.read_input(), None);
    }

    #[test]
    fn history_keeps_latest_window() {
        let term = Terminal::new(small());
        term.write(b"abcde");
        term.take_output();
        term.write(b"fghij");
        assert_eq!(term.history(), b"cdefghij");
        term.restore_history(b"0123456789");
        assert_eq!(term.history(), b"23456789");
    }

    #[test]
    fn reset_clears_everything() {
        let term = Terminal::new(small());
        term.write(b"abc");
        term.send_input(b"x");
        term.reset();
        assert!(term.take_output().is_none());
        assert!(term.history().is_empty());
        term.deliver_input();
        assert_eq!(term.read_input(), None);
    }
}
