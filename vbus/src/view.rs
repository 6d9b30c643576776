//! Observer-side mirror of a remote machine.

use std::collections::BTreeMap;

use vbus_proto::{BusState, RunState, Snapshot, Update};

use crate::config::TerminalConfig;
use crate::terminal::Terminal;

/// What an observer knows about a machine it tracks: the last snapshot with
/// every update applied since.
///
/// The terminal mirror is display-only, so a preview never feeds input back.
#[derive(Debug)]
pub struct RemoteView {
    run_state: RunState,
    bus_state: BusState,
    boot_error: Option<String>,
    terminal: Terminal,
    media: BTreeMap<u64, bool>,
}

impl RemoteView {
    /// Creates a view of a machine about which nothing is known yet.
    pub fn new(config: TerminalConfig) -> Self {
        Self {
            run_state: RunState::default(),
            bus_state: BusState::default(),
            boot_error: None,
            terminal: Terminal::display_only(config),
            media: BTreeMap::new(),
        }
    }

    /// Creates a view initialized from a snapshot.
    pub fn from_snapshot(snapshot: &Snapshot, config: TerminalConfig) -> Self {
        let view = Self {
            run_state: snapshot.run_state,
            bus_state: snapshot.bus_state,
            boot_error: snapshot.boot_error.clone(),
            ..Self::new(config)
        };
        view.terminal.restore_history(&snapshot.terminal);
        view
    }

    /// Applies one update.
    pub fn apply(&mut self, update: &Update) {
        match update {
            Update::BusState(state) => self.bus_state = *state,
            Update::RunState(state) => self.run_state = *state,
            Update::BootError(error) => self.boot_error.clone_from(error),
            Update::TerminalOutput(chunk) => self.terminal.apply_output(chunk),
            Update::TerminalReset => self.terminal.reset(),
            Update::MediaChanged { device, present } => {
                self.media.insert(*device, *present);
            }
            _ => {}
        }
    }

    /// Last known run state.
    pub const fn run_state(&self) -> RunState {
        self.run_state
    }

    /// Last known bus state.
    pub const fn bus_state(&self) -> BusState {
        self.bus_state
    }

    /// Last known boot error.
    pub fn boot_error(&self) -> Option<&str> {
        self.boot_error.as_deref()
    }

    /// Mirrored terminal.
    pub const fn terminal(&self) -> &Terminal {
        &self.terminal
    }

    /// Whether media was last reported present in `device`.
    pub fn media_present(&self, device: u64) -> Option<bool> {
        self.media.get(&device).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn updates_follow_snapshot() {
        let snapshot = Snapshot {
            run_state: RunState::Running,
            bus_state: BusState::Ready,
            boot_error: None,
            terminal: b"boot\n".to_vec(),
        };
        let mut view = RemoteView::from_snapshot(&snapshot, TerminalConfig::default());
        view.apply(&Update::TerminalOutput(b"$ ".to_vec()));
        assert_eq!(view.terminal().history(), b"boot\n$ ");
        assert_eq!(view.terminal().send_input(b"ls"), 0);

        view.apply(&Update::RunState(RunState::Error));
        view.apply(&Update::BootError(Some("halted".into())));
        view.apply(&Update::MediaChanged { device: 4, present: false });
        view.apply(&Update::TerminalReset);
        assert_eq!(view.run_state(), RunState::Error);
        assert_eq!(view.boot_error(), Some("halted"));
        assert_eq!(view.media_present(4), Some(false));
        assert!(view.terminal().history().is_empty());
    }
}
