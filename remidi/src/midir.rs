//! Bridge parsed events into a `midir` output connection.

use midir::{MidiOutputConnection, SendError};
use remidi_smf::{Event, EventKind};

pub use midir::*;

pub trait MidiOutBridge {
    /// Send the raw wire bytes of an event. File-only events (metas, XMI
    /// records) are skipped.
    fn send_event(&mut self, event: &Event) -> Result<(), SendError>;
}

impl MidiOutBridge for MidiOutputConnection {
    fn send_event(&mut self, event: &Event) -> Result<(), SendError> {
        match event.kind {
            EventKind::Message | EventKind::Escape => {
                let bytes = event.data();
                if !bytes.is_empty() {
                    self.send(bytes)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }
}
