//! # Overview
//!
//! `remidi_smf` reads, represents and rewrites Standard MIDI Files, with a
//! strong focus on accepting the many real-world files that bend the
//! format. It also reads the DMX MUS music format used by classic id
//! Software games, translating it into the same in-memory model.
//!
//! Parsing a `.mid` file:
//!
//! ```
//! let bytes = [
//!     0x4D, 0x54, 0x68, 0x64, 0x00, 0x00, 0x00, 0x06, // MThd
//!     0x00, 0x00, 0x00, 0x01, 0x01, 0xE0,
//!     0x4D, 0x54, 0x72, 0x6B, 0x00, 0x00, 0x00, 0x04, // MTrk
//!     0x00, 0xFF, 0x2F, 0x00,
//! ];
//! let smf = remidi_smf::Smf::parse(&bytes).unwrap();
//!
//! for (i, track) in smf.tracks.iter().enumerate() {
//!     println!("track {} has {} events", i, track.events.len());
//! }
//! ```
//!
//! # Tolerant parsing
//!
//! The parser attempts to plow through non-standard and even obviously
//! corrupted files: junk before the header, untrustworthy declared track lengths, missing
//! tracks, truncated tracks, split or unterminated sysex dumps, repeated or
//! unterminated end-of-track events and out-of-range delta times are all
//! recovered from, keeping as much of the file as possible. Only damage
//! with no sensible reading left, such as a missing header, is reported as
//! an error.
//!
//! Events keep their raw wire bytes rather than being decoded into a
//! message tree; what was read is exactly what is rewritten.
//!
//! # Writing
//!
//! [`Smf::to_vec`], [`Smf::write_std`] and [`Smf::save`] serialize a model
//! back to bytes, compressing channel messages with running status and
//! normalizing tolerated aliases.
//!
//! # About features
//!
//! - `parallel` (enabled by default)
//!
//!   Use multiple threads when encoding large files. Disabling this
//!   feature removes the dependency on `rayon`. Parsing is always
//!   single-threaded: running status legitimately crosses track
//!   boundaries, so track parses cannot be reordered.

mod prelude {
    pub(crate) use crate::error::{record_io, ErrorKind, Recorded, Result, ResultExt};
    pub use core::fmt;
    pub use std::{fs::File, io, path::Path};
}

#[macro_use]
mod error;

mod event;
mod mus;
mod primitive;
mod smf;

pub use crate::{
    error::{last_error, Error, ErrorKind, ErrorSite, FileError, LastError, Result, Status},
    event::{message_size, Event, EventKind},
    mus::read_mus,
    smf::{parse, Format, Header, Smf, Timing, Track},
};

use crate::error::StdResult;
use std::path::Path;

/// The largest input the SMF reader accepts.
pub const SMF_SIZE_LIMIT: usize = 64 * 1024 * 1024;

/// The largest input the MUS reader accepts.
pub const MUS_SIZE_LIMIT: usize = 64 * 1024;

/// The file formats recognized by [`auto_read`].
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum FileFormat {
    Smf,
    Mus,
}

/// Identify the format of a raw buffer: MUS by magic, otherwise SMF.
///
/// SMF needs no magic check of its own; the parser scans for the `MThd`
/// header, which also covers RMID containers and files with leading junk.
pub fn identify(raw: &[u8]) -> FileFormat {
    if raw.len() >= 4 && &raw[..4] == b"MUS\x1a" {
        FileFormat::Mus
    } else {
        FileFormat::Smf
    }
}

/// Read a raw buffer in whatever recognized format it is in.
pub fn auto_read(raw: &[u8]) -> Result<Smf> {
    match identify(raw) {
        FileFormat::Mus => read_mus(raw),
        FileFormat::Smf => parse(raw),
    }
}

/// Load and parse the file at `path`, auto-detecting its format.
///
/// ```no_run
/// let smf = remidi_smf::read_file("song.mid").unwrap();
/// println!("{} tracks", smf.track_count());
/// ```
pub fn read_file<P: AsRef<Path>>(path: P) -> StdResult<Smf, FileError> {
    fn read_impl(path: &Path) -> StdResult<Smf, FileError> {
        let raw = std::fs::read(path)?;
        Ok(auto_read(&raw)?)
    }
    read_impl(path.as_ref())
}
