//! Read, sequence and play back Standard MIDI Files and DMX MUS music.
//!
//! The file layer lives in [`remidi_smf`] and is re-exported here as
//! [`smf`]. On top of it this crate adds:
//!
//! - [`Sequencer`]: merges the per-track event streams of a parsed file
//!   into one monotonically timestamped sequence, tracking tempo changes
//!   and supporting side-effect-free seeking.
//! - [`Player`]: emits the merged sequence in wall-clock time through an
//!   event-loop abstraction, with rewind, seek, pause and speed change.
//! - A `midir` output bridge, behind the `midir-io` feature.
//!
//! ```no_run
//! use remidi::{Player, TimerLoop};
//!
//! let smf = remidi::smf::read_file("song.mid").unwrap();
//! let mut player = Player::new(&smf, TimerLoop::new());
//! player.on_event(|ev| println!("{:?}", ev));
//! player.start();
//! player.run();
//! ```

mod prelude {
    pub use std::time::{Duration, Instant};
}

pub use remidi_smf as smf;

pub use remidi_smf::{
    auto_read, parse, read_file, read_mus, Event, EventKind, Format, Header, Smf, Timing, Track,
};

pub mod player;
pub mod seq;

#[cfg(feature = "midir-io")]
pub mod midir;

pub use crate::{
    player::{EventLoop, LoopBreaker, Player, TimerLoop},
    seq::{duration, SeqEvent, Sequencer},
};

#[cfg(test)]
mod test;
