//! The merging sequencer: one time-ordered event stream out of many
//! tracks.

use remidi_smf::{Event, EventKind, Smf, Timing};

/// Microseconds per quarter note before any tempo event (120 BPM).
const DEFAULT_TEMPO: u32 = 500_000;

/// A merged event: its absolute time in seconds, the track it came from,
/// and the event itself.
#[derive(Copy, Clone, Debug)]
pub struct SeqEvent<'a> {
    pub time: f64,
    pub track: usize,
    pub event: &'a Event,
}

#[derive(Clone, Debug)]
struct TrackCursor {
    /// Index of the next unconsumed event.
    index: usize,
    /// Absolute tick at which that event fires.
    next_tick: u64,
    /// Set once the end-of-track meta has been reached.
    ended: bool,
}

/// Merges the tracks of a borrowed [`Smf`] into a single monotonically
/// timestamped event sequence.
///
/// Events are pulled lazily with [`next_event`](Sequencer::next_event);
/// ties between tracks break deterministically toward the lowest track
/// index. Tempo metas update the conversion *after* their own delta has
/// been converted, and are ignored under SMPTE timing.
#[derive(Clone, Debug)]
pub struct Sequencer<'a> {
    smf: &'a Smf,
    cursors: Vec<TrackCursor>,
    /// Current tempo in microseconds per quarter note.
    tempo: u32,
    /// Ticks accumulated on the merged timeline.
    tick: u64,
    /// Seconds accumulated on the merged timeline.
    time: f64,
    /// Velocity of the most recent note-on passed through, per channel and
    /// note. Used to synthesize note-offs when seeking.
    note_vel: Box<[[u8; 128]; 16]>,
}

impl<'a> Sequencer<'a> {
    pub fn new(smf: &'a Smf) -> Sequencer<'a> {
        let mut seq = Sequencer {
            smf,
            cursors: Vec::new(),
            tempo: DEFAULT_TEMPO,
            tick: 0,
            time: 0.0,
            note_vel: Box::new([[0; 128]; 16]),
        };
        seq.rewind();
        seq
    }

    #[inline]
    pub fn smf(&self) -> &'a Smf {
        self.smf
    }

    /// Seconds accumulated up to the most recently consumed event.
    #[inline]
    pub fn time(&self) -> f64 {
        self.time
    }

    #[inline]
    pub fn is_finished(&self) -> bool {
        self.cursors.iter().all(|cursor| cursor.ended)
    }

    /// Reset every track to its beginning and the tempo to the default.
    pub fn rewind(&mut self) {
        self.tempo = DEFAULT_TEMPO;
        self.tick = 0;
        self.time = 0.0;
        *self.note_vel = [[0; 128]; 16];
        self.cursors.clear();
        for track in &self.smf.tracks {
            let mut cursor = TrackCursor {
                index: 0,
                next_tick: 0,
                ended: false,
            };
            match track.events.first() {
                Some(event) if !event.is_end_of_track() => {
                    cursor.next_tick = event.delta as u64;
                }
                _ => cursor.ended = true,
            }
            self.cursors.push(cursor);
        }
    }

    /// The next event in merged order, without consuming it.
    pub fn peek(&self) -> Option<SeqEvent<'a>> {
        let mut best: Option<(u64, usize)> = None;
        for (track, cursor) in self.cursors.iter().enumerate() {
            if cursor.ended {
                continue;
            }
            match best {
                Some((tick, _)) if cursor.next_tick >= tick => {}
                _ => best = Some((cursor.next_tick, track)),
            }
        }
        let (tick, track) = best?;
        let event = &self.smf.tracks[track].events[self.cursors[track].index];
        Some(SeqEvent {
            time: self.time + self.delta_seconds(tick - self.tick),
            track,
            event,
        })
    }

    /// Consume and return the next event in merged order.
    pub fn next_event(&mut self) -> Option<SeqEvent<'a>> {
        self.step(true)
    }

    fn step(&mut self, update_notes: bool) -> Option<SeqEvent<'a>> {
        let ev = self.peek()?;

        // Commit the timeline before the event can change the tempo: a
        // tempo meta's own delta is converted at the previous tempo.
        self.tick = self.cursors[ev.track].next_tick;
        self.time = ev.time;
        if let Some(tempo) = ev.event.tempo() {
            if matches!(self.smf.header.timing, Timing::Metrical(_)) {
                self.tempo = tempo;
            }
        }
        if update_notes {
            self.track_notes(ev.event);
        }

        let events = &self.smf.tracks[ev.track].events;
        let cursor = &mut self.cursors[ev.track];
        cursor.index += 1;
        match events.get(cursor.index) {
            // End of track stops the cursor even when it carries a delta.
            Some(event) if !event.is_end_of_track() => {
                cursor.next_tick += event.delta as u64;
            }
            _ => cursor.ended = true,
        }

        Some(ev)
    }

    /// Fast-forward (or rewind-and-fast-forward) to `target` seconds with
    /// side effects suppressed.
    ///
    /// Events that configure the receiving engine (tempo and
    /// time-signature metas, program changes, control changes, pitch
    /// bends, channel aftertouch) are passed to `sink`; notes,
    /// polyphonic aftertouch and sysex are suppressed. Afterwards a
    /// synthetic all-notes-off (`Bx 7B 00`) is emitted for every channel
    /// that still held a note from normal playback.
    pub fn seek<F: FnMut(&Event)>(&mut self, target: f64, mut sink: F) {
        if target < self.time {
            let held = *self.note_vel;
            self.rewind();
            *self.note_vel = held;
        }
        while let Some(ev) = self.peek() {
            if ev.time >= target {
                break;
            }
            if seek_passes(ev.event) {
                sink(ev.event);
            }
            self.step(false);
        }
        for channel in 0..16u8 {
            if self.note_vel[channel as usize].iter().any(|&vel| vel != 0) {
                sink(&Event::new(
                    EventKind::Message,
                    0,
                    &[0xB0 | channel, 0x7B, 0x00],
                ));
            }
        }
        *self.note_vel = [[0; 128]; 16];
    }

    fn track_notes(&mut self, event: &Event) {
        let data = event.data();
        if event.kind != EventKind::Message || data.len() < 3 {
            return;
        }
        let channel = (data[0] & 0xF) as usize;
        let note = (data[1] & 127) as usize;
        match data[0] >> 4 {
            0x9 if data[2] & 127 != 0 => self.note_vel[channel][note] = data[2] & 127,
            0x8 | 0x9 => self.note_vel[channel][note] = 0,
            _ => {}
        }
    }

    #[inline]
    fn delta_seconds(&self, delta: u64) -> f64 {
        delta_time(delta as f64, self.smf.header.timing, self.tempo)
    }
}

/// Which events a seek passes through to reach the right engine state.
fn seek_passes(event: &Event) -> bool {
    match event.kind {
        EventKind::Meta => matches!(event.meta_tag(), Some(0x51) | Some(0x58)),
        EventKind::Message => matches!(
            event.status().map(|status| status >> 4),
            Some(0xB) | Some(0xC) | Some(0xD) | Some(0xE)
        ),
        _ => false,
    }
}

/// Convert a tick delta to seconds under the given division and tempo.
///
/// Tempo applies to PPQN divisions only; SMPTE divisions have a fixed tick
/// length of `1 / (fps * ticks_per_frame)` seconds. Zero division bytes in
/// malformed headers are clamped to 1 to keep the conversion finite.
pub fn delta_time(delta: f64, timing: Timing, tempo: u32) -> f64 {
    match timing {
        Timing::Metrical(ppqn) => delta * (1e-6 * tempo as f64) / ppqn.max(1) as f64,
        Timing::Timecode {
            fps,
            ticks_per_frame,
        } => delta / (fps.max(1) as f64 * ticks_per_frame.max(1) as f64),
    }
}

/// Total duration in seconds of a file's merged event stream.
pub fn duration(smf: &Smf) -> f64 {
    let mut seq = Sequencer::new(smf);
    let mut duration = 0.0;
    while let Some(ev) = seq.next_event() {
        duration = ev.time;
    }
    duration
}
