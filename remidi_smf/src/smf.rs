//! The SMF model, the tolerant parser and the writer.

use crate::{
    event::{message_size, Event, EventKind},
    prelude::*,
    primitive::Reader,
    SMF_SIZE_LIMIT,
};

/// How many events per byte to estimate when allocating memory for events
/// while parsing.
///
/// Real-world tests show a little above 3 bytes/event with running status
/// enabled (DeltaTime [+ Status] + Key + Velocity for note events, which
/// make up the bulk of most files). Memory is cheap, so err on the side of
/// overallocating rather than paying for a mid-parse reallocation.
const BYTES_TO_EVENTS: f32 = 1.0 / 3.0;

/// How many bytes per event to estimate when allocating memory for writing.
///
/// The writer uses running status, so a value a bit over 3 covers almost
/// everything except text-heavy info tracks, which are small enough that
/// reallocating does not matter.
const EVENTS_TO_BYTES: f32 = 3.4;

/// How many estimated body bytes a file must have before multithreaded
/// encoding is worth the fan-out overhead.
#[cfg(feature = "parallel")]
const PARALLEL_ENABLE_THRESHOLD: usize = 3 * 1024;

/// A single track: a list of events, deltas relative to the previous event
/// on the same track.
///
/// A well-formed track ends with exactly one end-of-track meta.
#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct Track {
    pub events: Vec<Event>,
}
impl Track {
    #[inline]
    pub fn new(events: Vec<Event>) -> Track {
        Track { events }
    }

    #[inline]
    pub fn iter(&self) -> core::slice::Iter<Event> {
        self.events.iter()
    }
}
impl IntoIterator for Track {
    type IntoIter = std::vec::IntoIter<Event>;
    type Item = Event;
    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.events.into_iter()
    }
}
impl<'a> IntoIterator for &'a Track {
    type IntoIter = core::slice::Iter<'a, Event>;
    type Item = &'a Event;
    #[inline]
    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

/// A parsed Standard MIDI File, immutable after parsing.
///
/// Owns every track and every payload byte; iterators and sequencers
/// borrow from it.
#[derive(Clone, PartialEq, Eq, Debug, Hash)]
pub struct Smf {
    /// The file header: track layout and delta-time division.
    pub header: Header,
    /// The tracks, in file order. May be fewer than the header announced
    /// if the file was truncated.
    pub tracks: Vec<Track>,
}
impl Smf {
    /// Create a new empty `Smf` with zero tracks, using the given header.
    #[inline]
    pub fn new(header: Header) -> Smf {
        Smf {
            header,
            tracks: vec![],
        }
    }

    /// Parse a `.mid` Standard MIDI File from its raw bytes.
    #[inline]
    pub fn parse(raw: &[u8]) -> Result<Smf> {
        parse(raw)
    }

    #[inline]
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Encode the file into a byte vector.
    pub fn to_vec(&self) -> Vec<u8> {
        let event_count: usize = self.tracks.iter().map(|track| track.events.len()).sum();
        let mut out = Vec::with_capacity(14 + (event_count as f32 * EVENTS_TO_BYTES) as usize);

        debug_assert!(self.tracks.len() <= u16::MAX as usize);
        out.extend_from_slice(b"MThd");
        out.extend_from_slice(&6u32.to_be_bytes());
        out.extend_from_slice(&self.header.encode(self.tracks.len() as u16));

        #[cfg(feature = "parallel")]
        {
            if (event_count as f32 * EVENTS_TO_BYTES) > PARALLEL_ENABLE_THRESHOLD as f32 {
                use rayon::prelude::*;

                let chunks: Vec<Vec<u8>> = self
                    .tracks
                    .par_iter()
                    .map(|track| {
                        let mut chunk = Vec::new();
                        encode_track(track, &mut chunk);
                        chunk
                    })
                    .collect();
                for chunk in chunks {
                    out.extend_from_slice(&chunk);
                }
                return out;
            }
        }

        let mut chunk = Vec::new();
        for track in &self.tracks {
            encode_track(track, &mut chunk);
            out.extend_from_slice(&chunk);
        }
        out
    }

    /// Encode and write the file to a `std::io::Write` writer.
    ///
    /// A short write is mirrored into the thread-local registry as
    /// `Status::InputIo`.
    pub fn write_std<W: io::Write>(&self, mut out: W) -> io::Result<()> {
        out.write_all(&self.to_vec()).map_err(|err| {
            record_io();
            err
        })
    }

    /// Encode and write the file to the given path.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        /// A non-generic, non-inline function, compiled and monomorphized
        /// once and reused for every call to `save`.
        fn save_impl(smf: &Smf, path: &Path) -> io::Result<()> {
            let file = File::create(path).map_err(|err| {
                record_io();
                err
            })?;
            smf.write_std(file)
        }
        save_impl(self, path.as_ref())
    }
}

/// A MIDI file header: track layout plus delta-time division.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub struct Header {
    pub format: Format,
    pub timing: Timing,
}
impl Header {
    #[inline]
    pub fn new(format: Format, timing: Timing) -> Header {
        Header { format, timing }
    }

    #[inline]
    fn encode(&self, track_count: u16) -> [u8; 6] {
        let mut bytes = [0; 6];
        bytes[0..2].copy_from_slice(&self.format.as_bits().to_be_bytes()[..]);
        bytes[2..4].copy_from_slice(&track_count.to_be_bytes()[..]);
        bytes[4..6].copy_from_slice(&self.timing.as_bits().to_be_bytes()[..]);
        bytes
    }
}

/// How the tracks of a file relate to each other.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
#[repr(u8)]
pub enum Format {
    /// The file should have a single track.
    SingleTrack,
    /// Several tracks, played simultaneously. Usually the first track
    /// carries tempo and other song metadata.
    Parallel,
    /// Several tracks, each an independent song.
    Sequential,
}
impl Format {
    pub fn from_bits(bits: u16) -> Result<Format> {
        Ok(match bits {
            0 => Format::SingleTrack,
            1 => Format::Parallel,
            2 => Format::Sequential,
            _ => bail!(err_format!("invalid smf format")),
        })
    }

    #[inline]
    pub fn as_bits(&self) -> u16 {
        *self as u8 as u16
    }
}

/// The delta-time division of a file: tempo-based ticks per quarter note,
/// or SMPTE frame-based ticks per second.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum Timing {
    /// Ticks per quarter note, as a 15-bit integer. The wall-clock length
    /// of a tick additionally depends on the current tempo meta.
    Metrical(u16),
    /// Ticks per frame at a fixed frame rate. Tempo metas do not apply.
    Timecode { fps: u8, ticks_per_frame: u8 },
}
impl Timing {
    /// Decode the 16-bit division field: high bit set selects SMPTE, with
    /// the negated frame rate in the high byte.
    pub fn from_bits(bits: u16) -> Timing {
        if bits & 0x8000 != 0 {
            Timing::Timecode {
                fps: (((bits >> 8) as u8 as i8) as i16).wrapping_neg() as u8,
                ticks_per_frame: (bits & 0xFF) as u8,
            }
        } else {
            Timing::Metrical(bits)
        }
    }

    pub fn as_bits(&self) -> u16 {
        match *self {
            Timing::Metrical(ticks_per_beat) => ticks_per_beat,
            Timing::Timecode {
                fps,
                ticks_per_frame,
            } => (((fps as i16).wrapping_neg() as u16 & 0xFF) << 8) | ticks_per_frame as u16,
        }
    }
}

/// Parse a Standard MIDI File from its raw bytes.
///
/// Junk before the `MThd` header (including RMID containers) is skipped by
/// scanning. Inputs larger than [`SMF_SIZE_LIMIT`](crate::SMF_SIZE_LIMIT)
/// are rejected with `TooLarge`.
pub fn parse(raw: &[u8]) -> Result<Smf> {
    parse_inner(raw).recorded()
}

fn parse_inner(raw: &[u8]) -> Result<Smf> {
    ensure!(
        raw.len() <= SMF_SIZE_LIMIT,
        err_too_large!("input exceeds the smf size cap")
    );

    let mut r = Reader::new(raw);
    loop {
        match r.peek(4) {
            Some(magic) if magic == b"MThd" => break,
            Some(_) => r.skip(1)?,
            None => bail!(err_format!("no midi header found")),
        }
    }
    r.skip(4)?;

    let header_len = r.read_u32_be()? as usize;
    let format = r.read_u16_be()?;
    let track_count = r.read_u16_be()?;
    let division = r.read_u16_be()?;
    ensure!(
        track_count >= 1 && header_len >= 6,
        err_format!("malformed midi header")
    );
    r.skip(header_len - 6)?;

    let header = Header::new(Format::from_bits(format)?, Timing::from_bits(division));
    let mut smf = Smf {
        header,
        tracks: Vec::with_capacity(track_count as usize),
    };

    // Status runs from track to track; plenty of real files depend on it.
    let mut running_status: u8 = 0;

    for _ in 0..track_count {
        let track_offset = r.pos();

        let magic = match r.read(4) {
            Ok(magic) => magic,
            // The file has fewer tracks than promised, repair.
            Err(_) => break,
        };
        if magic != b"MTrk" {
            if r.at_end() {
                // Some kind of final junk header, ignore.
                break;
            }
            bail!(err_format!("expected a track chunk"));
        }
        let track_len = r.read_u32_be()? as usize;

        // The declared length is broken in many files. Probe it: it is
        // reliable only if skipping it lands exactly at the end of input or
        // on the next track's magic.
        let track_len_good = {
            let reliable = r.skip(track_len).is_ok()
                && (r.at_end() || r.peek(4).map(|magic| magic == b"MTrk").unwrap_or(false));
            r.set_pos(track_offset + 8)?;
            reliable
        };

        let region_end = track_offset + 8 + track_len;
        let estimate = if track_len_good {
            (track_len as f32 * BYTES_TO_EVENTS) as usize
        } else {
            0
        };
        let mut events: Vec<Event> = Vec::with_capacity(estimate);
        let mut end_of_track = false;
        let mut truncated = false;
        let mut event_offset = r.pos();

        while !end_of_track {
            match read_event(&mut r, &mut events, &mut running_status) {
                Ok(()) => {
                    end_of_track = events.last().map(Event::is_end_of_track).unwrap_or(false);
                    event_offset = r.pos();
                    if track_len_good && r.pos() > region_end {
                        bail!(err_format!("track events overlap the next track"));
                    }
                }
                Err(err) => match err.kind() {
                    ErrorKind::Eof(_) => {
                        // Truncated track: keep what was read and stop.
                        truncated = true;
                        break;
                    }
                    ErrorKind::Format(_) => {
                        // An event with an absurdly high delta time? Ignore
                        // the rest of the track, and if the declared length
                        // can be trusted, proceed to the next one.
                        r.set_pos(event_offset)?;
                        let delta_out_of_range = matches!(
                            r.peek_vlq(),
                            Err(vlq_err) if matches!(vlq_err.kind(), ErrorKind::Format(_))
                        );
                        if delta_out_of_range {
                            // With a trustworthy declared length the cursor
                            // can jump to the next track below; otherwise
                            // stop reading further tracks.
                            if !track_len_good {
                                truncated = true;
                            }
                            break;
                        }
                        return Err(err);
                    }
                    _ => return Err(err),
                },
            }
        }

        if end_of_track {
            // Permit zero-delta meta events coming after end of track.
            loop {
                match r.peek(2) {
                    Some(head) if head[0] == 0x00 && head[1] == 0xFF => {}
                    _ => break,
                }
                match read_event(&mut r, &mut events, &mut running_status) {
                    Ok(()) => {
                        if track_len_good && r.pos() > region_end {
                            bail!(err_format!("track events overlap the next track"));
                        }
                    }
                    Err(err) => match err.kind() {
                        ErrorKind::Eof(_) => {
                            truncated = true;
                            break;
                        }
                        _ => return Err(err),
                    },
                }
            }
        }

        smf.tracks.push(Track::new(events));
        if truncated {
            break;
        }
        if track_len_good {
            r.set_pos(region_end)?;
        }
    }

    Ok(smf)
}

/// Read one event record: a VLQ delta, a status byte, and a body by case.
///
/// Pushes at least one event on success; a sysex with several concatenated
/// messages under one length yields one event per message.
fn read_event(r: &mut Reader, events: &mut Vec<Event>, running_status: &mut u8) -> Result<()> {
    let delta = r.read_vlq()?;
    let mut id = r.read_u8()?;
    match id {
        0xFF => read_meta_event(r, events, delta),
        0xF7 => read_escape_event(r, events, delta),
        0xF0 => read_sysex_event(r, events, delta),
        _ => {
            if id & 0x80 != 0 {
                *running_status = id;
            } else {
                // A data byte in status position: replay the running status
                // and re-read this byte as the first data byte.
                id = *running_status;
                r.set_pos(r.pos() - 1)?;
            }
            read_message_event(r, events, id, delta)
        }
    }
}

fn read_meta_event(r: &mut Reader, events: &mut Vec<Event>, delta: u32) -> Result<()> {
    let tag = r.read_u8()?;
    if tag == 0x2F || tag == 0x3F {
        // Some files use 3F instead of 2F for end of track.
        if r.skip_byte(0x00).is_err() {
            // Omitted final null byte in some broken files.
        } else {
            // Absorb runs of duplicated end-of-track events.
            loop {
                let offset = r.pos();
                let again = r.read_vlq().is_ok()
                    && r.skip_byte(0xFF).is_ok()
                    && (r.skip_byte(0x2F).is_ok() || r.skip_byte(0x3F).is_ok());
                if !again {
                    r.set_pos(offset)?;
                    break;
                }
                if r.skip_byte(0x00).is_err() {
                    break;
                }
            }
        }
        events.push(Event::meta(delta, tag, &[]));
    } else {
        let len = r.read_vlq()?;
        let payload = r.read(len as usize)?;
        events.push(Event::meta(delta, tag, payload));
    }
    Ok(())
}

fn read_escape_event(r: &mut Reader, events: &mut Vec<Event>, delta: u32) -> Result<()> {
    let len = r.read_vlq()?;
    let data = r.read(len as usize)?;
    events.push(Event::new(EventKind::Escape, delta, data));
    Ok(())
}

fn read_sysex_event(r: &mut Reader, events: &mut Vec<Event>, delta: u32) -> Result<()> {
    let mut sysex: Vec<u8> = Vec::with_capacity(256);
    sysex.push(0xF0);

    let len = r.read_vlq()?;
    let mut part = r.read(len as usize)?;

    // Handle files having multiple concatenated sysex messages in one
    // event.
    while let Some(end) = part.iter().position(|&byte| byte == 0xF7) {
        sysex.extend_from_slice(&part[..=end]);
        events.push(Event::new(EventKind::Message, delta, &sysex));

        part = &part[end + 1..];
        if part.is_empty() {
            return Ok(());
        }
        if part[0] != 0xF0 {
            // Trailing garbage, ignore.
            return Ok(());
        }
        part = &part[1..];
        sysex.clear();
        sysex.push(0xF0);
    }

    // Handle the rest in multiple parts (Casio style).
    let mut end: Option<usize> = None;
    let mut terminated = false;
    while !terminated {
        terminated = end.is_some();
        if let Some(end) = end {
            // The terminator must close the part exactly.
            ensure!(
                end + 1 == part.len(),
                err_format!("excess bytes after sysex terminator")
            );
        }
        sysex.extend_from_slice(part);

        if !terminated {
            let offset = r.pos();
            let have_continuation = r.read_vlq().is_ok()
                && r.read_u8().map(|byte| byte == 0xF7).unwrap_or(false);
            if have_continuation {
                let len = r.read_vlq()?;
                part = r.read(len as usize)?;
                end = part.iter().position(|&byte| byte == 0xF7);
            } else {
                // No next part? Assume an unfinished message and repair.
                r.set_pos(offset)?;
                sysex.push(0xF7);
                terminated = true;
            }
        }
    }

    events.push(Event::new(EventKind::Message, delta, &sysex));
    Ok(())
}

fn read_message_event(
    r: &mut Reader,
    events: &mut Vec<Event>,
    id: u8,
    delta: u32,
) -> Result<()> {
    let size = message_size(id);
    ensure!(size > 0, err_format!("unknown message status"));
    let tail = r.read(size - 1)?;

    let mut bytes = [0u8; 3];
    bytes[0] = id;
    bytes[1..size].copy_from_slice(tail);
    events.push(Event::new(EventKind::Message, delta, &bytes[..size]));
    Ok(())
}

fn write_vlq(out: &mut Vec<u8>, value: u32) {
    let mut shift = 28;
    while shift > 0 && (value >> shift) & 0x7F == 0 {
        shift -= 7;
    }
    while shift > 0 {
        out.push((((value >> shift) & 0x7F) as u8) | 0x80);
        shift -= 7;
    }
    out.push((value & 0x7F) as u8);
}

/// Encode one track chunk into `out`, backpatching the chunk length.
fn encode_track(track: &Track, out: &mut Vec<u8>) {
    out.clear();
    out.reserve(8 + (track.events.len() as f32 * EVENTS_TO_BYTES) as usize);
    out.extend_from_slice(b"MTrk\0\0\0\0");
    let mut running_status = None;
    for event in &track.events {
        encode_event(event, &mut running_status, out);
    }
    let len = (out.len() - 8) as u32;
    out[4..8].copy_from_slice(&len.to_be_bytes());
}

fn encode_event(event: &Event, running_status: &mut Option<u8>, out: &mut Vec<u8>) {
    match event.kind {
        EventKind::Meta => {
            let (&tag, payload) = match event.data().split_first() {
                Some(parts) => parts,
                None => return,
            };
            write_vlq(out, event.delta);
            out.push(0xFF);
            // The 3F end-of-track alias is tolerated on read but always
            // normalized on write.
            out.push(if tag == 0x3F { 0x2F } else { tag });
            write_vlq(out, payload.len() as u32);
            out.extend_from_slice(payload);
            *running_status = None;
        }
        EventKind::Message => {
            let data = event.data();
            let status = match data.first() {
                Some(&status) => status,
                None => return,
            };
            write_vlq(out, event.delta);
            if status == 0xF0 {
                out.push(0xF0);
                write_vlq(out, (data.len() - 1) as u32);
                out.extend_from_slice(&data[1..]);
                *running_status = None;
            } else if status < 0xF0 {
                // Channel messages alter and use running status.
                if *running_status == Some(status) {
                    out.extend_from_slice(&data[1..]);
                } else {
                    out.extend_from_slice(data);
                    *running_status = Some(status);
                }
            } else {
                // System common/realtime: verbatim, cancels running status.
                out.extend_from_slice(data);
                *running_status = None;
            }
        }
        EventKind::Escape => {
            write_vlq(out, event.delta);
            out.push(0xF7);
            write_vlq(out, event.data().len() as u32);
            out.extend_from_slice(event.data());
            *running_status = None;
        }
        EventKind::XmiTimbre | EventKind::XmiBranchPoint => {}
    }
}
