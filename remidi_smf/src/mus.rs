//! The DMX MUS reader: translates a MUS score into a single-track SMF.

use crate::{
    event::{Event, EventKind},
    prelude::*,
    primitive::Reader,
    smf::{Format, Header, Smf, Timing, Track},
    MUS_SIZE_LIMIT,
};

/// MUS channels map onto MIDI channels with percussion moved from MUS
/// channel 15 to MIDI channel 9.
const MUS_TO_MIDI_CHANNEL: [u8; 16] = [0, 1, 2, 3, 4, 5, 6, 7, 8, 10, 11, 12, 13, 14, 15, 9];

/// The DMX score tick runs at 140 Hz; division 70 renders that as PPQN at
/// the default 120 BPM tempo.
const MUS_DELTA_UNIT: u16 = 70;

/// Read a DMX MUS file and translate it into an equivalent format-0 SMF.
///
/// Inputs larger than [`MUS_SIZE_LIMIT`](crate::MUS_SIZE_LIMIT) are
/// rejected with `TooLarge`.
pub fn read_mus(raw: &[u8]) -> Result<Smf> {
    read_mus_inner(raw).recorded()
}

fn read_mus_inner(raw: &[u8]) -> Result<Smf> {
    ensure!(
        raw.len() <= MUS_SIZE_LIMIT,
        err_too_large!("input exceeds the mus size cap")
    );
    ensure!(
        raw.len() >= 4 && &raw[..4] == b"MUS\x1a",
        err_format!("not a mus file")
    );

    let mut r = Reader::new(raw);
    r.skip(4)?;
    let _score_len = r.read_u16_le()?;
    let score_start = r.read_u16_le()?;
    let _primary_channels = r.read_u16_le()?;
    let _secondary_channels = r.read_u16_le()?;
    let instrument_count = r.read_u16_le()?;
    r.skip(2)?;
    for _ in 0..instrument_count {
        let _instrument = r.read_u16_le()?;
    }

    r.set_pos(score_start as usize)
        .context(err_format!("mus score offset out of range"))?;

    let mut events: Vec<Event> = Vec::with_capacity(raw.len());
    let mut delta: u32 = 0;
    // Note-on velocities are sticky per channel.
    let mut velocity = [64u8; 16];

    // Open every channel at full volume before the score starts.
    for channel in 0..16u8 {
        events.push(Event::new(EventKind::Message, 0, &[0xB0 | channel, 7, 127]));
    }

    loop {
        let desc = r.read_u8()?;
        let last = desc & 0x80 != 0;
        let kind = (desc >> 4) & 0x7;
        let channel = MUS_TO_MIDI_CHANNEL[(desc & 0xF) as usize];

        let mut midi = [0u8; 3];
        let mut midi_len = 0usize;
        let mut score_end = false;

        match kind {
            // Release note.
            0 => {
                let note = r.read_u8()?;
                midi = [0x80 | channel, note & 127, 64];
                midi_len = 3;
            }
            // Play note; an explicit velocity byte follows iff the note's
            // high bit is set.
            1 => {
                let note = r.read_u8()?;
                if note & 0x80 != 0 {
                    velocity[channel as usize] = r.read_u8()? & 127;
                }
                midi = [0x90 | channel, note & 127, velocity[channel as usize]];
                midi_len = 3;
            }
            // Pitch wheel: widen the 8-bit value into the 14-bit range.
            2 => {
                let value = r.read_u8()? as u32;
                let bend = if value < 128 {
                    value << 6
                } else {
                    8192 + (value - 128) * 8191 / 127
                };
                midi = [0xE0 | channel, (bend & 127) as u8, (bend >> 7) as u8];
                midi_len = 3;
            }
            // System event: a channel-mode controller, or dropped.
            3 => {
                let controller = match r.read_u8()? & 127 {
                    10 => 120,
                    11 => 123,
                    12 => 126,
                    13 => 127,
                    14 => 121,
                    _ => 0,
                };
                if controller != 0 {
                    midi = [0xB0 | channel, controller, 0];
                    midi_len = 3;
                }
            }
            // Change controller: sub-code 0 is a program change, the rest
            // map onto a fixed controller table, unknowns are dropped.
            4 => {
                let sub = r.read_u8()? & 127;
                let value = r.read_u8()? & 127;
                if sub == 0 {
                    midi = [0xC0 | channel, value, 0];
                    midi_len = 2;
                } else {
                    let controller = match sub {
                        1 => 0,
                        2 => 1,
                        3 => 7,
                        4 => 10,
                        5 => 11,
                        6 => 91,
                        7 => 93,
                        8 => 64,
                        9 => 67,
                        _ => 128,
                    };
                    if controller < 128 {
                        midi = [0xB0 | channel, controller, value];
                        midi_len = 3;
                    }
                }
            }
            // End of measure.
            5 => {}
            // Score end.
            6 => score_end = true,
            // Unknown purpose, one payload byte.
            _ => r.skip(1)?,
        }

        if midi_len > 0 {
            events.push(Event::new(EventKind::Message, delta, &midi[..midi_len]));
            delta = 0;
        }
        if last {
            // The trailing delta delays whatever comes next.
            delta += r.read_vlq()?;
        }
        if score_end {
            break;
        }
    }

    events.push(Event::meta(delta, 0x2F, &[]));

    Ok(Smf {
        header: Header::new(Format::SingleTrack, Timing::Metrical(MUS_DELTA_UNIT)),
        tracks: vec![Track::new(events)],
    })
}
