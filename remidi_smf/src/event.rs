//! The in-memory event record and raw-message helpers.

use crate::prelude::*;

/// Payloads up to this size are stored inline in the event itself.
///
/// Channel messages are at most 3 bytes and make up the bulk of real-world
/// files, so almost no event pays for a heap allocation. Sysex dumps and
/// long text metas fall back to an owned vector.
const INLINE_CAP: usize = 14;

#[derive(Clone)]
enum Payload {
    Inline { len: u8, buf: [u8; INLINE_CAP] },
    Heap(Vec<u8>),
}
impl Payload {
    fn new(data: &[u8]) -> Payload {
        if data.len() <= INLINE_CAP {
            let mut buf = [0; INLINE_CAP];
            buf[..data.len()].copy_from_slice(data);
            Payload::Inline {
                len: data.len() as u8,
                buf,
            }
        } else {
            Payload::Heap(data.to_vec())
        }
    }

    fn from_parts(head: u8, tail: &[u8]) -> Payload {
        if 1 + tail.len() <= INLINE_CAP {
            let mut buf = [0; INLINE_CAP];
            buf[0] = head;
            buf[1..1 + tail.len()].copy_from_slice(tail);
            Payload::Inline {
                len: (1 + tail.len()) as u8,
                buf,
            }
        } else {
            let mut bytes = Vec::with_capacity(1 + tail.len());
            bytes.push(head);
            bytes.extend_from_slice(tail);
            Payload::Heap(bytes)
        }
    }

    #[inline]
    fn as_slice(&self) -> &[u8] {
        match self {
            Payload::Inline { len, buf } => &buf[..*len as usize],
            Payload::Heap(bytes) => bytes,
        }
    }
}

/// The kinds of records a track can hold.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash)]
pub enum EventKind {
    /// A file-only event: the meta tag is the first payload byte, the meta
    /// payload follows.
    Meta,
    /// A complete MIDI wire message starting with its status byte.
    /// System-exclusive messages are stored fully assembled, from the
    /// leading `F0` to the terminating `F7`.
    Message,
    /// Arbitrary bytes emitted through an `F7` escape, stored without the
    /// `F7` framing.
    Escape,
    /// An XMI timbre list entry. Not produced by the readers in this crate;
    /// carried for interchange with XMI-aware tooling.
    XmiTimbre,
    /// An XMI branch point. See [`EventKind::XmiTimbre`].
    XmiBranchPoint,
}

/// A single event in a track: a tick delta since the previous event on the
/// same track, plus the raw payload bytes laid out per [`EventKind`].
#[derive(Clone)]
pub struct Event {
    pub kind: EventKind,
    pub delta: u32,
    data: Payload,
}

impl Event {
    #[inline]
    pub fn new(kind: EventKind, delta: u32, data: &[u8]) -> Event {
        Event {
            kind,
            delta,
            data: Payload::new(data),
        }
    }

    /// Build a meta event from its tag and payload.
    #[inline]
    pub fn meta(delta: u32, tag: u8, payload: &[u8]) -> Event {
        Event {
            kind: EventKind::Meta,
            delta,
            data: Payload::from_parts(tag, payload),
        }
    }

    /// The raw payload bytes.
    #[inline]
    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    /// The meta tag, for meta events.
    #[inline]
    pub fn meta_tag(&self) -> Option<u8> {
        match self.kind {
            EventKind::Meta => self.data().first().copied(),
            _ => None,
        }
    }

    /// Whether this is an end-of-track meta. Some files use tag `3F` in
    /// place of `2F`; both are honored.
    #[inline]
    pub fn is_end_of_track(&self) -> bool {
        matches!(self.meta_tag(), Some(0x2F) | Some(0x3F))
    }

    /// The status byte, for message events.
    #[inline]
    pub fn status(&self) -> Option<u8> {
        match self.kind {
            EventKind::Message => self.data().first().copied(),
            _ => None,
        }
    }

    /// The channel of a channel-voice message.
    #[inline]
    pub fn channel(&self) -> Option<u8> {
        match self.status() {
            Some(status) if status < 0xF0 => Some(status & 0xF),
            _ => None,
        }
    }

    /// The microseconds-per-quarter-note payload of a tempo meta.
    #[inline]
    pub fn tempo(&self) -> Option<u32> {
        let data = self.data();
        if self.kind == EventKind::Meta && data.len() == 4 && data[0] == 0x51 {
            Some(u32::from_be_bytes([0, data[1], data[2], data[3]]))
        } else {
            None
        }
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Event) -> bool {
        self.kind == other.kind && self.delta == other.delta && self.data() == other.data()
    }
}
impl Eq for Event {}
impl core::hash::Hash for Event {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.kind.hash(state);
        self.delta.hash(state);
        self.data().hash(state);
    }
}
impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        struct HexBytes<'a>(&'a [u8]);
        impl fmt::Debug for HexBytes<'_> {
            fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
                for (i, byte) in self.0.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{:02x}", byte)?;
                }
                Ok(())
            }
        }
        f.debug_struct("Event")
            .field("kind", &self.kind)
            .field("delta", &self.delta)
            .field("data", &HexBytes(self.data()))
            .finish()
    }
}

/// Wire size of a complete MIDI message with the given status byte,
/// including the status itself. Zero for data bytes and for statuses whose
/// body is not fixed-size (`F0` sysex and `F7` escapes are framed
/// separately).
pub fn message_size(status: u8) -> usize {
    if status < 0x80 {
        0
    } else if status < 0xF0 {
        const SIZES: [usize; 7] = [3, 3, 3, 3, 2, 2, 3];
        SIZES[((status >> 4) & 0x7) as usize]
    } else {
        const SIZES: [usize; 16] = [0, 2, 3, 2, 1, 1, 1, 0, 1, 1, 1, 1, 1, 1, 1, 1];
        SIZES[(status & 0xF) as usize]
    }
}
