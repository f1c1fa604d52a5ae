//! H.264 Annex-B helpers
//!
//! The encoder writes a continuous Annex-B byte stream. WebRTC samples are
//! whole access units, so the stream is cut at access unit boundaries
//! (ITU-T H.264 7.4.1.2.3): an AUD, SPS, PPS or SEI following a slice, or a
//! slice whose `first_mb_in_slice` is zero.

use bytes::{Buf, Bytes, BytesMut};

const NAL_SLICE: u8 = 1;
const NAL_IDR: u8 = 5;
const NAL_SEI: u8 = 6;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;
const NAL_AUD: u8 = 9;
const NAL_FILLER: u8 = 12;

/// Find the next start code at or after `from`
///
/// Returns `(position, length)` where length is 3 or 4.
pub fn find_start_code(data: &[u8], from: usize) -> Option<(usize, usize)> {
    let mut i = from;
    while i + 3 <= data.len() {
        if data[i] == 0 && data[i + 1] == 0 && data[i + 2] == 1 {
            if i > from && data[i - 1] == 0 {
                return Some((i - 1, 4));
            }
            return Some((i, 3));
        }
        i += 1;
    }
    None
}

/// NAL unit type of a NAL header byte
#[inline]
pub fn nal_type(header: u8) -> u8 {
    header & 0x1F
}

/// Check if Annex-B data contains an IDR slice
pub fn is_keyframe(data: &[u8]) -> bool {
    let mut i = 0;
    while let Some((pos, len)) = find_start_code(data, i) {
        let nal_start = pos + len;
        match data.get(nal_start) {
            Some(&header) if nal_type(header) == NAL_IDR => return true,
            Some(_) => i = nal_start,
            None => break,
        }
    }
    false
}

/// Splits an Annex-B byte stream into access units
///
/// Feed arbitrary chunks with [`push`](Self::push); complete access units are
/// returned as soon as the first NAL of the following unit is seen. AUD and
/// filler NAL units are used as boundaries but not forwarded.
#[derive(Default)]
pub struct AccessUnitSplitter {
    /// Unparsed input, starts at a start code once synchronized
    buf: BytesMut,
    /// Access unit being assembled
    unit: BytesMut,
    unit_has_slice: bool,
    /// Boundary check already done for the NAL at the front of `buf`
    front_checked: bool,
}

impl AccessUnitSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append stream bytes; returns the access units completed by them
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buf.extend_from_slice(data);
        let mut units = Vec::new();

        loop {
            let Some((pos, sc_len)) = find_start_code(&self.buf, 0) else {
                // No start code yet; keep a possible partial one
                let keep = self.buf.len().min(3);
                let drop = self.buf.len() - keep;
                self.buf.advance(drop);
                break;
            };
            if pos > 0 {
                // Garbage before the first start code
                self.buf.advance(pos);
                self.front_checked = false;
                continue;
            }
            if self.buf.len() < sc_len + 2 {
                break;
            }

            if !self.front_checked {
                let header = self.buf[sc_len];
                let next = self.buf[sc_len + 1];
                if self.starts_new_unit(header, next) {
                    if let Some(unit) = self.take_unit() {
                        units.push(unit);
                    }
                }
                self.front_checked = true;
            }

            let Some((next_pos, _)) = find_start_code(&self.buf, sc_len + 1) else {
                break;
            };
            let nal = self.buf.split_to(next_pos);
            self.append_nal(&nal, sc_len);
            self.front_checked = false;
        }

        units
    }

    /// Flush at end of stream
    ///
    /// Returns the pending access unit, preceded by the previous one when the
    /// last NAL turns out to start a new unit.
    pub fn flush(&mut self) -> Vec<Bytes> {
        let mut units = Vec::new();
        if let Some((0, sc_len)) = find_start_code(&self.buf, 0) {
            if self.buf.len() > sc_len {
                let nal = self.buf.split();
                if !self.front_checked {
                    let next = nal.get(sc_len + 1).copied().unwrap_or(0);
                    if self.starts_new_unit(nal[sc_len], next) {
                        units.extend(self.take_unit());
                    }
                }
                self.append_nal(&nal, sc_len);
            }
        }
        self.buf.clear();
        self.front_checked = false;
        units.extend(self.take_unit());
        units
    }

    fn starts_new_unit(&self, header: u8, next: u8) -> bool {
        if !self.unit_has_slice {
            return false;
        }
        match nal_type(header) {
            NAL_AUD | NAL_SPS | NAL_PPS | NAL_SEI => true,
            // first_mb_in_slice is ue(v); a leading 1 bit encodes zero
            NAL_SLICE | NAL_IDR => next & 0x80 != 0,
            _ => false,
        }
    }

    fn append_nal(&mut self, nal: &[u8], sc_len: usize) {
        let Some(&header) = nal.get(sc_len) else {
            return;
        };
        match nal_type(header) {
            NAL_AUD | NAL_FILLER => {}
            t => {
                self.unit.extend_from_slice(nal);
                if t == NAL_SLICE || t == NAL_IDR {
                    self.unit_has_slice = true;
                }
            }
        }
    }

    fn take_unit(&mut self) -> Option<Bytes> {
        self.unit_has_slice = false;
        if self.unit.is_empty() {
            None
        } else {
            Some(self.unit.split().freeze())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const AUD: &[u8] = &[0, 0, 0, 1, 0x09, 0xF0];
    const SPS: &[u8] = &[0, 0, 0, 1, 0x67, 0x42, 0x00, 0x1f];
    const PPS: &[u8] = &[0, 0, 0, 1, 0x68, 0xce, 0x38, 0x80];
    const IDR: &[u8] = &[0, 0, 0, 1, 0x65, 0x88, 0x84, 0x21];
    const P1: &[u8] = &[0, 0, 1, 0x41, 0x9a, 0x02, 0x03];
    const P2: &[u8] = &[0, 0, 1, 0x41, 0x9b, 0x04, 0x05];
    // Second slice of the same picture: first_mb_in_slice != 0
    const P2_SLICE2: &[u8] = &[0, 0, 1, 0x41, 0x40, 0x06, 0x07];

    fn concat(parts: &[&[u8]]) -> Vec<u8> {
        parts.iter().flat_map(|p| p.iter().copied()).collect()
    }

    #[test]
    fn test_find_start_code() {
        assert_eq!(find_start_code(&[0, 0, 0, 1, 0x65], 0), Some((0, 4)));
        assert_eq!(find_start_code(&[0, 0, 1, 0x65], 0), Some((0, 3)));
        assert_eq!(find_start_code(&[0x65, 0xAA, 0, 0, 1, 0x41], 1), Some((2, 3)));
        assert_eq!(find_start_code(&[0x65, 0, 0, 0, 1, 0x41], 1), Some((1, 4)));
        assert_eq!(find_start_code(&[0x65, 0, 0], 0), None);
    }

    #[test]
    fn test_is_keyframe() {
        assert!(is_keyframe(&concat(&[SPS, PPS, IDR])));
        assert!(!is_keyframe(P1));
        assert!(!is_keyframe(SPS));
    }

    #[test]
    fn test_split_without_aud() {
        let stream = concat(&[SPS, PPS, IDR, P1, P2, P2_SLICE2]);
        let mut splitter = AccessUnitSplitter::new();

        let units = splitter.push(&stream);
        assert_eq!(units.len(), 2);
        assert_eq!(&units[0][..], &concat(&[SPS, PPS, IDR])[..]);
        assert_eq!(&units[1][..], P1);

        let last = splitter.flush();
        assert_eq!(last.len(), 1);
        assert_eq!(&last[0][..], &concat(&[P2, P2_SLICE2])[..]);
        assert!(splitter.flush().is_empty());
    }

    #[test]
    fn test_split_on_aud_and_strip_it() {
        let stream = concat(&[AUD, SPS, PPS, IDR, AUD, P1, AUD, P2]);
        let mut splitter = AccessUnitSplitter::new();

        let units = splitter.push(&stream);
        assert_eq!(units.len(), 2);
        assert_eq!(&units[0][..], &concat(&[SPS, PPS, IDR])[..]);
        assert_eq!(&units[1][..], P1);
        assert_eq!(&splitter.flush()[0][..], P2);
    }

    #[test]
    fn test_byte_by_byte_feed_matches_bulk() {
        let stream = concat(&[SPS, PPS, IDR, P1, P2]);
        let mut splitter = AccessUnitSplitter::new();

        let mut units = Vec::new();
        for b in &stream {
            units.extend(splitter.push(std::slice::from_ref(b)));
        }
        units.extend(splitter.flush());

        assert_eq!(units.len(), 3);
        assert_eq!(&units[0][..], &concat(&[SPS, PPS, IDR])[..]);
        assert_eq!(&units[1][..], P1);
        assert_eq!(&units[2][..], P2);
    }

    #[test]
    fn test_leading_garbage_is_dropped() {
        let stream = concat(&[&[0xAB, 0xCD, 0xEF], IDR, P1]);
        let mut splitter = AccessUnitSplitter::new();

        let units = splitter.push(&stream);
        assert_eq!(units.len(), 1);
        assert_eq!(&units[0][..], IDR);
    }
}
