//! Ogg packet extraction
//!
//! Opus encoders pack many 20 ms packets into one Ogg page, so pages cannot
//! be sent as frames. The page's segment (lacing) table gives the packet
//! boundaries: a packet ends at the first segment shorter than 255 bytes, and
//! a page whose last segment is 255 bytes long continues that packet on the
//! next page.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::io::{self, Read};
use tracing::debug;

const CAPTURE_PATTERN: &[u8; 4] = b"OggS";
const HEADER_LEN: usize = 27;
const CRC_OFFSET: usize = 22;

/// Header type flag: first packet continues from the previous page
const FLAG_CONTINUED: u8 = 0x01;

const CRC_TABLE: [u32; 256] = crc_table();

const fn crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut r = (i as u32) << 24;
        let mut bit = 0;
        while bit < 8 {
            r = if r & 0x8000_0000 != 0 {
                (r << 1) ^ 0x04c1_1db7
            } else {
                r << 1
            };
            bit += 1;
        }
        table[i] = r;
        i += 1;
    }
    table
}

/// Ogg page checksum (CRC-32, polynomial 0x04c11db7, no reflection)
pub fn crc32(data: &[u8]) -> u32 {
    data.iter().fold(0u32, |crc, &b| {
        (crc << 8) ^ CRC_TABLE[(((crc >> 24) as u8) ^ b) as usize]
    })
}

/// One parsed Ogg page
#[derive(Debug)]
pub struct OggPage {
    pub header_type: u8,
    pub granule_position: u64,
    pub serial: u32,
    pub sequence: u32,
    /// Lacing values, one per segment
    pub segments: Vec<u8>,
    pub body: Bytes,
    /// Stored checksum matched the page contents
    pub crc_ok: bool,
}

impl OggPage {
    pub fn is_continued(&self) -> bool {
        self.header_type & FLAG_CONTINUED != 0
    }
}

/// Read the next page; `None` at end of stream
///
/// A page cut short by the end of the stream is dropped.
pub fn read_page<R: Read>(reader: &mut R) -> io::Result<Option<OggPage>> {
    let mut header = [0u8; HEADER_LEN];
    if !read_full(reader, &mut header)? {
        return Ok(None);
    }
    if &header[..4] != CAPTURE_PATTERN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "missing Ogg capture pattern",
        ));
    }

    let segment_count = header[26] as usize;
    let mut segments = vec![0u8; segment_count];
    if !read_full(reader, &mut segments)? {
        return Ok(None);
    }
    let body_len: usize = segments.iter().map(|&s| s as usize).sum();
    let mut body = vec![0u8; body_len];
    if !read_full(reader, &mut body)? {
        return Ok(None);
    }

    let stored = u32::from_le_bytes([
        header[CRC_OFFSET],
        header[CRC_OFFSET + 1],
        header[CRC_OFFSET + 2],
        header[CRC_OFFSET + 3],
    ]);
    header[CRC_OFFSET..CRC_OFFSET + 4].fill(0);
    let mut page_bytes = Vec::with_capacity(HEADER_LEN + segment_count + body_len);
    page_bytes.extend_from_slice(&header);
    page_bytes.extend_from_slice(&segments);
    page_bytes.extend_from_slice(&body);

    Ok(Some(OggPage {
        header_type: header[5],
        granule_position: u64::from_le_bytes([
            header[6], header[7], header[8], header[9], header[10], header[11], header[12],
            header[13],
        ]),
        serial: u32::from_le_bytes([header[14], header[15], header[16], header[17]]),
        sequence: u32::from_le_bytes([header[18], header[19], header[20], header[21]]),
        segments,
        body: Bytes::from(body),
        crc_ok: crc32(&page_bytes) == stored,
    }))
}

/// Fill `buf`; `false` if the stream ended first
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// Reassembles packets from a stream of Ogg pages
pub struct OggPacketReader<R> {
    reader: R,
    partial: BytesMut,
    ready: VecDeque<Bytes>,
}

impl<R: Read> OggPacketReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            partial: BytesMut::new(),
            ready: VecDeque::new(),
        }
    }

    /// Next complete packet; `None` at end of stream
    pub fn next_packet(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            if let Some(packet) = self.ready.pop_front() {
                return Ok(Some(packet));
            }
            match read_page(&mut self.reader)? {
                Some(page) => self.push_page(page),
                None => return Ok(None),
            }
        }
    }

    fn push_page(&mut self, page: OggPage) {
        if !page.crc_ok {
            debug!("Ogg page {} failed its checksum, skipped", page.sequence);
            self.partial.clear();
            return;
        }

        // A continuation with nothing to continue (stream joined mid-packet,
        // or the previous page was lost) is discarded up to its first
        // packet boundary. An unexpected fresh page drops the stale partial.
        let mut discard = page.is_continued() && self.partial.is_empty();
        if !page.is_continued() {
            self.partial.clear();
        }

        let mut offset = 0;
        for &lace in &page.segments {
            let end = offset + lace as usize;
            if !discard {
                self.partial.extend_from_slice(&page.body[offset..end]);
            }
            offset = end;

            if lace < 255 {
                if discard {
                    discard = false;
                } else {
                    self.ready.push_back(self.partial.split().freeze());
                }
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{packets_page, page};
    use super::*;
    use std::io::Cursor;

    fn collect(stream: Vec<u8>) -> Vec<Bytes> {
        let mut reader = OggPacketReader::new(Cursor::new(stream));
        let mut packets = Vec::new();
        while let Some(packet) = reader.next_packet().unwrap() {
            packets.push(packet);
        }
        packets
    }

    #[test]
    fn test_page_with_several_packets() {
        let packets = collect(packets_page(0, &[&b"PKT-A"[..], &b"PKT-B"[..], &b"PKT-C"[..]]));
        assert_eq!(packets, vec![&b"PKT-A"[..], &b"PKT-B"[..], &b"PKT-C"[..]]);
    }

    #[test]
    fn test_packet_spanning_pages() {
        let long = vec![7u8; 300];
        let mut stream = page(0, 0, &[255], &long[..255]);
        stream.extend(page(FLAG_CONTINUED, 1, &[45, 3], &[&long[255..], &b"end"[..]].concat()));

        let packets = collect(stream);
        assert_eq!(packets.len(), 2);
        assert_eq!(&packets[0][..], &long[..]);
        assert_eq!(&packets[1][..], b"end");
    }

    #[test]
    fn test_orphan_continuation_is_discarded() {
        let stream = page(FLAG_CONTINUED, 4, &[5, 4], b"tail-next");
        assert_eq!(collect(stream), vec![&b"next"[..]]);
    }

    #[test]
    fn test_corrupt_page_is_skipped() {
        let mut bad = packets_page(0, &[&b"lost"[..]]);
        let last = bad.len() - 1;
        bad[last] ^= 0xff;
        bad.extend(packets_page(1, &[&b"kept"[..]]));
        assert_eq!(collect(bad), vec![&b"kept"[..]]);
    }

    #[test]
    fn test_truncated_stream_ends_cleanly() {
        let mut stream = packets_page(0, &[&b"whole"[..]]);
        let next = packets_page(1, &[&b"cut"[..]]);
        stream.extend_from_slice(&next[..next.len() - 2]);
        assert_eq!(collect(stream), vec![&b"whole"[..]]);
    }

    #[test]
    fn test_missing_capture_pattern_is_an_error() {
        let mut reader = OggPacketReader::new(Cursor::new(vec![0u8; 40]));
        assert!(reader.next_packet().is_err());
    }
}
