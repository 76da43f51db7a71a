//! Cheap plausibility check for downloaded segments.
//!
//! A segment is accepted when its head looks like an MPEG-TS packet stream
//! (0x47 sync bytes on 188-byte boundaries) or like the start of an ISO-BMFF
//! (fMP4) box tree. Empty bodies and HTML error pages served with HTTP 200
//! both fail this check and get retried like any transient fetch failure.

/// MPEG-TS packet size in bytes.
pub const TS_PACKET_LEN: usize = 188;

/// MPEG-TS sync byte.
const TS_SYNC_BYTE: u8 = 0x47;

/// fMP4 box types an HLS media segment can plausibly start with. `styp` is
/// the usual opener for CMAF media segments.
const FMP4_BOX_TYPES: [&[u8; 4]; 4] = [b"ftyp", b"styp", b"moof", b"mdat"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentFormat {
    MpegTs,
    Fmp4,
}

/// Detect the container of a downloaded segment, or `None` when the bytes
/// cannot be a media segment.
pub fn detect_media_segment(data: &[u8]) -> Option<SegmentFormat> {
    if looks_like_mpeg_ts(data) {
        return Some(SegmentFormat::MpegTs);
    }
    if looks_like_fmp4(data) {
        return Some(SegmentFormat::Fmp4);
    }
    None
}

pub fn is_valid_media_segment(data: &[u8]) -> bool {
    detect_media_segment(data).is_some()
}

fn looks_like_mpeg_ts(data: &[u8]) -> bool {
    if data.len() < TS_PACKET_LEN {
        return false;
    }
    // Check the sync byte on the first three packet boundaries that fall
    // inside the buffer. One aligned 0x47 can be a coincidence; three cannot.
    (0..3)
        .map(|i| i * TS_PACKET_LEN)
        .filter(|offset| *offset < data.len())
        .all(|offset| data[offset] == TS_SYNC_BYTE)
}

fn looks_like_fmp4(data: &[u8]) -> bool {
    if data.len() < 8 {
        return false;
    }
    let size = u32::from_be_bytes([data[0], data[1], data[2], data[3]]);
    // size == 0 (box extends to EOF) and size == 1 (64-bit extended size) are
    // legal headers; otherwise the box must at least cover its own header.
    if size != 0 && size != 1 && size < 8 {
        return false;
    }
    let fourcc: [u8; 4] = [data[4], data[5], data[6], data[7]];
    FMP4_BOX_TYPES.iter().any(|t| **t == fourcc)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts_fixture(len: usize) -> Vec<u8> {
        let mut data = vec![0u8; len];
        for offset in (0..len).step_by(TS_PACKET_LEN) {
            data[offset] = TS_SYNC_BYTE;
        }
        data
    }

    fn fmp4_fixture(fourcc: &[u8; 4]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&24u32.to_be_bytes());
        data.extend_from_slice(fourcc);
        data.extend_from_slice(&[0u8; 16]);
        data
    }

    #[test]
    fn accepts_aligned_ts_packets() {
        assert_eq!(
            detect_media_segment(&ts_fixture(188)),
            Some(SegmentFormat::MpegTs)
        );
        assert_eq!(
            detect_media_segment(&ts_fixture(1024)),
            Some(SegmentFormat::MpegTs)
        );
    }

    #[test]
    fn rejects_misaligned_sync_bytes() {
        let mut data = ts_fixture(1024);
        data[188] = 0x00;
        assert_eq!(detect_media_segment(&data), None);
    }

    #[test]
    fn accepts_fmp4_openers() {
        for fourcc in [b"ftyp", b"styp", b"moof", b"mdat"] {
            assert_eq!(
                detect_media_segment(&fmp4_fixture(fourcc)),
                Some(SegmentFormat::Fmp4),
                "{}",
                String::from_utf8_lossy(fourcc)
            );
        }
    }

    #[test]
    fn rejects_unknown_box_types() {
        assert_eq!(detect_media_segment(&fmp4_fixture(b"free")), None);
    }

    #[test]
    fn rejects_empty_and_short_bodies() {
        assert!(!is_valid_media_segment(&[]));
        assert!(!is_valid_media_segment(&[0x47; 100]));
    }

    #[test]
    fn rejects_html_error_pages() {
        let body = b"<!DOCTYPE html><html><body>403 Forbidden</body></html>";
        assert!(!is_valid_media_segment(body));
        let padded: Vec<u8> = body
            .iter()
            .copied()
            .chain(std::iter::repeat(b' '))
            .take(400)
            .collect();
        assert!(!is_valid_media_segment(&padded));
    }
}
