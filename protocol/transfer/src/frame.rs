//! Length-prefixed framing: `le64 body_length` then `body_length` bytes.

use bytes::{BufMut, BytesMut};

/// Frame header: one little-endian `i64` body length.
pub const HEADER_LEN: usize = 8;

/// Hard cap on a single body. Anything larger (or non-positive) is treated
/// as a hostile header and the connection is force-closed.
pub const MAX_BODY_LEN: i64 = 50 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("illegal frame header: body length {0}")]
    BadLength(i64),
}

/// Try to split one frame off the front of `data`.
///
/// Returns `Ok(None)` while the frame is still incomplete, and otherwise
/// the body slice plus the total bytes consumed (header included).
pub fn split_frame(data: &[u8]) -> Result<Option<(&[u8], usize)>, FrameError> {
    if data.len() < HEADER_LEN {
        return Ok(None);
    }
    let mut raw = [0u8; HEADER_LEN];
    raw.copy_from_slice(&data[..HEADER_LEN]);
    let body_len = i64::from_le_bytes(raw);
    if body_len <= 0 || body_len > MAX_BODY_LEN {
        return Err(FrameError::BadLength(body_len));
    }
    let body_len = body_len as usize;
    if data.len() < HEADER_LEN + body_len {
        return Ok(None);
    }
    Ok(Some((&data[HEADER_LEN..HEADER_LEN + body_len], HEADER_LEN + body_len)))
}

/// Write `body` as one frame.
pub fn write_frame(body: &[u8], out: &mut BytesMut) {
    out.reserve(HEADER_LEN + body.len());
    out.put_i64_le(body.len() as i64);
    out.put_slice(body);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_header_is_incomplete() {
        assert_eq!(split_frame(&[]).unwrap(), None);
        assert_eq!(split_frame(&[1, 0, 0]).unwrap(), None);
    }

    #[test]
    fn short_body_is_incomplete() {
        let mut wire = BytesMut::new();
        write_frame(b"abcdef", &mut wire);
        assert_eq!(split_frame(&wire[..wire.len() - 1]).unwrap(), None);
    }

    #[test]
    fn whole_frame_round_trips() {
        let mut wire = BytesMut::new();
        write_frame(b"abcdef", &mut wire);
        let (body, consumed) = split_frame(&wire).unwrap().unwrap();
        assert_eq!(body, b"abcdef");
        assert_eq!(consumed, wire.len());
    }

    #[test]
    fn back_to_back_frames_split_in_order() {
        let mut wire = BytesMut::new();
        write_frame(b"first", &mut wire);
        write_frame(b"second", &mut wire);

        let (body, consumed) = split_frame(&wire).unwrap().unwrap();
        assert_eq!(body, b"first");
        let (body, rest) = split_frame(&wire[consumed..]).unwrap().unwrap();
        assert_eq!(body, b"second");
        assert_eq!(consumed + rest, wire.len());
    }

    #[test]
    fn zero_length_body_is_rejected() {
        let wire = 0i64.to_le_bytes();
        assert_eq!(split_frame(&wire), Err(FrameError::BadLength(0)));
    }

    #[test]
    fn negative_length_is_rejected() {
        let wire = (-1i64).to_le_bytes();
        assert_eq!(split_frame(&wire), Err(FrameError::BadLength(-1)));
    }

    #[test]
    fn oversize_length_is_rejected() {
        let wire = (MAX_BODY_LEN + 1).to_le_bytes();
        assert_eq!(
            split_frame(&wire),
            Err(FrameError::BadLength(MAX_BODY_LEN + 1))
        );
    }

    #[test]
    fn max_size_header_is_accepted_as_incomplete() {
        let wire = MAX_BODY_LEN.to_le_bytes();
        assert_eq!(split_frame(&wire).unwrap(), None);
    }
}
