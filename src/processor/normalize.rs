use crate::frame::{FrameBuffer, PayloadType};

fn sanitize(value: f32) -> f32 {
    if value.is_finite() {
        value
    } else {
        0.0
    }
}

/// Elements a frame claims to carry, clamped to what its buffer holds.
pub fn element_count(frame: &FrameBuffer, element_width: usize) -> usize {
    let width = element_width.max(1);
    let claimed = frame.payload_size() as usize / width;
    claimed.min(frame.payload_capacity() / width)
}

/// Convert `src` into the canonical `f32` form in `canonical`.
///
/// `canonical` is reused when it already has the right element count and
/// replaced otherwise. Header fields are carried over with the payload
/// retagged as `F32`. Returns `false`, leaving `canonical` untouched, when the
/// payload type has no element width.
pub fn normalize_into(src: &FrameBuffer, canonical: &mut FrameBuffer) -> bool {
    let payload_type = src.payload_type();
    let Some(width) = payload_type.element_width() else {
        return false;
    };

    let count = element_count(src, width);
    if canonical.element_count() != count || canonical.element_width() != 4 {
        *canonical = FrameBuffer::canonical(count);
    }

    let mut header = src.header();
    header.payload_type = PayloadType::F32;
    header.payload_size = (count * 4) as u32;
    canonical.set_header(&header);

    let dst = canonical.samples_mut();
    match payload_type {
        PayloadType::U8 => {
            for (d, &s) in dst.iter_mut().zip(&src.payload()[..count]) {
                *d = f32::from(s);
            }
        }
        PayloadType::I16 => {
            for (d, &s) in dst.iter_mut().zip(&src.payload_as::<i16>()[..count]) {
                *d = f32::from(s);
            }
        }
        PayloadType::I32 => {
            for (d, &s) in dst.iter_mut().zip(&src.payload_as::<i32>()[..count]) {
                *d = s as f32;
            }
        }
        PayloadType::F32 => {
            for (d, &s) in dst.iter_mut().zip(&src.payload_as::<f32>()[..count]) {
                *d = sanitize(s);
            }
        }
        PayloadType::Unsupported => return false,
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::MAGIC_WORD;

    fn tagged(payload_type: PayloadType, count: usize) -> FrameBuffer {
        let mut frame = FrameBuffer::with_type(payload_type, count);
        frame.set_magic_word(MAGIC_WORD);
        frame.set_frame_counter(41);
        frame.set_source_id(6);
        frame
    }

    #[test]
    fn widens_unsigned_bytes() {
        let mut src = tagged(PayloadType::U8, 3);
        src.payload_mut().copy_from_slice(&[0, 128, 255]);
        let mut dst = FrameBuffer::canonical(3);

        assert!(normalize_into(&src, &mut dst));
        assert_eq!(dst.samples(), &[0.0, 128.0, 255.0]);
        assert_eq!(dst.frame_counter(), 41);
        assert_eq!(dst.source_id(), 6);
        assert_eq!(dst.magic_word(), MAGIC_WORD);
        assert!(dst.is_canonical());
    }

    #[test]
    fn widens_signed_integers() {
        let mut src = tagged(PayloadType::I16, 3);
        src.payload_as_mut::<i16>().copy_from_slice(&[i16::MIN, -1, i16::MAX]);
        let mut dst = FrameBuffer::canonical(3);
        assert!(normalize_into(&src, &mut dst));
        assert_eq!(dst.samples(), &[-32768.0, -1.0, 32767.0]);

        let mut src = tagged(PayloadType::I32, 2);
        src.payload_as_mut::<i32>().copy_from_slice(&[-70_000, 1 << 20]);
        assert!(normalize_into(&src, &mut dst));
        assert_eq!(dst.samples(), &[-70_000.0, 1_048_576.0]);
    }

    #[test]
    fn floats_copy_bits_and_drop_non_finite() {
        let mut src = tagged(PayloadType::F32, 5);
        src.payload_as_mut::<f32>()
            .copy_from_slice(&[1.25, f32::NAN, f32::INFINITY, f32::NEG_INFINITY, -0.5]);
        let mut dst = FrameBuffer::canonical(5);

        assert!(normalize_into(&src, &mut dst));
        assert_eq!(dst.samples(), &[1.25, 0.0, 0.0, 0.0, -0.5]);
    }

    #[test]
    fn reallocates_on_element_count_change() {
        let src = tagged(PayloadType::I16, 8);
        let mut dst = FrameBuffer::canonical(2);
        assert!(normalize_into(&src, &mut dst));
        assert_eq!(dst.element_count(), 8);
        assert_eq!(dst.payload_size(), 32);
    }

    #[test]
    fn claimed_size_is_clamped_to_allocation() {
        let mut src = tagged(PayloadType::U8, 4);
        src.set_payload_size(1_000_000);
        assert_eq!(element_count(&src, 1), 4);

        src.set_payload_size(2);
        assert_eq!(element_count(&src, 1), 2);
    }

    #[test]
    fn unsupported_type_is_not_converted() {
        let src = tagged(PayloadType::Unsupported, 4);
        let mut dst = FrameBuffer::canonical(1);
        assert!(!normalize_into(&src, &mut dst));
        assert_eq!(dst.element_count(), 1);
    }
}
