use crate::error::{HalError, HalResult};

use super::frame::{Dimension, FrameLenOffset, PixelFormat};

/// Turn a captured frame into packed RGB24 for the software encoder.
pub fn decode_frame(
    data: &[u8],
    layout: &FrameLenOffset,
    dim: Dimension,
    format: PixelFormat,
) -> HalResult<Vec<u8>> {
    if data.len() < layout.frame_len {
        return Err(HalError::InvalidArgument(format!(
            "frame holds {} bytes, layout needs {}",
            data.len(),
            layout.frame_len
        )));
    }
    match format {
        PixelFormat::Rgb24 => {
            let plane = &layout.planes[0];
            let row = dim.width as usize * 3;
            let mut out = Vec::with_capacity(row * dim.height as usize);
            for y in 0..dim.height as usize {
                let start = plane.offset + y * plane.stride as usize;
                out.extend_from_slice(&data[start..start + row]);
            }
            Ok(out)
        }
        PixelFormat::Nv21 => Ok(semi_planar_to_rgb(data, layout, dim, true)),
        PixelFormat::Nv12 => Ok(semi_planar_to_rgb(data, layout, dim, false)),
        _ => Err(HalError::InvalidArgument(format!(
            "no software encode path for {:?}",
            format
        ))),
    }
}

/// 4:2:0 semi-planar to RGB24, BT.601 full range.
fn semi_planar_to_rgb(data: &[u8], layout: &FrameLenOffset, dim: Dimension, vu: bool) -> Vec<u8> {
    let (w, h) = (dim.width as usize, dim.height as usize);
    let luma = &layout.planes[0];
    let chroma = &layout.planes[1];
    let mut out = Vec::with_capacity(w * h * 3);

    for y in 0..h {
        let yrow = luma.offset + y * luma.stride as usize;
        let crow = chroma.offset + (y / 2) * chroma.stride as usize;
        for x in 0..w {
            let yy = data[yrow + x] as f32;
            let c = crow + (x & !1);
            let (u, v) = if vu {
                (data[c + 1], data[c])
            } else {
                (data[c], data[c + 1])
            };
            let (u, v) = (u as f32 - 128.0, v as f32 - 128.0);
            let r = yy + 1.402 * v;
            let g = yy - 0.344_136 * u - 0.714_136 * v;
            let b = yy + 1.772 * u;
            out.push(r.clamp(0.0, 255.0) as u8);
            out.push(g.clamp(0.0, 255.0) as u8);
            out.push(b.clamp(0.0, 255.0) as u8);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grey_nv21_stays_grey() {
        let dim = Dimension::new(4, 2);
        let layout = FrameLenOffset::compute(dim, PixelFormat::Nv21, 1);
        let mut data = vec![100u8; layout.planes[0].len];
        data.extend(std::iter::repeat(128u8).take(layout.planes[1].len));
        let rgb = decode_frame(&data, &layout, dim, PixelFormat::Nv21).unwrap();
        assert_eq!(rgb.len(), 4 * 2 * 3);
        assert!(rgb.iter().all(|&p| p == 100));
    }

    #[test]
    fn short_frame_is_rejected() {
        let dim = Dimension::new(4, 2);
        let layout = FrameLenOffset::compute(dim, PixelFormat::Nv12, 1);
        assert!(decode_frame(&[0u8; 3], &layout, dim, PixelFormat::Nv12).is_err());
    }

    #[test]
    fn raw_has_no_encode_path() {
        let dim = Dimension::new(2, 2);
        let layout = FrameLenOffset::compute(dim, PixelFormat::Raw8, 1);
        let data = vec![0u8; layout.frame_len];
        assert!(decode_frame(&data, &layout, dim, PixelFormat::Raw8).is_err());
    }
}
