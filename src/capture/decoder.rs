use image::RgbImage;
use jpeg_decoder::Decoder;

use super::{frame::PixelFormat, CaptureError, Frame};

/// Decode a captured frame into packed RGB.
pub fn decode_frame(frame: &Frame) -> Result<RgbImage, CaptureError> {
    let meta = &frame.meta;
    let (width, height) = (meta.width, meta.height);
    let data = &frame.data[..];

    let rgb = match meta.format {
        PixelFormat::Mjpeg => return decode_mjpeg(data),
        PixelFormat::Rgb24 => data.to_vec(),
        PixelFormat::Bgr24 => data
            .chunks_exact(3)
            .flat_map(|px| [px[2], px[1], px[0]])
            .collect(),
        PixelFormat::Yuyv4 => yuyv_to_rgb(data, width, height)?,
        PixelFormat::Nv12 => nv12_to_rgb(data, width, height)?,
    };

    RgbImage::from_raw(width, height, rgb).ok_or_else(|| CaptureError::Decode {
        format: meta.format,
        reason: format!("buffer of {} bytes is too small for {}x{}", data.len(), width, height),
    })
}

fn decode_mjpeg(data: &[u8]) -> Result<RgbImage, CaptureError> {
    let err = |reason: String| CaptureError::Decode {
        format: PixelFormat::Mjpeg,
        reason,
    };

    let mut decoder = Decoder::new(data);
    let pixels = decoder.decode().map_err(|e| err(e.to_string()))?;
    let info = decoder
        .info()
        .ok_or_else(|| err("missing JPEG header".into()))?;

    let rgb = match info.pixel_format {
        jpeg_decoder::PixelFormat::RGB24 => pixels,
        jpeg_decoder::PixelFormat::L8 => pixels.iter().flat_map(|&l| [l, l, l]).collect(),
        other => return Err(err(format!("unsupported JPEG pixel format {:?}", other))),
    };

    RgbImage::from_raw(info.width as u32, info.height as u32, rgb)
        .ok_or_else(|| err("decoded size mismatch".into()))
}

/// BT.601 limited range
fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
    let c = y as i32 - 16;
    let d = u as i32 - 128;
    let e = v as i32 - 128;
    let clamp = |x: i32| ((x + 128) >> 8).clamp(0, 255) as u8;
    [
        clamp(298 * c + 409 * e),
        clamp(298 * c - 100 * d - 208 * e),
        clamp(298 * c + 516 * d),
    ]
}

fn yuyv_to_rgb(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CaptureError> {
    let expected = (width * height * 2) as usize;
    if data.len() < expected || width % 2 != 0 {
        return Err(CaptureError::Decode {
            format: PixelFormat::Yuyv4,
            reason: format!("expected {} bytes with even width, got {}", expected, data.len()),
        });
    }

    let mut rgb = Vec::with_capacity((width * height * 3) as usize);
    for px in data[..expected].chunks_exact(4) {
        let (y0, u, y1, v) = (px[0], px[1], px[2], px[3]);
        rgb.extend_from_slice(&yuv_to_rgb(y0, u, v));
        rgb.extend_from_slice(&yuv_to_rgb(y1, u, v));
    }
    Ok(rgb)
}

fn nv12_to_rgb(data: &[u8], width: u32, height: u32) -> Result<Vec<u8>, CaptureError> {
    let (w, h) = (width as usize, height as usize);
    let luma = w * h;
    if data.len() < luma + luma / 2 || w % 2 != 0 || h % 2 != 0 {
        return Err(CaptureError::Decode {
            format: PixelFormat::Nv12,
            reason: format!(
                "expected {} bytes with even dimensions, got {}",
                luma + luma / 2,
                data.len()
            ),
        });
    }

    let (y_plane, uv_plane) = data.split_at(luma);
    let mut rgb = Vec::with_capacity(luma * 3);
    for row in 0..h {
        for col in 0..w {
            let y = y_plane[row * w + col];
            let uv = (row / 2) * w + (col & !1);
            rgb.extend_from_slice(&yuv_to_rgb(y, uv_plane[uv], uv_plane[uv + 1]));
        }
    }
    Ok(rgb)
}
