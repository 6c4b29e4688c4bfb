// Copyright 2024 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConversionError {
    #[error("source buffer too small: need {needed} bytes, have {available}")]
    SourceTooSmall { needed: usize, available: usize },
    #[error("destination buffer too small: need {needed} bytes, have {available}")]
    DestinationTooSmall { needed: usize, available: usize },
    #[error("stride {stride} is smaller than the line width {width}")]
    InvalidStride { stride: usize, width: usize },
}

/// Returns the size of a tightly packed I420 frame of `width`x`height`.
pub fn i420_frame_size(width: usize, height: usize) -> usize {
    let uv_width = (width + 1) / 2;
    let uv_height = (height + 1) / 2;

    width * height + 2 * uv_width * uv_height
}

fn required_len(offset: usize, stride: usize, line: usize, lines: usize) -> usize {
    if lines == 0 {
        return offset;
    }
    offset + stride * (lines - 1) + line
}

/// Converts the NV12 frame in `src` into tightly packed I420 in `dst`, deinterleaving the UV
/// plane and removing any padding.
///
/// `strides` and `offsets` give the stride and start of the Y and UV planes in `src`.
pub fn nv12_to_i420(
    src: &[u8],
    dst: &mut [u8],
    width: usize,
    height: usize,
    strides: [usize; 2],
    offsets: [usize; 2],
) -> Result<(), ConversionError> {
    // UV samples cover 2x2 pixels, odd sizes round up.
    let uv_width = (width + 1) / 2;
    let uv_height = (height + 1) / 2;

    if strides[0] < width {
        return Err(ConversionError::InvalidStride {
            stride: strides[0],
            width,
        });
    }
    if strides[1] < uv_width * 2 {
        return Err(ConversionError::InvalidStride {
            stride: strides[1],
            width: uv_width * 2,
        });
    }

    let needed = required_len(offsets[0], strides[0], width, height)
        .max(required_len(offsets[1], strides[1], uv_width * 2, uv_height));
    if src.len() < needed {
        return Err(ConversionError::SourceTooSmall {
            needed,
            available: src.len(),
        });
    }

    let dst_size = i420_frame_size(width, height);
    if dst.len() < dst_size {
        return Err(ConversionError::DestinationTooSmall {
            needed: dst_size,
            available: dst.len(),
        });
    }

    let (dst_y_plane, dst_uv_planes) = dst.split_at_mut(width * height);
    let (dst_u_plane, dst_v_plane) = dst_uv_planes.split_at_mut(uv_width * uv_height);

    // Copy Y.
    let src_y_lines = src[offsets[0]..]
        .chunks(strides[0])
        .map(|line| &line[..width]);
    for (src_line, dst_line) in src_y_lines.zip(dst_y_plane.chunks_mut(width)).take(height) {
        dst_line.copy_from_slice(src_line);
    }

    // Split UV.
    let src_uv_lines = src[offsets[1]..]
        .chunks(strides[1])
        .map(|line| &line[..uv_width * 2]);
    for (src_line, (dst_u_line, dst_v_line)) in src_uv_lines
        .zip(
            dst_u_plane
                .chunks_mut(uv_width)
                .zip(dst_v_plane.chunks_mut(uv_width)),
        )
        .take(uv_height)
    {
        for (uv, (u, v)) in src_line
            .chunks(2)
            .zip(dst_u_line.iter_mut().zip(dst_v_line.iter_mut()))
        {
            *u = uv[0];
            *v = uv[1];
        }
    }

    Ok(())
}
