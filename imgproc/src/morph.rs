use image::GrayImage;
use rayon::prelude::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MorphType {
    Erode,
    Dilate,
}

/// Rectangular `kw x kh` structuring element, applied separably.
pub fn dilate(src: &GrayImage, kw: u32, kh: u32) -> GrayImage {
    morph_rect(src, kw, kh, MorphType::Dilate)
}

pub fn erode(src: &GrayImage, kw: u32, kh: u32) -> GrayImage {
    morph_rect(src, kw, kh, MorphType::Erode)
}

fn morph_rect(src: &GrayImage, kw: u32, kh: u32, op: MorphType) -> GrayImage {
    let w = src.width() as usize;
    let h = src.height() as usize;
    if w == 0 || h == 0 || (kw <= 1 && kh <= 1) {
        return src.clone();
    }
    let rx = kw as usize / 2;
    let ry = kh as usize / 2;
    let pick = |a: u8, b: u8| match op {
        MorphType::Dilate => a.max(b),
        MorphType::Erode => a.min(b),
    };
    let init = match op {
        MorphType::Dilate => 0u8,
        MorphType::Erode => 255u8,
    };

    let raw = src.as_raw();
    let mut horiz = vec![0u8; w * h];
    horiz.par_chunks_mut(w).enumerate().for_each(|(y, row)| {
        let src_row = &raw[y * w..(y + 1) * w];
        for (x, out) in row.iter_mut().enumerate() {
            let x0 = x.saturating_sub(rx);
            let x1 = (x + rx).min(w - 1);
            *out = src_row[x0..=x1].iter().fold(init, |acc, &v| pick(acc, v));
        }
    });

    let mut dst = GrayImage::new(src.width(), src.height());
    dst.as_mut().par_chunks_mut(w).enumerate().for_each(|(y, row)| {
        let y0 = y.saturating_sub(ry);
        let y1 = (y + ry).min(h - 1);
        for (x, out) in row.iter_mut().enumerate() {
            *out = (y0..=y1).fold(init, |acc, yy| pick(acc, horiz[yy * w + x]));
        }
    });
    dst
}
