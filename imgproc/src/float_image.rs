use image::GrayImage;

/// Single-channel `f32` image used where intermediate results must not be
/// quantized (blurred responses, pyramids, derivative images).
#[derive(Debug, Clone, PartialEq)]
pub struct FloatImage {
    pub width: u32,
    pub height: u32,
    pub data: Vec<f32>,
}

impl FloatImage {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0.0; (width * height) as usize],
        }
    }

    pub fn from_gray(img: &GrayImage) -> Self {
        Self {
            width: img.width(),
            height: img.height(),
            data: img.as_raw().iter().map(|&v| v as f32).collect(),
        }
    }

    pub fn to_gray(&self) -> GrayImage {
        let mut out = GrayImage::new(self.width, self.height);
        for (o, &v) in out.as_mut().iter_mut().zip(self.data.iter()) {
            *o = v.round().clamp(0.0, 255.0) as u8;
        }
        out
    }

    #[inline]
    pub fn get(&self, x: u32, y: u32) -> f32 {
        self.data[(y * self.width + x) as usize]
    }

    #[inline]
    pub fn set(&mut self, x: u32, y: u32, v: f32) {
        self.data[(y * self.width + x) as usize] = v;
    }

    /// Integer access with clamping to the image border.
    #[inline]
    pub fn get_clamped(&self, x: i64, y: i64) -> f32 {
        let xi = x.clamp(0, self.width as i64 - 1) as u32;
        let yi = y.clamp(0, self.height as i64 - 1) as u32;
        self.get(xi, yi)
    }

    /// Bilinear sample with replicated border.
    pub fn sample(&self, x: f32, y: f32) -> f32 {
        let x0 = x.floor();
        let y0 = y.floor();
        let fx = x - x0;
        let fy = y - y0;
        let xi = x0 as i64;
        let yi = y0 as i64;
        let v00 = self.get_clamped(xi, yi);
        let v10 = self.get_clamped(xi + 1, yi);
        let v01 = self.get_clamped(xi, yi + 1);
        let v11 = self.get_clamped(xi + 1, yi + 1);
        let v0 = v00 + (v10 - v00) * fx;
        let v1 = v01 + (v11 - v01) * fx;
        v0 + (v1 - v0) * fy
    }

    pub fn max_value(&self) -> f32 {
        self.data.iter().copied().fold(f32::NEG_INFINITY, f32::max)
    }
}

impl From<&GrayImage> for FloatImage {
    fn from(img: &GrayImage) -> Self {
        Self::from_gray(img)
    }
}
