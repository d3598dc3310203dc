//! Frame type and quality metrics — YUYV conversion, exposure, sharpness.
//!
//! Quality gating happens at capture time: a frame that is underexposed or
//! motion-blurred is marked unusable so a high-confidence liveness score on
//! a bad frame can never combine with a token into a verification.

/// An immutable grayscale camera frame snapshot.
#[derive(Clone)]
pub struct Frame {
    /// Grayscale pixel data (width * height bytes).
    pub luma: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub captured_at: std::time::Instant,
    pub sequence: u32,
    /// Result of exposure + sharpness gating at capture time.
    pub quality_ok: bool,
}

impl Frame {
    /// Average pixel brightness (0.0–255.0).
    pub fn avg_brightness(&self) -> f32 {
        if self.luma.is_empty() {
            return 0.0;
        }
        self.luma.iter().map(|&b| b as f32).sum::<f32>() / self.luma.len() as f32
    }
}

/// Thresholds for the capture-time quality gate.
#[derive(Debug, Clone, Copy)]
pub struct QualityPolicy {
    /// Fraction of near-black pixels above which a frame counts as dark.
    pub dark_threshold_pct: f32,
    /// Minimum mean absolute gradient; blurred frames fall below this.
    pub min_sharpness: f32,
}

impl Default for QualityPolicy {
    fn default() -> Self {
        Self {
            dark_threshold_pct: 0.95,
            min_sharpness: 1.5,
        }
    }
}

impl QualityPolicy {
    /// Apply the gate to raw luma data.
    pub fn assess(&self, luma: &[u8], width: u32, height: u32) -> bool {
        !is_dark_frame(luma, self.dark_threshold_pct)
            && sharpness(luma, width, height) >= self.min_sharpness
    }
}

/// Convert packed YUYV (4:2:2) to grayscale by extracting the Y channel.
///
/// YUYV packs two pixels per 4 bytes: [Y0, U, Y1, V].
pub fn yuyv_to_grayscale(yuyv: &[u8], width: u32, height: u32) -> Result<Vec<u8>, FrameError> {
    let expected = (width * height * 2) as usize;
    if yuyv.len() < expected {
        return Err(FrameError::InvalidLength {
            expected,
            actual: yuyv.len(),
        });
    }
    Ok(yuyv[..expected].iter().step_by(2).copied().collect())
}

/// Check if a frame is underexposed: more than `threshold_pct` of pixels in
/// the darkest histogram bucket (0–31).
pub fn is_dark_frame(luma: &[u8], threshold_pct: f32) -> bool {
    if luma.is_empty() {
        return true;
    }
    let dark_count = luma.iter().filter(|&&p| p < 32).count();
    (dark_count as f32 / luma.len() as f32) > threshold_pct
}

/// Mean absolute gradient across horizontal and vertical neighbors.
///
/// Motion blur smears edges, collapsing the gradient toward zero; a sharp
/// frame of a real scene sits well above. Returns 0.0 for degenerate sizes.
pub fn sharpness(luma: &[u8], width: u32, height: u32) -> f32 {
    let w = width as usize;
    let h = height as usize;
    if w < 2 || h < 2 || luma.len() < w * h {
        return 0.0;
    }

    let mut total = 0u64;
    let mut count = 0u64;
    for y in 0..h - 1 {
        for x in 0..w - 1 {
            let p = luma[y * w + x] as i32;
            let right = luma[y * w + x + 1] as i32;
            let below = luma[(y + 1) * w + x] as i32;
            total += (p - right).unsigned_abs() as u64;
            total += (p - below).unsigned_abs() as u64;
            count += 2;
        }
    }
    total as f32 / count as f32
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("invalid YUYV length: expected {expected}, got {actual}")]
    InvalidLength { expected: usize, actual: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_yuyv_to_grayscale() {
        // 2x1 image: [Y0=100, U=128, Y1=200, V=128]
        let yuyv = vec![100, 128, 200, 128];
        let gray = yuyv_to_grayscale(&yuyv, 2, 1).unwrap();
        assert_eq!(gray, vec![100, 200]);
    }

    #[test]
    fn test_yuyv_invalid_length() {
        let yuyv = vec![100, 128];
        assert!(yuyv_to_grayscale(&yuyv, 2, 1).is_err());
    }

    #[test]
    fn test_dark_frame_all_black() {
        assert!(is_dark_frame(&vec![0u8; 1000], 0.95));
    }

    #[test]
    fn test_dark_frame_normal() {
        assert!(!is_dark_frame(&vec![128u8; 1000], 0.95));
    }

    #[test]
    fn test_dark_frame_empty() {
        assert!(is_dark_frame(&[], 0.95));
    }

    #[test]
    fn test_dark_frame_borderline() {
        // 96% dark → dark; 94% dark → not dark.
        let mut mostly = vec![10u8; 960];
        mostly.extend(vec![128u8; 40]);
        assert!(is_dark_frame(&mostly, 0.95));

        let mut borderline = vec![10u8; 940];
        borderline.extend(vec![128u8; 60]);
        assert!(!is_dark_frame(&borderline, 0.95));
    }

    #[test]
    fn test_sharpness_uniform_is_zero() {
        let luma = vec![128u8; 64 * 64];
        assert_eq!(sharpness(&luma, 64, 64), 0.0);
    }

    #[test]
    fn test_sharpness_checkerboard_is_high() {
        let w = 32u32;
        let h = 32u32;
        let luma: Vec<u8> = (0..(w * h) as usize)
            .map(|i| {
                let x = i % w as usize;
                let y = i / w as usize;
                if (x + y) % 2 == 0 { 255 } else { 0 }
            })
            .collect();
        assert!(sharpness(&luma, w, h) > 100.0);
    }

    #[test]
    fn test_sharpness_degenerate_sizes() {
        assert_eq!(sharpness(&[1, 2], 2, 1), 0.0);
        assert_eq!(sharpness(&[], 0, 0), 0.0);
    }

    #[test]
    fn test_quality_gate_rejects_dark_and_flat() {
        let policy = QualityPolicy::default();
        assert!(!policy.assess(&vec![0u8; 32 * 32], 32, 32), "dark frame");
        assert!(!policy.assess(&vec![128u8; 32 * 32], 32, 32), "flat (blurred) frame");
    }

    #[test]
    fn test_quality_gate_accepts_sharp_lit_frame() {
        let w = 32u32;
        let luma: Vec<u8> = (0..(w * w) as usize)
            .map(|i| if (i % w as usize + i / w as usize) % 2 == 0 { 200 } else { 60 })
            .collect();
        assert!(QualityPolicy::default().assess(&luma, w, w));
    }
}
