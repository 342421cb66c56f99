//! Fixed-mask loading.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::error::EngineError;
use crate::frame::FrameSize;
use std::path::Path;

/// Loads a PGM (or any greyscale-decodable) mask and validates it against
/// the camera resolution. Pixel values weight the differ multiplicatively:
/// 0 silences a pixel entirely, 255 leaves it untouched.
pub fn load_mask(path: &Path, size: FrameSize) -> Result<Vec<u8>, EngineError> {
    let img = image::open(path).map_err(|e| EngineError::Mask {
        path: path.display().to_string(),
        reason: e.to_string(),
    })?;
    let grey = img.to_luma8();
    if (grey.width() as usize, grey.height() as usize) != (size.width, size.height) {
        return Err(EngineError::Mask {
            path: path.display().to_string(),
            reason: format!(
                "mask is {}x{} but the camera is {}x{}",
                grey.width(),
                grey.height(),
                size.width,
                size.height
            ),
        });
    }
    Ok(grey.into_raw())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::fs;

    #[test]
    fn loads_ascii_pgm() {
        let path = env::temp_dir().join(format!("vigil-mask-{}.pgm", std::process::id()));
        fs::write(&path, "P2\n4 2\n255\n0 255 0 255\n255 0 255 0\n").unwrap();
        let mask = load_mask(&path, FrameSize::new(4, 2)).unwrap();
        fs::remove_file(&path).unwrap();
        assert_eq!(mask, vec![0, 255, 0, 255, 255, 0, 255, 0]);
    }

    #[test]
    fn rejects_wrong_resolution() {
        let path = env::temp_dir().join(format!("vigil-mask-bad-{}.pgm", std::process::id()));
        fs::write(&path, "P2\n2 2\n255\n0 0 0 0\n").unwrap();
        let err = load_mask(&path, FrameSize::new(4, 2));
        fs::remove_file(&path).unwrap();
        assert!(matches!(err, Err(EngineError::Mask { .. })));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = load_mask(Path::new("/nonexistent/mask.pgm"), FrameSize::new(4, 2));
        assert!(matches!(err, Err(EngineError::Mask { .. })));
    }
}
