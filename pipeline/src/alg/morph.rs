//! Erode/dilate operators for the despeckle stage and smartmask shaping.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::error::EngineError;

/// One step of the despeckle pipeline, parsed from the configuration
/// string (`E`, `e`, `D`, `d`, `l`).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DespeckleOp {
    Erode9,
    Erode5,
    Dilate9,
    Dilate5,
    Label,
}

/// Parses a despeckle configuration string once, up front. Unknown
/// characters are an error rather than being skipped silently.
pub fn parse_despeckle(spec: &str) -> Result<Vec<DespeckleOp>, EngineError> {
    spec.chars()
        .map(|c| match c {
            'E' => Ok(DespeckleOp::Erode9),
            'e' => Ok(DespeckleOp::Erode5),
            'D' => Ok(DespeckleOp::Dilate9),
            'd' => Ok(DespeckleOp::Dilate5),
            'l' => Ok(DespeckleOp::Label),
            other => Err(EngineError::Despeckle(other)),
        })
        .collect()
}

struct RowWindow {
    above: Vec<u8>,
    cur: Vec<u8>,
    below: Vec<u8>,
}

impl RowWindow {
    fn new(width: usize, edge: u8) -> Self {
        RowWindow {
            above: vec![edge; width],
            cur: vec![0; width],
            below: vec![0; width],
        }
    }

    /// Loads the original contents of row `y` and `y + 1` before row `y`
    /// is overwritten in place.
    fn load(&mut self, img: &[u8], width: usize, height: usize, y: usize, edge: u8) {
        self.cur.copy_from_slice(&img[y * width..(y + 1) * width]);
        if y + 1 < height {
            self.below
                .copy_from_slice(&img[(y + 1) * width..(y + 2) * width]);
        } else {
            self.below.fill(edge);
        }
    }

    fn advance(&mut self) {
        std::mem::swap(&mut self.above, &mut self.cur);
    }
}

/// Erodes with the full 3x3 box: a pixel survives only if all eight
/// neighbors are non-zero. Border columns are set to `flag`; rows beyond
/// the image edge read as `flag`. Returns the surviving pixel count.
pub fn erode9(img: &mut [u8], width: usize, height: usize, flag: u8) -> i32 {
    if width == 0 || height == 0 {
        return 0;
    }
    let mut sum = 0;
    let mut w = RowWindow::new(width, flag);
    for y in 0..height {
        w.load(img, width, height, y, flag);
        for i in 1..width.saturating_sub(1) {
            let zero = w.above[i - 1] == 0
                || w.above[i] == 0
                || w.above[i + 1] == 0
                || w.cur[i - 1] == 0
                || w.cur[i] == 0
                || w.cur[i + 1] == 0
                || w.below[i - 1] == 0
                || w.below[i] == 0
                || w.below[i + 1] == 0;
            if zero {
                img[y * width + i] = 0;
            } else {
                sum += 1;
            }
        }
        img[y * width] = flag;
        img[y * width + width - 1] = flag;
        w.advance();
    }
    sum
}

/// Erodes with a + shape (4-neighborhood).
pub fn erode5(img: &mut [u8], width: usize, height: usize, flag: u8) -> i32 {
    if width == 0 || height == 0 {
        return 0;
    }
    let mut sum = 0;
    let mut w = RowWindow::new(width, flag);
    for y in 0..height {
        w.load(img, width, height, y, flag);
        for i in 1..width.saturating_sub(1) {
            let zero = w.above[i] == 0
                || w.cur[i - 1] == 0
                || w.cur[i] == 0
                || w.cur[i + 1] == 0
                || w.below[i] == 0;
            if zero {
                img[y * width + i] = 0;
            } else {
                sum += 1;
            }
        }
        img[y * width] = flag;
        img[y * width + width - 1] = flag;
        w.advance();
    }
    sum
}

fn max3(a: u8, b: u8, c: u8) -> u8 {
    a.max(b).max(c)
}

/// Dilates with the full 3x3 box: each interior pixel becomes the
/// neighborhood maximum. Border columns and rows beyond the edge read and
/// stay zero. Returns the non-zero pixel count.
pub fn dilate9(img: &mut [u8], width: usize, height: usize) -> i32 {
    if width == 0 || height == 0 {
        return 0;
    }
    let mut sum = 0;
    let mut w = RowWindow::new(width, 0);
    for y in 0..height {
        w.load(img, width, height, y, 0);
        for i in 1..width.saturating_sub(1) {
            let m = max3(
                max3(w.above[i - 1], w.above[i], w.above[i + 1]),
                max3(w.cur[i - 1], w.cur[i], w.cur[i + 1]),
                max3(w.below[i - 1], w.below[i], w.below[i + 1]),
            );
            img[y * width + i] = m;
            if m != 0 {
                sum += 1;
            }
        }
        img[y * width] = 0;
        img[y * width + width - 1] = 0;
        w.advance();
    }
    sum
}

/// Dilates with a + shape.
pub fn dilate5(img: &mut [u8], width: usize, height: usize) -> i32 {
    if width == 0 || height == 0 {
        return 0;
    }
    let mut sum = 0;
    let mut w = RowWindow::new(width, 0);
    for y in 0..height {
        w.load(img, width, height, y, 0);
        for i in 1..width.saturating_sub(1) {
            let m = max3(
                w.above[i],
                max3(w.cur[i - 1], w.cur[i], w.cur[i + 1]),
                w.below[i],
            );
            img[y * width + i] = m;
            if m != 0 {
                sum += 1;
            }
        }
        img[y * width] = 0;
        img[y * width + width - 1] = 0;
        w.advance();
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;

    fn block(width: usize, height: usize, fill: &[(usize, usize)]) -> Vec<u8> {
        let mut img = vec![0u8; width * height];
        for &(x, y) in fill {
            img[y * width + x] = 200;
        }
        img
    }

    #[test]
    fn parse_rejects_unknown() {
        assert!(parse_despeckle("EedDl").is_ok());
        assert!(matches!(
            parse_despeckle("Ex"),
            Err(EngineError::Despeckle('x'))
        ));
        assert!(parse_despeckle("").unwrap().is_empty());
    }

    #[test]
    fn operators_on_empty_image() {
        let (w, h) = (8, 4);
        for op in [erode9 as fn(&mut [u8], usize, usize, u8) -> i32, erode5] {
            let mut img = vec![0u8; w * h];
            assert_eq!(op(&mut img, w, h, 0), 0);
            assert!(img.iter().all(|&v| v == 0));
        }
        for op in [dilate9 as fn(&mut [u8], usize, usize) -> i32, dilate5] {
            let mut img = vec![0u8; w * h];
            assert_eq!(op(&mut img, w, h), 0);
            assert!(img.iter().all(|&v| v == 0));
        }
    }

    #[test]
    fn dilate_grows_pointwise() {
        let (w, h) = (8, 6);
        let img = block(w, h, &[(3, 2), (4, 3)]);
        let mut dilated = img.clone();
        dilate9(&mut dilated, w, h);
        for i in 0..w * h {
            // borders are forced to zero; interior must not shrink
            if i % w != 0 && i % w != w - 1 {
                assert!(dilated[i] >= img[i], "pixel {i} shrank");
            }
        }
    }

    #[test]
    fn erode_shrinks_pointwise() {
        let (w, h) = (8, 6);
        let mut img = vec![200u8; w * h];
        img[2 * w + 3] = 0;
        let before = img.clone();
        erode9(&mut img, w, h, 0);
        for i in 0..w * h {
            assert!(img[i] <= before[i], "pixel {i} grew");
        }
    }

    #[test]
    fn erode_removes_single_speckle() {
        let (w, h) = (8, 6);
        let mut img = block(w, h, &[(3, 2)]);
        assert_eq!(erode5(&mut img, w, h, 0), 0);
        assert!(img.iter().all(|&v| v == 0));
    }

    #[test]
    fn erode_border_flag_is_written() {
        let (w, h) = (8, 4);
        let mut img = vec![0u8; w * h];
        erode9(&mut img, w, h, 255);
        for y in 0..h {
            assert_eq!(img[y * w], 255);
            assert_eq!(img[y * w + w - 1], 255);
        }
    }

    #[test]
    fn solid_block_survives_erode() {
        let (w, h) = (10, 10);
        let mut img = vec![0u8; w * h];
        for y in 2..7 {
            for x in 2..7 {
                img[y * w + x] = 150;
            }
        }
        let survivors = erode9(&mut img, w, h, 0);
        assert_eq!(survivors, 9); // 3x3 core of the 5x5 block
    }

    #[test]
    fn single_column_image() {
        let mut img = vec![200u8; 4];
        // width 1: no interior, border write only
        assert_eq!(erode9(&mut img, 1, 4, 0), 0);
        assert!(img.iter().all(|&v| v == 0));
        let mut img = vec![200u8; 4];
        assert_eq!(dilate9(&mut img, 1, 4), 0);
        assert!(img.iter().all(|&v| v == 0));
    }

    #[test]
    fn single_row_image() {
        let mut img = vec![200u8; 6];
        // height 1: neighbors above/below read as the flag byte
        let survivors = erode9(&mut img, 6, 1, 255);
        assert_eq!(survivors, 4);
    }
}
