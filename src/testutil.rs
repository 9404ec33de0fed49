//! Synthetic canopy surfaces shared by unit tests.

use crate::raster::Raster;

/// Sum of isotropic Gaussian bumps `(row, col, height, sigma_px)`, combined
/// with `max` so that every bump keeps a strict apex.
pub(crate) fn bumps(nrow: usize, ncol: usize, peaks: &[(f64, f64, f64, f64)]) -> Raster {
    let mut r = Raster::new(nrow, ncol, 0.0);
    for row in 0..nrow {
        for col in 0..ncol {
            let mut v: f64 = 0.0;
            for &(pr, pc, h, s) in peaks {
                let d2 = (row as f64 - pr).powi(2) + (col as f64 - pc).powi(2);
                v = v.max(h * (-d2 / (2.0 * s * s)).exp());
            }
            r.set(row, col, v);
        }
    }
    r
}
