//! Adaptive mass binning for sharding alignment work.

/// Compute bin boundaries covering `[min_mass, max_mass]`.
///
/// Bin width grows with mass (1 Da below 600, 2 Da to 800, 4 Da to 1000,
/// 10 Da beyond) because mass-measurement tolerance scales with mass. Each
/// boundary is nudged by a split offset so two points sitting exactly on an
/// integer mass land in the same bin; the offset shrinks to zero above
/// 900 Da, beyond which all fractional masses occur. The final boundary is
/// `+inf`.
///
/// A true match whose two points straddle a boundary is scored in neither
/// bin; the split offsets keep boundaries away from where points cluster,
/// which is the accepted approximation here rather than cross-bin matching.
pub fn mass_bins(min_mass: f64, max_mass: f64) -> Vec<f64> {
    let mut bins = Vec::new();
    let mut bin = (min_mass as i64) - 1;
    let max_bin = (max_mass as i64) + 1;
    while bin <= max_bin {
        bins.push(bin as f64 + split_offset(bin as f64));
        if bin < 600 {
            bin += 1;
        } else if bin < 800 {
            bin += 2;
        } else if bin < 1000 {
            bin += 4;
        } else {
            bin += 10;
        }
    }
    bins.push(f64::INFINITY);
    bins
}

/// Fractional offset keeping bin boundaries away from integer masses, where
/// most peptide and metabolite masses cluster.
fn split_offset(mass: f64) -> f64 {
    if mass < 400.0 {
        0.6
    } else if mass < 500.0 {
        0.65
    } else if mass < 600.0 {
        0.7
    } else if mass < 700.0 {
        0.75
    } else if mass < 800.0 {
        0.8
    } else if mass < 900.0 {
        0.9
    } else {
        0.0
    }
}
