//! Reference-star selection
//!
//! A detection is kept only if it lies in the central region of the detector, its flux is
//! inside the usable range and no other detection lies within the isolation radius.

use tracing::info;

use crate::config::FilterConfig;
use crate::detector::DetectedSource;
use crate::spatial::KdTree;

/// Central-region test
pub fn in_bounds(source: &DetectedSource, config: &FilterConfig) -> bool {
    let x_low = config.overscan_width + config.edge_margin;
    let high = config.image_size - config.edge_margin;
    source.x > x_low && source.x < high && source.y > config.edge_margin && source.y < high
}

/// Inclusive flux range test
pub fn in_flux_range(source: &DetectedSource, config: &FilterConfig) -> bool {
    let (low, high) = config.flux_limits();
    source.flux >= low && source.flux <= high
}

/// Per-source isolation flags over the whole detection list
///
/// Each source counts itself, so a source is isolated when exactly one point is found.
pub fn isolation_mask(sources: &[DetectedSource], radius: f64) -> Vec<bool> {
    let points: Vec<(f64, f64)> = sources.iter().map(|s| (s.x, s.y)).collect();
    let tree = KdTree::build(&points);
    points
        .iter()
        .map(|&p| tree.count_within(p, radius) == 1)
        .collect()
}

/// Keep-mask aligned with `sources`
pub fn mask(sources: &[DetectedSource], config: &FilterConfig, isolation_radius: f64) -> Vec<bool> {
    let isolated = isolation_mask(sources, isolation_radius);
    sources
        .iter()
        .zip(isolated)
        .map(|(source, isolated)| {
            in_bounds(source, config) && in_flux_range(source, config) && isolated
        })
        .collect()
}

/// Order-preserving subset of `sources` passing every test
pub fn filter(
    sources: &[DetectedSource],
    config: &FilterConfig,
    isolation_radius: f64,
) -> Vec<DetectedSource> {
    info!(isolation_radius, "Filtering source list");
    let keep = mask(sources, config, isolation_radius);
    let kept: Vec<DetectedSource> = sources
        .iter()
        .zip(keep)
        .filter_map(|(source, keep)| keep.then_some(*source))
        .collect();
    info!(detected = sources.len(), kept = kept.len(), "Source filter done");
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn good(x: f64, y: f64) -> DetectedSource {
        DetectedSource::new(x, y, 10_000.0)
    }

    #[test]
    fn bounds_are_strict() {
        let config = FilterConfig::default();
        assert!(!in_bounds(&good(532.0, 1000.0), &config));
        assert!(in_bounds(&good(532.1, 1000.0), &config));
        assert!(!in_bounds(&good(1536.0, 1000.0), &config));
        assert!(!in_bounds(&good(1000.0, 512.0), &config));
        assert!(in_bounds(&good(1000.0, 512.5), &config));
        assert!(!in_bounds(&good(1000.0, 1536.0), &config));
    }

    #[test]
    fn flux_range_is_inclusive() {
        let config = FilterConfig::default();
        let at = |flux| DetectedSource::new(1000.0, 1000.0, flux);
        assert!(!in_flux_range(&at(1999.9), &config));
        assert!(in_flux_range(&at(2000.0), &config));
        assert!(in_flux_range(&at(90000.0), &config));
        assert!(!in_flux_range(&at(90000.1), &config));
    }

    #[test]
    fn lone_source_is_isolated() {
        assert_eq!(isolation_mask(&[good(1000.0, 1000.0)], 6.0), vec![true]);
    }

    #[test]
    fn close_pair_both_excluded() {
        let sources = [
            good(1000.0, 1000.0),
            good(1004.0, 1000.0),
            good(1200.0, 1200.0),
        ];
        assert_eq!(isolation_mask(&sources, 6.0), vec![false, false, true]);
    }

    #[test]
    fn pair_at_exact_radius_excluded() {
        let sources = [good(1000.0, 1000.0), good(1006.0, 1000.0)];
        assert_eq!(isolation_mask(&sources, 6.0), vec![false, false]);
    }

    #[test]
    fn neighbour_outside_bounds_still_crowds() {
        // The neighbour fails the geometric cut but still disqualifies the star
        let config = FilterConfig::default();
        let sources = [good(534.0, 1000.0), good(530.0, 1000.0)];
        assert_eq!(mask(&sources, &config, 6.0), vec![false, false]);
    }

    #[test]
    fn neighbour_outside_flux_range_still_crowds() {
        let config = FilterConfig::default();
        let sources = [
            good(1000.0, 1000.0),
            DetectedSource::new(1003.0, 1000.0, 150_000.0),
        ];
        assert_eq!(mask(&sources, &config, 6.0), vec![false, false]);
    }

    #[test]
    fn filter_preserves_order() {
        let config = FilterConfig::default();
        let sources = [
            good(1400.0, 1400.0),
            DetectedSource::new(900.0, 900.0, 100.0),
            good(600.0, 700.0),
            good(1000.0, 1000.0),
        ];
        let kept = filter(&sources, &config, 6.0);
        assert_eq!(kept, vec![sources[0], sources[2], sources[3]]);
    }

    #[test]
    fn empty_input_gives_empty_output() {
        assert!(filter(&[], &FilterConfig::default(), 6.0).is_empty());
    }
}
