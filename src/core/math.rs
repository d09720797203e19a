/// Unit conversions and float hygiene shared by every costing path.

pub const BYTES_PER_GIB: f64 = 1_073_741_824.0;

/// CPU quantities above this are treated as scrape garbage.
pub const MAX_SANE_CPU_CORES: f64 = 512.0;

#[inline]
pub fn bytes_to_gib(bytes: f64) -> f64 {
    bytes / BYTES_PER_GIB
}

/// NaN and infinities collapse to zero. Applied during finalization so
/// serialized output never carries non-finite numbers.
#[inline]
pub fn sanitize(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        0.0
    }
}

/// Equality within the tolerance used by the cost-conservation checks.
#[inline]
pub fn approx_eq(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-6
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_scrubs_non_finite() {
        assert_eq!(sanitize(f64::NAN), 0.0);
        assert_eq!(sanitize(f64::INFINITY), 0.0);
        assert_eq!(sanitize(f64::NEG_INFINITY), 0.0);
        assert_eq!(sanitize(1.5), 1.5);
    }

    #[test]
    fn gib_conversion() {
        assert!(approx_eq(bytes_to_gib(BYTES_PER_GIB * 2.0), 2.0));
    }
}
