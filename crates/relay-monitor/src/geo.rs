//! Geohash encoding and the `g` tag ladder.
//!
//! A relay located at a point is tagged with the geohash of that point at
//! every precision from 1 up to a maximum, so subscribers can filter with a
//! single `#g` prefix at whatever granularity they care about.

use crate::tags::{Tag, TagSet};
use serde::{Deserialize, Serialize};

/// Default ladder height.
pub const DEFAULT_PRECISION: usize = 9;

/// Longest geohash we emit.
pub const MAX_PRECISION: usize = 12;

const BASE32: &[u8; 32] = b"0123456789bcdefghjkmnpqrstuvwxyz";

/// A WGS84 coordinate pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GeoPoint {
    #[must_use]
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Whether both coordinates are finite and in range.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// Encode a point as a geohash of the given length.
///
/// Precision is clamped to `1..=MAX_PRECISION`; out-of-range coordinates are
/// clamped to the valid range.
#[must_use]
pub fn encode(point: GeoPoint, precision: usize) -> String {
    let precision = precision.clamp(1, MAX_PRECISION);
    let latitude = point.latitude.clamp(-90.0, 90.0);
    let longitude = point.longitude.clamp(-180.0, 180.0);

    let (mut lat_lo, mut lat_hi) = (-90.0_f64, 90.0_f64);
    let (mut lon_lo, mut lon_hi) = (-180.0_f64, 180.0_f64);

    let mut hash = String::with_capacity(precision);
    let mut even_bit = true;
    let mut index = 0usize;
    let mut bit = 0u8;

    while hash.len() < precision {
        if even_bit {
            let mid = (lon_lo + lon_hi) / 2.0;
            if longitude >= mid {
                index = (index << 1) | 1;
                lon_lo = mid;
            } else {
                index <<= 1;
                lon_hi = mid;
            }
        } else {
            let mid = (lat_lo + lat_hi) / 2.0;
            if latitude >= mid {
                index = (index << 1) | 1;
                lat_lo = mid;
            } else {
                index <<= 1;
                lat_hi = mid;
            }
        }
        even_bit = !even_bit;

        bit += 1;
        if bit == 5 {
            hash.push(BASE32[index] as char);
            bit = 0;
            index = 0;
        }
    }

    hash
}

/// Geohash prefixes for precisions `1..=max_precision`, shortest first.
#[must_use]
pub fn ladder(point: GeoPoint, max_precision: usize) -> Vec<String> {
    let full = encode(point, max_precision);
    // Base32 output is ASCII, so byte slicing is safe.
    (1..=full.len()).map(|i| full[..i].to_string()).collect()
}

/// Append the `g` ladder for `point` to `tags`.
pub fn append_ladder(tags: &mut TagSet, point: GeoPoint, max_precision: usize) {
    for prefix in ladder(point, max_precision) {
        tags.append(Tag::new("g", [prefix]));
    }
}
