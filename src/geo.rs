//! Great-circle helpers for accumulating driven distance from position fixes.

/// Mean Earth radius (km)
pub const EARTH_RADIUS_KM: f64 = 6371.0;

/// Haversine distance between two WGS84 points in kilometers
pub fn haversine_km(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let d_lat = (lat2 - lat1).to_radians();
    let d_lon = (lon2 - lon1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).max(0.0).sqrt());
    EARTH_RADIUS_KM * c
}

/// Initial bearing from the first point towards the second, in degrees [0, 360)
pub fn bearing_deg(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_lon = (lon2 - lon1).to_radians();

    let y = d_lon.sin() * phi2.cos();
    let x = phi1.cos() * phi2.sin() - phi1.sin() * phi2.cos() * d_lon.cos();
    y.atan2(x).to_degrees().rem_euclid(360.0)
}

/// Total length of a `(lat, lon)` path; zero for fewer than two points
pub fn path_distance_km(path: &[(f64, f64)]) -> f64 {
    path.windows(2)
        .map(|pair| haversine_km(pair[0].0, pair[0].1, pair[1].0, pair[1].1))
        .sum()
}

/// Running distance over consecutive fixes
#[derive(Clone, Debug, Default)]
pub struct DistanceAccumulator {
    last: Option<(f64, f64)>,
    total_km: f64,
    fixes: usize,
}

impl DistanceAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a fix and return the length of the new segment (0 for the first fix)
    pub fn push(&mut self, latitude: f64, longitude: f64) -> f64 {
        let segment = match self.last {
            Some((lat, lon)) => haversine_km(lat, lon, latitude, longitude),
            None => 0.0,
        };

        self.last = Some((latitude, longitude));
        self.total_km += segment;
        self.fixes += 1;
        segment
    }

    pub fn total_km(&self) -> f64 {
        self.total_km
    }

    pub fn fixes(&self) -> usize {
        self.fixes
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn test_one_degree_latitude() {
        let d = haversine_km(35.0, 139.0, 36.0, 139.0);
        let expected = 111.19;
        assert!((d - expected).abs() / expected < 0.005, "got {d}");
    }

    #[test]
    fn test_same_point_is_zero() {
        assert_eq!(haversine_km(35.68, 139.76, 35.68, 139.76), 0.0);
    }

    #[test]
    fn test_path_distance_short_paths() {
        assert_eq!(path_distance_km(&[]), 0.0);
        assert_eq!(path_distance_km(&[(35.0, 139.0)]), 0.0);
    }

    #[test]
    fn test_path_matches_accumulator() {
        let path = [(35.0, 139.0), (35.01, 139.0), (35.01, 139.01), (35.02, 139.02)];

        let mut acc = DistanceAccumulator::new();
        for (lat, lon) in path {
            acc.push(lat, lon);
        }

        assert_abs_diff_eq!(acc.total_km(), path_distance_km(&path), epsilon = 1e-9);
        assert_eq!(acc.fixes(), 4);

        acc.reset();
        assert_eq!(acc.total_km(), 0.0);
        assert_eq!(acc.fixes(), 0);
    }

    #[test]
    fn test_bearing_cardinal_directions() {
        assert_abs_diff_eq!(bearing_deg(0.0, 0.0, 1.0, 0.0), 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(bearing_deg(0.0, 0.0, 0.0, 1.0), 90.0, epsilon = 1e-6);
        assert_abs_diff_eq!(bearing_deg(1.0, 0.0, 0.0, 0.0), 180.0, epsilon = 1e-6);
        assert_abs_diff_eq!(bearing_deg(0.0, 1.0, 0.0, 0.0), 270.0, epsilon = 1e-6);
    }
}
