//! Reprojection of raw OSM latitude/longitude into the working SRS.

use clap::ValueEnum;

const EARTH_RADIUS: f64 = 6_378_137.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Projection {
    /// Keep coordinates as degrees (EPSG:4326).
    #[value(name = "latlong")]
    LatLong,
    /// Spherical web mercator (EPSG:3857), the rendering default.
    #[value(name = "mercator")]
    SphericalMercator,
}

impl Projection {
    pub fn srid(self) -> i32 {
        match self {
            Projection::LatLong => 4326,
            Projection::SphericalMercator => 3857,
        }
    }

    pub fn is_geographic(self) -> bool {
        matches!(self, Projection::LatLong)
    }

    /// Long linear features are split after roughly 1 degree or 100 km.
    pub fn split_at(self) -> f64 {
        if self.is_geographic() {
            1.0
        } else {
            100_000.0
        }
    }

    /// `(lat, lon)` in degrees to `(x, y)` in the working SRS.
    pub fn project(self, lat: f64, lon: f64) -> (f64, f64) {
        match self {
            Projection::LatLong => (lon, lat),
            Projection::SphericalMercator => {
                let x = EARTH_RADIUS * lon.to_radians();
                let y = EARTH_RADIUS
                    * (std::f64::consts::FRAC_PI_4 + lat.to_radians() / 2.0)
                        .tan()
                        .ln();
                (x, y)
            }
        }
    }

    /// `(x, y)` in the working SRS back to `(lon, lat)` degrees.
    pub fn unproject(self, x: f64, y: f64) -> (f64, f64) {
        match self {
            Projection::LatLong => (x, y),
            Projection::SphericalMercator => {
                let lon = (x / EARTH_RADIUS).to_degrees();
                let lat = (2.0 * (y / EARTH_RADIUS).exp().atan()
                    - std::f64::consts::FRAC_PI_2)
                    .to_degrees();
                (lon, lat)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latlong_is_passthrough() {
        assert_eq!(Projection::LatLong.project(51.5, -0.1), (-0.1, 51.5));
        assert_eq!(Projection::LatLong.srid(), 4326);
        assert_eq!(Projection::LatLong.split_at(), 1.0);
    }

    #[test]
    fn mercator_origin_and_hemispheres() {
        let merc = Projection::SphericalMercator;
        let (x, y) = merc.project(0.0, 0.0);
        assert!(x.abs() < 1e-9 && y.abs() < 1e-9);
        let (x, y) = merc.project(45.0, 90.0);
        assert!(x > 10_000_000.0 && y > 5_000_000.0);
        assert_eq!(merc.srid(), 3857);
        assert_eq!(merc.split_at(), 100_000.0);
    }

    #[test]
    fn mercator_roundtrips() {
        let merc = Projection::SphericalMercator;
        let (x, y) = merc.project(51.5073509, -0.1277583);
        let (lon, lat) = merc.unproject(x, y);
        assert!((lon - (-0.1277583)).abs() < 1e-9);
        assert!((lat - 51.5073509).abs() < 1e-9);
    }
}
