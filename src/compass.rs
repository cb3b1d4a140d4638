//! Heading to compass-point conversion for display.

pub const HALF_WINDS: [&str; 16] = [
    "N", "NNE", "NE", "ENE", "E", "ESE", "SE", "SSE", "S", "SSW", "SW", "WSW", "W", "WNW", "NW", "NNW",
];

/// Index into [`HALF_WINDS`]; each point covers 22.5 degrees centred on itself
pub fn half_wind_index(heading: f32) -> usize {
    if !heading.is_finite() {
        return 0;
    }
    let shifted = (heading as f64 + 11.25).rem_euclid(360.0);
    (shifted / 22.5) as usize % HALF_WINDS.len()
}

pub fn half_wind(heading: f32) -> &'static str {
    HALF_WINDS[half_wind_index(heading)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cardinal_points() {
        assert_eq!(half_wind(0.0), "N");
        assert_eq!(half_wind(90.0), "E");
        assert_eq!(half_wind(180.0), "S");
        assert_eq!(half_wind(270.0), "W");
    }

    #[test]
    fn test_sector_boundaries() {
        assert_eq!(half_wind(11.24), "N");
        assert_eq!(half_wind(11.25), "NNE");
        assert_eq!(half_wind(348.75), "N");
        assert_eq!(half_wind(348.7), "NNW");
        assert_eq!(half_wind(359.99), "N");
    }

    #[test]
    fn test_out_of_range_headings_wrap() {
        assert_eq!(half_wind(-90.0), "W");
        assert_eq!(half_wind(450.0), "E");
        assert_eq!(half_wind_index(f32::NAN), 0);
    }
}
