use std::str::FromStr;

use fragtree::solver::SolverConfig;
use fragtree::spectrum::Ionization;

pub const DEFAULT_NUMBER_OF_RESULTS: usize = 10;
pub const DEFAULT_PPM: f64 = 10.0;
pub const DEFAULT_ABSOLUTE_DEVIATION: f64 = 0.002;
pub const DEFAULT_DP_MAX_COLORS: usize = 12;
pub const DEFAULT_HEURISTIC_ONLY_ABOVE_MZ: f64 = 650.0;
pub const DEFAULT_HEURISTIC_TRIAGE_ABOVE_MZ: f64 = 300.0;
pub const DEFAULT_IONIZATION: &str = "[M+H]+";

/// The backend ids tried in order when none are given
pub fn default_backends() -> Vec<String> {
    SolverConfig::default().backends
}

pub fn non_negative_float(s: &str) -> Result<f64, String> {
    let value = s.parse::<f64>().map_err(|e| e.to_string())?;
    if value < 0.0 || !value.is_finite() {
        Err(format!("`{s}` is not a non-negative number"))
    } else {
        Ok(value)
    }
}

/// Check that an ionization string is one [`Ionization`] understands
pub fn ionization_name(s: &str) -> Result<String, String> {
    Ionization::from_str(s)
        .map(|_| s.trim().to_string())
        .map_err(|e| e.to_string())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_value_parsers() {
        assert_eq!(non_negative_float("2.5"), Ok(2.5));
        assert!(non_negative_float("-1").is_err());
        assert!(non_negative_float("inf").is_err());
        assert_eq!(ionization_name("[M+H]+").unwrap(), "[M+H]+");
        assert_eq!(ionization_name(" [M+Na]+").unwrap(), "[M+Na]+");
        assert!(ionization_name("[M+X]+").is_err());
        assert_eq!(default_backends().last().unwrap(), "microlp");
    }
}
