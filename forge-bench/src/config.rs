use serde::Serialize;

use crate::error::BenchError;

/// A benchmark profile with preset sizes, runs, and warmup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BenchProfile {
    pub name: &'static str,
    pub sizes: Vec<usize>,
    pub runs: u32,
    pub warmup: u32,
}

/// 64K keys, 3 runs, 1 warmup.
pub fn quick_profile() -> BenchProfile {
    BenchProfile {
        name: "quick",
        sizes: vec![65_536],
        runs: 3,
        warmup: 1,
    }
}

/// 64K and 1M keys, 5 runs, 2 warmups.
pub fn standard_profile() -> BenchProfile {
    BenchProfile {
        name: "standard",
        sizes: vec![65_536, 1_000_000],
        runs: 5,
        warmup: 2,
    }
}

/// 64K, 1M and 4M keys, 10 runs, 2 warmups.
pub fn thorough_profile() -> BenchProfile {
    BenchProfile {
        name: "thorough",
        sizes: vec![65_536, 1_000_000, 4_000_000],
        runs: 10,
        warmup: 2,
    }
}

pub fn get_profile(name: &str) -> Result<BenchProfile, BenchError> {
    match name {
        "quick" => Ok(quick_profile()),
        "standard" => Ok(standard_profile()),
        "thorough" => Ok(thorough_profile()),
        other => Err(BenchError::UnknownProfile(other.to_string())),
    }
}

/// Parse a human-readable size: `64K`, `1.5M`, `1_000_000`, `4096`.
pub fn parse_size(s: &str) -> Result<usize, BenchError> {
    let trimmed = s.trim();
    let invalid = |reason: String| BenchError::InvalidSize {
        input: s.to_string(),
        reason,
    };

    let (digits, multiplier) = match trimmed.chars().last() {
        Some('M' | 'm') => (&trimmed[..trimmed.len() - 1], 1_000_000.0),
        Some('K' | 'k') => (&trimmed[..trimmed.len() - 1], 1_000.0),
        _ => {
            return trimmed
                .replace('_', "")
                .parse::<usize>()
                .map_err(|e| invalid(e.to_string()));
        }
    };
    let value: f64 = digits
        .replace('_', "")
        .parse()
        .map_err(|e: std::num::ParseFloatError| invalid(e.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(invalid("size must be a non-negative number".to_string()));
    }
    Ok((value * multiplier).round() as usize)
}

pub fn parse_sizes(raw: &[String]) -> Result<Vec<usize>, BenchError> {
    raw.iter().map(|s| parse_size(s)).collect()
}

/// Short display form: 1000000 -> "1M", 65536 -> "65536", 64000 -> "64K".
pub fn format_size(size: usize) -> String {
    if size >= 1_000_000 && size % 1_000_000 == 0 {
        format!("{}M", size / 1_000_000)
    } else if size >= 1_000 && size % 1_000 == 0 {
        format!("{}K", size / 1_000)
    } else {
        size.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("1M").unwrap(), 1_000_000);
        assert_eq!(parse_size("4m").unwrap(), 4_000_000);
        assert_eq!(parse_size("64K").unwrap(), 64_000);
        assert_eq!(parse_size("0.5k").unwrap(), 500);
        assert_eq!(parse_size("2.5M").unwrap(), 2_500_000);
        assert_eq!(parse_size("1_000K").unwrap(), 1_000_000);
    }

    #[test]
    fn test_parse_size_raw() {
        assert_eq!(parse_size("65536").unwrap(), 65_536);
        assert_eq!(parse_size(" 1_000_000 ").unwrap(), 1_000_000);
        assert_eq!(parse_size("0").unwrap(), 0);
    }

    #[test]
    fn test_parse_size_invalid() {
        assert!(parse_size("abc").is_err());
        assert!(parse_size("").is_err());
        assert!(parse_size("M").is_err());
        assert!(parse_size("-1K").is_err());
        let err = parse_size("12x").unwrap_err();
        assert!(err.to_string().contains("12x"));
    }

    #[test]
    fn test_parse_sizes() {
        let raw = vec!["64K".to_string(), "1M".to_string()];
        assert_eq!(parse_sizes(&raw).unwrap(), vec![64_000, 1_000_000]);
        assert!(parse_sizes(&["1M".to_string(), "bad".to_string()]).is_err());
        assert!(parse_sizes(&[]).unwrap().is_empty());
    }

    #[test]
    fn test_profiles() {
        for name in ["quick", "standard", "thorough"] {
            let p = get_profile(name).unwrap();
            assert_eq!(p.name, name);
            assert!(p.runs > 0);
            for w in p.sizes.windows(2) {
                assert!(w[0] < w[1], "{name} sizes should be ascending");
            }
        }
        assert!(matches!(
            get_profile("extreme"),
            Err(BenchError::UnknownProfile(_))
        ));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(1_000_000), "1M");
        assert_eq!(format_size(64_000), "64K");
        assert_eq!(format_size(65_536), "65536");
        assert_eq!(format_size(7), "7");
    }
}
