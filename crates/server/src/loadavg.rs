//! Host load sampling for profiles with dynamic limits.

use std::path::Path;

use anyhow::Context;

const LOADAVG_PATH: &str = "/proc/loadavg";

/// One-minute load average from the contents of `/proc/loadavg`.
pub fn parse_loadavg(contents: &str) -> Option<f64> {
    let one_minute: f64 = contents.split_whitespace().next()?.parse().ok()?;
    (one_minute.is_finite() && one_minute >= 0.0).then_some(one_minute)
}

/// Scale a load average to per-core utilisation, so 1.0 means every core
/// is busy.
pub fn normalise(load: f64, cores: usize) -> f64 {
    load / cores.max(1) as f64
}

pub fn sample() -> anyhow::Result<f64> {
    sample_from(Path::new(LOADAVG_PATH))
}

fn sample_from(path: &Path) -> anyhow::Result<f64> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let load = parse_loadavg(&contents)
        .with_context(|| format!("unrecognised load average in {}", path.display()))?;
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    Ok(normalise(load, cores))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_first_field() {
        assert_eq!(parse_loadavg("0.52 0.58 0.59 2/1234 56789\n"), Some(0.52));
        assert_eq!(parse_loadavg("3 1 1 1/1 1"), Some(3.0));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_loadavg(""), None);
        assert_eq!(parse_loadavg("busy 0.1"), None);
        assert_eq!(parse_loadavg("-1.0 0 0"), None);
        assert_eq!(parse_loadavg("NaN 0 0"), None);
    }

    #[test]
    fn normalises_by_core_count() {
        assert_eq!(normalise(2.0, 4), 0.5);
        assert_eq!(normalise(2.0, 0), 2.0);
    }

    #[test]
    fn missing_file_is_an_error() {
        let path = std::env::temp_dir().join(format!("turnstile_no_loadavg_{}", std::process::id()));
        assert!(sample_from(&path).is_err());
    }
}
