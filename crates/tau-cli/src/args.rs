//! Value parsers for compound command-line arguments.

/// `lo:hi` (or `lo,hi`) with `lo < hi`.
pub fn parse_range(s: &str) -> Result<(f64, f64), String> {
    let (lo, hi) = s
        .split_once(':')
        .or_else(|| s.split_once(','))
        .ok_or_else(|| format!("expected lo:hi, got '{s}'"))?;
    let lo: f64 = lo.trim().parse().map_err(|_| format!("bad lower bound in '{s}'"))?;
    let hi: f64 = hi.trim().parse().map_err(|_| format!("bad upper bound in '{s}'"))?;
    if !(lo < hi) {
        return Err(format!("empty range '{s}'"));
    }
    Ok((lo, hi))
}

/// `name` or `name=value`.
pub fn parse_freeze(s: &str) -> Result<(String, Option<f64>), String> {
    match s.split_once('=') {
        Some((name, value)) => {
            let value: f64 = value.trim().parse().map_err(|_| format!("bad value in '{s}'"))?;
            Ok((name.trim().to_string(), Some(value)))
        }
        None if !s.trim().is_empty() => Ok((s.trim().to_string(), None)),
        None => Err("empty parameter name".to_string()),
    }
}

/// `name=lo:hi`.
pub fn parse_set_range(s: &str) -> Result<(String, f64, f64), String> {
    let (name, range) = s.split_once('=').ok_or_else(|| format!("expected name=lo:hi, got '{s}'"))?;
    let (lo, hi) = parse_range(range)?;
    Ok((name.trim().to_string(), lo, hi))
}
