//! Kubernetes resource quantity parsing
//!
//! Accepts the decimal (`m`, `k`, `M`, `G`, `T`, `P`, `E`), binary (`Ki` ..
//! `Ei`) and exponent (`1e3`) suffix forms.

const BINARY_SUFFIXES: &[(&str, f64)] = &[
    ("Ki", 1024.0),
    ("Mi", 1_048_576.0),
    ("Gi", 1_073_741_824.0),
    ("Ti", 1_099_511_627_776.0),
    ("Pi", 1_125_899_906_842_624.0),
    ("Ei", 1_152_921_504_606_846_976.0),
];

const DECIMAL_SUFFIXES: &[(&str, f64)] = &[
    ("n", 1e-9),
    ("u", 1e-6),
    ("m", 1e-3),
    ("k", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

/// Parse a quantity into its base-unit value
pub fn parse(quantity: &str) -> Result<f64, String> {
    let q = quantity.trim();
    if q.is_empty() {
        return Err("empty quantity".to_string());
    }

    let (number, multiplier) = BINARY_SUFFIXES
        .iter()
        .chain(DECIMAL_SUFFIXES)
        .find_map(|(suffix, mult)| q.strip_suffix(suffix).map(|n| (n, *mult)))
        // "1e3" ends in a digit, so it never matches "E" above
        .unwrap_or((q, 1.0));

    let value: f64 = number
        .parse()
        .map_err(|_| format!("invalid quantity {quantity:?}"))?;
    if !value.is_finite() || value < 0.0 {
        return Err(format!("invalid quantity {quantity:?}"));
    }
    Ok(value * multiplier)
}

/// Round up, ignoring float noise below a millionth
fn ceil(value: f64) -> u64 {
    (value - 1e-6).ceil().max(0.0) as u64
}

/// CPU quantity in millicores, rounded up
pub fn cpu_millis(quantity: &str) -> Result<u64, String> {
    parse(quantity).map(|cores| ceil(cores * 1000.0))
}

/// Memory quantity in bytes, rounded up
pub fn memory_bytes(quantity: &str) -> Result<u64, String> {
    parse(quantity).map(ceil)
}
