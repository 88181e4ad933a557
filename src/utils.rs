//! Utility functions for the mug-control-ble crate.

/// Convert Celsius to Fahrenheit.
///
/// # Example
///
/// ```
/// use mug_control_ble::celsius_to_fahrenheit;
///
/// let fahrenheit = celsius_to_fahrenheit(100.0);
/// assert!((fahrenheit - 212.0).abs() < 0.001);
/// ```
#[inline]
pub fn celsius_to_fahrenheit(celsius: f64) -> f64 {
    celsius * 9.0 / 5.0 + 32.0
}

/// Convert Fahrenheit to Celsius.
///
/// # Example
///
/// ```
/// use mug_control_ble::fahrenheit_to_celsius;
///
/// let celsius = fahrenheit_to_celsius(212.0);
/// assert!((celsius - 100.0).abs() < 0.001);
/// ```
#[inline]
pub fn fahrenheit_to_celsius(fahrenheit: f64) -> f64 {
    (fahrenheit - 32.0) * 5.0 / 9.0
}

/// Format a payload as space separated upper-case hex, truncated to `max_len` bytes.
///
/// Used for logging characteristic traffic.
///
/// # Example
///
/// ```
/// use mug_control_ble::utils::hex_preview;
///
/// assert_eq!(hex_preview(&[0x13, 0x88], 16), "13 88");
/// assert_eq!(hex_preview(&[1, 2, 3], 2), "01 02 …");
/// ```
pub fn hex_preview(data: &[u8], max_len: usize) -> String {
    let shown = &data[..data.len().min(max_len)];
    let mut out = shown
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ");

    if data.len() > max_len {
        out.push_str(" …");
    }

    out
}
