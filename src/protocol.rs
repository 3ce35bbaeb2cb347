//! MMC-100 wire protocol codec.
//!
//! Commands are ASCII, one per line: `<axis><opcode><args>` with axis `0`
//! reserved for broadcast. The codec is pure string handling; framing with
//! the line terminator and all I/O belong to the transport.
//!
//! Responses come back prefixed with `#`. A status query returns an integer
//! whose bit 3 distinguishes stopped (1) from moving (0); a position query
//! returns comma-separated device-unit fields (millimeters or degrees).

use crate::error::ProtocolError;

/// Line terminator appended by the transport to every command.
pub const LINE_TERMINATOR: &str = "\r\n";

/// Command builders. Arguments are in controller device units.
pub mod cmd {
    /// Enable closed-loop feedback mode.
    pub fn closed_loop(axis: u8) -> String {
        format!("{axis}SM3")
    }

    pub fn set_velocity(axis: u8, device_units_per_s: f64) -> String {
        format!("{axis}VA{device_units_per_s:.6}")
    }

    pub fn set_acceleration(axis: u8, device_units_per_s2: f64) -> String {
        format!("{axis}ACC{device_units_per_s2:.6}")
    }

    pub fn move_absolute(axis: u8, device_units: f64) -> String {
        format!("{axis}MVA{device_units:.6}")
    }

    pub fn move_relative(axis: u8, device_units: f64) -> String {
        format!("{axis}MVR{device_units:.6}")
    }

    pub fn stop(axis: u8) -> String {
        format!("{axis}STP")
    }

    /// Emergency stop, broadcast to every axis.
    pub fn emergency_stop() -> String {
        "0EST".to_string()
    }

    pub fn query_status(axis: u8) -> String {
        format!("{axis}STA?")
    }

    pub fn query_position(axis: u8) -> String {
        format!("{axis}POS?")
    }

    /// Drive toward the negative limit switch.
    pub fn seek_negative_limit(axis: u8) -> String {
        format!("{axis}MLN")
    }

    /// Drive toward the positive limit switch.
    pub fn seek_positive_limit(axis: u8) -> String {
        format!("{axis}MLP")
    }

    /// Declare the current position to be zero.
    pub fn zero(axis: u8) -> String {
        format!("{axis}ZRO")
    }
}

/// Decoded controller status word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusWord(u32);

impl StatusWord {
    pub fn raw(self) -> u32 {
        self.0
    }

    /// Bit 3: stopped (1) / moving (0).
    pub fn is_stopped(self) -> bool {
        (self.0 >> 3) & 1 == 1
    }

    pub fn is_moving(self) -> bool {
        !self.is_stopped()
    }
}

fn payload<'a>(command: &str, raw: &'a str) -> Result<&'a str, ProtocolError> {
    let trimmed = raw.trim().trim_start_matches('#');
    if trimmed.is_empty() {
        return Err(ProtocolError::EmptyResponse {
            command: command.to_string(),
        });
    }
    Ok(trimmed)
}

/// Decode a `STA?` response.
pub fn decode_status(command: &str, raw: &str) -> Result<StatusWord, ProtocolError> {
    let body = payload(command, raw)?;
    body.parse::<u32>()
        .map(StatusWord)
        .map_err(|e| ProtocolError::Malformed {
            command: command.to_string(),
            response: raw.trim().to_string(),
            reason: format!("status is not an integer: {e}"),
        })
}

/// Decode a `POS?` response into its comma-separated device-unit fields.
pub fn decode_positions(command: &str, raw: &str) -> Result<Vec<f64>, ProtocolError> {
    let body = payload(command, raw)?;
    body.split(',')
        .map(|field| {
            field
                .trim()
                .parse::<f64>()
                .map_err(|e| ProtocolError::Malformed {
                    command: command.to_string(),
                    response: raw.trim().to_string(),
                    reason: format!("position field '{}' is not numeric: {e}", field.trim()),
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_are_axis_prefixed() {
        assert_eq!(cmd::move_absolute(1, 1.0), "1MVA1.000000");
        assert_eq!(cmd::move_relative(2, -0.5), "2MVR-0.500000");
        assert_eq!(cmd::stop(3), "3STP");
        assert_eq!(cmd::emergency_stop(), "0EST");
        assert_eq!(cmd::closed_loop(4), "4SM3");
        assert_eq!(cmd::query_status(5), "5STA?");
        assert_eq!(cmd::query_position(1), "1POS?");
        assert_eq!(cmd::seek_negative_limit(1), "1MLN");
        assert_eq!(cmd::seek_positive_limit(1), "1MLP");
        assert_eq!(cmd::zero(1), "1ZRO");
    }

    #[test]
    fn status_bit3_distinguishes_stopped_from_moving() {
        assert!(decode_status("1STA?", "#8").unwrap().is_stopped());
        assert!(decode_status("1STA?", "8").unwrap().is_stopped());
        assert!(decode_status("1STA?", "#0").unwrap().is_moving());
        // Other bits must not leak into the stopped flag.
        assert!(decode_status("1STA?", "#3").unwrap().is_moving());
        assert!(decode_status("1STA?", "#15").unwrap().is_stopped());
    }

    #[test]
    fn positions_decode_all_fields() {
        let fields = decode_positions("1POS?", "#1.250000,1.249800\r\n").unwrap();
        assert_eq!(fields.len(), 2);
        assert!((fields[0] - 1.25).abs() < 1e-9);
        assert!((fields[1] - 1.2498).abs() < 1e-9);
    }

    #[test]
    fn single_field_position_is_accepted() {
        let fields = decode_positions("4POS?", "#-12.5").unwrap();
        assert_eq!(fields, vec![-12.5]);
    }

    #[test]
    fn empty_response_is_an_explicit_error() {
        let err = decode_status("1STA?", "").unwrap_err();
        assert!(matches!(err, ProtocolError::EmptyResponse { .. }));
        let err = decode_positions("1POS?", "#").unwrap_err();
        assert!(matches!(err, ProtocolError::EmptyResponse { .. }));
    }

    #[test]
    fn garbage_is_never_silently_defaulted() {
        assert!(decode_status("1STA?", "#ok").is_err());
        assert!(decode_positions("1POS?", "#1.0,abc").is_err());
    }
}
