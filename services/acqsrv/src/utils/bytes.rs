//! Big-endian payload codecs and bit helpers
//!
//! S7 payloads are big-endian throughout; these helpers convert between
//! raw PLC bytes and typed values, and mask single bits inside a byte for
//! the read-modify-write path.

use edge_model::Value;

// ============================================================================
// Bit operations
// ============================================================================

/// Test a single bit (0..=7) in a byte
///
/// # Examples
/// ```
/// use acqsrv::utils::bytes::bit_get;
///
/// assert!(bit_get(0b1010_0000, 5));
/// assert!(!bit_get(0b1010_0000, 3));
/// ```
#[inline]
pub fn bit_get(byte: u8, bit: u8) -> bool {
    byte & (1 << bit) != 0
}

/// Set or clear a single bit (0..=7) in a byte
///
/// # Examples
/// ```
/// use acqsrv::utils::bytes::bit_set;
///
/// assert_eq!(bit_set(0b1010_0000, 3, true), 0b1010_1000);
/// assert_eq!(bit_set(0b1010_0000, 5, false), 0b1000_0000);
/// ```
#[inline]
pub fn bit_set(byte: u8, bit: u8, value: bool) -> u8 {
    if value {
        byte | (1 << bit)
    } else {
        byte & !(1 << bit)
    }
}

// ============================================================================
// Big-endian decode
// ============================================================================

/// Decode a big-endian i16 from 2 bytes
#[inline]
pub fn be_i16(data: &[u8]) -> Option<i16> {
    Some(i16::from_be_bytes([*data.first()?, *data.get(1)?]))
}

/// Decode a big-endian u16 from 2 bytes
#[inline]
pub fn be_u16(data: &[u8]) -> Option<u16> {
    Some(u16::from_be_bytes([*data.first()?, *data.get(1)?]))
}

/// Decode a big-endian i32 from 4 bytes
#[inline]
pub fn be_i32(data: &[u8]) -> Option<i32> {
    let bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
    Some(i32::from_be_bytes(bytes))
}

/// Decode a big-endian IEEE 754 f32 from 4 bytes
#[inline]
pub fn be_f32(data: &[u8]) -> Option<f32> {
    let bytes: [u8; 4] = data.get(..4)?.try_into().ok()?;
    Some(f32::from_be_bytes(bytes))
}

// ============================================================================
// Typed value bridging
// ============================================================================

/// Coerce a telemetry value into the bytes for a 16-bit register write
pub fn value_to_be_i16(value: &Value) -> Option<[u8; 2]> {
    let v = value.as_f64()?;
    Some((v as i16).to_be_bytes())
}

/// Coerce a telemetry value into the bytes for an f32 write
pub fn value_to_be_f32(value: &Value) -> Option<[u8; 4]> {
    let v = value.as_f64()?;
    Some((v as f32).to_be_bytes())
}

/// Coerce a telemetry value into a single byte
pub fn value_to_byte(value: &Value) -> Option<u8> {
    let v = value.as_f64()?;
    if !(0.0..=255.0).contains(&v) {
        return None;
    }
    Some(v as u8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bit_get_set() {
        let byte = 0b1010_0000u8;
        assert!(bit_get(byte, 7));
        assert!(bit_get(byte, 5));
        assert!(!bit_get(byte, 0));

        // Setting an already-set bit leaves the byte unchanged
        assert_eq!(bit_set(byte, 5, true), 0b1010_0000);
        // Clearing an already-clear bit leaves the byte unchanged
        assert_eq!(bit_set(byte, 3, false), 0b1010_0000);

        assert_eq!(bit_set(byte, 0, true), 0b1010_0001);
        assert_eq!(bit_set(byte, 7, false), 0b0010_0000);
    }

    #[test]
    fn test_be_decode() {
        assert_eq!(be_i16(&[0xFF, 0xFE]), Some(-2));
        assert_eq!(be_u16(&[0x12, 0x34]), Some(0x1234));
        assert_eq!(be_i32(&[0x00, 0x00, 0x01, 0x00]), Some(256));
        // 25.0 in IEEE 754: 0x41C80000
        assert_eq!(be_f32(&[0x41, 0xC8, 0x00, 0x00]), Some(25.0));
        assert_eq!(be_i16(&[0x01]), None);
    }

    #[test]
    fn test_value_encode() {
        assert_eq!(value_to_be_i16(&Value::Int(-2)), Some([0xFF, 0xFE]));
        assert_eq!(
            value_to_be_f32(&Value::Float(25.0)),
            Some([0x41, 0xC8, 0x00, 0x00])
        );
        assert_eq!(value_to_byte(&Value::Int(200)), Some(200));
        assert_eq!(value_to_byte(&Value::Int(300)), None);
        assert_eq!(value_to_be_i16(&Value::Text("x".into())), None);
    }
}
