//! S7 address codec
//!
//! Parses textual PLC addresses into structured records and formats them
//! back. Grammar:
//!
//! ```text
//! DB{n}.DB{X|B|W|D}{offset}[.{bit}]     data block
//! {M|I|Q}{B|W|D}{offset}                marker / input / output
//! {M|I|Q}X{offset}.{bit}                single bit
//! ```
//!
//! `X` addresses are bits and require a bit index 0..=7; `B` is one byte,
//! `W` a big-endian 16-bit word, `D` a big-endian 32-bit IEEE 754 real.

use std::fmt;
use std::str::FromStr;

use crate::error::AcqError;

/// Memory area of an S7 address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum S7Area {
    /// Numbered data block
    DataBlock(u16),
    /// Flag memory (M)
    Marker,
    /// Process input image (I)
    Input,
    /// Process output image (Q)
    Output,
}

impl S7Area {
    /// Area code used in read/write var item specifications
    pub fn code(self) -> u8 {
        match self {
            S7Area::DataBlock(_) => 0x84,
            S7Area::Marker => 0x83,
            S7Area::Input => 0x81,
            S7Area::Output => 0x82,
        }
    }

    pub fn db_number(self) -> u16 {
        match self {
            S7Area::DataBlock(n) => n,
            _ => 0,
        }
    }
}

/// Value width addressed by an S7 address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum S7Kind {
    Bool,
    Byte,
    Int16,
    Real,
}

impl S7Kind {
    /// Bytes occupied in PLC memory
    pub fn width(self) -> u32 {
        match self {
            S7Kind::Bool | S7Kind::Byte => 1,
            S7Kind::Int16 => 2,
            S7Kind::Real => 4,
        }
    }

    fn letter(self) -> char {
        match self {
            S7Kind::Bool => 'X',
            S7Kind::Byte => 'B',
            S7Kind::Int16 => 'W',
            S7Kind::Real => 'D',
        }
    }
}

/// A parsed S7 address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct S7Address {
    pub area: S7Area,
    pub kind: S7Kind,
    /// Byte offset inside the area
    pub byte: u32,
    /// Bit index, only meaningful for `S7Kind::Bool`
    pub bit: u8,
}

impl FromStr for S7Address {
    type Err = AcqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim().to_ascii_uppercase();
        let bad = || AcqError::protocol(format!("Unsupported S7 address: {}", s));

        if let Some(rest) = text.strip_prefix("DB") {
            // DB{n}.DB{X|B|W|D}{offset}[.{bit}]
            let (db_str, tail) = rest.split_once('.').ok_or_else(bad)?;
            let db: u16 = db_str.parse().map_err(|_| bad())?;
            let tail = tail.strip_prefix("DB").ok_or_else(bad)?;
            let mut chars = tail.chars();
            let letter = chars.next().ok_or_else(bad)?;
            let kind = kind_of(letter).ok_or_else(bad)?;
            let (byte, bit) = parse_offset(chars.as_str(), kind).ok_or_else(bad)?;
            Ok(S7Address {
                area: S7Area::DataBlock(db),
                kind,
                byte,
                bit,
            })
        } else {
            // {M|I|Q}{X|B|W|D}{offset}[.{bit}]
            let mut chars = text.chars();
            let area = match chars.next().ok_or_else(bad)? {
                'M' => S7Area::Marker,
                'I' => S7Area::Input,
                'Q' => S7Area::Output,
                _ => return Err(bad()),
            };
            let letter = chars.next().ok_or_else(bad)?;
            let kind = kind_of(letter).ok_or_else(bad)?;
            let (byte, bit) = parse_offset(chars.as_str(), kind).ok_or_else(bad)?;
            Ok(S7Address {
                area,
                kind,
                byte,
                bit,
            })
        }
    }
}

fn kind_of(letter: char) -> Option<S7Kind> {
    match letter {
        'X' => Some(S7Kind::Bool),
        'B' => Some(S7Kind::Byte),
        'W' => Some(S7Kind::Int16),
        'D' => Some(S7Kind::Real),
        _ => None,
    }
}

/// Parse `{offset}` or `{offset}.{bit}`; bits are only legal on bools
fn parse_offset(s: &str, kind: S7Kind) -> Option<(u32, u8)> {
    if let Some((byte_str, bit_str)) = s.split_once('.') {
        if kind != S7Kind::Bool {
            return None;
        }
        let byte = byte_str.parse().ok()?;
        let bit: u8 = bit_str.parse().ok()?;
        if bit > 7 {
            return None;
        }
        Some((byte, bit))
    } else {
        if kind == S7Kind::Bool {
            // Bit addresses require an explicit bit index
            return None;
        }
        Some((s.parse().ok()?, 0))
    }
}

impl fmt::Display for S7Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.area {
            S7Area::DataBlock(n) => {
                write!(f, "DB{}.DB{}{}", n, self.kind.letter(), self.byte)?;
            },
            S7Area::Marker => write!(f, "M{}{}", self.kind.letter(), self.byte)?,
            S7Area::Input => write!(f, "I{}{}", self.kind.letter(), self.byte)?,
            S7Area::Output => write!(f, "Q{}{}", self.kind.letter(), self.byte)?,
        }
        if self.kind == S7Kind::Bool {
            write!(f, ".{}", self.bit)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_db_addresses() {
        let addr: S7Address = "DB1.DBX0.3".parse().unwrap();
        assert_eq!(addr.area, S7Area::DataBlock(1));
        assert_eq!(addr.kind, S7Kind::Bool);
        assert_eq!(addr.byte, 0);
        assert_eq!(addr.bit, 3);

        let addr: S7Address = "DB10.DBW20".parse().unwrap();
        assert_eq!(addr.area, S7Area::DataBlock(10));
        assert_eq!(addr.kind, S7Kind::Int16);
        assert_eq!(addr.byte, 20);

        let addr: S7Address = "DB2.DBD4".parse().unwrap();
        assert_eq!(addr.kind, S7Kind::Real);

        let addr: S7Address = "DB2.DBB7".parse().unwrap();
        assert_eq!(addr.kind, S7Kind::Byte);
    }

    #[test]
    fn test_marker_io_addresses() {
        let addr: S7Address = "MW10".parse().unwrap();
        assert_eq!(addr.area, S7Area::Marker);
        assert_eq!(addr.kind, S7Kind::Int16);
        assert_eq!(addr.byte, 10);

        let addr: S7Address = "IX0.1".parse().unwrap();
        assert_eq!(addr.area, S7Area::Input);
        assert_eq!(addr.kind, S7Kind::Bool);
        assert_eq!(addr.bit, 1);

        let addr: S7Address = "QB2".parse().unwrap();
        assert_eq!(addr.area, S7Area::Output);
        assert_eq!(addr.kind, S7Kind::Byte);

        let addr: S7Address = "MD100".parse().unwrap();
        assert_eq!(addr.kind, S7Kind::Real);
    }

    #[test]
    fn test_lowercase_accepted() {
        let addr: S7Address = "db1.dbx0.3".parse().unwrap();
        assert_eq!(addr.area, S7Area::DataBlock(1));
        assert_eq!(addr.bit, 3);
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in [
            "",
            "DB1",
            "DB1.DBX0",   // bool without bit
            "DB1.DBW0.3", // bit on a word
            "DB1.DBX0.8", // bit out of range
            "ZB1",
            "DBX0.1",
            "M10",        // missing width letter
            "DB.DBW0",
            "DB1.DW0",
        ] {
            assert!(bad.parse::<S7Address>().is_err(), "accepted: {}", bad);
        }
    }

    #[test]
    fn test_parse_format_identity() {
        for text in [
            "DB1.DBX0.3",
            "DB10.DBW2",
            "DB999.DBD100",
            "DB5.DBB0",
            "MW10",
            "MB0",
            "MD64",
            "MX7.7",
            "IX0.0",
            "IB1",
            "IW2",
            "QX3.5",
            "QW4",
            "QD8",
        ] {
            let addr: S7Address = text.parse().unwrap();
            assert_eq!(addr.to_string(), text, "round trip of {}", text);
        }
    }

    #[test]
    fn test_area_codes() {
        assert_eq!(S7Area::DataBlock(1).code(), 0x84);
        assert_eq!(S7Area::Marker.code(), 0x83);
        assert_eq!(S7Area::Input.code(), 0x81);
        assert_eq!(S7Area::Output.code(), 0x82);
    }
}
