//! Semantic data kinds for tags
//!
//! Kinds follow the IEC 61131 elementary type names. Legacy aliases from
//! older configurations (`int`, `bigint`, `float`, ...) are normalized at
//! the configuration boundary.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::ModelError;

/// Tag data kind with explicit width and signedness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataKind {
    Bool,
    Sint,
    Int,
    Dint,
    Lint,
    Usint,
    Uint,
    Udint,
    Real,
    Lreal,
    String,
}

impl DataKind {
    /// Width of the kind in bytes; strings report 0 (variable)
    pub fn width(self) -> usize {
        match self {
            DataKind::Bool | DataKind::Sint | DataKind::Usint => 1,
            DataKind::Int | DataKind::Uint => 2,
            DataKind::Dint | DataKind::Udint | DataKind::Real => 4,
            DataKind::Lint | DataKind::Lreal => 8,
            DataKind::String => 0,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(
            self,
            DataKind::Sint | DataKind::Int | DataKind::Dint | DataKind::Lint
        )
    }

    pub fn is_float(self) -> bool {
        matches!(self, DataKind::Real | DataKind::Lreal)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            DataKind::Bool => "BOOL",
            DataKind::Sint => "SINT",
            DataKind::Int => "INT",
            DataKind::Dint => "DINT",
            DataKind::Lint => "LINT",
            DataKind::Usint => "USINT",
            DataKind::Uint => "UINT",
            DataKind::Udint => "UDINT",
            DataKind::Real => "REAL",
            DataKind::Lreal => "LREAL",
            DataKind::String => "STRING",
        }
    }
}

impl FromStr for DataKind {
    type Err = ModelError;

    /// Parse a kind name, accepting legacy aliases
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BOOL" | "BOOLEAN" => Ok(DataKind::Bool),
            "SINT" | "INT8" => Ok(DataKind::Sint),
            "INT16" => Ok(DataKind::Int),
            // Plain INT historically meant a 32-bit integer in tag configs
            "INT" | "DINT" | "INT32" => Ok(DataKind::Dint),
            "LINT" | "BIGINT" | "INT64" => Ok(DataKind::Lint),
            "USINT" | "UINT8" | "BYTE" => Ok(DataKind::Usint),
            "UINT" | "UINT16" | "WORD" => Ok(DataKind::Uint),
            "UDINT" | "UINT32" | "DWORD" => Ok(DataKind::Udint),
            "REAL" | "FLOAT" | "FLOAT32" => Ok(DataKind::Real),
            "LREAL" | "DOUBLE" | "FLOAT64" => Ok(DataKind::Lreal),
            "STRING" | "TEXT" => Ok(DataKind::String),
            other => Err(ModelError::Parse(format!("Unknown data kind: {}", other))),
        }
    }
}

impl std::fmt::Display for DataKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
