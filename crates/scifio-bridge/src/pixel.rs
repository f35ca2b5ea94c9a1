//! Pixel component types and the worker's integer type codes.
//!
//! The worker speaks eight codes. The host has ten component types, so the
//! host→worker table collapses some of them onto a shared code:
//!
//! | code | worker type | host types mapped to it |
//! |------|-------------|-------------------------|
//! | 0    | int8        | Char                    |
//! | 1    | uint8       | UChar                   |
//! | 2    | int32       | Short, Int              |
//! | 3    | uint32      | UShort, UInt            |
//! | 4    | int64       | Long                    |
//! | 5    | uint64      | ULong                   |
//! | 6    | float32     | Float                   |
//! | 7    | float64     | Double (fallback)       |
//!
//! Only pixel *values* survive a host→worker→host trip, not the code: a Short
//! image is written as int32 and reads back as Int.

use serde::{Deserialize, Serialize};

use crate::error::{BridgeError, Result};

/// Code used for anything without a dedicated entry.
pub const FALLBACK_CODE: u8 = 7;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentType {
    Char,
    #[serde(rename = "unsigned_char")]
    UChar,
    Short,
    #[serde(rename = "unsigned_short")]
    UShort,
    Int,
    #[serde(rename = "unsigned_int")]
    UInt,
    Long,
    #[serde(rename = "unsigned_long")]
    ULong,
    Float,
    Double,
}

impl ComponentType {
    pub fn size_in_bytes(self) -> usize {
        match self {
            Self::Char | Self::UChar => 1,
            Self::Short | Self::UShort => 2,
            Self::Int | Self::UInt | Self::Float => 4,
            Self::Long | Self::ULong | Self::Double => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Char => "char",
            Self::UChar => "unsigned_char",
            Self::Short => "short",
            Self::UShort => "unsigned_short",
            Self::Int => "int",
            Self::UInt => "unsigned_int",
            Self::Long => "long",
            Self::ULong => "unsigned_long",
            Self::Float => "float",
            Self::Double => "double",
        }
    }

    /// The type the worker will actually store for this host type.
    pub fn wire_type(self) -> ComponentType {
        to_local(to_remote(self))
    }
}

impl std::fmt::Display for ComponentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Worker code → host type. Unknown codes decode as Double so no value is
/// truncated.
pub fn to_local(code: u8) -> ComponentType {
    match code {
        0 => ComponentType::Char,
        1 => ComponentType::UChar,
        2 => ComponentType::Int,
        3 => ComponentType::UInt,
        4 => ComponentType::Long,
        5 => ComponentType::ULong,
        6 => ComponentType::Float,
        _ => ComponentType::Double,
    }
}

/// Host type → worker code. Not the inverse of [`to_local`].
pub fn to_remote(component: ComponentType) -> u8 {
    match component {
        ComponentType::Char => 0,
        ComponentType::UChar => 1,
        ComponentType::Short | ComponentType::Int => 2,
        ComponentType::UShort | ComponentType::UInt => 3,
        ComponentType::Long => 4,
        ComponentType::ULong => 5,
        ComponentType::Float => 6,
        ComponentType::Double => FALLBACK_CODE,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn native() -> Self {
        if cfg!(target_endian = "big") {
            Self::Big
        } else {
            Self::Little
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Little => "little",
            Self::Big => "big",
        }
    }

    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "little" => Some(Self::Little),
            "big" => Some(Self::Big),
            _ => None,
        }
    }
}

/// Reverse the bytes of every `width`-byte component in place.
pub fn swap_byte_order(buf: &mut [u8], width: usize) {
    if width <= 1 {
        return;
    }
    for component in buf.chunks_exact_mut(width) {
        component.reverse();
    }
}

/// Convert native-endian components of `from` into native-endian components
/// of `to`.
///
/// Only the widenings introduced by [`to_remote`] are supported; any other
/// pair must already be identical.
pub fn widen_components(buf: &[u8], from: ComponentType, to: ComponentType) -> Result<Vec<u8>> {
    if from == to {
        return Ok(buf.to_vec());
    }

    let width = from.size_in_bytes();
    if buf.len() % width != 0 {
        return Err(BridgeError::BufferSize {
            expected: buf.len() - buf.len() % width,
            actual: buf.len(),
        });
    }

    let count = buf.len() / width;
    let mut out = Vec::with_capacity(count * to.size_in_bytes());
    match (from, to) {
        (ComponentType::Short, ComponentType::Int) => {
            for c in buf.chunks_exact(2) {
                let v = i16::from_ne_bytes([c[0], c[1]]) as i32;
                out.extend_from_slice(&v.to_ne_bytes());
            }
        }
        (ComponentType::UShort, ComponentType::UInt) => {
            for c in buf.chunks_exact(2) {
                let v = u16::from_ne_bytes([c[0], c[1]]) as u32;
                out.extend_from_slice(&v.to_ne_bytes());
            }
        }
        _ => {
            return Err(BridgeError::InvalidRegion(format!(
                "cannot convert {} components to {}",
                from, to
            )));
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [ComponentType; 10] = [
        ComponentType::Char,
        ComponentType::UChar,
        ComponentType::Short,
        ComponentType::UShort,
        ComponentType::Int,
        ComponentType::UInt,
        ComponentType::Long,
        ComponentType::ULong,
        ComponentType::Float,
        ComponentType::Double,
    ];

    #[test]
    fn remote_of_local_is_identity_or_fallback() {
        for code in 0..=u8::MAX {
            let back = to_remote(to_local(code));
            assert!(
                back == code || back == FALLBACK_CODE,
                "code {code} came back as {back}"
            );
        }
    }

    #[test]
    fn known_codes_round_trip_exactly() {
        for code in 0..=FALLBACK_CODE {
            assert_eq!(to_remote(to_local(code)), code);
        }
    }

    #[test]
    fn unknown_codes_decode_as_double() {
        assert_eq!(to_local(8), ComponentType::Double);
        assert_eq!(to_local(200), ComponentType::Double);
    }

    #[test]
    fn narrow_types_share_codes() {
        assert_eq!(to_remote(ComponentType::Short), to_remote(ComponentType::Int));
        assert_eq!(to_remote(ComponentType::UShort), to_remote(ComponentType::UInt));
        assert_eq!(ComponentType::Short.wire_type(), ComponentType::Int);
        assert_eq!(ComponentType::UShort.wire_type(), ComponentType::UInt);
    }

    #[test]
    fn wire_type_never_narrows() {
        for t in ALL {
            assert!(t.wire_type().size_in_bytes() >= t.size_in_bytes(), "{t}");
        }
    }

    #[test]
    fn widening_preserves_values() {
        let values: [i16; 3] = [-2, 0, 300];
        let buf: Vec<u8> = values.iter().flat_map(|v| v.to_ne_bytes()).collect();

        let wide = widen_components(&buf, ComponentType::Short, ComponentType::Int).unwrap();
        let decoded: Vec<i32> = wide
            .chunks_exact(4)
            .map(|c| i32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(decoded, vec![-2, 0, 300]);
    }

    #[test]
    fn widening_unsigned_does_not_sign_extend() {
        let buf = 65535u16.to_ne_bytes();
        let wide = widen_components(&buf, ComponentType::UShort, ComponentType::UInt).unwrap();
        assert_eq!(u32::from_ne_bytes([wide[0], wide[1], wide[2], wide[3]]), 65535);
    }

    #[test]
    fn unsupported_conversion_is_rejected() {
        let err = widen_components(&[0; 4], ComponentType::Float, ComponentType::Int).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidRegion(_)));
    }

    #[test]
    fn swap_reverses_each_component() {
        let mut buf = vec![1, 2, 3, 4, 5, 6];
        swap_byte_order(&mut buf, 2);
        assert_eq!(buf, vec![2, 1, 4, 3, 6, 5]);

        let mut bytes = vec![9, 8];
        swap_byte_order(&mut bytes, 1);
        assert_eq!(bytes, vec![9, 8]);
    }

    #[test]
    fn byte_order_tokens() {
        assert_eq!(ByteOrder::parse("big"), Some(ByteOrder::Big));
        assert_eq!(ByteOrder::parse("LE"), None);
        assert_eq!(ByteOrder::Little.as_str(), "little");
    }
}
