//! Metadata tokens and the stable identifiers derived from them.
//!
//! A [`Token`] is the 32-bit reference used throughout a module image: the high byte names a
//! metadata table and the low 24 bits hold a 1-based row. A [`StableId`] is the row slice of a
//! method token taken before weaving, used to name the artifacts generated for that method.

use std::fmt;

/// A metadata token: `table << 24 | row`.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Token(pub u32);

impl Token {
    /// Create a token from its raw value.
    #[must_use]
    pub fn new(value: u32) -> Self {
        Token(value)
    }

    /// Create a token from a table id and a 1-based row.
    #[must_use]
    pub fn from_parts(table: u8, row: u32) -> Self {
        Token((u32::from(table) << 24) | (row & 0x00FF_FFFF))
    }

    /// The raw value.
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// The table id held in the high byte.
    #[must_use]
    pub fn table(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    /// The 1-based row held in the low 24 bits.
    #[must_use]
    pub fn row(&self) -> u32 {
        self.0 & 0x00FF_FFFF
    }

    /// `true` for the all-zero token.
    #[must_use]
    pub fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// The stable identifier of a method token.
    #[must_use]
    pub fn stable(&self) -> StableId {
        StableId(self.row())
    }
}

impl From<u32> for Token {
    fn from(value: u32) -> Self {
        Token(value)
    }
}

impl From<Token> for u32 {
    fn from(token: Token) -> Self {
        token.0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Token(0x{:08x}, table: 0x{:02x}, row: {})",
            self.0,
            self.table(),
            self.row()
        )
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// The low 24 bits of a method's pre-weave metadata token.
///
/// Stored in the marker attribute and rendered in every generated member name, so the fix-up
/// side can find the clone and the delegate field without any side channel.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct StableId(u32);

impl StableId {
    /// Build from a raw marker value. Bits above the low 24 are discarded.
    #[must_use]
    pub fn new(value: u32) -> Self {
        StableId(value & 0x00FF_FFFF)
    }

    /// The raw value.
    #[must_use]
    pub fn value(&self) -> u32 {
        self.0
    }

    /// Value as stored in the marker's int32 field.
    #[must_use]
    pub fn as_i32(&self) -> i32 {
        // Always fits: only 24 bits are ever set.
        #[allow(clippy::cast_possible_wrap)]
        let value = self.0 as i32;
        value
    }
}

impl fmt::Display for StableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:06x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_token_parts() {
        let token = Token::new(0x0600_0001);
        assert_eq!(token.table(), 0x06);
        assert_eq!(token.row(), 1);
        assert_eq!(Token::from_parts(0x06, 1), token);
        assert_eq!(Token::from_parts(0x02, 0x0100_0005).row(), 5);
        assert!(Token::default().is_null());
    }

    #[test]
    fn test_token_from_conversion() {
        let value = 0x0600_0001u32;
        let token: Token = value.into();
        assert_eq!(token.value(), value);

        let back_to_u32: u32 = token.into();
        assert_eq!(back_to_u32, value);
    }

    #[test]
    fn test_token_display_debug() {
        let token = Token(0x0600_0001);
        assert_eq!(format!("{}", token), "0x06000001");
        assert_eq!(
            format!("{:?}", token),
            "Token(0x06000001, table: 0x06, row: 1)"
        );
    }

    #[test]
    fn test_token_as_key() {
        let mut map = HashMap::new();
        map.insert(Token(0x0600_0001), "Method1");
        map.insert(Token(0x0200_0001), "Type1");
        assert_eq!(map.get(&Token(0x0600_0001)), Some(&"Method1"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn stable_id_is_row_and_fixed_width() {
        let id = Token(0x0600_002A).stable();
        assert_eq!(id.value(), 0x2A);
        assert_eq!(id.to_string(), "00002a");
        assert_eq!(StableId::new(0xFF12_3456).value(), 0x12_3456);
        assert_eq!(StableId::new(0x00FF_FFFF).as_i32(), 0x00FF_FFFF);
    }
}
