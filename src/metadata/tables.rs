//! Metadata table identifiers, column schemas and coded indices.
//!
//! Column widths follow ECMA-335 II.24.2.6: heap indices are 2 or 4 bytes depending on the
//! `HeapSizes` flags of the tables stream, table indices widen to 4 bytes once the target table
//! reaches 2^16 rows, and coded indices once any candidate table no longer fits beside the tag
//! bits. [`TableLayout`] computes those widths from a set of row counts.

use strum::{EnumCount, EnumIter, IntoEnumIterator};

use crate::{metadata::token::Token, Result};

/// The tables carried by a module image, with their ECMA-335 ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, EnumIter, EnumCount)]
#[repr(u8)]
pub enum TableId {
    /// Module identity
    Module = 0x00,
    /// Types referenced from other scopes
    TypeRef = 0x01,
    /// Types defined in this module
    TypeDef = 0x02,
    /// Field definitions
    Field = 0x04,
    /// Method definitions
    MethodDef = 0x06,
    /// Parameter rows
    Param = 0x08,
    /// Member references
    MemberRef = 0x0A,
    /// Custom attribute instances
    CustomAttribute = 0x0C,
    /// Stand-alone (local variable) signatures
    StandAloneSig = 0x11,
    /// Constructed type signatures
    TypeSpec = 0x1B,
    /// Assembly manifest
    Assembly = 0x20,
    /// Referenced assemblies
    AssemblyRef = 0x23,
    /// Nesting relation
    NestedClass = 0x29,
    /// Generic parameters of types and methods
    GenericParam = 0x2A,
}

impl TableId {
    /// Look up a table by id.
    #[must_use]
    pub fn from_id(id: u8) -> Option<TableId> {
        TableId::iter().find(|t| *t as u8 == id)
    }

    /// Bit of this table in the `valid` mask of the tables stream header.
    #[must_use]
    pub fn mask_bit(self) -> u64 {
        1u64 << (self as u8)
    }

    /// Token for `row` (1-based) of this table.
    #[must_use]
    pub fn token(self, row: u32) -> Token {
        Token::from_parts(self as u8, row)
    }

    /// The column schema of a row.
    #[must_use]
    pub fn columns(self) -> &'static [Column] {
        use Column::{Blob, Coded, Guid, Str, Table, U16, U32};
        match self {
            // Generation, Name, Mvid, EncId, EncBaseId
            TableId::Module => &[U16, Str, Guid, Guid, Guid],
            // ResolutionScope, TypeName, TypeNamespace
            TableId::TypeRef => &[Coded(CodedIndexType::ResolutionScope), Str, Str],
            // Flags, TypeName, TypeNamespace, Extends, FieldList, MethodList
            TableId::TypeDef => &[
                U32,
                Str,
                Str,
                Coded(CodedIndexType::TypeDefOrRef),
                Table(TableId::Field),
                Table(TableId::MethodDef),
            ],
            // Flags, Name, Signature
            TableId::Field => &[U16, Str, Blob],
            // RVA, ImplFlags, Flags, Name, Signature, ParamList
            TableId::MethodDef => &[U32, U16, U16, Str, Blob, Table(TableId::Param)],
            // Flags, Sequence, Name
            TableId::Param => &[U16, U16, Str],
            // Class, Name, Signature
            TableId::MemberRef => &[Coded(CodedIndexType::MemberRefParent), Str, Blob],
            // Parent, Type, Value
            TableId::CustomAttribute => &[
                Coded(CodedIndexType::HasCustomAttribute),
                Coded(CodedIndexType::CustomAttributeType),
                Blob,
            ],
            // Signature
            TableId::StandAloneSig | TableId::TypeSpec => &[Blob],
            // HashAlgId, Major, Minor, Build, Revision, Flags, PublicKey, Name, Culture
            TableId::Assembly => &[U32, U16, U16, U16, U16, U32, Blob, Str, Str],
            // Major, Minor, Build, Revision, Flags, PublicKeyOrToken, Name, Culture, HashValue
            TableId::AssemblyRef => &[U16, U16, U16, U16, U32, Blob, Str, Str, Blob],
            // NestedClass, EnclosingClass
            TableId::NestedClass => &[Table(TableId::TypeDef), Table(TableId::TypeDef)],
            // Number, Flags, Owner, Name
            TableId::GenericParam => &[U16, U16, Coded(CodedIndexType::TypeOrMethodDef), Str],
        }
    }

    /// `true` for tables that must be sorted by their first column.
    #[must_use]
    pub fn is_sorted(self) -> bool {
        matches!(
            self,
            TableId::CustomAttribute | TableId::NestedClass | TableId::GenericParam
        )
    }
}

/// Table id of a user string token.
pub const USER_STRING_TABLE: u8 = 0x70;

/// `HeapSizes` flag: `#Strings` indices are 4 bytes wide.
pub const HEAP_LARGE_STRINGS: u8 = 0x01;
/// `HeapSizes` flag: `#GUID` indices are 4 bytes wide.
pub const HEAP_LARGE_GUID: u8 = 0x02;
/// `HeapSizes` flag: `#Blob` indices are 4 bytes wide.
pub const HEAP_LARGE_BLOB: u8 = 0x04;

/// The kind of one table column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    /// 2-byte constant
    U16,
    /// 4-byte constant
    U32,
    /// Index into `#Strings`
    Str,
    /// Index into `#GUID`
    Guid,
    /// Index into `#Blob`
    Blob,
    /// Row of another table
    Table(TableId),
    /// Coded index
    Coded(CodedIndexType),
}

/// Column widths of one tables stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableLayout {
    heap_sizes: u8,
    rows: [u32; 64],
}

impl TableLayout {
    /// A layout for the given `HeapSizes` flags and per-table row counts.
    #[must_use]
    pub fn new(heap_sizes: u8, rows: impl Fn(TableId) -> u32) -> Self {
        let mut counts = [0u32; 64];
        for table in TableId::iter() {
            counts[table as usize] = rows(table);
        }
        TableLayout {
            heap_sizes,
            rows: counts,
        }
    }

    /// `HeapSizes` flags for heaps of the given byte lengths.
    #[must_use]
    pub fn heap_sizes_for(strings: usize, guids: usize, blobs: usize) -> u8 {
        let mut flags = 0;
        if strings > 0xFFFF {
            flags |= HEAP_LARGE_STRINGS;
        }
        if guids > 0xFFFF {
            flags |= HEAP_LARGE_GUID;
        }
        if blobs > 0xFFFF {
            flags |= HEAP_LARGE_BLOB;
        }
        flags
    }

    /// The `HeapSizes` flags of this layout.
    #[must_use]
    pub fn heap_sizes(&self) -> u8 {
        self.heap_sizes
    }

    fn count(&self, table: TableId) -> u32 {
        self.rows[table as usize]
    }

    /// Byte width of a column.
    #[must_use]
    pub fn width(&self, column: Column) -> usize {
        let large = |flag: u8| if self.heap_sizes & flag != 0 { 4 } else { 2 };
        match column {
            Column::U16 => 2,
            Column::U32 => 4,
            Column::Str => large(HEAP_LARGE_STRINGS),
            Column::Guid => large(HEAP_LARGE_GUID),
            Column::Blob => large(HEAP_LARGE_BLOB),
            Column::Table(table) => {
                if self.count(table) > 0xFFFF {
                    4
                } else {
                    2
                }
            }
            Column::Coded(kind) => {
                let max = kind
                    .tables()
                    .iter()
                    .flatten()
                    .map(|t| self.count(*t))
                    .max()
                    .unwrap_or(0);
                if u64::from(max) >= 1u64 << (16 - kind.tag_bits()) {
                    4
                } else {
                    2
                }
            }
        }
    }

    /// Size of one row of `table` in bytes.
    #[must_use]
    pub fn row_size(&self, table: TableId) -> usize {
        table.columns().iter().map(|c| self.width(*c)).sum()
    }
}

/// A coded index kind (ECMA-335 II.24.2.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodedIndexType {
    /// TypeDef, TypeRef, TypeSpec
    TypeDefOrRef,
    /// Module, ModuleRef, AssemblyRef, TypeRef
    ResolutionScope,
    /// TypeDef, TypeRef, ModuleRef, MethodDef, TypeSpec
    MemberRefParent,
    /// Owners of custom attributes
    HasCustomAttribute,
    /// MethodDef, MemberRef
    CustomAttributeType,
    /// TypeDef, MethodDef
    TypeOrMethodDef,
}

impl CodedIndexType {
    /// Candidate tables in tag order; `None` marks tags this format never emits.
    #[must_use]
    pub fn tables(self) -> &'static [Option<TableId>] {
        match self {
            CodedIndexType::TypeDefOrRef => &[
                Some(TableId::TypeDef),
                Some(TableId::TypeRef),
                Some(TableId::TypeSpec),
            ],
            CodedIndexType::ResolutionScope => &[
                Some(TableId::Module),
                None,
                Some(TableId::AssemblyRef),
                Some(TableId::TypeRef),
            ],
            CodedIndexType::MemberRefParent => &[
                Some(TableId::TypeDef),
                Some(TableId::TypeRef),
                None,
                Some(TableId::MethodDef),
                Some(TableId::TypeSpec),
            ],
            CodedIndexType::HasCustomAttribute => &[
                Some(TableId::MethodDef),
                Some(TableId::Field),
                Some(TableId::TypeRef),
                Some(TableId::TypeDef),
                Some(TableId::Param),
                None,
                Some(TableId::MemberRef),
                Some(TableId::Module),
                None,
                None,
                Some(TableId::StandAloneSig),
                None,
                None,
                Some(TableId::TypeSpec),
                Some(TableId::Assembly),
                Some(TableId::AssemblyRef),
            ],
            CodedIndexType::CustomAttributeType => &[
                None,
                None,
                Some(TableId::MethodDef),
                Some(TableId::MemberRef),
            ],
            CodedIndexType::TypeOrMethodDef => &[Some(TableId::TypeDef), Some(TableId::MethodDef)],
        }
    }

    /// Number of tag bits.
    #[must_use]
    pub fn tag_bits(self) -> u32 {
        match self {
            CodedIndexType::TypeDefOrRef | CodedIndexType::ResolutionScope => 2,
            CodedIndexType::MemberRefParent | CodedIndexType::CustomAttributeType => 3,
            CodedIndexType::HasCustomAttribute => 5,
            CodedIndexType::TypeOrMethodDef => 1,
        }
    }

    /// Encode a token as this coded index.
    ///
    /// # Errors
    /// Returns an error if the token's table is not a member of this coded index.
    pub fn encode(self, token: Token) -> Result<u32> {
        let tag = self
            .tables()
            .iter()
            .position(|t| t.is_some_and(|t| t as u8 == token.table()))
            .ok_or_else(|| malformed_error!("{} cannot be encoded as {:?}", token, self))?;
        Ok((token.row() << self.tag_bits()) | tag as u32)
    }

    /// Decode a coded index into a token. A zero row yields the null token of the table.
    ///
    /// # Errors
    /// Returns an error for tags outside the candidate list.
    pub fn decode(self, value: u32) -> Result<Token> {
        let bits = self.tag_bits();
        let tag = (value & ((1 << bits) - 1)) as usize;
        let table = self
            .tables()
            .get(tag)
            .copied()
            .flatten()
            .ok_or_else(|| malformed_error!("Invalid {:?} tag {}", self, tag))?;
        Ok(table.token(value >> bits))
    }
}
