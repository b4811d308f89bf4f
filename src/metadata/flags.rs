//! Attribute flag sets of the metadata tables (ECMA-335 II.23.1).

use bitflags::bitflags;

bitflags! {
    /// Flags of a TypeDef row.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct TypeAttributes: u32 {
        /// Visible outside the assembly
        const PUBLIC = 0x0000_0001;
        /// Nested, public
        const NESTED_PUBLIC = 0x0000_0002;
        /// Nested, private
        const NESTED_PRIVATE = 0x0000_0003;
        /// Nested, visible to the assembly
        const NESTED_ASSEMBLY = 0x0000_0005;
        /// Type is an interface
        const INTERFACE = 0x0000_0020;
        /// Type is abstract
        const ABSTRACT = 0x0000_0080;
        /// Type cannot be derived from
        const SEALED = 0x0000_0100;
        /// Name carries special meaning
        const SPECIAL_NAME = 0x0000_0400;
        /// Type is serializable
        const SERIALIZABLE = 0x0000_2000;
        /// Static initialisation may run at any time before first static field access
        const BEFORE_FIELD_INIT = 0x0010_0000;
    }
}

/// Mask of the visibility bits of [`TypeAttributes`].
pub const TYPE_VISIBILITY_MASK: u32 = 0x0000_0007;

bitflags! {
    /// Flags of a MethodDef row.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MethodAttributes: u16 {
        /// Accessible only by the parent type
        const PRIVATE = 0x0001;
        /// Accessible by sub-types only in this assembly
        const FAM_AND_ASSEM = 0x0002;
        /// Accessible by anyone in the assembly
        const ASSEM = 0x0003;
        /// Accessible only by type and sub-types
        const FAMILY = 0x0004;
        /// Accessible by sub-types anywhere, plus anyone in assembly
        const FAM_OR_ASSEM = 0x0005;
        /// Accessible by anyone
        const PUBLIC = 0x0006;
        /// Defined on type, else per instance
        const STATIC = 0x0010;
        /// Method cannot be overridden
        const FINAL = 0x0020;
        /// Method is virtual
        const VIRTUAL = 0x0040;
        /// Method hides by name and signature
        const HIDE_BY_SIG = 0x0080;
        /// Method always gets a new slot in the vtable
        const NEW_SLOT = 0x0100;
        /// Method does not provide an implementation
        const ABSTRACT = 0x0400;
        /// Method is special
        const SPECIAL_NAME = 0x0800;
        /// Runtime checks the name encoding
        const RT_SPECIAL_NAME = 0x1000;
        /// Implementation is forwarded through PInvoke
        const PINVOKE_IMPL = 0x2000;
    }
}

/// Mask of the member access bits of [`MethodAttributes`] and [`FieldAttributes`].
pub const MEMBER_ACCESS_MASK: u16 = 0x0007;

impl MethodAttributes {
    /// Replace the member access bits with `access`.
    #[must_use]
    pub fn with_access(self, access: MethodAttributes) -> MethodAttributes {
        let bits = (self.bits() & !MEMBER_ACCESS_MASK) | (access.bits() & MEMBER_ACCESS_MASK);
        MethodAttributes::from_bits_retain(bits)
    }

    /// `true` if the access bits equal `access`.
    #[must_use]
    pub fn has_access(self, access: MethodAttributes) -> bool {
        self.bits() & MEMBER_ACCESS_MASK == access.bits() & MEMBER_ACCESS_MASK
    }
}

bitflags! {
    /// Implementation flags of a MethodDef row.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct MethodImplAttributes: u16 {
        /// Method impl is native
        const NATIVE = 0x0001;
        /// Method impl is provided by the runtime
        const RUNTIME = 0x0003;
        /// Method impl is unmanaged
        const UNMANAGED = 0x0004;
        /// Method cannot be inlined
        const NO_INLINING = 0x0008;
        /// Method is single-threaded through the body
        const SYNCHRONIZED = 0x0020;
        /// Signature is preserved for PInvoke
        const PRESERVE_SIG = 0x0080;
        /// Method should be inlined if possible
        const AGGRESSIVE_INLINING = 0x0100;
        /// Implemented inside the runtime
        const INTERNAL_CALL = 0x1000;
    }
}

/// Mask of the code type bits of [`MethodImplAttributes`].
pub const METHOD_IMPL_CODE_TYPE_MASK: u16 = 0x0003;

impl MethodImplAttributes {
    /// `true` if the body is supplied by the runtime (delegate members, intrinsics).
    #[must_use]
    pub fn is_runtime(self) -> bool {
        self.bits() & METHOD_IMPL_CODE_TYPE_MASK == MethodImplAttributes::RUNTIME.bits()
            || self.contains(MethodImplAttributes::INTERNAL_CALL)
    }
}

bitflags! {
    /// Flags of a Field row.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct FieldAttributes: u16 {
        /// Accessible only by the parent type
        const PRIVATE = 0x0001;
        /// Accessible by anyone in the assembly
        const ASSEMBLY = 0x0003;
        /// Accessible only by type and sub-types
        const FAMILY = 0x0004;
        /// Accessible by anyone
        const PUBLIC = 0x0006;
        /// Defined on type, else per instance
        const STATIC = 0x0010;
        /// Field can only be initialised
        const INIT_ONLY = 0x0020;
        /// Value is a compile-time constant
        const LITERAL = 0x0040;
        /// Field is special
        const SPECIAL_NAME = 0x0200;
    }
}

bitflags! {
    /// Flags of a Param row.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ParamAttributes: u16 {
        /// Parameter is input
        const IN = 0x0001;
        /// Parameter is output
        const OUT = 0x0002;
        /// Parameter is optional
        const OPTIONAL = 0x0010;
        /// Parameter has a default value
        const HAS_DEFAULT = 0x1000;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    /// Kind of an exception handling clause
    pub struct ExceptionHandlerFlags: u16 {
        /// A typed exception clause
        const EXCEPTION = 0x0000;
        /// An exception filter and handler clause
        const FILTER = 0x0001;
        /// A finally clause
        const FINALLY = 0x0002;
        /// Fault clause (finally that is called on exception only)
        const FAULT = 0x0004;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Flags of a method body header
    pub struct MethodBodyFlags: u16 {
        /// Tiny header, code size in the upper six bits
        const TINY_FORMAT = 0x2;
        /// Fat header
        const FAT_FORMAT = 0x3;
        /// More sections follow the code
        const MORE_SECTS = 0x8;
        /// Zero-initialise locals
        const INIT_LOCALS = 0x10;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    /// Flags of an extra data section following the code
    pub struct SectionFlags: u8 {
        /// Exception handling data
        const EHTABLE = 0x1;
        /// Reserved, must be zero
        const OPT_ILTABLE = 0x2;
        /// Fat section layout
        const FAT_FORMAT = 0x40;
        /// Another section follows
        const MORE_SECTS = 0x80;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_replacement() {
        let flags = MethodAttributes::PUBLIC | MethodAttributes::STATIC | MethodAttributes::HIDE_BY_SIG;
        let private = flags.with_access(MethodAttributes::PRIVATE);
        assert!(private.has_access(MethodAttributes::PRIVATE));
        assert!(!private.has_access(MethodAttributes::PUBLIC));
        assert!(private.contains(MethodAttributes::STATIC | MethodAttributes::HIDE_BY_SIG));
    }

    #[test]
    fn runtime_impl() {
        assert!(MethodImplAttributes::RUNTIME.is_runtime());
        assert!(MethodImplAttributes::INTERNAL_CALL.is_runtime());
        assert!(!MethodImplAttributes::empty().is_runtime());
        assert!(!MethodImplAttributes::NO_INLINING.is_runtime());
    }
}
