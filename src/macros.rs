#![allow(unused_macros)]

/// Helper macro for reading locked items, mapping a poisoned lock to [`crate::Error::LockError`]
///
/// ```rust, ignore
///  let data = read_lock!(my_arc_rwlock);
///  println!("{}", data.some_field);
/// ```
macro_rules! read_lock {
    ($arc_rwlock:expr) => {
        $arc_rwlock.read().map_err(|_| crate::Error::LockError)?
    };
}

/// Helper macro for writing to locked items, mapping a poisoned lock to [`crate::Error::LockError`]
///
/// ```rust, ignore
///  let mut data = write_lock!(my_arc_rwlock);
///  data.some_field = 42;
/// ```
macro_rules! write_lock {
    ($arc_rwlock:expr) => {
        $arc_rwlock.write().map_err(|_| crate::Error::LockError)?
    };
}

/// Helper macro for locking a mutex, mapping a poisoned lock to [`crate::Error::LockError`]
///
/// ```rust, ignore
///  let mut data = lock!(my_mutex);
///  data.push(42);
/// ```
macro_rules! lock {
    ($lock:expr) => {
        $lock.lock().map_err(|_| crate::Error::LockError)?
    };
}

/// Declares the CIL opcode table.
///
/// Every row is `Variant = value, "mnemonic", OperandType, FlowType;` and expands to the
/// [`crate::assembly::OpCode`] enum together with its lookup functions.
macro_rules! opcodes {
    ($($variant:ident = $value:expr, $mnemonic:expr, $operand:ident, $flow:ident;)*) => {
        /// A CIL opcode.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum OpCode {
            $(
                #[doc = $mnemonic]
                $variant,
            )*
        }

        impl OpCode {
            /// Every opcode known to the codec.
            pub const ALL: &'static [OpCode] = &[$(OpCode::$variant,)*];

            /// The encoded value. Two-byte opcodes carry the `0xFE` prefix in the high byte.
            #[must_use]
            pub const fn value(self) -> u16 {
                match self {
                    $(OpCode::$variant => $value,)*
                }
            }

            /// The ILAsm mnemonic.
            #[must_use]
            pub const fn mnemonic(self) -> &'static str {
                match self {
                    $(OpCode::$variant => $mnemonic,)*
                }
            }

            /// The kind of inline operand following the opcode.
            #[must_use]
            pub const fn operand_type(self) -> OperandType {
                match self {
                    $(OpCode::$variant => OperandType::$operand,)*
                }
            }

            /// How the opcode affects control flow.
            #[must_use]
            pub const fn flow(self) -> FlowType {
                match self {
                    $(OpCode::$variant => FlowType::$flow,)*
                }
            }
        }
    };
}
