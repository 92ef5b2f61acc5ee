//! # Internal Macros
//!
//! Accessor generators for the zerocopy header structs used by data pages
//! and WAL records. All multi-byte header fields are stored as
//! little-endian wrapper types (`U16`, `U32`, `U64`); these macros generate
//! the native-typed getters and setters so call sites never touch the
//! wrappers directly.
//!
//! ```ignore
//! use zerocopy::little_endian::{U16, U64};
//!
//! #[repr(C)]
//! struct CellHeader {
//!     payload_len: U16,
//!     next_link: U64,
//! }
//!
//! impl CellHeader {
//!     zerocopy_accessors! {
//!         payload_len: u16,
//!         next_link: u64,
//!     }
//! }
//! ```

/// Generates getter and setter methods for zerocopy little-endian fields.
#[macro_export]
macro_rules! zerocopy_accessors {
    (@impl $field:ident, u16) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u16 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u16) {
                self.$field = ::zerocopy::little_endian::U16::new(val);
            }
        }
    };
    (@impl $field:ident, u32) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u32 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u32) {
                self.$field = ::zerocopy::little_endian::U32::new(val);
            }
        }
    };
    (@impl $field:ident, u64) => {
        ::paste::paste! {
            #[inline]
            pub fn $field(&self) -> u64 {
                self.$field.get()
            }

            #[inline]
            pub fn [<set_ $field>](&mut self, val: u64) {
                self.$field = ::zerocopy::little_endian::U64::new(val);
            }
        }
    };
    ($($field:ident : $ty:tt),* $(,)?) => {
        $(
            $crate::zerocopy_accessors!(@impl $field, $ty);
        )*
    };
}

/// Generates only getter methods for zerocopy little-endian fields (read-only).
#[macro_export]
macro_rules! zerocopy_getters {
    ($($field:ident : $native_ty:ty),* $(,)?) => {
        $(
            #[inline]
            pub fn $field(&self) -> $native_ty {
                self.$field.get()
            }
        )*
    };
}
