// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

use num_traits::{PrimInt, Unsigned};
use std::fmt::{Binary, Debug, LowerHex, UpperHex};
use std::mem;

/* ---------------------------------------------------------------------------------------------- */

use private::Sealed;
mod private {
    /// Private trait that can be used as a supertrait to make other traits non-implementable from
    /// outside this crate: https://jack.wrenn.fyi/blog/private-trait-methods/
    pub trait Sealed {}
}

/// Trait for types that represent the value of a register or of a little-endian field of a guest
/// structure.
///
/// This is implemented for [`u8`], [`u16`], [`u32`], and [`u64`].
///
/// This trait is _sealed_, and thus cannot be implemented by users of the crate.
pub trait RegisterValue:
    PrimInt + Unsigned + Debug + LowerHex + UpperHex + Binary + Default + Sealed
{
    /// Width of the value in bytes.
    const SIZE: usize;

    /// Decodes a value from the first `Self::SIZE` bytes of `bytes`, which are little-endian.
    ///
    /// Panics if `bytes` is shorter than `Self::SIZE`; callers slice fixed-size buffers.
    fn from_le_slice(bytes: &[u8]) -> Self;

    /// Encodes the value as little-endian into the first `Self::SIZE` bytes of `bytes`.
    fn write_le_slice(self, bytes: &mut [u8]);
}

macro_rules! impl_register_value {
    ($($type:ty),*) => {
        $(
            impl Sealed for $type {}
            impl RegisterValue for $type {
                const SIZE: usize = mem::size_of::<$type>();

                fn from_le_slice(bytes: &[u8]) -> Self {
                    let mut raw = [0u8; mem::size_of::<$type>()];
                    raw.copy_from_slice(&bytes[..<$type as RegisterValue>::SIZE]);
                    <$type>::from_le_bytes(raw)
                }

                fn write_le_slice(self, bytes: &mut [u8]) {
                    bytes[..<$type as RegisterValue>::SIZE].copy_from_slice(&self.to_le_bytes());
                }
            }
        )*
    };
}

impl_register_value!(u8, u16, u32, u64);

/* ---------------------------------------------------------------------------------------------- */

/// A fixed-width field of a guest structure declared with [`le_struct!`](crate::le_struct).
///
/// Implemented for every [`RegisterValue`] and for every type declared with
/// [`bit_field!`](crate::bit_field).
pub trait LeField: Copy {
    /// Width of the field in bytes.
    const SIZE: usize;

    fn from_le_slice(bytes: &[u8]) -> Self;

    fn write_le_slice(&self, bytes: &mut [u8]);
}

macro_rules! impl_le_field {
    ($($type:ty),*) => {
        $(
            impl LeField for $type {
                const SIZE: usize = <$type as RegisterValue>::SIZE;

                fn from_le_slice(bytes: &[u8]) -> Self {
                    <$type as RegisterValue>::from_le_slice(bytes)
                }

                fn write_le_slice(&self, bytes: &mut [u8]) {
                    <$type as RegisterValue>::write_le_slice(*self, bytes)
                }
            }
        )*
    };
}

impl_le_field!(u8, u16, u32, u64);

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
