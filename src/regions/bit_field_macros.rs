// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

/// Declares a value type giving structured access to the bits of an integer: a register, or one
/// quadword of a guest structure.
///
/// ```
/// use amdvi::bit_field;
///
/// bit_field! {
///     pub struct Example : u16 {
///         enable      @      0 : RW,
///         __          @   1--3 : RsvdZ,
///         mode        @   4--6 : RO u8,
///         interrupt   @      7 : RW1C,
///         __          @  8--15 : RsvdP,
///     }
/// }
///
/// let value = Example(0).with_enable(true).with_mode(5);
/// assert!(value.enable());
/// assert_eq!(value.mode(), 5);
/// assert_eq!(Example::RESERVED_MASK, 0b0000_0000_0000_1110);
/// assert_eq!(Example::WRITE_1_CLEAR_MASK, 0b0000_0000_1000_0000);
/// assert_eq!(Example(0b1000).reserved_bits(), 0b1000);
/// ```
///
/// Each line is `name @ bit : MODE` for a single bit, which reads back as a `bool`, or
/// `name @ first_bit--last_bit : MODE type` for a sequence of bits (both ends inclusive). Modes are
/// `RO`, `RW`, `RW1C`, `RsvdZ`, and `RsvdP`. Reserved lines must be named `__`; they generate no
/// accessor but contribute to the masks:
///
/// - `RESERVED_MASK`: `RsvdZ` bits. Guest structures with any of these set are malformed.
/// - `READ_ONLY_MASK`: `RO`, `RsvdZ`, and `RsvdP` bits. Guest writes never change them.
/// - `WRITE_1_CLEAR_MASK`: `RW1C` bits. Writing a 1 clears them.
///
/// Every non-reserved field gets a getter with its own name and a `with_<name>` builder.
#[macro_export]
macro_rules! bit_field {
    (
        $(
            $(#[$attr:meta])*
            $vis:vis struct $name:ident : $type:ty {
                $(
                    $(#[$elem_attr:meta])*
                    $elem_name:ident @ $elem_first_bit:literal$(--$elem_last_bit:literal)? :
                    $elem_mode:ident $($elem_type:ty)?
                ),* $(,)?
            }
        )*
    ) => {
        $(
            $(#[$attr])*
            #[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
            $vis struct $name(pub $type);

            impl $name {
                /// Bits that must be zero in a well-formed value.
                pub const RESERVED_MASK: $type = 0 $(
                    | $crate::_bit_field_reserved_mask_elem!(
                        $type, @ $elem_first_bit$(--$elem_last_bit)? : $elem_mode $($elem_type)?
                    )
                )*;

                /// Bits that a guest write leaves untouched.
                pub const READ_ONLY_MASK: $type = 0 $(
                    | $crate::_bit_field_read_only_mask_elem!(
                        $type, @ $elem_first_bit$(--$elem_last_bit)? : $elem_mode $($elem_type)?
                    )
                )*;

                /// Bits that a guest write of 1 clears.
                pub const WRITE_1_CLEAR_MASK: $type = 0 $(
                    | $crate::_bit_field_write_1_clear_mask_elem!(
                        $type, @ $elem_first_bit$(--$elem_last_bit)? : $elem_mode $($elem_type)?
                    )
                )*;

                /// The set reserved bits, if any.
                pub const fn reserved_bits(&self) -> $type {
                    self.0 & Self::RESERVED_MASK
                }

                $(
                    $crate::_bit_field_elem! {
                        $type :
                        $(#[$elem_attr])*
                        $elem_name @ $elem_first_bit$(--$elem_last_bit)? :
                        $elem_mode $($elem_type)?
                    }
                )*
            }

            impl ::std::convert::From<$type> for $name {
                fn from(value: $type) -> Self {
                    $name(value)
                }
            }

            impl ::std::convert::From<$name> for $type {
                fn from(value: $name) -> Self {
                    value.0
                }
            }

            impl $crate::regions::structured::LeField for $name {
                const SIZE: usize = <$type as $crate::regions::structured::RegisterValue>::SIZE;

                fn from_le_slice(bytes: &[u8]) -> Self {
                    $name(<$type as $crate::regions::structured::RegisterValue>::from_le_slice(bytes))
                }

                fn write_le_slice(&self, bytes: &mut [u8]) {
                    <$type as $crate::regions::structured::RegisterValue>::write_le_slice(
                        self.0, bytes,
                    )
                }
            }

            impl ::std::fmt::Debug for $name {
                fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                    let mut debug_struct = f.debug_struct(::std::stringify!($name));
                    debug_struct.field("raw", &::std::format_args!("{:#x}", self.0));
                    $(
                        $crate::_bit_field_debug_elem!(
                            self, debug_struct, $elem_name : $elem_mode $($elem_type)?
                        );
                    )*
                    debug_struct.finish()
                }
            }
        )*
    };
}

/// This macro is __internal__. It should __not__ be used outside of the `amdvi` crate.
#[doc(hidden)]
#[macro_export]
macro_rules! _bit_field_debug_elem {
    ( $self:ident, $debug_struct:ident, $elem_name:ident : RsvdP ) => {};
    ( $self:ident, $debug_struct:ident, $elem_name:ident : RsvdZ ) => {};
    ( $self:ident, $debug_struct:ident, $elem_name:ident : $elem_mode:ident $($elem_type:ty)? ) => {
        $debug_struct.field(::std::stringify!($elem_name), &$self.$elem_name())
    };
}

/// This macro is __internal__. It should __not__ be used outside of the `amdvi` crate.
#[doc(hidden)]
#[macro_export]
macro_rules! _bit_field_elem {
    (
        $field_type:ty :
        $(#[$elem_attr:meta])*
        $elem_name:ident @ $elem_bit:literal : RsvdP
    ) => {};

    (
        $field_type:ty :
        $(#[$elem_attr:meta])*
        $elem_name:ident @ $elem_first_bit:literal--$elem_last_bit:literal : RsvdP
    ) => {};

    (
        $field_type:ty :
        $(#[$elem_attr:meta])*
        $elem_name:ident @ $elem_bit:literal : RsvdZ
    ) => {};

    (
        $field_type:ty :
        $(#[$elem_attr:meta])*
        $elem_name:ident @ $elem_first_bit:literal--$elem_last_bit:literal : RsvdZ
    ) => {};

    (
        $field_type:ty :
        $(#[$elem_attr:meta])*
        $elem_name:ident @ $elem_bit:literal : $elem_mode:ident
    ) => {
        $(#[$elem_attr])*
        pub const fn $elem_name(&self) -> bool {
            const MASK: $field_type = 1 << $elem_bit;
            self.0 & MASK != 0
        }

        $crate::__private::paste::paste! {
            #[must_use]
            pub const fn [<with_ $elem_name>](self, value: bool) -> Self {
                const MASK: $field_type = 1 << $elem_bit;
                if value {
                    Self(self.0 | MASK)
                } else {
                    Self(self.0 & !MASK)
                }
            }
        }
    };

    (
        $field_type:ty :
        $(#[$elem_attr:meta])*
        $elem_name:ident @ $elem_first_bit:literal--$elem_last_bit:literal : $elem_mode:ident $elem_type:ty
    ) => {
        $(#[$elem_attr])*
        pub const fn $elem_name(&self) -> $elem_type {
            const MASK: $field_type = $crate::_bit_range!($field_type, $elem_first_bit, $elem_last_bit);
            ((self.0 & MASK) >> $elem_first_bit) as $elem_type
        }

        $crate::__private::paste::paste! {
            #[must_use]
            pub const fn [<with_ $elem_name>](self, value: $elem_type) -> Self {
                const MASK: $field_type = $crate::_bit_range!($field_type, $elem_first_bit, $elem_last_bit);
                Self((self.0 & !MASK) | (((value as $field_type) << $elem_first_bit) & MASK))
            }
        }
    };
}

/// This macro is __internal__. It should __not__ be used outside of the `amdvi` crate.
#[doc(hidden)]
#[macro_export]
macro_rules! _bit_field_elem_mask {
    ($field_type:ty, $elem_bit:literal) => {{
        let one: $field_type = 1;
        one << $elem_bit
    }};

    ($field_type:ty, $elem_first_bit:literal--$elem_last_bit:literal) => {
        $crate::_bit_range!($field_type, $elem_first_bit, $elem_last_bit)
    };
}

/// This macro is __internal__. It should __not__ be used outside of the `amdvi` crate.
#[doc(hidden)]
#[macro_export]
macro_rules! _bit_field_reserved_mask_elem {
    ($field_type:ty, @ $elem_first_bit:literal$(--$elem_last_bit:literal)? : RsvdZ) => {
        $crate::_bit_field_elem_mask!($field_type, $elem_first_bit$(--$elem_last_bit)?)
    };

    (
        $field_type:ty,
        @ $elem_first_bit:literal$(--$elem_last_bit:literal)? :
        $elem_mode:ident $($elem_type:ty)?
    ) => {
        0
    };
}

/// This macro is __internal__. It should __not__ be used outside of the `amdvi` crate.
#[doc(hidden)]
#[macro_export]
macro_rules! _bit_field_read_only_mask_elem {
    ($field_type:ty, @ $elem_first_bit:literal$(--$elem_last_bit:literal)? : RO $($elem_type:ty)?) => {
        $crate::_bit_field_elem_mask!($field_type, $elem_first_bit$(--$elem_last_bit)?)
    };

    ($field_type:ty, @ $elem_first_bit:literal$(--$elem_last_bit:literal)? : RsvdZ) => {
        $crate::_bit_field_elem_mask!($field_type, $elem_first_bit$(--$elem_last_bit)?)
    };

    ($field_type:ty, @ $elem_first_bit:literal$(--$elem_last_bit:literal)? : RsvdP) => {
        $crate::_bit_field_elem_mask!($field_type, $elem_first_bit$(--$elem_last_bit)?)
    };

    (
        $field_type:ty,
        @ $elem_first_bit:literal$(--$elem_last_bit:literal)? :
        $elem_mode:ident $($elem_type:ty)?
    ) => {
        0
    };
}

/// This macro is __internal__. It should __not__ be used outside of the `amdvi` crate.
#[doc(hidden)]
#[macro_export]
macro_rules! _bit_field_write_1_clear_mask_elem {
    ($field_type:ty, @ $elem_first_bit:literal$(--$elem_last_bit:literal)? : RW1C) => {
        $crate::_bit_field_elem_mask!($field_type, $elem_first_bit$(--$elem_last_bit)?)
    };

    (
        $field_type:ty,
        @ $elem_first_bit:literal$(--$elem_last_bit:literal)? :
        $elem_mode:ident $($elem_type:ty)?
    ) => {
        0
    };
}

/// This macro is __internal__. It should __not__ be used outside of the `amdvi` crate.
#[doc(hidden)]
#[macro_export]
macro_rules! _bit_range {
    ($field_type:ty, $elem_first_bit:literal, $elem_last_bit:literal) => {{
        let one: $field_type = 1;
        let mask_1 = match one.checked_shl($elem_last_bit + 1) {
            ::std::option::Option::Some(v) => v - 1,
            ::std::option::Option::None => !0,
        };
        let mask_2 = (one << $elem_first_bit) - 1;
        mask_1 & !mask_2
    }};
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
