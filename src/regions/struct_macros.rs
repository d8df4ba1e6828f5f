// SPDX-License-Identifier: MIT OR Apache-2.0

/* ---------------------------------------------------------------------------------------------- */

/// Declares a fixed-size structure that lives in guest memory as a little-endian byte buffer.
///
/// Each field names a byte offset and a type implementing
/// [`LeField`](crate::regions::structured::LeField), which is any of `u8`, `u16`, `u32`, `u64`, or a
/// type declared with [`bit_field!`](crate::bit_field). The structure owns a copy of its bytes, so
/// reading it twice from guest memory gives two independent values.
///
/// ```
/// use amdvi::le_struct;
///
/// le_struct! {
///     pub struct Pair : 16 {
///         low  @ 0 : u64,
///         high @ 8 : u32,
///     }
/// }
///
/// let pair = Pair::default().with_low(1).with_high(2);
/// assert_eq!(pair.as_bytes()[0], 1);
/// assert_eq!(pair.as_bytes()[8], 2);
/// assert_eq!(Pair::from_bytes(*pair.as_bytes()).high(), 2);
/// ```
///
/// Field offsets are checked against the length at compile time.
#[macro_export]
macro_rules! le_struct {
    (
        $(
            $(#[$attr:meta])*
            $vis:vis struct $name:ident : $length:literal {
                $(
                    $(#[$field_attr:meta])*
                    $field_name:ident @ $field_offset:literal : $field_type:ty
                ),* $(,)?
            }
        )*
    ) => {
        $(
            $(#[$attr])*
            #[derive(Clone, Copy, PartialEq, Eq, Hash)]
            $vis struct $name {
                bytes: [u8; $length],
            }

            $(
                const _: () = ::std::assert!(
                    $field_offset + <$field_type as $crate::regions::structured::LeField>::SIZE
                        <= $length,
                    ::std::concat!(
                        "field `",
                        ::std::stringify!($field_name),
                        "` does not fit in `",
                        ::std::stringify!($name),
                        "`",
                    ),
                );
            )*

            impl ::std::default::Default for $name {
                fn default() -> Self {
                    $name { bytes: [0; $length] }
                }
            }

            impl $name {
                /// Size of the structure in guest memory, in bytes.
                pub const SIZE: usize = $length;

                pub const fn from_bytes(bytes: [u8; $length]) -> Self {
                    $name { bytes }
                }

                pub const fn as_bytes(&self) -> &[u8; $length] {
                    &self.bytes
                }

                /// Reads the structure from guest memory at `address`.
                pub fn read_from(
                    memory: &dyn $crate::regions::GuestMemory,
                    address: u64,
                ) -> ::std::io::Result<Self> {
                    let mut bytes = [0; $length];
                    memory.read_bytes(address, &mut bytes)?;
                    Ok($name { bytes })
                }

                /// Writes the structure to guest memory at `address`.
                pub fn write_to(
                    &self,
                    memory: &dyn $crate::regions::GuestMemory,
                    address: u64,
                ) -> ::std::io::Result<()> {
                    memory.write_bytes(address, &self.bytes)
                }

                $(
                    $(#[$field_attr])*
                    pub fn $field_name(&self) -> $field_type {
                        <$field_type as $crate::regions::structured::LeField>::from_le_slice(
                            &self.bytes[$field_offset..],
                        )
                    }

                    $crate::__private::paste::paste! {
                        #[must_use]
                        pub fn [<with_ $field_name>](mut self, value: $field_type) -> Self {
                            <$field_type as $crate::regions::structured::LeField>::write_le_slice(
                                &value,
                                &mut self.bytes[$field_offset..],
                            );
                            self
                        }
                    }
                )*
            }

            impl ::std::fmt::Debug for $name {
                fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                    let mut debug_struct = f.debug_struct(::std::stringify!($name));
                    $( debug_struct.field(::std::stringify!($field_name), &self.$field_name()); )*
                    debug_struct.finish()
                }
            }
        )*
    };
}

/* ---------------------------------------------------------------------------------------------- */


/* ---------------------------------------------------------------------------------------------- */
