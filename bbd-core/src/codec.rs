//! Big-endian scalar codec. Every setup and control field on the wire goes through here.

use byteorder::{BigEndian, ByteOrder};

/// Fixed-width value with a canonical big-endian representation.
pub trait Scalar: Copy {
    /// Encoded size in bytes.
    const WIDTH: usize;

    /// Encode into the first `WIDTH` bytes of `out`.
    fn put(self, out: &mut [u8]);

    /// Decode from the first `WIDTH` bytes of `bytes`.
    fn get(bytes: &[u8]) -> Self;
}

macro_rules! scalar {
    ($ty:ty, $width:expr, $write:ident, $read:ident, $encode:ident, $decode:ident) => {
        impl Scalar for $ty {
            const WIDTH: usize = $width;

            fn put(self, out: &mut [u8]) {
                BigEndian::$write(&mut out[..$width], self)
            }

            fn get(bytes: &[u8]) -> Self {
                BigEndian::$read(&bytes[..$width])
            }
        }

        #[doc = concat!("Encode a `", stringify!($ty), "` in big-endian order.")]
        pub fn $encode(value: $ty) -> [u8; $width] {
            let mut out = [0u8; $width];
            value.put(&mut out);
            out
        }

        #[doc = concat!("Decode a big-endian `", stringify!($ty), "`.")]
        pub fn $decode(bytes: [u8; $width]) -> $ty {
            <$ty as Scalar>::get(&bytes)
        }
    };
}

scalar!(i16, 2, write_i16, read_i16, encode_i16, decode_i16);
scalar!(u16, 2, write_u16, read_u16, encode_u16, decode_u16);
scalar!(i32, 4, write_i32, read_i32, encode_i32, decode_i32);
scalar!(u32, 4, write_u32, read_u32, encode_u32, decode_u32);
scalar!(i64, 8, write_i64, read_i64, encode_i64, decode_i64);
scalar!(u64, 8, write_u64, read_u64, encode_u64, decode_u64);
scalar!(f32, 4, write_f32, read_f32, encode_f32, decode_f32);
scalar!(f64, 8, write_f64, read_f64, encode_f64, decode_f64);

/// Widest scalar the codec handles; sizes staging arrays.
pub const MAX_WIDTH: usize = 8;
