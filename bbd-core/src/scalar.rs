//! Scalar reads and writes on a [`BufferedChannel`].
//!
//! A scalar that fits in what is already buffered is decoded or encoded in place. Anything
//! straddling a buffer boundary goes through a small staging array and the generic
//! buffered read or write.

use crate::channel::{BufferedChannel, ChannelError, ReadStatus};
use crate::codec::{Scalar, MAX_WIDTH};

impl BufferedChannel {
    /// Read one big-endian scalar. End of file here is always an error.
    pub fn read_scalar<T: Scalar>(&mut self) -> Result<T, ChannelError> {
        if let Some(bytes) = self.buffered(T::WIDTH) {
            let value = T::get(bytes);
            self.consume(T::WIDTH);
            return Ok(value);
        }
        let mut staging = [0u8; MAX_WIDTH];
        match self.read(&mut staging[..T::WIDTH])? {
            ReadStatus::Complete => Ok(T::get(&staging[..T::WIDTH])),
            ReadStatus::Eof => Err(ChannelError::UnexpectedEof {
                name: self.name().to_string(),
            }),
        }
    }

    /// Write one big-endian scalar.
    pub fn write_scalar<T: Scalar>(&mut self, value: T) -> Result<(), ChannelError> {
        if let Some(room) = self.room(T::WIDTH) {
            value.put(room);
            self.commit(T::WIDTH);
            return Ok(());
        }
        let mut staging = [0u8; MAX_WIDTH];
        value.put(&mut staging[..T::WIDTH]);
        self.write(&staging[..T::WIDTH])?;
        Ok(())
    }
}

macro_rules! typed {
    ($($ty:ty => $read:ident, $write:ident;)*) => {
        impl BufferedChannel {
            $(
                pub fn $read(&mut self) -> Result<$ty, ChannelError> {
                    self.read_scalar::<$ty>()
                }

                pub fn $write(&mut self, value: $ty) -> Result<(), ChannelError> {
                    self.write_scalar(value)
                }
            )*
        }
    };
}

typed! {
    i16 => read_i16, write_i16;
    u16 => read_u16, write_u16;
    i32 => read_i32, write_i32;
    u32 => read_u32, write_u32;
    i64 => read_i64, write_i64;
    u64 => read_u64, write_u64;
    f32 => read_f32, write_f32;
    f64 => read_f64, write_f64;
}

#[cfg(test)]
mod tests {
    use crate::channel::{AccessMethod, BufferedChannel, ChannelError, ChannelSpec, Direction};

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Value {
        I16(i16),
        I32(i32),
        I64(i64),
        U64(u64),
        F32(f32),
        F64(f64),
    }

    fn mixed() -> Vec<Value> {
        vec![
            Value::I16(i16::MIN),
            Value::I32(-7),
            Value::F64(std::f64::consts::PI),
            Value::U64(u64::MAX),
            Value::I16(0),
            Value::F32(-1.5),
            Value::I64(i64::MIN),
            Value::I32(i32::MAX),
            Value::F32(f32::MAX),
            Value::I64(42),
        ]
    }

    fn roundtrip(buffer_size: usize) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("scalars.bin");
        let name = path.to_string_lossy().into_owned();
        let values: Vec<Value> = mixed().into_iter().cycle().take(200).collect();

        let mut w = BufferedChannel::open_new(
            ChannelSpec::new(name.clone(), Direction::Write, AccessMethod::Sequential).with_buffer_size(buffer_size),
        )
        .unwrap();
        for v in &values {
            match *v {
                Value::I16(x) => w.write_i16(x),
                Value::I32(x) => w.write_i32(x),
                Value::I64(x) => w.write_i64(x),
                Value::U64(x) => w.write_u64(x),
                Value::F32(x) => w.write_f32(x),
                Value::F64(x) => w.write_f64(x),
            }
            .unwrap();
        }
        let total = w.tell();
        w.close().unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), total);

        let mut r = BufferedChannel::open_new(
            ChannelSpec::new(name, Direction::Read, AccessMethod::Sequential).with_buffer_size(buffer_size),
        )
        .unwrap();
        for v in &values {
            let back = match v {
                Value::I16(_) => Value::I16(r.read_i16().unwrap()),
                Value::I32(_) => Value::I32(r.read_i32().unwrap()),
                Value::I64(_) => Value::I64(r.read_i64().unwrap()),
                Value::U64(_) => Value::U64(r.read_u64().unwrap()),
                Value::F32(_) => Value::F32(r.read_f32().unwrap()),
                Value::F64(_) => Value::F64(r.read_f64().unwrap()),
            };
            assert_eq!(back, *v);
        }
        assert_eq!(r.tell(), total);
        assert!(matches!(r.read_i16(), Err(ChannelError::UnexpectedEof { .. })));
    }

    #[test]
    fn buffer_smaller_than_a_scalar() {
        roundtrip(3);
    }

    #[test]
    fn odd_buffer_straddles_boundaries() {
        roundtrip(11);
    }

    #[test]
    fn default_buffer_uses_fast_path() {
        roundtrip(0);
    }

    #[test]
    fn truncated_scalar_is_short_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trunc.bin");
        std::fs::write(&path, [0u8, 0, 1]).unwrap();
        let mut r = BufferedChannel::open_new(ChannelSpec::new(
            path.to_string_lossy(),
            Direction::Read,
            AccessMethod::Sequential,
        ))
        .unwrap();
        assert!(matches!(
            r.read_i32(),
            Err(ChannelError::ShortRead { wanted: 4, got: 3, .. })
        ));
    }

    #[test]
    fn writes_are_big_endian_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("be.bin");
        let mut w = BufferedChannel::open_new(ChannelSpec::new(
            path.to_string_lossy(),
            Direction::Write,
            AccessMethod::Sequential,
        ))
        .unwrap();
        w.write_u16(0x2000).unwrap();
        w.write_i32(7).unwrap();
        w.close().unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), [0x20, 0x00, 0, 0, 0, 7]);
    }
}
