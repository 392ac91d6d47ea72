// External crate imports
use bytes::{Buf, BytesMut};

// Internal crate imports
use crate::encoding::Encoding;
use crate::errors::Error;

/// Trait for reading protocol fields from a message body held in BytesMut.
pub trait BytesMutReader {
    /// Read one null-terminated string and decode it with `encoding`.
    fn read_string(&mut self, encoding: &Encoding) -> Result<String, Error>;
    fn read_i32_checked(&mut self) -> Result<i32, Error>;
    fn read_i16_checked(&mut self) -> Result<i16, Error>;
}

impl BytesMutReader for BytesMut {
    fn read_string(&mut self, encoding: &Encoding) -> Result<String, Error> {
        let null_index = self.iter().position(|&byte| byte == b'\0');

        match null_index {
            Some(index) => {
                let string_bytes = self.split_to(index + 1);
                Ok(encoding.decode(&string_bytes[..string_bytes.len() - 1]))
            }
            None => Err(Error::ParseBytesError("Could not read string".to_string())),
        }
    }

    fn read_i32_checked(&mut self) -> Result<i32, Error> {
        if self.remaining() < 4 {
            return Err(Error::ParseBytesError(format!(
                "Expected 4 bytes for int32, {} remaining",
                self.remaining()
            )));
        }
        Ok(self.get_i32())
    }

    fn read_i16_checked(&mut self) -> Result<i16, Error> {
        if self.remaining() < 2 {
            return Err(Error::ParseBytesError(format!(
                "Expected 2 bytes for int16, {} remaining",
                self.remaining()
            )));
        }
        Ok(self.get_i16())
    }
}
