use crate::Status;

pub fn write_varint(out: &mut Vec<u8>, mut value: u64) {
    while value >= 0x80 {
        out.push((value as u8) | 0x80);
        value >>= 7;
    }
    out.push(value as u8);
}

pub fn zigzag(value: i64) -> u64 {
    ((value << 1) ^ (value >> 63)) as u64
}

pub fn unzigzag(value: u64) -> i64 {
    ((value >> 1) as i64) ^ -((value & 1) as i64)
}

/// A cursor over an encoded buffer. Every read is bounds-checked and reports truncation as [`Status::CorruptPayload`].
pub struct ByteReader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> ByteReader<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.bytes.len() - self.pos
    }

    pub fn u8(&mut self) -> Result<u8, Status> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| Status::corrupt("truncated buffer"))?;
        self.pos += 1;
        Ok(b)
    }

    pub fn take(&mut self, n: usize) -> Result<&'a [u8], Status> {
        if n > self.remaining() {
            return Err(Status::corrupt("truncated buffer"));
        }
        let slice = &self.bytes[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    pub fn varint(&mut self) -> Result<u64, Status> {
        let mut value = 0u64;
        for shift in (0..64).step_by(7) {
            let b = self.u8()?;
            let bits = (b & 0x7f) as u64;
            if shift == 63 && bits > 1 {
                return Err(Status::corrupt("varint overflows 64 bits"));
            }
            value |= bits << shift;
            if b & 0x80 == 0 {
                return Ok(value);
            }
        }
        Err(Status::corrupt("varint overflows 64 bits"))
    }

    pub fn signed_varint(&mut self) -> Result<i64, Status> {
        self.varint().map(unzigzag)
    }

    pub fn finish(self) -> Result<(), Status> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(Status::corrupt(format!(
                "{} trailing bytes after payload",
                self.remaining()
            )))
        }
    }
}

// ████████╗███████╗███████╗████████╗
// ╚══██╔══╝██╔════╝██╔════╝╚══██╔══╝
//    ██║   █████╗  ███████╗   ██║
//    ██║   ██╔══╝  ╚════██║   ██║
//    ██║   ███████╗███████║   ██║
//    ╚═╝   ╚══════╝╚══════╝   ╚═╝

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn varints_and_zigzag() {
        let values = [0u64, 1, 127, 128, 300, u32::MAX as u64, u64::MAX];
        let mut out = Vec::new();
        for &v in &values {
            write_varint(&mut out, v);
        }
        let mut reader = ByteReader::new(&out);
        for &v in &values {
            assert_eq!(reader.varint().unwrap(), v);
        }
        reader.finish().unwrap();

        for v in [0i64, -1, 1, -64, 64, i64::MIN, i64::MAX] {
            assert_eq!(unzigzag(zigzag(v)), v);
        }
        assert_eq!(zigzag(-1), 1);
        assert_eq!(zigzag(1), 2);
    }

    #[test]
    fn truncated_varint_is_corrupt() {
        let mut reader = ByteReader::new(&[0x80, 0x80]);
        assert!(matches!(reader.varint(), Err(Status::CorruptPayload(_))));

        let overlong = [0xff; 11];
        let mut reader = ByteReader::new(&overlong);
        assert!(matches!(reader.varint(), Err(Status::CorruptPayload(_))));
    }
}
