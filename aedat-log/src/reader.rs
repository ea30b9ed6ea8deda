use std::io::{BufRead, BufReader, Read};

use byteorder::{BigEndian, ByteOrder, LittleEndian};

use dvs_flow_types::{PolarityEvent, SensorSize};

use crate::{decode_v2_address, decode_v3_word, AedatError, AedatResult, AedatVariant};

/// Reads back AEDAT logs of either variant, detecting the variant from the
/// first header line.
pub struct AedatReader<R: BufRead> {
    r: R,
    variant: AedatVariant,
    size: SensorSize,
}

impl AedatReader<BufReader<std::fs::File>> {
    pub fn open<P: AsRef<std::path::Path>>(path: P, size: SensorSize) -> AedatResult<Self> {
        let fd = std::fs::File::open(path)?;
        Self::new(BufReader::new(fd), size)
    }
}

impl<R: BufRead> AedatReader<R> {
    pub fn new(mut r: R, size: SensorSize) -> AedatResult<Self> {
        let first = read_header_line(&mut r)?;
        let variant = if first.starts_with("#!AER-DAT2.0") {
            AedatVariant::V2
        } else if first.starts_with("#!AER-DAT3.0") {
            AedatVariant::V3
        } else {
            return Err(AedatError::UnrecognizedHeader(first));
        };
        match variant {
            AedatVariant::V2 => {
                // Header is every leading line starting with '#'.
                loop {
                    let buf = r.fill_buf()?;
                    if buf.first() != Some(&b'#') {
                        break;
                    }
                    read_header_line(&mut r)?;
                }
            }
            AedatVariant::V3 => loop {
                let line = read_header_line(&mut r)?;
                if line.starts_with("#!END-HEADER") {
                    break;
                }
            },
        }
        Ok(Self { r, variant, size })
    }

    pub fn variant(&self) -> AedatVariant {
        self.variant
    }

    /// Read the next event, or `None` at a clean end of file.
    pub fn next_event(&mut self) -> AedatResult<Option<PolarityEvent>> {
        let mut buf = [0u8; 8];
        let mut n = 0;
        while n < buf.len() {
            let k = self.r.read(&mut buf[n..])?;
            if k == 0 {
                if n == 0 {
                    return Ok(None);
                }
                return Err(AedatError::PrematureFileEnd);
            }
            n += k;
        }
        let ev = match self.variant {
            AedatVariant::V2 => {
                let addr = BigEndian::read_u32(&buf[0..4]);
                let t = BigEndian::read_i32(&buf[4..8]);
                let (x, y, polarity) = decode_v2_address(addr, &self.size);
                PolarityEvent {
                    x,
                    y,
                    timestamp: t as i64,
                    polarity,
                }
            }
            AedatVariant::V3 => {
                let word = LittleEndian::read_u32(&buf[0..4]);
                let t = LittleEndian::read_i32(&buf[4..8]);
                let (x, y, polarity) = decode_v3_word(word);
                PolarityEvent {
                    x,
                    y,
                    timestamp: t as i64,
                    polarity,
                }
            }
        };
        Ok(Some(ev))
    }
}

impl<R: BufRead> Iterator for AedatReader<R> {
    type Item = AedatResult<PolarityEvent>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_event().transpose()
    }
}

fn read_header_line<R: BufRead>(r: &mut R) -> AedatResult<String> {
    let mut raw = Vec::new();
    let n = r.read_until(b'\n', &mut raw)?;
    if n == 0 {
        return Err(AedatError::PrematureFileEnd);
    }
    while raw.last() == Some(&b'\n') || raw.last() == Some(&b'\r') {
        raw.pop();
    }
    Ok(String::from_utf8_lossy(&raw).into_owned())
}
