use dvs_flow_types::SensorSize;

/// Dense per-pixel memory of the most recent admitted event timestamp for
/// one polarity.
///
/// Reads and writes are bounds-tolerant: out-of-range reads return zero and
/// out-of-range writes are no-ops, so the kernel iterator needs no edge
/// tests. A cell value of zero means the pixel has never been touched.
pub struct TimestampMap {
    size: SensorSize,
    data: Vec<i64>,
}

impl TimestampMap {
    pub fn new(size: SensorSize) -> Self {
        Self {
            size,
            data: vec![0; size.n_pixels()],
        }
    }

    pub fn size(&self) -> SensorSize {
        self.size
    }

    #[inline]
    pub fn get(&self, x: i32, y: i32) -> i64 {
        if x < 0 || y < 0 || x >= self.size.width as i32 || y >= self.size.height as i32 {
            return 0;
        }
        self.data[y as usize * self.size.width as usize + x as usize]
    }

    #[inline]
    pub fn set(&mut self, x: i32, y: i32, t: i64) {
        if x < 0 || y < 0 || x >= self.size.width as i32 || y >= self.size.height as i32 {
            return;
        }
        self.data[y as usize * self.size.width as usize + x as usize] = t;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_of_bounds_reads_are_zero() {
        let mut map = TimestampMap::new(SensorSize::new(4, 3));
        map.set(3, 2, 77);
        assert_eq!(map.get(3, 2), 77);
        assert_eq!(map.get(-1, 0), 0);
        assert_eq!(map.get(0, -1), 0);
        assert_eq!(map.get(4, 0), 0);
        assert_eq!(map.get(0, 3), 0);
    }

    #[test]
    fn out_of_bounds_writes_are_noops() {
        let mut map = TimestampMap::new(SensorSize::new(4, 3));
        map.set(4, 0, 123);
        map.set(-1, -1, 123);
        for y in 0..3 {
            for x in 0..4 {
                assert_eq!(map.get(x, y), 0);
            }
        }
    }
}
