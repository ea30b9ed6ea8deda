use serde::Deserialize;

use dvs_flow_types::SensorSize;

use crate::errors::{Error, Result};

/// Read-only pixel-to-undistorted-pixel lookup, loaded once at startup from
/// a calibration table.
///
/// Out-of-range lookups return the center of the image.
pub struct UndistortionMap {
    size: SensorSize,
    map_x: Vec<f32>,
    map_y: Vec<f32>,
    center_x: f32,
    center_y: f32,
}

#[derive(Debug, Deserialize)]
struct TableRow {
    x: u16,
    y: u16,
    xu: f32,
    yu: f32,
}

impl UndistortionMap {
    /// A map for an ideal lens: every pixel maps to itself.
    pub fn identity(size: SensorSize) -> Self {
        let mut map_x = Vec::with_capacity(size.n_pixels());
        let mut map_y = Vec::with_capacity(size.n_pixels());
        for y in 0..size.height {
            for x in 0..size.width {
                map_x.push(x as f32);
                map_y.push(y as f32);
            }
        }
        Self::with_tables(size, map_x, map_y)
    }

    /// Build from precomputed W*H tables in row-major order.
    pub fn from_tables(size: SensorSize, map_x: Vec<f32>, map_y: Vec<f32>) -> Result<Self> {
        let expected = size.n_pixels();
        if map_x.len() != expected || map_y.len() != expected {
            return Err(Error::CalibrationSize {
                got: map_x.len().min(map_y.len()),
                expected,
            });
        }
        Ok(Self::with_tables(size, map_x, map_y))
    }

    /// Load a CSV calibration table with `x,y,xu,yu` rows. Pixels absent
    /// from the table keep their identity mapping.
    pub fn from_csv_reader<R: std::io::Read>(size: SensorSize, rdr: R) -> Result<Self> {
        let mut map = Self::identity(size);
        let mut csv_rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .comment(Some(b'#'))
            .from_reader(rdr);
        for row in csv_rdr.deserialize() {
            let row: TableRow = row?;
            if !size.contains(row.x, row.y) {
                return Err(Error::CalibrationEntryOutOfRange {
                    x: row.x,
                    y: row.y,
                    width: size.width,
                    height: size.height,
                });
            }
            let idx = row.y as usize * size.width as usize + row.x as usize;
            map.map_x[idx] = row.xu;
            map.map_y[idx] = row.yu;
        }
        Ok(map)
    }

    fn with_tables(size: SensorSize, map_x: Vec<f32>, map_y: Vec<f32>) -> Self {
        Self {
            size,
            map_x,
            map_y,
            center_x: (size.width as f32 - 1.0) * 0.5,
            center_y: (size.height as f32 - 1.0) * 0.5,
        }
    }

    pub fn size(&self) -> SensorSize {
        self.size
    }

    /// Undistorted x coordinate of integer pixel (x,y).
    #[inline]
    pub fn ux(&self, x: u16, y: u16) -> f32 {
        if !self.size.contains(x, y) {
            return self.center_x;
        }
        self.map_x[y as usize * self.size.width as usize + x as usize]
    }

    /// Undistorted y coordinate of integer pixel (x,y).
    #[inline]
    pub fn uy(&self, x: u16, y: u16) -> f32 {
        if !self.size.contains(x, y) {
            return self.center_y;
        }
        self.map_y[y as usize * self.size.width as usize + x as usize]
    }
}
