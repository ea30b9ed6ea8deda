use crate::errors::{Error, Result};

/// Largest supported kernel half-size.
pub const MAX_KERNEL_DX: u8 = 5;

/// Offset count of the largest kernel, `(2*MAX_KERNEL_DX+1)^2 - 1`. Sizes
/// the fitter's stack buffers.
pub const MAX_KERNEL_LEN: usize = 120;

/// Precomputed relative neighbor offsets searched around each event.
///
/// For half-size `dx` the kernel holds every `(dx,dy)` pair with
/// `max(|dx|,|dy|) <= dx` except `(0,0)`, in a stable iteration order. It is
/// regenerated whenever the half-size changes.
pub struct SearchKernel {
    half_size: u8,
    offsets: Vec<(i8, i8)>,
}

impl SearchKernel {
    pub fn new(half_size: u8) -> Result<Self> {
        if half_size < 1 || half_size > MAX_KERNEL_DX {
            return Err(Error::InvalidKernelDx(half_size));
        }
        let r = half_size as i8;
        let mut offsets = Vec::with_capacity((2 * half_size as usize + 1).pow(2) - 1);
        for dx in -r..=r {
            for dy in -r..=r {
                if dx == 0 && dy == 0 {
                    continue;
                }
                offsets.push((dx, dy));
            }
        }
        Ok(Self { half_size, offsets })
    }

    pub fn half_size(&self) -> u8 {
        self.half_size
    }

    pub fn offsets(&self) -> &[(i8, i8)] {
        &self.offsets
    }

    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}
