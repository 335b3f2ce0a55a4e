//! Matrix commands.

use tracing::{trace, warn};

use crate::{
    System,
    system::{
        math::{self, IDENTITY, Kernel, MATRIX_LEN, Matrix},
        mem::{MemoryError, Rdram},
        rsp::State,
    },
};

/// Reads a guest matrix at a physical address.
pub fn read(mem: &Rdram, address: u32) -> Result<Matrix, MemoryError> {
    let bytes = mem.slice(address, MATRIX_LEN)?;
    let mut raw = [0; MATRIX_LEN];
    raw.copy_from_slice(bytes);
    Ok(math::decode_matrix(&raw))
}

/// Rebuilds the combined matrix if the model view or projection changed.
#[inline(always)]
pub fn combine(kernel: &dyn Kernel, rsp: &mut State) {
    if rsp.changed.matrix() {
        let m = &mut rsp.matrix;
        m.combined = kernel.mult_matrix(&m.modelview[m.index], &m.projection);
        rsp.changed.set_matrix(false);
    }
}

pub fn matrix(sys: &mut System, address: u32, projection: bool, load: bool, push: bool) {
    let address = sys.rsp.segment_address(address);
    let mtx = match read(&sys.mem, address) {
        Ok(mtx) => mtx,
        Err(e) => {
            warn!("matrix load failed: {e}");
            return;
        }
    };

    let kernel = sys.kernel;
    let m = &mut sys.rsp.matrix;
    if projection {
        if load {
            m.projection = mtx;
        } else {
            kernel.mult_matrix_in_place(&mut m.projection, &mtx);
        }
    } else {
        if push {
            if m.index < m.stack_size {
                m.modelview[m.index + 1] = m.modelview[m.index];
                m.index += 1;
            } else {
                warn!(depth = m.index, "model view stack overflow");
            }
        }

        let top = &mut m.modelview[m.index];
        if load {
            *top = mtx;
        } else {
            kernel.mult_matrix_in_place(top, &mtx);
        }

        sys.rsp.changed.set_light(true);
        sys.rsp.changed.set_lookat(true);
    }

    sys.rsp.changed.set_matrix(true);
    trace!(projection, load, push, "matrix");
}

/// Loads or multiplies a model view slot through the DMA offset. Used by Diddy Kong Racing.
pub fn dma_matrix(sys: &mut System, address: u32, index: u8, multiply: bool) {
    let address = sys.rsp.dma.matrix.wrapping_add(sys.rsp.segment_address(address));
    let mtx = match read(&sys.mem, address) {
        Ok(mtx) => mtx,
        Err(e) => {
            warn!("matrix load failed: {e}");
            return;
        }
    };

    let m = &mut sys.rsp.matrix;
    let value = if multiply {
        sys.kernel.mult_matrix(&mtx, &m.modelview[0])
    } else {
        mtx
    };

    m.index = index as usize % m.modelview.len();
    m.modelview[m.index] = value;
    m.projection = IDENTITY;

    let changed = &mut sys.rsp.changed;
    changed.set_matrix(true);
    changed.set_light(true);
    changed.set_lookat(true);
}

/// Replaces the combined matrix directly.
pub fn force_matrix(sys: &mut System, address: u32) {
    let address = sys.rsp.segment_address(address);
    match read(&sys.mem, address) {
        Ok(mtx) => {
            sys.rsp.matrix.combined = mtx;
            sys.rsp.changed.set_matrix(false);
        }
        Err(e) => warn!("matrix load failed: {e}"),
    }
}

pub fn pop_matrix(sys: &mut System, count: u32) {
    let m = &mut sys.rsp.matrix;
    if m.index >= count as usize {
        m.index -= count as usize;

        let changed = &mut sys.rsp.changed;
        changed.set_matrix(true);
        changed.set_light(true);
        changed.set_lookat(true);
    } else {
        warn!(depth = m.index, count, "model view stack underflow");
    }
}

/// Overwrites two elements of the combined matrix. Offsets below 0x20 replace integer parts,
/// the rest replace fractional parts.
pub fn insert_matrix(sys: &mut System, offset: u32, value: u32) {
    if offset & 3 != 0 || offset > 0x3C {
        warn!(offset, "invalid matrix insertion");
        return;
    }

    let combined = &mut sys.rsp.matrix.combined;
    let mut set = |index: usize, half: u16| {
        let element = &mut combined[index / 4][index % 4];
        let fraction = element.fract();
        let integer = element.trunc();

        *element = if offset < 0x20 {
            half as i16 as f32 + fraction.abs()
        } else {
            let mut new = integer + half as f32 / 65536.0;
            // keep the sign of values between -1 and 0
            if integer == 0.0 && fraction != 0.0 {
                new *= fraction.signum();
            }
            new
        };
    };

    let index = ((offset & 0x1F) >> 1) as usize;
    set(index, (value >> 16) as u16);
    set(index + 1, value as u16);

    sys.rsp.changed.set_matrix(false);
}
