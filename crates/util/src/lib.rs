/// Returns a `Box<[T; LEN]>` filled with `elem`.
#[inline(always)]
pub fn boxed_array<T: Clone, const LEN: usize>(elem: T) -> Box<[T; LEN]> {
    let boxed = vec![elem; LEN].into_boxed_slice();
    match boxed.try_into() {
        Ok(array) => array,
        Err(_) => unreachable!("vec has exactly LEN elements"),
    }
}

/// Sign extends the lowest `BITS` bits of `value`.
#[inline(always)]
pub const fn sign_extend<const BITS: u32>(value: u32) -> i32 {
    const {
        assert!(BITS > 0 && BITS <= 32);
    };

    let shift = 32 - BITS;
    ((value << shift) as i32) >> shift
}

/// Converts a signed fixed point value with `FRAC` fractional bits into a float.
#[inline(always)]
pub fn fixed_to_f32<const FRAC: u32>(value: i32) -> f32 {
    value as f32 / (1u32 << FRAC) as f32
}

/// Converts an unsigned fixed point value with `FRAC` fractional bits into a float.
#[inline(always)]
pub fn ufixed_to_f32<const FRAC: u32>(value: u32) -> f32 {
    value as f32 / (1u32 << FRAC) as f32
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sign_extension() {
        assert_eq!(sign_extend::<12>(0x800), -2048);
        assert_eq!(sign_extend::<12>(0x7FF), 2047);
        assert_eq!(sign_extend::<16>(0xFFFF), -1);
        assert_eq!(sign_extend::<32>(0x8000_0000), i32::MIN);
    }

    #[test]
    fn fixed_point() {
        assert_eq!(fixed_to_f32::<2>(-6), -1.5);
        assert_eq!(ufixed_to_f32::<10>(0x400), 1.0);
        assert_eq!(ufixed_to_f32::<5>(48), 1.5);
    }

    #[test]
    fn boxed() {
        let array = boxed_array::<u8, 80>(7);
        assert!(array.iter().all(|&x| x == 7));
    }
}
