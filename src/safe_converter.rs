//! Integer conversions that are checked once, in one place, instead of sprinkling `as` casts
//!  through the buffer code.

pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

impl SafeCast<u64> for u32 {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}

impl SafeCast<u64> for usize {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}

impl SafeCast<i64> for u32 {
    fn safe_cast(self) -> i64 {
        self as i64
    }
}


/// For narrowing casts where business logic ensures that the value is in the narrower type's range.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
impl PrecheckedCast<i32> for usize {
    fn prechecked_cast(self) -> i32 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
impl PrecheckedCast<usize> for i32 {
    fn prechecked_cast(self) -> usize {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
impl PrecheckedCast<usize> for u64 {
    fn prechecked_cast(self) -> usize {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
impl PrecheckedCast<i64> for u64 {
    fn prechecked_cast(self) -> i64 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
impl PrecheckedCast<u64> for u128 {
    fn prechecked_cast(self) -> u64 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widening() {
        assert_eq!(<u32 as SafeCast<u64>>::safe_cast(u32::MAX), 0xffff_ffff_u64);
        assert_eq!(<usize as SafeCast<u64>>::safe_cast(usize::MAX), usize::MAX as u64);
        assert_eq!(<u32 as SafeCast<i64>>::safe_cast(u32::MAX), 0xffff_ffff_i64);
    }

    #[test]
    fn test_prechecked_in_range() {
        assert_eq!(<u64 as PrecheckedCast<i64>>::prechecked_cast(1 << 40), 1_i64 << 40);
        assert_eq!(<u128 as PrecheckedCast<u64>>::prechecked_cast(120_000), 120_000_u64);
        assert_eq!(<u64 as PrecheckedCast<usize>>::prechecked_cast(1316), 1316_usize);
    }

    #[test]
    #[should_panic]
    fn test_prechecked_out_of_range() {
        let _: i32 = usize::MAX.prechecked_cast();
    }

    #[test]
    #[should_panic]
    fn test_prechecked_sign_overflow() {
        let _: i64 = u64::MAX.prechecked_cast();
    }
}
