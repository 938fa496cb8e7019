/// Widening casts that cannot lose information on the platforms we support
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

impl SafeCast<usize> for u16 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}


/// For narrowing casts where business logic ensures that the value is in the narrower type's range,
///  e.g. message lengths that were checked against the 16 bit length field.
/// NB: The implementations will panic otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}
impl PrecheckedCast<u16> for usize {
    fn prechecked_cast(self) -> u16 {
        self.try_into().expect("this is a bug: application logic should have ensured the value range")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_casts() {
        let len: usize = 65535;
        let narrowed: u16 = len.prechecked_cast();
        assert_eq!(narrowed, u16::MAX);
        let widened: usize = narrowed.safe_cast();
        assert_eq!(widened, 65535);
    }

    #[test]
    #[should_panic]
    fn test_prechecked_out_of_range() {
        let len: usize = 65536;
        let _: u16 = len.prechecked_cast();
    }
}
