
/// Widening conversions that can not lose information on the platforms we support
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

impl SafeCast<usize> for u16 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

impl SafeCast<u64> for u32 {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}


/// For narrowing conversions where protocol logic guarantees that the value fits, e.g. a payload
///  length that was checked against the frame's 24-bit length limit. The implementations panic
///  if that guarantee is violated.
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: value range should have been checked before")
    }
}

impl PrecheckedCast<u16> for u32 {
    fn prechecked_cast(self) -> u16 {
        self.try_into().expect("this is a bug: value range should have been checked before")
    }
}
