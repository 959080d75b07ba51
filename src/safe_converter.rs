//! Conversions between `usize` (buffer lengths and slice indices) and `u32` (message lengths and
//!  positions on the wire).

/// Widening conversion that can not fail on the supported platforms
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

/// Wire positions are used to index into payload buffers
#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

/// Narrowing conversion for values whose range was checked before, e.g. payload lengths which
///  [crate::end_point::EndPoint::send_message] limits to `u32::MAX`.
///
/// NB: Panics if the value is out of range, since that means a missing check elsewhere
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}

impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        match u32::try_from(self) {
            Ok(value) => value,
            Err(_) => panic!("this is a bug: length or position {} does not fit into a u32 - it should have been rejected earlier", self),
        }
    }
}
