use std::{
    fmt,
    ops::{Add, AddAssign, Sub},
};

/// Byte offset applied while walking a pointer chain.
pub type Offset = usize;

/// A location in the current process's address space.
///
/// Wraps the raw numeric address so the accessor API can't confuse addresses
/// with sizes or offsets. Zero is the null address and is rejected by every
/// checked accessor entry point.
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(usize);

impl Address {
    pub const NULL: Self = Self(0);

    #[inline]
    pub const fn new(value: usize) -> Self {
        Self(value)
    }

    /// Address of a live value. Mostly useful for tests and for hooking
    /// structures the host process itself owns.
    #[inline]
    pub fn of<T>(value: &T) -> Self {
        Self(value as *const T as usize)
    }

    #[inline]
    pub const fn get(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline]
    pub fn checked_add(self, offset: Offset) -> Option<Self> {
        self.0.checked_add(offset).map(Self)
    }

    #[inline]
    pub fn wrapping_add(self, offset: Offset) -> Self {
        Self(self.0.wrapping_add(offset))
    }

    /// Offset of `self` past the start of the region beginning at `base`.
    #[inline]
    pub fn offset_in(self, base: Address) -> Offset {
        self.0.wrapping_sub(base.0)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Address")
            .field(&format_args!("{:#x}", self.0))
            .finish()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<usize> for Address {
    fn from(value: usize) -> Self {
        Self(value)
    }
}

impl From<Address> for usize {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

impl<T> From<*const T> for Address {
    fn from(ptr: *const T) -> Self {
        Self(ptr as usize)
    }
}

impl<T> From<*mut T> for Address {
    fn from(ptr: *mut T) -> Self {
        Self(ptr as usize)
    }
}

/// Address arithmetic wraps; chains walk whatever values the target process
/// holds, including values that would overflow a signed offset.
impl Add<Offset> for Address {
    type Output = Address;

    fn add(self, offset: Offset) -> Address {
        self.wrapping_add(offset)
    }
}

impl AddAssign<Offset> for Address {
    fn add_assign(&mut self, offset: Offset) {
        *self = *self + offset;
    }
}

impl Sub<Offset> for Address {
    type Output = Address;

    fn sub(self, offset: Offset) -> Address {
        Address(self.0.wrapping_sub(offset))
    }
}

impl Sub<Address> for Address {
    type Output = Offset;

    fn sub(self, other: Address) -> Offset {
        self.0.wrapping_sub(other.0)
    }
}

#[cfg(test)]
mod test {
    use super::Address;

    #[test]
    fn null_is_falsy() {
        assert!(Address::NULL.is_null());
        assert!(Address::new(0).is_null());
        assert!(!Address::new(0x1000).is_null());
        assert_eq!(Address::default(), Address::NULL);
    }

    #[test]
    fn arithmetic() {
        let base = Address::new(0x1000);

        assert_eq!(base + 0x10, Address::new(0x1010));
        assert_eq!(base - 0x10, Address::new(0xff0));
        assert_eq!((base + 0x20) - base, 0x20);
        assert_eq!(Address::new(usize::MAX) + 1, Address::NULL);
        assert_eq!(Address::new(usize::MAX).checked_add(1), None);

        let mut cursor = base;
        cursor += 0x8;
        assert_eq!(cursor.get(), 0x1008);
    }

    #[test]
    fn pointer_round_trip() {
        let value = 7u64;
        let addr = Address::of(&value);

        assert!(!addr.is_null());
        assert_eq!(addr, Address::from(&value as *const u64));
        assert_eq!(unsafe { *addr.as_ptr::<u64>() }, 7);
    }

    #[test]
    fn display_is_hex() {
        assert_eq!(Address::new(0xdead_beef).to_string(), "0xdeadbeef");
        assert_eq!(format!("{:?}", Address::new(0x10)), "Address(0x10)");
    }
}
