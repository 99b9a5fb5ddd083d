/// Integer widths the memory model reads and writes.
pub trait MemValue: Copy + Send + 'static + sealed::Sealed {
    const SIZE: usize;

    /// # Safety
    /// `p` must be valid for `SIZE` bytes.
    unsafe fn load(p: *const u8) -> Self;

    /// # Safety
    /// `p` must be valid for `SIZE` bytes of writes.
    unsafe fn store(p: *mut u8, v: Self);

    fn to_u128(self) -> u128;
    fn from_u128(v: u128) -> Self;
}

mod sealed {
    pub trait Sealed {}
}

macro_rules! impl_mem_value {
    ($($t:ty),*) => {$(
        impl sealed::Sealed for $t {}

        impl MemValue for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            #[inline]
            unsafe fn load(p: *const u8) -> Self {
                <$t>::from_le((p as *const $t).read_unaligned())
            }

            #[inline]
            unsafe fn store(p: *mut u8, v: Self) {
                (p as *mut $t).write_unaligned(v.to_le())
            }

            #[inline]
            fn to_u128(self) -> u128 {
                self as u128
            }

            #[inline]
            fn from_u128(v: u128) -> Self {
                v as $t
            }
        }
    )*};
}

impl_mem_value!(u8, u16, u32, u64, u128);
