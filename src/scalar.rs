//! Element types that can live in staging memory.

/// A plain scalar that can be stored in a [`StagingTile`](crate::StagingTile).
///
/// Staging cells are 64-bit atomic words so that every participant of a tile
/// can read and write through a shared handle; implementors describe how the
/// value round-trips through those bits.
pub trait StageScalar: Copy + Send + Sync + 'static {
    fn to_bits64(self) -> u64;
    fn from_bits64(bits: u64) -> Self;
}

macro_rules! impl_stage_int {
    ($($t:ty => $u:ty),*) => {
        $(impl StageScalar for $t {
            #[inline(always)]
            fn to_bits64(self) -> u64 {
                self as $u as u64
            }
            #[inline(always)]
            fn from_bits64(bits: u64) -> Self {
                bits as $u as $t
            }
        })*
    };
}

impl_stage_int!(
    i8 => u8, i16 => u16, i32 => u32, i64 => u64, isize => usize,
    u8 => u8, u16 => u16, u32 => u32, u64 => u64, usize => usize
);

impl StageScalar for f32 {
    #[inline(always)]
    fn to_bits64(self) -> u64 {
        self.to_bits() as u64
    }
    #[inline(always)]
    fn from_bits64(bits: u64) -> Self {
        f32::from_bits(bits as u32)
    }
}

impl StageScalar for f64 {
    #[inline(always)]
    fn to_bits64(self) -> u64 {
        self.to_bits()
    }
    #[inline(always)]
    fn from_bits64(bits: u64) -> Self {
        f64::from_bits(bits)
    }
}

impl StageScalar for bool {
    #[inline(always)]
    fn to_bits64(self) -> u64 {
        self as u64
    }
    #[inline(always)]
    fn from_bits64(bits: u64) -> Self {
        bits != 0
    }
}
