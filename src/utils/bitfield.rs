/// Compile-time description of a bit range inside a machine word.
///
/// `BitField<SIZE, POSITION>` covers `SIZE` bits starting at bit `POSITION`.
/// All header layouts in this crate are spelled in terms of it so that the
/// masks and shifts are derived in exactly one place.
pub struct BitField<const SIZE: usize, const POSITION: usize>;

impl<const SIZE: usize, const POSITION: usize> BitField<SIZE, POSITION> {
    pub const NEXT_BIT: usize = POSITION + SIZE;

    #[inline(always)]
    pub const fn mask() -> usize {
        if SIZE >= usize::BITS as usize {
            usize::MAX
        } else {
            (1 << SIZE) - 1
        }
    }
    #[inline(always)]
    pub const fn mask_in_place() -> usize {
        Self::mask() << POSITION
    }
    #[inline(always)]
    pub const fn shift() -> usize {
        POSITION
    }
    #[inline(always)]
    pub const fn is_valid(value: usize) -> bool {
        Self::decode(Self::encode(value)) == value
    }
    #[inline(always)]
    pub const fn decode(value: usize) -> usize {
        (value >> POSITION) & Self::mask()
    }
    #[inline(always)]
    pub const fn encode(value: usize) -> usize {
        (value & Self::mask()) << POSITION
    }
    #[inline(always)]
    pub const fn update(value: usize, original: usize) -> usize {
        Self::encode(value) | (!Self::mask_in_place() & original)
    }
}
