use std::fmt;

const LOGICAL_BITS: u32 = 12;
const LOGICAL_MASK: u64 = (1 << LOGICAL_BITS) - 1;

/// HybridTime packs a physical microsecond timestamp with a 12 bit logical counter.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HybridTime(u64);

impl HybridTime {
    pub const MIN: HybridTime = HybridTime(0);
    pub const MAX: HybridTime = HybridTime(u64::MAX - 1);
    pub const INVALID: HybridTime = HybridTime(u64::MAX);

    pub const fn from_u64(value: u64) -> Self {
        HybridTime(value)
    }

    pub fn from_micros(micros: u64) -> Self {
        HybridTime(micros << LOGICAL_BITS)
    }

    pub fn from_micros_and_logical(micros: u64, logical: u64) -> Self {
        HybridTime((micros << LOGICAL_BITS) | (logical & LOGICAL_MASK))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }

    pub fn physical_micros(&self) -> u64 {
        self.0 >> LOGICAL_BITS
    }

    pub fn logical(&self) -> u64 {
        self.0 & LOGICAL_MASK
    }

    pub fn is_valid(&self) -> bool {
        *self != HybridTime::INVALID
    }

    pub fn make_at_least(&mut self, other: HybridTime) {
        if other.is_valid() && (!self.is_valid() || other > *self) {
            *self = other;
        }
    }

    pub fn make_at_most(&mut self, other: HybridTime) {
        if other.is_valid() && (!self.is_valid() || other < *self) {
            *self = other;
        }
    }
}

impl Default for HybridTime {
    fn default() -> Self {
        HybridTime::INVALID
    }
}

impl fmt::Debug for HybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            HybridTime::INVALID => write!(f, "<invalid>"),
            HybridTime::MIN => write!(f, "<min>"),
            HybridTime::MAX => write!(f, "<max>"),
            ht if ht.logical() == 0 => write!(f, "{{ physical: {} }}", ht.physical_micros()),
            ht => write!(
                f,
                "{{ physical: {} logical: {} }}",
                ht.physical_micros(),
                ht.logical()
            ),
        }
    }
}

impl fmt::Display for HybridTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
