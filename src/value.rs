//! NaN-boxed value representation for the Wisp VM.
//!
//! A [`Var`] packs every runtime value into 64 bits. IEEE-754 doubles leave
//! a large quiet-NaN payload space; the singletons live in the low tag bits
//! of a quiet NaN and heap references set the sign bit with the arena index
//! in the payload. The bit layout is private to this module; everything
//! else goes through the constructors and accessors.

use xxhash_rust::xxh3::xxh3_64;

/// Reference to an object slot in the VM heap arena.
///
/// `ObjRef` is plain data; dereferencing one always goes through the heap,
/// which keeps interior references traversable by the collector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(pub(crate) u32);

impl ObjRef {
    /// The raw arena index of this reference.
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Type enum of the first class types. `Object` isn't instanciable but is
/// considered first class: it is the root of the builtin class hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
#[repr(u8)]
pub enum VarKind {
    #[display(fmt = "Object")]
    Object = 0,
    #[display(fmt = "Null")]
    Null,
    #[display(fmt = "Bool")]
    Bool,
    #[display(fmt = "Number")]
    Number,
    #[display(fmt = "String")]
    String,
    #[display(fmt = "List")]
    List,
    #[display(fmt = "Map")]
    Map,
    #[display(fmt = "Range")]
    Range,
    #[display(fmt = "Module")]
    Module,
    #[display(fmt = "Closure")]
    Closure,
    #[display(fmt = "MethodBind")]
    MethodBind,
    #[display(fmt = "Fiber")]
    Fiber,
    #[display(fmt = "Class")]
    Class,
    #[display(fmt = "Instance")]
    Instance,
}

/// Number of builtin (non-instance) kinds, the size of the builtin class
/// table.
pub(crate) const BUILTIN_KIND_COUNT: usize = VarKind::Instance as usize;

const MASK_SIGN: u64 = 0x8000_0000_0000_0000;
const MASK_QNAN: u64 = 0x7ffc_0000_0000_0000;
const MASK_OBJECT: u64 = MASK_SIGN | MASK_QNAN;
const MASK_PAYLOAD: u64 = 0x0000_0000_ffff_ffff;

const TAG_NULL: u64 = 1;
const TAG_FALSE: u64 = 2;
const TAG_TRUE: u64 = 3;
const TAG_UNDEFINED: u64 = 4;

/// A single 64-bit tagged runtime value: a double, a singleton, or a heap
/// reference.
#[derive(Clone, Copy)]
pub struct Var(u64);

impl Var {
    /// The null value.
    pub const NULL: Var = Var(MASK_QNAN | TAG_NULL);
    /// The boolean true value.
    pub const TRUE: Var = Var(MASK_QNAN | TAG_TRUE);
    /// The boolean false value.
    pub const FALSE: Var = Var(MASK_QNAN | TAG_FALSE);
    /// Internal sentinel, never observable from user code. Marks empty map
    /// slots, absent globals and unbound receivers.
    pub const UNDEFINED: Var = Var(MASK_QNAN | TAG_UNDEFINED);

    /// Creates a number value.
    pub fn number(value: f64) -> Var {
        Var(value.to_bits())
    }

    /// Creates a boolean value.
    pub fn bool(value: bool) -> Var {
        if value {
            Var::TRUE
        } else {
            Var::FALSE
        }
    }

    /// Creates a heap reference value.
    pub fn object(obj: ObjRef) -> Var {
        Var(MASK_OBJECT | u64::from(obj.0))
    }

    /// Returns `true` when this value is a number.
    pub fn is_num(self) -> bool {
        (self.0 & MASK_QNAN) != MASK_QNAN
    }

    /// Returns the number payload.
    ///
    /// Debug-asserts the value is a number; in release the caller gets the
    /// raw bit reinterpretation.
    pub fn as_num(self) -> f64 {
        debug_assert!(self.is_num(), "Var wasn't a Number.");
        f64::from_bits(self.0)
    }

    /// Returns `true` when this value is null.
    pub fn is_null(self) -> bool {
        self.0 == Var::NULL.0
    }

    /// Returns `true` when this value is a boolean.
    pub fn is_bool(self) -> bool {
        self.0 == Var::TRUE.0 || self.0 == Var::FALSE.0
    }

    /// Returns the boolean payload. Debug-asserts the value is a boolean.
    pub fn as_bool(self) -> bool {
        debug_assert!(self.is_bool(), "Var wasn't a Bool.");
        self.0 == Var::TRUE.0
    }

    /// Returns `true` for the internal undefined sentinel.
    pub fn is_undef(self) -> bool {
        self.0 == Var::UNDEFINED.0
    }

    /// Returns `true` when this value is a heap reference.
    pub fn is_obj(self) -> bool {
        (self.0 & MASK_OBJECT) == MASK_OBJECT
    }

    /// Returns the heap reference payload. Debug-asserts the value is one.
    pub fn as_obj(self) -> ObjRef {
        debug_assert!(self.is_obj(), "Var wasn't an object reference.");
        ObjRef((self.0 & MASK_PAYLOAD) as u32)
    }

    /// Bit identity. Because every encoding is unique this is also semantic
    /// identity, except that `+0.0` and `-0.0` have distinct bits.
    pub fn same(self, other: Var) -> bool {
        self.0 == other.0
    }

    /// Hash of the value bits. Only meaningful for hashable non-object
    /// values; object hashing lives on the heap where the payload is
    /// reachable.
    pub(crate) fn bits_hash(self) -> u32 {
        hash_bits(self.0)
    }
}

/// Shallow equality: bit identity, with a numeric fallback so that `+0.0`
/// and `-0.0` compare equal. Deep (structural) equality for containers
/// needs the heap and lives there.
impl PartialEq for Var {
    fn eq(&self, other: &Self) -> bool {
        if self.0 == other.0 {
            return true;
        }
        self.is_num() && other.is_num() && self.as_num() == other.as_num()
    }
}

impl std::fmt::Debug for Var {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_num() {
            write!(f, "Var({})", self.as_num())
        } else if self.is_null() {
            write!(f, "Var(null)")
        } else if self.is_bool() {
            write!(f, "Var({})", self.as_bool())
        } else if self.is_undef() {
            write!(f, "Var(undefined)")
        } else {
            write!(f, "Var(obj #{})", self.as_obj().0)
        }
    }
}

/// Hashes a 64-bit pattern down to 32 bits.
pub(crate) fn hash_bits(bits: u64) -> u32 {
    xxh3_64(&bits.to_le_bytes()) as u32
}

/// Hashes a double by its bit pattern, folding `-0.0` onto `+0.0` so that
/// equal numbers hash equally.
pub(crate) fn hash_number(value: f64) -> u32 {
    let value = if value == 0.0 { 0.0 } else { value };
    hash_bits(value.to_bits())
}

/// Hashes string content. Strings precompute this at construction.
pub(crate) fn hash_string(data: &str) -> u32 {
    xxh3_64(data.as_bytes()) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_number_roundtrip() {
        for n in [0.0, -0.0, 1.5, -3.25, f64::MAX, f64::MIN_POSITIVE] {
            let v = Var::number(n);
            assert!(v.is_num());
            assert!(!v.is_obj() && !v.is_bool() && !v.is_null());
            assert_eq!(v.as_num().to_bits(), n.to_bits());
        }
    }

    #[test]
    fn test_nan_stays_a_number() {
        let v = Var::number(f64::NAN);
        assert!(v.is_num());
        assert!(v.as_num().is_nan());
    }

    #[test]
    fn test_singletons_are_distinct() {
        let singletons = [Var::NULL, Var::TRUE, Var::FALSE, Var::UNDEFINED];
        for (i, a) in singletons.iter().enumerate() {
            for (j, b) in singletons.iter().enumerate() {
                assert_eq!(a.same(*b), i == j);
            }
            assert!(!a.is_num());
            assert!(!a.is_obj());
        }
        assert!(Var::NULL.is_null());
        assert!(Var::TRUE.is_bool() && Var::TRUE.as_bool());
        assert!(Var::FALSE.is_bool() && !Var::FALSE.as_bool());
        assert!(Var::UNDEFINED.is_undef());
    }

    #[test]
    fn test_object_roundtrip() {
        for idx in [0u32, 1, 255, u32::MAX] {
            let v = Var::object(ObjRef(idx));
            assert!(v.is_obj());
            assert!(!v.is_num());
            assert_eq!(v.as_obj(), ObjRef(idx));
        }
    }

    #[test]
    fn test_signed_zero_equality() {
        let pos = Var::number(0.0);
        let neg = Var::number(-0.0);
        assert!(!pos.same(neg));
        assert_eq!(pos, neg);
        assert_eq!(hash_number(0.0), hash_number(-0.0));
    }

    #[test]
    fn test_equal_numbers_hash_equal() {
        assert_eq!(hash_number(42.0), hash_number(42.0));
        assert_ne!(hash_number(1.0), hash_number(2.0));
    }
}
