//! The object arena: allocation list, byte accounting, handles and temp
//! references.
//!
//! Objects live in slots of a single arena owned by the VM. Each slot
//! carries the common object header (mark bit, next-in-allocation-list);
//! interior references are [`ObjRef`] indices resolved through the arena so
//! the collector can traverse cycles. The collector itself lives in
//! [`crate::gc`].

use crate::object::{Object, UpvalueSlot};
use crate::value::{hash_bits, hash_number, ObjRef, Var, VarKind};

/// Minimum size the heap can get before a collection is considered.
pub const MIN_HEAP_SIZE: usize = 1024 * 1024;

/// The next collection triggers when the live bytes grow by this percent
/// beyond the last measurement.
pub const HEAP_FILL_PERCENT: usize = 50;

/// A GC root owned by the host. The referenced value stays alive until the
/// handle is released with [`crate::vm::Vm::release_handle`]; every handle
/// must be released before the VM is dropped.
#[derive(Debug)]
pub struct Handle {
    pub(crate) index: u32,
}

pub(crate) struct HeapEntry {
    pub(crate) marked: bool,
    pub(crate) next: Option<ObjRef>,
    pub(crate) object: Object,
}

/// The VM heap: arena slots, the allocation list, handle slab and the
/// temporary reference stack.
pub struct Heap {
    pub(crate) entries: Vec<Option<HeapEntry>>,
    pub(crate) free: Vec<u32>,
    /// Head of the allocation list; new objects are prepended.
    pub(crate) first: Option<ObjRef>,

    /// Bytes allocated and not (yet) garbage collected.
    pub(crate) bytes_allocated: usize,
    /// The byte total that triggers the next collection.
    pub(crate) next_gc: usize,
    pub(crate) min_heap_size: usize,
    pub(crate) heap_fill_percent: usize,
    /// True while a collection runs; no allocation is allowed then.
    pub(crate) collecting: bool,

    /// The gray worklist of the tri-color mark phase.
    pub(crate) working_set: Vec<ObjRef>,
    /// Objects pinned by constructors while they are otherwise unreachable.
    pub(crate) temp_refs: Vec<ObjRef>,

    /// Handle slab; a live slot is a GC root.
    pub(crate) handles: Vec<Option<Var>>,
    pub(crate) handle_free: Vec<u32>,
}

impl Heap {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            free: Vec::new(),
            first: None,
            bytes_allocated: 0,
            next_gc: MIN_HEAP_SIZE,
            min_heap_size: MIN_HEAP_SIZE,
            heap_fill_percent: HEAP_FILL_PERCENT,
            collecting: false,
            working_set: Vec::new(),
            temp_refs: Vec::new(),
            handles: Vec::new(),
            handle_free: Vec::new(),
        }
    }

    /// Inserts `object` into the arena and prepends it to the allocation
    /// list. Collection decisions happen in the caller; allocating while a
    /// collection runs is a programmer error.
    pub(crate) fn insert(&mut self, object: Object) -> ObjRef {
        debug_assert!(!self.collecting, "Allocation during garbage collection.");

        self.bytes_allocated += object.shallow_size();

        let entry = HeapEntry {
            marked: false,
            next: self.first,
            object,
        };

        let index = match self.free.pop() {
            Some(index) => {
                self.entries[index as usize] = Some(entry);
                index
            }
            None => {
                self.entries.push(Some(entry));
                (self.entries.len() - 1) as u32
            }
        };

        let obj = ObjRef(index);
        self.first = Some(obj);
        obj
    }

    /// Records container growth for the collection trigger.
    pub(crate) fn add_bytes(&mut self, bytes: usize) {
        self.bytes_allocated += bytes;
    }

    /// The current allocation estimate.
    pub fn bytes_allocated(&self) -> usize {
        self.bytes_allocated
    }

    /// Number of live objects in the arena.
    pub fn object_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    /// Returns `true` when the next allocation should collect first.
    pub(crate) fn wants_collection(&self) -> bool {
        self.bytes_allocated > self.next_gc
    }

    /// Resolves a reference. A stale reference is a programmer error.
    pub fn get(&self, obj: ObjRef) -> &Object {
        &self.entries[obj.index()]
            .as_ref()
            .expect("Use of a collected object reference.")
            .object
    }

    /// Resolves a reference mutably.
    pub fn get_mut(&mut self, obj: ObjRef) -> &mut Object {
        &mut self.entries[obj.index()]
            .as_mut()
            .expect("Use of a collected object reference.")
            .object
    }

    /// Returns `true` when the reference still points at a live object.
    pub fn is_live(&self, obj: ObjRef) -> bool {
        self.entries
            .get(obj.index())
            .map(|e| e.is_some())
            .unwrap_or(false)
    }

    /// The first-class kind of a value.
    pub fn kind_of(&self, value: Var) -> VarKind {
        if value.is_null() {
            VarKind::Null
        } else if value.is_bool() {
            VarKind::Bool
        } else if value.is_num() {
            VarKind::Number
        } else {
            debug_assert!(value.is_obj());
            self.get(value.as_obj()).kind()
        }
    }

    /// The display type name of a value; instances report their class name.
    pub fn value_type_name(&self, value: Var) -> String {
        if value.is_null() {
            return "Null".to_string();
        }
        if value.is_bool() {
            return "Bool".to_string();
        }
        if value.is_num() {
            return "Number".to_string();
        }
        match self.get(value.as_obj()) {
            Object::Instance(instance) => {
                self.string(self.class(instance.class).name).as_str().to_string()
            }
            object => object.type_name().to_string(),
        }
    }

    /// Returns `true` when `value` can be used as a map key.
    pub fn is_hashable(&self, value: Var) -> bool {
        if value.is_obj() {
            self.get(value.as_obj()).is_hashable()
        } else {
            !value.is_undef()
        }
    }

    /// Hashes a hashable value. Check hashability first; an unhashable
    /// value here is a programmer error.
    pub fn hash_value(&self, value: Var) -> u32 {
        if value.is_num() {
            return hash_number(value.as_num());
        }
        if !value.is_obj() {
            return value.bits_hash();
        }
        match self.get(value.as_obj()) {
            Object::String(s) => s.hash(),
            Object::Range(r) => hash_number(r.from()) ^ hash_number(r.to()),
            Object::Class(_) => hash_bits(u64::from(value.as_obj().0)),
            _ => unreachable!("Check hashability before hashing."),
        }
    }

    /// Structural equality: bit identity, the signed-zero rule, then deep
    /// comparison for strings, ranges, lists and maps.
    pub fn values_equal(&self, v1: Var, v2: Var) -> bool {
        if v1.same(v2) {
            return true;
        }
        // +0.0 and -0.0 have different bit representations.
        if v1.is_num() && v2.is_num() {
            return v1.as_num() == v2.as_num();
        }
        if !v1.is_obj() || !v2.is_obj() {
            return false;
        }

        match (self.get(v1.as_obj()), self.get(v2.as_obj())) {
            (Object::Range(r1), Object::Range(r2)) => {
                r1.from() == r2.from() && r1.to() == r2.to()
            }
            (Object::String(s1), Object::String(s2)) => {
                s1.hash() == s2.hash() && s1.as_str() == s2.as_str()
            }
            (Object::List(l1), Object::List(l2)) => {
                if l1.len() != l2.len() {
                    return false;
                }
                l1.as_slice()
                    .iter()
                    .zip(l2.as_slice())
                    .all(|(a, b)| self.values_equal(*a, *b))
            }
            (Object::Map(m1), Object::Map(_)) => {
                if m1.len() != self.map(v2.as_obj()).len() {
                    return false;
                }
                for entry in &m1.entries {
                    if entry.key.is_undef() {
                        continue;
                    }
                    let other = self.map_get(v2.as_obj(), entry.key);
                    if other.is_undef() || !self.values_equal(entry.value, other) {
                        return false;
                    }
                }
                true
            }
            _ => false,
        }
    }

    /// Truthiness of a value.
    pub fn to_bool(&self, value: Var) -> bool {
        if value.is_bool() {
            return value.as_bool();
        }
        if value.is_null() {
            return false;
        }
        if value.is_num() {
            return value.as_num() != 0.0;
        }
        debug_assert!(value.is_obj());
        match self.get(value.as_obj()) {
            Object::String(s) => !s.is_empty(),
            Object::List(l) => !l.is_empty(),
            Object::Map(m) => !m.is_empty(),
            _ => true,
        }
    }
}

// Typed accessors. A kind mismatch is a programmer error, caught by the
// unreachable branch.
macro_rules! typed_accessors {
    ($get:ident, $get_mut:ident, $variant:ident, $ty:ty) => {
        impl Heap {
            #[doc = concat!("Resolves a reference known to be a ", stringify!($variant), ".")]
            pub fn $get(&self, obj: ObjRef) -> &$ty {
                match self.get(obj) {
                    Object::$variant(inner) => inner,
                    other => unreachable!(
                        "Expected {} object, found {}.",
                        stringify!($variant),
                        other.type_name()
                    ),
                }
            }

            #[doc = concat!("Mutable access to a ", stringify!($variant), " object.")]
            pub fn $get_mut(&mut self, obj: ObjRef) -> &mut $ty {
                match self.get_mut(obj) {
                    Object::$variant(inner) => inner,
                    other => unreachable!(
                        "Expected {} object, found {}.",
                        stringify!($variant),
                        other.type_name()
                    ),
                }
            }
        }
    };
}

typed_accessors!(string, string_mut, String, crate::object::Str);
typed_accessors!(list, list_mut, List, crate::object::List);
typed_accessors!(map, map_mut, Map, crate::object::Map);
typed_accessors!(range, range_mut, Range, crate::object::Range);
typed_accessors!(module, module_mut, Module, crate::object::Module);
typed_accessors!(function, function_mut, Function, crate::object::Function);
typed_accessors!(closure, closure_mut, Closure, crate::object::Closure);
typed_accessors!(method_bind, method_bind_mut, MethodBind, crate::object::MethodBind);
typed_accessors!(upvalue, upvalue_mut, Upvalue, crate::object::Upvalue);
typed_accessors!(fiber, fiber_mut, Fiber, crate::fiber::Fiber);
typed_accessors!(class, class_mut, Class, crate::object::Class);
typed_accessors!(instance, instance_mut, Instance, crate::object::Instance);

impl Heap {
    /// Marks an object gray: sets its mark bit and queues it on the
    /// worklist. Already-marked objects are skipped, which terminates
    /// marking over cycles.
    pub(crate) fn mark_object(&mut self, obj: Option<ObjRef>) {
        let Some(obj) = obj else { return };
        let entry = self.entries[obj.index()]
            .as_mut()
            .expect("Marked a collected object.");
        if entry.marked {
            return;
        }
        entry.marked = true;
        self.working_set.push(obj);
    }

    /// Marks the object referenced by a value, if any.
    pub(crate) fn mark_value(&mut self, value: Var) {
        if value.is_obj() {
            self.mark_object(Some(value.as_obj()));
        }
    }

    /// Shallow size plus outgoing references of one object, consumed by the
    /// worklist loop of the mark phase.
    pub(crate) fn referents(&self, obj: ObjRef) -> (usize, Vec<Var>) {
        let object = self.get(obj);
        let mut out: Vec<Var> = Vec::new();
        let mut push_obj = |r: Option<ObjRef>, out: &mut Vec<Var>| {
            if let Some(r) = r {
                out.push(Var::object(r));
            }
        };

        match object {
            Object::String(_) | Object::Range(_) => {}

            Object::List(list) => out.extend_from_slice(list.as_slice()),

            Object::Map(map) => {
                for entry in &map.entries {
                    if entry.key.is_undef() {
                        continue;
                    }
                    out.push(entry.key);
                    out.push(entry.value);
                }
            }

            Object::Module(module) => {
                push_obj(module.name, &mut out);
                push_obj(module.path, &mut out);
                out.extend_from_slice(module.globals.as_slice());
                out.extend_from_slice(module.constants.as_slice());
                push_obj(module.body, &mut out);
            }

            Object::Function(function) => {
                push_obj(function.owner, &mut out);
            }

            Object::Closure(closure) => {
                push_obj(Some(closure.function), &mut out);
                for upvalue in &closure.upvalues {
                    push_obj(Some(*upvalue), &mut out);
                }
            }

            Object::MethodBind(bind) => {
                push_obj(Some(bind.method), &mut out);
                out.push(bind.receiver);
            }

            Object::Upvalue(upvalue) => match upvalue.slot {
                // The owner fiber marks the stack slot itself; keeping the
                // owner reachable keeps the slot valid.
                UpvalueSlot::Open { owner, .. } => push_obj(Some(owner), &mut out),
                UpvalueSlot::Closed(value) => out.push(value),
            },

            Object::Fiber(fiber) => {
                push_obj(fiber.closure, &mut out);
                out.extend_from_slice(&fiber.stack[..fiber.sp]);
                for frame in &fiber.frames {
                    push_obj(Some(frame.closure), &mut out);
                    out.push(frame.receiver);
                }
                let mut open = fiber.open_upvalues;
                while let Some(upvalue) = open {
                    push_obj(Some(upvalue), &mut out);
                    open = self.upvalue(upvalue).next;
                }
                push_obj(fiber.caller, &mut out);
                push_obj(fiber.native_parent, &mut out);
                push_obj(fiber.error, &mut out);
                out.push(fiber.receiver);
            }

            Object::Class(class) => {
                push_obj(class.owner, &mut out);
                push_obj(Some(class.name), &mut out);
                push_obj(Some(class.static_attribs), &mut out);
                // The magic cache needs no marking; every cached closure is
                // in the methods table.
                for method in class.methods.iter() {
                    push_obj(Some(*method), &mut out);
                }
                push_obj(class.super_class, &mut out);
            }

            Object::Instance(instance) => {
                push_obj(Some(instance.class), &mut out);
                push_obj(Some(instance.attribs), &mut out);
            }
        }

        (object.shallow_size(), out)
    }
}
