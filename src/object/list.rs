//! Dynamic sequences of values.

use crate::buffer::Buffer;
use crate::object::Object;
use crate::value::{ObjRef, Var};
use crate::vm::Vm;

/// A dynamic array of values, insertion order preserved.
pub struct List {
    pub(crate) elements: Buffer<Var>,
}

impl List {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self {
            elements: Buffer::new(),
        }
    }

    /// The number of elements.
    pub fn len(&self) -> usize {
        self.elements.count()
    }

    /// Returns `true` when the list holds no elements.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// The elements as a slice.
    pub fn as_slice(&self) -> &[Var] {
        self.elements.as_slice()
    }

    /// The allocated element capacity.
    pub fn capacity(&self) -> usize {
        self.elements.capacity()
    }
}

impl Default for List {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// Allocates a new list, reserving room for `size` elements.
    pub fn new_list(&mut self, size: usize) -> ObjRef {
        let mut list = List::new();
        if size > 0 {
            list.elements.reserve(size);
        }
        self.allocate(Object::List(list))
    }

    /// Appends `value` at the end of the list.
    pub fn list_append(&mut self, list: ObjRef, value: Var) {
        let grown = self.heap.list_mut(list).elements.write(value);
        self.heap.add_bytes(grown);
    }

    /// Inserts `value` at `index`, shifting existing elements down. The
    /// index must satisfy `0 <= index <= len`.
    pub fn list_insert_at(&mut self, list: ObjRef, index: usize, value: Var) {
        debug_assert!(index <= self.heap.list(list).len(), "Index out of bounds.");
        let grown = self.heap.list_mut(list).elements.insert(index, value);
        self.heap.add_bytes(grown);
    }

    /// Removes and returns the element at `index`, shifting the rest up and
    /// shrinking the backing store when occupancy allows.
    pub fn list_remove_at(&mut self, list: ObjRef, index: usize) -> Var {
        debug_assert!(index < self.heap.list(list).len(), "Index out of bounds.");
        let list = self.heap.list_mut(list);
        let removed = list.elements.remove(index);
        list.elements.shrink();
        removed
    }

    /// Drops every element.
    pub fn list_clear(&mut self, list: ObjRef) {
        self.heap.list_mut(list).elements.clear();
    }

    /// Concatenates two lists into a fresh list. An empty operand returns
    /// the other list unchanged.
    pub fn list_add(&mut self, l1: ObjRef, l2: ObjRef) -> ObjRef {
        if self.heap.list(l1).is_empty() {
            return l2;
        }
        if self.heap.list(l2).is_empty() {
            return l1;
        }

        let size = self.heap.list(l1).len() + self.heap.list(l2).len();
        let list = self.new_list(size);

        self.push_temp_ref(list); // list.
        let mut merged = Buffer::new();
        merged.concat(&self.heap.list(l1).elements);
        merged.concat(&self.heap.list(l2).elements);
        self.heap.list_mut(list).elements = merged;
        self.pop_temp_ref(); // list.

        list
    }

    /// Materializes a range into a list of numbers, walking toward `to`.
    pub fn range_as_list(&mut self, range: ObjRef) -> ObjRef {
        let (from, to) = {
            let r = self.heap.range(range);
            (r.from(), r.to())
        };

        let list = self.new_list((from - to).abs() as usize);
        self.push_temp_ref(list); // list.
        if from < to {
            let mut i = from;
            while i < to {
                self.list_append(list, Var::number(i));
                i += 1.0;
            }
        } else {
            let mut i = from;
            while i > to {
                self.list_append(list, Var::number(i));
                i -= 1.0;
            }
        }
        self.pop_temp_ref(); // list.

        list
    }
}
