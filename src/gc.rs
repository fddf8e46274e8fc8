//! Mark-and-sweep garbage collection.
//!
//! Classic tri-color collection with an explicit worklist. Roots are the
//! live handles, the temporary reference stack, the module map and search
//! paths, the builtin classes and functions, and the current fiber. The
//! mark phase recomputes `bytes_allocated` from marked objects so the heap
//! accounting stays monotone; the sweep phase unlinks and frees every
//! unmarked object from the allocation list.

use crate::object::{DeleteInstanceFn, Object};
use crate::value::{ObjRef, Var};
use crate::vm::Vm;

impl Vm {
    /// Runs a full collection.
    pub fn collect_garbage(&mut self) {
        debug_assert!(
            !self.heap.collecting,
            "Re-entrant garbage collection."
        );
        self.heap.collecting = true;

        // The mark phase recounts the live bytes from scratch.
        self.heap.bytes_allocated = 0;

        self.mark_roots();

        // Pop the worklist until empty; every pop colors its object black
        // and queues the objects it references.
        while let Some(obj) = self.heap.working_set.pop() {
            let (size, children) = self.heap.referents(obj);
            self.heap.bytes_allocated += size;
            for child in children {
                self.heap.mark_value(child);
            }
        }

        let (freed_count, freed_bytes) = self.sweep();

        self.heap.next_gc = self
            .heap
            .min_heap_size
            .max(self.heap.bytes_allocated * (100 + self.heap.heap_fill_percent) / 100);
        self.heap.collecting = false;

        if freed_count > 0 {
            log::debug!(
                "gc: freed {freed_count} objects (~{freed_bytes} bytes), {} bytes live, next trigger at {}",
                self.heap.bytes_allocated,
                self.heap.next_gc
            );
        }
    }

    fn mark_roots(&mut self) {
        let handle_roots: Vec<Var> = self.heap.handles.iter().flatten().copied().collect();
        for value in handle_roots {
            self.heap.mark_value(value);
        }

        let temp_roots = self.heap.temp_refs.clone();
        for obj in temp_roots {
            self.heap.mark_object(Some(obj));
        }

        self.heap.mark_object(Some(self.modules));
        self.heap.mark_object(Some(self.search_paths));

        for cls in self.builtin_classes.into_iter().flatten() {
            self.heap.mark_object(Some(cls));
        }

        let builtins = self.builtins.clone();
        for closure in builtins {
            self.heap.mark_object(Some(closure));
        }

        self.heap.mark_object(self.fiber);
    }

    /// Walks the allocation list, unlinking and freeing unmarked objects
    /// and clearing the mark bit on survivors. Returns the freed object
    /// count and byte estimate.
    fn sweep(&mut self) -> (usize, usize) {
        // Unlink the doomed objects first; payload destructors run after
        // the arena is consistent again, because a doomed instance may need
        // its (equally doomed) class chain to resolve its destructor.
        let mut doomed: Vec<ObjRef> = Vec::new();
        let mut prev: Option<ObjRef> = None;
        let mut current = self.heap.first;

        while let Some(obj) = current {
            let (marked, next) = {
                let entry = self.heap.entries[obj.index()]
                    .as_ref()
                    .expect("Allocation list points at a freed slot.");
                (entry.marked, entry.next)
            };

            if marked {
                self.heap.entries[obj.index()]
                    .as_mut()
                    .expect("Allocation list points at a freed slot.")
                    .marked = false;
                prev = Some(obj);
            } else {
                match prev {
                    Some(prev) => {
                        self.heap.entries[prev.index()]
                            .as_mut()
                            .expect("Allocation list points at a freed slot.")
                            .next = next;
                    }
                    None => self.heap.first = next,
                }
                doomed.push(obj);
            }
            current = next;
        }

        // Resolve instance destructors while the doomed classes are still
        // readable.
        let mut destructors: Vec<(ObjRef, DeleteInstanceFn)> = Vec::new();
        for obj in &doomed {
            if let Object::Instance(instance) = self.heap.get(*obj) {
                if instance.native.is_none() {
                    continue;
                }
                let mut walk = Some(instance.class);
                while let Some(cls) = walk {
                    let class = self.heap.class(cls);
                    if let Some(delete_fn) = class.delete_fn {
                        destructors.push((*obj, delete_fn));
                        break;
                    }
                    walk = class.super_class;
                }
            }
        }

        // Free the slots.
        let mut freed_bytes = 0;
        let mut payloads: Vec<(DeleteInstanceFn, Box<dyn std::any::Any>)> = Vec::new();
        let mut dl_handles = Vec::new();

        for obj in &doomed {
            let entry = self.heap.entries[obj.index()]
                .take()
                .expect("Doomed object already freed.");
            freed_bytes += entry.object.shallow_size();

            match entry.object {
                Object::Instance(mut instance) => {
                    if let Some(native) = instance.native.take() {
                        if let Some((_, delete_fn)) =
                            destructors.iter().find(|(doomed, _)| doomed == obj)
                        {
                            payloads.push((*delete_fn, native));
                        }
                    }
                }
                Object::Module(mut module) => {
                    if let Some(handle) = module.dl_handle.take() {
                        dl_handles.push(handle);
                    }
                }
                _ => {}
            }

            self.heap.free.push(obj.0);
        }

        // Host destructors run last; they must not allocate.
        for (delete_fn, payload) in payloads {
            delete_fn(self, payload);
        }
        for handle in dl_handles {
            self.unload_dl_handle(handle);
        }

        (doomed.len(), freed_bytes)
    }
}
