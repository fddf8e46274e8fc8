//! Fibers: first-class coroutines with their own value and call stacks.

use crate::buffer::power_of_two_ceil;
use crate::object::{Object, UpvalueSlot};
use crate::value::{ObjRef, Var};
use crate::vm::Vm;

/// Minimum stack slots for a fiber running bytecode.
pub const MIN_STACK_SIZE: usize = 128;

/// Initial call-frame capacity of a new fiber.
pub const INITIAL_CALL_FRAMES: usize = 4;

/// Lifecycle states of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, derive_more::Display)]
pub enum FiberState {
    /// Created, never run.
    #[display(fmt = "new")]
    New,
    /// Prepared or suspended at a yield, resumable.
    #[display(fmt = "yielded")]
    Yielded,
    /// Currently executing.
    #[display(fmt = "running")]
    Running,
    /// Ran to completion or errored; not resumable.
    #[display(fmt = "done")]
    Done,
}

/// One call frame of a fiber.
#[derive(Clone, Copy)]
pub struct CallFrame {
    /// The closure being executed.
    pub closure: ObjRef,
    /// Byte offset of the next instruction in the closure's opcode stream.
    pub ip: usize,
    /// Base of this frame: the callee's return slot index.
    pub rbp: usize,
    /// The receiver when this frame runs a method.
    pub receiver: Var,
}

/// A coroutine: value stack, frame stack, open upvalues and scheduling
/// links.
pub struct Fiber {
    /// The closure this fiber runs; `None` for the bare fiber that hosts
    /// stand-alone native calls.
    pub closure: Option<ObjRef>,
    pub state: FiberState,
    /// The value stack. `stack[ret]` is the return slot of the active call;
    /// `sp` points one past the topmost live value.
    pub stack: Vec<Var>,
    pub sp: usize,
    pub ret: usize,
    /// The call frames, innermost last.
    pub frames: Vec<CallFrame>,
    /// Head of the open-upvalue chain, descending stack index order.
    pub open_upvalues: Option<ObjRef>,
    /// The fiber that resumed this one, receiving control back on yield.
    pub caller: Option<ObjRef>,
    /// The fiber that was current when a native call spawned this one.
    pub native_parent: Option<ObjRef>,
    /// The runtime error string, set at most once per run.
    pub error: Option<ObjRef>,
    /// Receiver of the innermost method call, for the native `this` API.
    pub receiver: Var,
    /// Set once a frameless native fiber has entered its closure, so the
    /// dispatch loop finishes it instead of re-entering when control
    /// returns after a fiber switch.
    pub(crate) started: bool,
}

impl Fiber {
    /// The allocated stack capacity in slots.
    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    pub(crate) fn backing_bytes(&self) -> usize {
        use std::mem::size_of;
        self.stack.capacity() * size_of::<Var>() + self.frames.capacity() * size_of::<CallFrame>()
    }

    /// Returns `true` when a runtime error is set.
    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }
}

impl Vm {
    /// Allocates a new fiber for `closure`.
    ///
    /// Native closures (and `None`) only use the stack for parameters, so
    /// the stack is sized to the arity; bytecode closures get the declared
    /// stack size with the [`MIN_STACK_SIZE`] floor and an initial frame.
    pub fn new_fiber(&mut self, closure: Option<ObjRef>) -> ObjRef {
        let is_native = match closure {
            Some(closure) => {
                let function = self.heap.closure(closure).function;
                debug_assert!(self.heap.function(function).arity >= -1);
                self.heap.function(function).is_native()
            }
            None => true,
        };

        let fiber = if is_native {
            let arity = closure
                .map(|c| {
                    let function = self.heap.closure(c).function;
                    self.heap.function(function).arity.max(0) as usize
                })
                .unwrap_or(0);
            // At least one slot is needed for the return value.
            let stack_size = power_of_two_ceil((arity + 1).max(1));

            Fiber {
                closure,
                state: FiberState::New,
                stack: vec![Var::UNDEFINED; stack_size],
                sp: 1,
                ret: 0,
                frames: Vec::with_capacity(INITIAL_CALL_FRAMES),
                open_upvalues: None,
                caller: None,
                native_parent: None,
                error: None,
                receiver: Var::UNDEFINED,
                started: false,
            }
        } else {
            let closure_ref = closure.expect("Bytecode fiber always has a closure.");
            let function = self.heap.closure(closure_ref).function;
            let declared = self.heap.function(function).body().stack_size as usize;
            let stack_size = power_of_two_ceil(declared + 1).max(MIN_STACK_SIZE);

            let mut frames = Vec::with_capacity(INITIAL_CALL_FRAMES);
            frames.push(CallFrame {
                closure: closure_ref,
                ip: 0,
                rbp: 0,
                receiver: Var::UNDEFINED,
            });

            Fiber {
                closure,
                state: FiberState::New,
                stack: vec![Var::UNDEFINED; stack_size],
                sp: 1,
                ret: 0,
                frames,
                open_upvalues: None,
                caller: None,
                native_parent: None,
                error: None,
                receiver: Var::UNDEFINED,
                started: false,
            }
        };

        let mut fiber = fiber;
        fiber.stack[0] = Var::NULL;

        // The closure may have no other root yet; pin it across the
        // allocation.
        if let Some(closure) = closure {
            self.push_temp_ref(closure);
        }
        let obj = self.allocate(Object::Fiber(fiber));
        if closure.is_some() {
            self.pop_temp_ref();
        }
        obj
    }

    /// Grows the fiber's stack so at least `size` slots exist. Stack
    /// bookkeeping is index based, so frames, the return slot and open
    /// upvalues stay valid across the reallocation.
    pub fn ensure_stack_size(&mut self, fiber: ObjRef, size: usize) {
        let current = self.heap.fiber(fiber).stack.len();
        if current >= size {
            return;
        }
        let new_size = power_of_two_ceil(size);
        self.heap
            .fiber_mut(fiber)
            .stack
            .resize(new_size, Var::UNDEFINED);
        self.heap
            .add_bytes((new_size - current) * std::mem::size_of::<Var>());
    }

    /// Closes every open upvalue at or above stack index `bottom`: the
    /// value moves from the stack into the upvalue and the upvalue leaves
    /// the open chain.
    pub(crate) fn close_upvalues(&mut self, fiber: ObjRef, bottom: usize) {
        while let Some(upvalue) = self.heap.fiber(fiber).open_upvalues {
            let index = match self.heap.upvalue(upvalue).slot {
                UpvalueSlot::Open { index, .. } => index,
                UpvalueSlot::Closed(_) => {
                    unreachable!("Closed upvalue on the open chain.")
                }
            };
            if index < bottom {
                break;
            }

            let value = self.heap.fiber(fiber).stack[index];
            let next = self.heap.upvalue(upvalue).next;
            {
                let upvalue = self.heap.upvalue_mut(upvalue);
                upvalue.slot = UpvalueSlot::Closed(value);
                upvalue.next = None;
            }
            self.heap.fiber_mut(fiber).open_upvalues = next;
        }
    }

    /// Finds or creates the upvalue open over `index` in the fiber's open
    /// chain, keeping the chain sorted by descending stack index.
    pub(crate) fn capture_upvalue(&mut self, fiber: ObjRef, index: usize) -> ObjRef {
        let mut prev: Option<ObjRef> = None;
        let mut current = self.heap.fiber(fiber).open_upvalues;

        while let Some(upvalue) = current {
            let open_index = match self.heap.upvalue(upvalue).slot {
                UpvalueSlot::Open { index, .. } => index,
                UpvalueSlot::Closed(_) => unreachable!("Closed upvalue on the open chain."),
            };
            if open_index <= index {
                if open_index == index {
                    return upvalue;
                }
                break;
            }
            prev = Some(upvalue);
            current = self.heap.upvalue(upvalue).next;
        }

        let created = self.new_upvalue(fiber, index);
        self.heap.upvalue_mut(created).next = current;
        match prev {
            Some(prev) => self.heap.upvalue_mut(prev).next = Some(created),
            None => self.heap.fiber_mut(fiber).open_upvalues = Some(created),
        }
        created
    }
}
