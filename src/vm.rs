//! The virtual machine: heap ownership, fibers, modules and run entries.

use std::time::Instant;

use crate::error::RunResult;
use crate::fiber::FiberState;
use crate::heap::{Handle, Heap};
use crate::host::{CompileOptions, Configuration};
use crate::object::function::{FunctionKind, ARITY_UNSET};
use crate::object::module::{DlHandle, IMPLICIT_MAIN_NAME};
use crate::object::{NativeFn, Object, UpvalueSlot};
use crate::runtime::dispatch;
use crate::value::{ObjRef, Var, VarKind, BUILTIN_KIND_COUNT};

/// The Wisp virtual machine. Owns the heap and every object in it; all
/// execution state, module registries and host bridges hang off this
/// struct.
pub struct Vm {
    pub(crate) heap: Heap,
    pub(crate) config: Configuration,

    /// Map of registered modules, keyed by name (native modules) or path
    /// (compiled scripts).
    pub(crate) modules: ObjRef,
    /// List of directories searched when importing modules.
    pub(crate) search_paths: ObjRef,

    /// Registered builtin function closures.
    pub(crate) builtins: Vec<ObjRef>,
    /// Builtin classes indexed by value kind.
    pub(crate) builtin_classes: [Option<ObjRef>; BUILTIN_KIND_COUNT],

    /// The current fiber.
    pub(crate) fiber: Option<ObjRef>,

    /// Milliseconds the last run entry took.
    time_ms: f64,

    user_data: Option<Box<dyn std::any::Any>>,
}

impl Vm {
    /// Creates a VM with the given configuration (or the defaults) and the
    /// core builtins registered.
    pub fn new(config: Option<Configuration>) -> Self {
        let mut heap = Heap::new();
        let modules = heap.insert(Object::Map(crate::object::Map::new()));
        let search_paths = heap.insert(Object::List(crate::object::List::new()));

        let mut vm = Self {
            heap,
            config: config.unwrap_or_default(),
            modules,
            search_paths,
            builtins: Vec::new(),
            builtin_classes: [None; BUILTIN_KIND_COUNT],
            fiber: None,
            time_ms: 0.0,
            user_data: None,
        };
        crate::core::initialize_core(&mut vm);
        vm
    }

    /// Allocates a heap object, collecting garbage first when the trigger
    /// threshold is crossed.
    pub(crate) fn allocate(&mut self, object: Object) -> ObjRef {
        if self.heap.wants_collection() && !self.heap.collecting {
            self.collect_garbage();
        }
        self.heap.insert(object)
    }

    /// Read-only heap access for embedders and tests.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Mutable heap access for embedders; container operations such as
    /// map insertion live on [`Heap`].
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Attaches native construction/destruction hooks to a class, for
    /// instances backed by host state.
    pub fn class_set_native(
        &mut self,
        cls: ObjRef,
        new_fn: Option<crate::object::NewInstanceFn>,
        delete_fn: Option<crate::object::DeleteInstanceFn>,
    ) {
        let class = self.heap.class_mut(cls);
        class.new_fn = new_fn;
        class.delete_fn = delete_fn;
    }

    /// Renders a value as a display string (`repr` quotes strings and
    /// abbreviates recursive containers). Instances dispatch to their
    /// `_str`/`_repr` magic methods; a failing magic method reports `None`
    /// with the error set.
    pub fn value_to_string(&mut self, value: Var, repr: bool) -> Option<ObjRef> {
        crate::runtime::operators::var_to_string(self, value, repr)
    }

    /// The builtin class of `kind`.
    pub fn builtin_class(&self, kind: VarKind) -> ObjRef {
        self.builtin_classes[kind as usize].expect("Core classes are initialized with the VM.")
    }

    /// Pins `obj` against collection while a constructor holds the only
    /// reference. Pops must mirror pushes exactly.
    pub fn push_temp_ref(&mut self, obj: ObjRef) {
        self.heap.temp_refs.push(obj);
    }

    /// Pops the top temporary reference.
    pub fn pop_temp_ref(&mut self) {
        let popped = self.heap.temp_refs.pop();
        debug_assert!(popped.is_some(), "Temp reference stack underflow.");
    }

    /// Claims a GC root for `value`. Release every handle before dropping
    /// the VM.
    pub fn new_handle(&mut self, value: Var) -> Handle {
        let index = match self.heap.handle_free.pop() {
            Some(index) => {
                self.heap.handles[index as usize] = Some(value);
                index
            }
            None => {
                self.heap.handles.push(Some(value));
                (self.heap.handles.len() - 1) as u32
            }
        };
        Handle { index }
    }

    /// Releases a handle, allowing its value to be collected.
    pub fn release_handle(&mut self, handle: Handle) {
        let slot = &mut self.heap.handles[handle.index as usize];
        debug_assert!(slot.is_some(), "Handle released twice.");
        *slot = None;
        self.heap.handle_free.push(handle.index);
    }

    /// The value a handle pins.
    pub fn handle_value(&self, handle: &Handle) -> Var {
        self.heap.handles[handle.index as usize].expect("Use of a released handle.")
    }

    /// Attaches host data to the VM.
    pub fn set_user_data(&mut self, user_data: Box<dyn std::any::Any>) {
        self.user_data = Some(user_data);
    }

    /// The attached host data.
    pub fn user_data(&self) -> Option<&(dyn std::any::Any + 'static)> {
        self.user_data.as_deref()
    }

    /// Milliseconds the last `run_string`/`run_file` took.
    pub fn time(&self) -> f64 {
        self.time_ms
    }

    /// The currently executing (or suspended-in-native) fiber.
    pub fn current_fiber(&self) -> Option<ObjRef> {
        self.fiber
    }

    /// The process arguments handed to the VM.
    pub fn arguments(&self) -> &[String] {
        &self.config.arguments
    }

    pub(crate) fn write_stdout(&mut self, text: &str) {
        if let Some(write) = self.config.stdout_write {
            write(self, text);
        }
    }

    pub(crate) fn write_stderr(&mut self, text: &str) {
        if let Some(write) = self.config.stderr_write {
            write(self, text);
        }
    }

    /// Returns `true` when the current fiber carries a runtime error.
    pub fn has_error(&self) -> bool {
        self.fiber
            .map(|fiber| self.heap.fiber(fiber).has_error())
            .unwrap_or(false)
    }

    /// Sets a runtime error on the current fiber. At most one error can be
    /// pending; without a running fiber the message goes to stderr.
    pub fn set_runtime_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        match self.fiber {
            Some(fiber) => {
                debug_assert!(
                    !self.heap.fiber(fiber).has_error(),
                    "A runtime error is already pending."
                );
                let error = self.new_string(&message);
                self.heap.fiber_mut(fiber).error = Some(error);
            }
            None => {
                self.write_stderr(&format!("Error: {message}\n"));
            }
        }
    }

    /// The current fiber's error message, if any.
    pub fn error_message(&self) -> Option<String> {
        let fiber = self.fiber?;
        let error = self.heap.fiber(fiber).error?;
        Some(self.heap.string(error).as_str().to_string())
    }

    /// Registers a builtin function. Overriding an existing builtin isn't
    /// supported.
    pub fn register_builtin_fn(
        &mut self,
        name: &str,
        native: NativeFn,
        arity: i32,
        docstring: Option<&str>,
    ) {
        debug_assert!(
            self.find_builtin_fn(name).is_none(),
            "Overriding an existing builtin function isn't supported."
        );

        let function = self.new_function(name, None, FunctionKind::Native(native), docstring);
        self.heap.function_mut(function).arity = arity;
        self.push_temp_ref(function); // function.
        let closure = self.new_closure(function);
        self.builtins.push(closure);
        self.pop_temp_ref(); // function.
    }

    /// Finds a registered builtin function by name.
    pub fn find_builtin_fn(&self, name: &str) -> Option<(usize, ObjRef)> {
        for (index, closure) in self.builtins.iter().enumerate() {
            let function = self.heap.closure(*closure).function;
            if self.heap.function(function).name == name {
                return Some((index, *closure));
            }
        }
        None
    }

    /// Appends a module search path. The path must end with a separator.
    pub fn add_search_path(&mut self, path: &str) {
        debug_assert!(
            path.ends_with('/') || path.ends_with('\\'),
            "Search path should end with a path separator."
        );
        let path = self.new_string(path);
        self.push_temp_ref(path); // path.
        self.list_append(self.search_paths, Var::object(path));
        self.pop_temp_ref(); // path.
    }

    /// Registers `module` in the module map under its name (native
    /// modules) or path (compiled scripts).
    pub fn register_module(&mut self, module: ObjRef) {
        let key = {
            let m = self.heap.module(module);
            m.name.or(m.path).expect("Module needs a name or a path to register.")
        };
        self.heap.map_set(self.modules, Var::object(key), Var::object(module));
    }

    /// Finds a registered module by its key (name or path).
    pub fn lookup_module(&mut self, key: &str) -> Option<ObjRef> {
        let key = self.new_string(key);
        self.push_temp_ref(key); // key.
        let found = self.heap.map_get(self.modules, Var::object(key));
        self.pop_temp_ref(); // key.
        if found.is_undef() {
            None
        } else {
            Some(found.as_obj())
        }
    }

    /// Creates a native module and registers nothing; call
    /// [`Self::register_module`] to make it importable.
    pub fn new_named_module(&mut self, name: &str) -> ObjRef {
        let module = self.new_module();
        self.push_temp_ref(module); // module.
        let name = self.new_string(name);
        self.heap.module_mut(module).name = Some(name);
        self.pop_temp_ref(); // module.
        module
    }

    /// Adds a native function as a global of `module`.
    pub fn module_add_function(
        &mut self,
        module: ObjRef,
        name: &str,
        native: NativeFn,
        arity: i32,
        docstring: Option<&str>,
    ) {
        let function = self.new_function(name, Some(module), FunctionKind::Native(native), docstring);
        self.heap.function_mut(function).arity = arity;
        self.push_temp_ref(function); // function.
        let closure = self.new_closure(function);
        self.pop_temp_ref(); // function.
        self.push_temp_ref(closure); // closure.
        self.module_set_global(module, name, Var::object(closure));
        self.pop_temp_ref(); // closure.
    }

    /// Adds a native method to `cls`, wiring the magic-method cache when
    /// the name is magic.
    pub fn class_add_method(
        &mut self,
        cls: ObjRef,
        name: &str,
        native: NativeFn,
        arity: i32,
        docstring: Option<&str>,
    ) {
        let owner = self.heap.class(cls).owner;
        let function = self.new_function(name, owner, FunctionKind::Native(native), docstring);
        {
            let f = self.heap.function_mut(function);
            f.arity = arity;
            f.is_method = true;
        }
        self.push_temp_ref(function); // function.
        let method = self.new_closure(function);
        self.pop_temp_ref(); // function.

        self.push_temp_ref(method); // method.
        self.bind_method(cls, method);
        self.pop_temp_ref(); // method.
    }

    /// Binds a method closure to a class, invalidating the magic cache
    /// entry it shadows.
    pub fn bind_method(&mut self, cls: ObjRef, method: ObjRef) {
        let grown = self.heap.class_mut(cls).methods.write(method);
        self.heap.add_bytes(grown);

        let function = self.heap.closure(method).function;
        let name = self.heap.function(function).name.clone();
        if let Some(magic) = crate::object::MagicMethod::from_name(&name) {
            self.heap.class_mut(cls).magic_methods[magic as usize] =
                crate::object::MagicSlot::Method(method);
        }
    }

    /// Prepares a new fiber for execution with `args`, transitioning it
    /// from new to yielded. On failure an error is set and `false`
    /// returned.
    pub fn prepare_fiber(&mut self, fiber: ObjRef, args: &[Var]) -> bool {
        if self.heap.fiber(fiber).state != FiberState::New {
            self.set_runtime_error("The fiber has already been run.");
            return false;
        }

        if let Some(closure) = self.heap.fiber(fiber).closure {
            let function = self.heap.closure(closure).function;
            let arity = self.heap.function(function).arity;
            debug_assert!(arity != ARITY_UNSET, "Function arity wasn't set.");
            if arity >= 0 && args.len() != arity as usize {
                let name = self.heap.function(function).name.clone();
                self.set_runtime_error(format!(
                    "Function '{name}' expected exactly {arity} argument(s), got {}.",
                    args.len()
                ));
                return false;
            }
        }

        self.ensure_stack_size(fiber, args.len() + 1);
        {
            let fb = self.heap.fiber_mut(fiber);
            fb.stack[fb.ret] = Var::NULL;
            for (i, arg) in args.iter().enumerate() {
                fb.stack[fb.ret + 1 + i] = *arg;
            }
            fb.sp = fb.ret + 1 + args.len();
            fb.state = FiberState::Yielded;
        }
        true
    }

    /// Switches execution to `fiber`, optionally delivering `value` as the
    /// result of the yield it suspended at.
    pub fn switch_fiber(&mut self, fiber: ObjRef, value: Option<Var>) -> bool {
        match self.heap.fiber(fiber).state {
            FiberState::Yielded => {}
            FiberState::New => {
                self.set_runtime_error("The fiber hasn't been prepared to run.");
                return false;
            }
            FiberState::Running => {
                self.set_runtime_error("The fiber is already running.");
                return false;
            }
            FiberState::Done => {
                self.set_runtime_error("The fiber has finished running.");
                return false;
            }
        }

        self.heap.fiber_mut(fiber).caller = self.fiber;
        if let Some(current) = self.fiber {
            self.heap.fiber_mut(current).state = FiberState::Yielded;
        }
        self.heap.fiber_mut(fiber).state = FiberState::Running;

        if let Some(value) = value {
            let ret = self.heap.fiber(fiber).ret;
            self.heap.fiber_mut(fiber).stack[ret] = value;
        }
        self.fiber = Some(fiber);
        true
    }

    /// Yields from the current fiber back to its caller, optionally
    /// delivering `value` as the caller's resume result.
    pub fn yield_fiber(&mut self, value: Option<Var>) {
        let Some(current) = self.fiber else {
            return;
        };
        let caller = self.heap.fiber(current).caller;
        {
            let fb = self.heap.fiber_mut(current);
            fb.state = FiberState::Yielded;
            fb.caller = None;
        }

        if let Some(caller) = caller {
            self.heap.fiber_mut(caller).state = FiberState::Running;
            if let Some(value) = value {
                let ret = self.heap.fiber(caller).ret;
                self.heap.fiber_mut(caller).stack[ret] = value;
            }
        }
        self.fiber = caller;
    }

    /// Runs `fiber` (new-and-prepared or yielded) until it yields,
    /// finishes or errors.
    pub fn run_fiber(&mut self, fiber: ObjRef) -> RunResult {
        dispatch::run_fiber(self, fiber)
    }

    /// Calls a managed callable with `args`, running it to completion in a
    /// fresh fiber. Returns the result, or `None` with the error rethrown
    /// into the calling fiber (or reported, at top level).
    pub fn call_function(&mut self, closure: ObjRef, args: &[Var]) -> Option<Var> {
        self.call_with_receiver(closure, Var::UNDEFINED, args)
    }

    /// Calls a method closure on `receiver`; see [`Self::call_function`].
    pub fn call_method(&mut self, receiver: Var, closure: ObjRef, args: &[Var]) -> Option<Var> {
        self.call_with_receiver(closure, receiver, args)
    }

    fn call_with_receiver(&mut self, closure: ObjRef, receiver: Var, args: &[Var]) -> Option<Var> {
        let parent = self.fiber;

        let fiber = self.new_fiber(Some(closure));
        self.push_temp_ref(fiber); // fiber.
        {
            let fb = self.heap.fiber_mut(fiber);
            fb.native_parent = parent;
            fb.receiver = receiver;
            if let Some(frame) = fb.frames.last_mut() {
                frame.receiver = receiver;
            }
        }
        let prepared = self.prepare_fiber(fiber, args);
        self.pop_temp_ref(); // fiber.
        if !prepared {
            return None;
        }

        self.push_temp_ref(fiber); // fiber, across the run.
        let result = dispatch::run_fiber(self, fiber);
        self.pop_temp_ref(); // fiber.
        self.fiber = parent;

        if result != RunResult::Success {
            return None;
        }
        let ret = self.heap.fiber(fiber).ret;
        Some(self.heap.fiber(fiber).stack[ret])
    }

    /// Reads through an upvalue: the owner's stack while open, the closed
    /// cell afterwards.
    pub(crate) fn read_upvalue(&self, upvalue: ObjRef) -> Var {
        match self.heap.upvalue(upvalue).slot {
            UpvalueSlot::Open { owner, index } => self.heap.fiber(owner).stack[index],
            UpvalueSlot::Closed(value) => value,
        }
    }

    /// Writes through an upvalue.
    pub(crate) fn write_upvalue(&mut self, upvalue: ObjRef, value: Var) {
        match self.heap.upvalue(upvalue).slot {
            UpvalueSlot::Open { owner, index } => {
                self.heap.fiber_mut(owner).stack[index] = value;
            }
            UpvalueSlot::Closed(_) => {
                self.heap.upvalue_mut(upvalue).slot = UpvalueSlot::Closed(value);
            }
        }
    }

    /// Defines the implicit module globals: `__name__` (the module name,
    /// `"__main__"` for the entry module) and `__file__` (the path when
    /// known).
    pub fn initialize_module(&mut self, module: ObjRef, is_main: bool) {
        let name = if is_main {
            "__main__".to_string()
        } else {
            match self.heap.module(module).name {
                Some(name) => self.heap.string(name).as_str().to_string(),
                None => String::new(),
            }
        };
        let name = self.new_string(&name);
        self.push_temp_ref(name); // name.
        self.module_set_global(module, "__name__", Var::object(name));
        self.pop_temp_ref(); // name.

        if let Some(path) = self.heap.module(module).path {
            self.module_set_global(module, "__file__", Var::object(path));
        }
    }

    /// Imports a module by `path`, returning the cached registration or
    /// resolving, loading, compiling and initializing it. `from` is the
    /// importing script's path for relative resolution.
    pub fn import_module(&mut self, from: Option<ObjRef>, path: ObjRef) -> Option<Var> {
        let path_str = self.heap.string(path).as_str().to_string();

        if let Some(module) = self.lookup_module(&path_str) {
            self.ensure_module_initialized(module)?;
            return Some(Var::object(module));
        }

        let from_str = from.map(|p| self.heap.string(p).as_str().to_string());
        let resolved = self
            .config
            .resolve_path_fn
            .and_then(|resolve| resolve(self, from_str.as_deref(), &path_str));
        let Some(resolved) = resolved else {
            self.set_runtime_error(format!("Cannot resolve path '{path_str}'."));
            return None;
        };

        if let Some(module) = self.lookup_module(&resolved) {
            self.ensure_module_initialized(module)?;
            return Some(Var::object(module));
        }

        // The resolved path first, then every registered search path.
        let mut resolved = resolved;
        let mut source = self
            .config
            .load_script_fn
            .and_then(|load| load(self, &resolved));
        if source.is_none() {
            let search_paths: Vec<String> = {
                let list = self.heap.list(self.search_paths);
                list.as_slice()
                    .iter()
                    .map(|p| self.heap.string(p.as_obj()).as_str().to_string())
                    .collect()
            };
            for prefix in search_paths {
                let candidate = self
                    .config
                    .resolve_path_fn
                    .and_then(|resolve| resolve(self, None, &format!("{prefix}{path_str}")));
                let Some(candidate) = candidate else { continue };
                if let Some(module) = self.lookup_module(&candidate) {
                    self.ensure_module_initialized(module)?;
                    return Some(Var::object(module));
                }
                source = self
                    .config
                    .load_script_fn
                    .and_then(|load| load(self, &candidate));
                if source.is_some() {
                    resolved = candidate;
                    break;
                }
            }
        }

        let module = match source {
            Some(source) => {
                let Some(compile) = self.config.compile_fn else {
                    self.set_runtime_error("No compiler configured.");
                    return None;
                };

                let module = self.new_module();
                self.push_temp_ref(module); // module.

                let resolved_str = self.new_string(&resolved);
                self.heap.module_mut(module).path = Some(resolved_str);
                self.initialize_module(module, false);

                let result = compile(self, module, &source, &CompileOptions::default());
                if result != RunResult::Success {
                    self.pop_temp_ref(); // module.
                    self.set_runtime_error(format!("Failed to compile module '{path_str}'."));
                    return None;
                }

                self.register_module(module);
                self.pop_temp_ref(); // module.
                module
            }
            None => self.import_dl_module(&path_str, &resolved)?,
        };

        self.ensure_module_initialized(module)?;
        Some(Var::object(module))
    }

    /// Imports a module by a path string; see [`Self::import_module`].
    pub fn import_module_path(&mut self, path: &str) -> Option<Var> {
        let path = self.new_string(path);
        self.push_temp_ref(path); // path.
        let module = self.import_module(None, path);
        self.pop_temp_ref(); // path.
        module
    }

    /// Loads a native extension module through the host's DL callbacks.
    fn import_dl_module(&mut self, name: &str, resolved: &str) -> Option<ObjRef> {
        let (Some(load_dl), Some(import_dl)) = (self.config.load_dl_fn, self.config.import_dl_fn)
        else {
            self.set_runtime_error(format!("Failed to load module '{name}'."));
            return None;
        };

        let Some(dl_data) = load_dl(self, resolved) else {
            self.set_runtime_error(format!("Failed to load module '{name}'."));
            return None;
        };

        let Some(handle) = import_dl(self, dl_data.as_ref()) else {
            self.unload_dl_handle(DlHandle(dl_data));
            self.set_runtime_error(format!("Failed to import module '{name}'."));
            return None;
        };

        let module_var = self.handle_value(&handle);
        self.release_handle(handle);
        debug_assert!(module_var.is_obj());
        let module = module_var.as_obj();

        self.push_temp_ref(module); // module.
        if self.heap.module(module).name.is_none() {
            let name_str = self.new_string(name);
            self.heap.module_mut(module).name = Some(name_str);
        }
        self.heap.module_mut(module).dl_handle = Some(DlHandle(dl_data));
        self.register_module(module);
        self.pop_temp_ref(); // module.

        Some(module)
    }

    /// Runs a module's implicit main once. The flag is set before the body
    /// runs so cyclic imports don't re-enter.
    fn ensure_module_initialized(&mut self, module: ObjRef) -> Option<()> {
        if self.heap.module(module).initialized {
            return Some(());
        }
        self.heap.module_mut(module).initialized = true;
        if let Some(body) = self.heap.module(module).body {
            self.call_function(body, &[])?;
        }
        Some(())
    }

    /// Releases a native extension library handle.
    pub(crate) fn unload_dl_handle(&mut self, handle: DlHandle) {
        if let Some(unload) = self.config.unload_dl_fn {
            unload(self, handle.0);
        }
    }

    /// Compiles and runs `source` in a fresh module. The source only needs
    /// to stay valid for the duration of the call.
    pub fn run_string(&mut self, source: &str) -> RunResult {
        let Some(compile) = self.config.compile_fn else {
            self.write_stderr("No compiler configured.\n");
            return RunResult::CompileError;
        };

        let module = self.new_module();
        self.push_temp_ref(module); // module.

        let path = self.new_string("@(String)");
        self.heap.module_mut(module).path = Some(path);

        let result = compile(self, module, source, &CompileOptions::default());
        if result != RunResult::Success {
            self.pop_temp_ref(); // module.
            return result;
        }

        let result = self.run_module(module);
        self.pop_temp_ref(); // module.
        result
    }

    /// Runs the file at `path` relative to the working directory.
    pub fn run_file(&mut self, path: &str) -> RunResult {
        debug_assert!(
            self.config.load_script_fn.is_some(),
            "No script loading function defined."
        );

        let resolved = self
            .config
            .resolve_path_fn
            .and_then(|resolve| resolve(self, None, path));
        let Some(resolved) = resolved else {
            self.write_stderr(&format!("Error finding script at \"{path}\"\n"));
            return RunResult::CompileError;
        };

        let Some(compile) = self.config.compile_fn else {
            self.write_stderr("No compiler configured.\n");
            return RunResult::CompileError;
        };

        let module = self.new_module();
        self.push_temp_ref(module); // module.

        let path_str = self.new_string(&resolved);
        self.heap.module_mut(module).path = Some(path_str);
        self.initialize_module(module, true);

        let source = self
            .config
            .load_script_fn
            .and_then(|load| load(self, &resolved));
        let Some(source) = source else {
            self.pop_temp_ref(); // module.
            self.write_stderr(&format!("Error loading script at \"{resolved}\"\n"));
            return RunResult::CompileError;
        };

        let result = compile(self, module, &source, &CompileOptions::default());
        if result != RunResult::Success {
            self.pop_temp_ref(); // module.
            return result;
        }

        self.register_module(module);
        let result = self.run_module(module);
        self.pop_temp_ref(); // module.
        result
    }

    /// Runs a compiled module's implicit main in a new fiber, recording
    /// the elapsed milliseconds.
    pub fn run_module(&mut self, module: ObjRef) -> RunResult {
        // Set just before executing so cyclic imports don't re-enter.
        self.heap.module_mut(module).initialized = true;

        let Some(body) = self.heap.module(module).body else {
            return RunResult::Success;
        };

        let fiber = self.new_fiber(Some(body));
        self.push_temp_ref(fiber); // fiber.
        let prepared = self.prepare_fiber(fiber, &[]);
        if !prepared {
            self.pop_temp_ref(); // fiber.
            return RunResult::RuntimeError;
        }

        let start = Instant::now();
        let result = self.run_fiber(fiber);
        self.time_ms = start.elapsed().as_secs_f64() * 1000.0;
        self.pop_temp_ref(); // fiber.
        result
    }

    /// Runs the interactive loop: read a line, compile (buffering while
    /// the compiler reports unexpected EOF), execute the module's main.
    pub fn run_repl(&mut self) -> RunResult {
        let Some(read) = self.config.stdin_read else {
            self.write_stderr("REPL failed to input.\n");
            return RunResult::RuntimeError;
        };
        let Some(compile) = self.config.compile_fn else {
            self.write_stderr("No compiler configured.\n");
            return RunResult::CompileError;
        };

        let options = CompileOptions { repl_mode: true };

        let module = self.new_named_module("@(REPL)");
        let module_handle = self.new_handle(Var::object(module));
        self.initialize_module(module, true);

        // Buffered lines of an incomplete construct.
        let mut lines = String::new();
        let mut need_more_lines = false;
        let mut result = RunResult::Success;

        loop {
            self.write_stdout(if need_more_lines { "... " } else { ">>> " });

            let Some(line) = read(self) else {
                self.write_stdout("\n");
                result = RunResult::Success;
                break;
            };

            if line.trim().is_empty() {
                continue;
            }

            if !lines.is_empty() {
                lines.push('\n');
            }
            lines.push_str(&line);

            result = compile(self, module, &lines, &options);

            if result == RunResult::UnexpectedEof {
                need_more_lines = true;
                continue;
            }
            need_more_lines = false;
            lines.clear();

            if result != RunResult::Success {
                continue;
            }

            if let Some(main_index) = self.module_get_global_index(module, IMPLICIT_MAIN_NAME) {
                let main = self.heap.module(module).globals[main_index as usize];
                debug_assert!(main.is_obj());
                result = match self.call_function(main.as_obj(), &[]) {
                    Some(_) => RunResult::Success,
                    None => RunResult::RuntimeError,
                };
            }
        }

        self.release_handle(module_handle);
        result
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        // Run the native payload destructors and release extension
        // libraries; the arena frees everything else.
        let mut instance_dtors: Vec<(usize, crate::object::DeleteInstanceFn)> = Vec::new();
        let mut module_indices: Vec<usize> = Vec::new();

        for index in 0..self.heap.entries.len() {
            let Some(entry) = self.heap.entries[index].as_ref() else {
                continue;
            };
            match &entry.object {
                Object::Instance(instance) if instance.native.is_some() => {
                    let mut walk = Some(instance.class);
                    while let Some(cls) = walk {
                        let class = self.heap.class(cls);
                        if let Some(delete_fn) = class.delete_fn {
                            instance_dtors.push((index, delete_fn));
                            break;
                        }
                        walk = class.super_class;
                    }
                }
                Object::Module(module) if module.dl_handle.is_some() => {
                    module_indices.push(index);
                }
                _ => {}
            }
        }

        let mut payloads: Vec<(crate::object::DeleteInstanceFn, Box<dyn std::any::Any>)> =
            Vec::new();
        for (index, delete_fn) in instance_dtors {
            if let Some(entry) = self.heap.entries[index].as_mut() {
                if let Object::Instance(instance) = &mut entry.object {
                    if let Some(native) = instance.native.take() {
                        payloads.push((delete_fn, native));
                    }
                }
            }
        }

        let mut dl_handles = Vec::new();
        for index in module_indices {
            if let Some(entry) = self.heap.entries[index].as_mut() {
                if let Object::Module(module) = &mut entry.object {
                    if let Some(handle) = module.dl_handle.take() {
                        dl_handles.push(handle);
                    }
                }
            }
        }

        for (delete_fn, payload) in payloads {
            delete_fn(self, payload);
        }
        for handle in dl_handles {
            self.unload_dl_handle(handle);
        }

        // The host must have released every handle by now.
        debug_assert!(
            self.heap.handles.iter().flatten().count() == 0,
            "Not all handles were released."
        );
    }
}
