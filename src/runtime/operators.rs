//! Operator, attribute, subscript and iteration semantics.
//!
//! Binary operators dispatch on the left operand: builtin kinds get their
//! builtin behavior, instances go through the class magic-method cache. A
//! missing magic method on a user class is a runtime type error. Every
//! function here reports failure by setting the fiber error; callers check
//! `vm.has_error()`.

use crate::object::{MagicMethod, MagicSlot, Object};
use crate::value::{ObjRef, Var, VarKind};
use crate::vm::Vm;

/// Returns the class of `value`: the builtin class of its kind, or the
/// instance's own class.
pub fn get_class_of(vm: &Vm, value: Var) -> ObjRef {
    if value.is_obj() {
        if let Object::Instance(instance) = vm.heap.get(value.as_obj()) {
            return instance.class;
        }
        if let Object::Class(_) = vm.heap.get(value.as_obj()) {
            // The class of a class is the builtin Class class.
            return vm.builtin_class(VarKind::Class);
        }
    }
    vm.builtin_class(vm.heap.kind_of(value))
}

/// Resolves a magic method on the class chain, populating the per-class
/// cache with either the closure or a known-absent marker.
pub fn get_magic_method(vm: &mut Vm, cls: ObjRef, magic: MagicMethod) -> Option<ObjRef> {
    match vm.heap.class(cls).magic_methods[magic as usize] {
        MagicSlot::Method(closure) => return Some(closure),
        MagicSlot::Absent => return None,
        MagicSlot::Unresolved => {}
    }

    let name = magic_name(magic);
    let found = find_method_on_chain(vm, cls, name);
    vm.heap.class_mut(cls).magic_methods[magic as usize] = match found {
        Some(closure) => MagicSlot::Method(closure),
        None => MagicSlot::Absent,
    };
    found
}

fn magic_name(magic: MagicMethod) -> &'static str {
    match magic {
        MagicMethod::Init => "_init",
        MagicMethod::Str => "_str",
        MagicMethod::Repr => "_repr",
        MagicMethod::Getter => "_getter",
        MagicMethod::Setter => "_setter",
        MagicMethod::Call => "_call",
        MagicMethod::Next => "_next",
        MagicMethod::Value => "_value",
        MagicMethod::Add => "+",
        MagicMethod::Sub => "-",
        MagicMethod::Mul => "*",
        MagicMethod::Div => "/",
        MagicMethod::Eq => "==",
        MagicMethod::Gt => ">",
        MagicMethod::Lt => "<",
        MagicMethod::SubscriptGet => "[]",
        MagicMethod::SubscriptSet => "[]=",
    }
}

/// Walks the super chain looking for a method named `name`.
pub fn find_method_on_chain(vm: &Vm, cls: ObjRef, name: &str) -> Option<ObjRef> {
    let mut walk = Some(cls);
    while let Some(current) = walk {
        let class = vm.heap.class(current);
        for method in class.methods.iter() {
            let function = vm.heap.closure(*method).function;
            if vm.heap.function(function).name == name {
                return Some(*method);
            }
        }
        walk = class.super_class;
    }
    None
}

/// Returns `true` when `receiver`'s class chain has a method named `name`,
/// writing the closure to `method`. Never sets an error and never falls
/// back to attributes.
pub fn has_method(vm: &Vm, receiver: Var, name: &str) -> Option<ObjRef> {
    find_method_on_chain(vm, get_class_of(vm, receiver), name)
}

/// Resolution of a method-call name: either a genuine method or a plain
/// attribute that may itself be callable.
pub enum MethodLookup {
    Method(ObjRef),
    Attribute(Var),
}

/// Looks up `name` on `receiver` for a call: methods first, then the
/// attribute fallback. Sets an error when neither resolves.
pub fn get_method(vm: &mut Vm, receiver: Var, name: ObjRef) -> Option<MethodLookup> {
    let name_str = vm.heap.string(name).as_str().to_string();
    if let Some(closure) = has_method(vm, receiver, &name_str) {
        return Some(MethodLookup::Method(closure));
    }

    let attrib = get_attrib(vm, receiver, name, false);
    if vm.has_error() {
        return None;
    }
    Some(MethodLookup::Attribute(attrib))
}

/// Looks up `name` strictly on the super chain of `receiver`'s class,
/// skipping the class itself. Sets an error when absent.
pub fn get_super_method(vm: &mut Vm, receiver: Var, name: ObjRef) -> Option<ObjRef> {
    let name_str = vm.heap.string(name).as_str().to_string();
    let cls = get_class_of(vm, receiver);
    let found = vm
        .heap
        .class(cls)
        .super_class
        .and_then(|super_class| find_method_on_chain(vm, super_class, &name_str));
    if found.is_none() {
        let type_name = vm.heap.value_type_name(receiver);
        vm.set_runtime_error(format!(
            "'{type_name}' has no super class method named '{name_str}'."
        ));
    }
    found
}

/// Renders `value` as a display string, calling `_str`/`_repr` on
/// instances. `repr` quotes strings and abbreviates recursive containers.
pub fn var_to_string(vm: &mut Vm, value: Var, repr: bool) -> Option<ObjRef> {
    // A string renders to itself; no allocation.
    if !repr && value.is_obj() {
        if matches!(vm.heap.get(value.as_obj()), Object::String(_)) {
            return Some(value.as_obj());
        }
    }

    // Instances dispatch to their magic methods; _repr doubles as _str
    // when _str is absent.
    if value.is_obj() {
        if matches!(vm.heap.get(value.as_obj()), Object::Instance(_)) {
            let cls = get_class_of(vm, value);
            let magic = if repr { MagicMethod::Repr } else { MagicMethod::Str };
            let mut closure = get_magic_method(vm, cls, magic);
            if closure.is_none() && !repr {
                closure = get_magic_method(vm, cls, MagicMethod::Repr);
            }
            if let Some(closure) = closure {
                let result = vm.call_method(value, closure, &[])?;
                if !result.is_obj()
                    || !matches!(vm.heap.get(result.as_obj()), Object::String(_))
                {
                    vm.set_runtime_error("_str must return a String.".to_string());
                    return None;
                }
                return Some(result.as_obj());
            }
        }
    }

    let mut out = String::new();
    to_string_internal(vm, value, &mut out, &mut Vec::new(), repr);
    Some(vm.new_string_owned(out))
}

/// Recursive rendering with an outer-sequence list so self-referencing
/// lists and maps print as `[...]`/`{...}` instead of recursing forever.
fn to_string_internal(vm: &Vm, value: Var, out: &mut String, outer: &mut Vec<ObjRef>, repr: bool) {
    use std::fmt::Write;

    if value.is_null() {
        out.push_str("null");
        return;
    }
    if value.is_bool() {
        out.push_str(if value.as_bool() { "true" } else { "false" });
        return;
    }
    if value.is_num() {
        let n = value.as_num();
        if n.is_nan() {
            out.push_str("nan");
        } else if n.is_infinite() {
            out.push_str(if n > 0.0 { "+inf" } else { "-inf" });
        } else if n == n.trunc() && n.abs() < 1e15 {
            let _ = write!(out, "{}", n as i64);
        } else {
            let _ = write!(out, "{n}");
        }
        return;
    }

    debug_assert!(value.is_obj());
    let obj = value.as_obj();
    match vm.heap.get(obj) {
        Object::String(s) => {
            if !repr {
                out.push_str(s.as_str());
            } else {
                out.push('"');
                for c in s.as_str().chars() {
                    match c {
                        '"' => out.push_str("\\\""),
                        '\\' => out.push_str("\\\\"),
                        '\n' => out.push_str("\\n"),
                        '\r' => out.push_str("\\r"),
                        '\t' => out.push_str("\\t"),
                        c => out.push(c),
                    }
                }
                out.push('"');
            }
        }

        Object::List(list) => {
            if list.is_empty() {
                out.push_str("[]");
                return;
            }
            if outer.contains(&obj) {
                out.push_str("[...]");
                return;
            }
            outer.push(obj);
            out.push('[');
            for (i, element) in list.as_slice().iter().enumerate() {
                if i != 0 {
                    out.push_str(", ");
                }
                to_string_internal(vm, *element, out, outer, true);
            }
            out.push(']');
            outer.pop();
        }

        Object::Map(map) => {
            if map.capacity() == 0 {
                out.push_str("{}");
                return;
            }
            if outer.contains(&obj) {
                out.push_str("{...}");
                return;
            }
            outer.push(obj);
            out.push('{');
            let mut first = true;
            let mut index = 0;
            while let Some(i) = vm.heap.map_next_entry(obj, index) {
                if !first {
                    out.push_str(", ");
                }
                let entry = vm.heap.map(obj).entries[i];
                to_string_internal(vm, entry.key, out, outer, true);
                out.push(':');
                to_string_internal(vm, entry.value, out, outer, true);
                first = false;
                index = i + 1;
            }
            out.push('}');
            outer.pop();
        }

        Object::Range(range) => {
            let _ = write!(out, "[Range:{}..{}]", range.from(), range.to());
        }

        Object::Module(module) => {
            out.push_str("[Module:");
            match module.name {
                Some(name) => out.push_str(vm.heap.string(name).as_str()),
                None => {
                    out.push('"');
                    if let Some(path) = module.path {
                        out.push_str(vm.heap.string(path).as_str());
                    }
                    out.push('"');
                }
            }
            out.push(']');
        }

        Object::Function(function) => {
            let _ = write!(out, "[Func:{}]", function.name);
        }

        Object::Closure(closure) => {
            let _ = write!(
                out,
                "[Closure:{}]",
                vm.heap.function(closure.function).name
            );
        }

        Object::MethodBind(bind) => {
            let method = vm.heap.closure(bind.method).function;
            let _ = write!(out, "[MethodBind:{}]", vm.heap.function(method).name);
        }

        Object::Upvalue(_) => out.push_str("[Upvalue]"),

        Object::Fiber(fiber) => {
            let name = fiber
                .closure
                .map(|c| vm.heap.function(vm.heap.closure(c).function).name.clone())
                .unwrap_or_default();
            let _ = write!(out, "[Fiber:{name}]");
        }

        Object::Class(class) => {
            let _ = write!(out, "[Class:{}]", vm.heap.string(class.name).as_str());
        }

        Object::Instance(instance) => {
            let name = vm
                .heap
                .string(vm.heap.class(instance.class).name)
                .as_str()
                .to_string();
            let _ = write!(out, "['{name}' instance at 0x{:08x}]", obj.index());
        }
    }
}

fn unsupported_operand(vm: &mut Vm, op: &str, v1: Var, v2: Var) {
    let t1 = vm.heap.value_type_name(v1);
    let t2 = vm.heap.value_type_name(v2);
    vm.set_runtime_error(format!(
        "Unsupported operand types for operator '{op}': '{t1}' and '{t2}'."
    ));
}

fn instance_binary(vm: &mut Vm, magic: MagicMethod, v1: Var, v2: Var) -> Option<Var> {
    let cls = get_class_of(vm, v1);
    let closure = get_magic_method(vm, cls, magic)?;
    vm.call_method(v1, closure, &[v2])
}

/// `v1 + v2`: numbers add, strings concatenate, lists concatenate,
/// instances dispatch to `+`.
pub fn var_add(vm: &mut Vm, v1: Var, v2: Var) -> Option<Var> {
    if v1.is_num() && v2.is_num() {
        return Some(Var::number(v1.as_num() + v2.as_num()));
    }
    if v1.is_obj() && v2.is_obj() {
        let (o1, o2) = (v1.as_obj(), v2.as_obj());
        let (k1, k2) = (vm.heap.kind_of(v1), vm.heap.kind_of(v2));
        if k1 == VarKind::String && k2 == VarKind::String {
            return Some(Var::object(vm.string_join(o1, o2)));
        }
        if k1 == VarKind::List && k2 == VarKind::List {
            return Some(Var::object(vm.list_add(o1, o2)));
        }
    }
    if is_instance(vm, v1) {
        if let Some(result) = instance_binary(vm, MagicMethod::Add, v1, v2) {
            return Some(result);
        }
        if vm.has_error() {
            return None;
        }
    }
    unsupported_operand(vm, "+", v1, v2);
    None
}

macro_rules! numeric_operator {
    ($name:ident, $op:tt, $magic:expr, $symbol:expr, $doc:literal) => {
        #[doc = $doc]
        pub fn $name(vm: &mut Vm, v1: Var, v2: Var) -> Option<Var> {
            if v1.is_num() && v2.is_num() {
                return Some(Var::number(v1.as_num() $op v2.as_num()));
            }
            if is_instance(vm, v1) {
                if let Some(result) = instance_binary(vm, $magic, v1, v2) {
                    return Some(result);
                }
                if vm.has_error() {
                    return None;
                }
            }
            unsupported_operand(vm, $symbol, v1, v2);
            None
        }
    };
}

numeric_operator!(var_subtract, -, MagicMethod::Sub, "-", "`v1 - v2` on numbers, with instance magic dispatch.");
numeric_operator!(var_multiply, *, MagicMethod::Mul, "*", "`v1 * v2` on numbers, with instance magic dispatch.");
numeric_operator!(var_divide, /, MagicMethod::Div, "/", "`v1 / v2` on numbers, with instance magic dispatch.");

/// `v1 % v2` on numbers, with instance magic unavailable (no `%` magic
/// slot); mirrors IEEE-754 remainder semantics of the host.
pub fn var_modulo(vm: &mut Vm, v1: Var, v2: Var) -> Option<Var> {
    if v1.is_num() && v2.is_num() {
        return Some(Var::number(v1.as_num() % v2.as_num()));
    }
    unsupported_operand(vm, "%", v1, v2);
    None
}

fn is_instance(vm: &Vm, value: Var) -> bool {
    value.is_obj() && matches!(vm.heap.get(value.as_obj()), Object::Instance(_))
}

/// `v1 == v2`: structural equality, instances dispatch to `==`.
pub fn var_equals(vm: &mut Vm, v1: Var, v2: Var) -> Option<bool> {
    if is_instance(vm, v1) {
        let cls = get_class_of(vm, v1);
        if let Some(closure) = get_magic_method(vm, cls, MagicMethod::Eq) {
            let result = vm.call_method(v1, closure, &[v2])?;
            return Some(vm.heap.to_bool(result));
        }
        if vm.has_error() {
            return None;
        }
    }
    Some(vm.heap.values_equal(v1, v2))
}

/// `v1 > v2`: numbers, strings lexicographically, instance magic.
pub fn var_greater(vm: &mut Vm, v1: Var, v2: Var) -> Option<bool> {
    compare(vm, v1, v2, MagicMethod::Gt, ">", |ordering| {
        ordering == std::cmp::Ordering::Greater
    })
}

/// `v1 < v2`: numbers, strings lexicographically, instance magic.
pub fn var_lesser(vm: &mut Vm, v1: Var, v2: Var) -> Option<bool> {
    compare(vm, v1, v2, MagicMethod::Lt, "<", |ordering| {
        ordering == std::cmp::Ordering::Less
    })
}

fn compare(
    vm: &mut Vm,
    v1: Var,
    v2: Var,
    magic: MagicMethod,
    symbol: &str,
    pick: fn(std::cmp::Ordering) -> bool,
) -> Option<bool> {
    if v1.is_num() && v2.is_num() {
        // NaN compares false under every ordering.
        return match v1.as_num().partial_cmp(&v2.as_num()) {
            Some(ordering) => Some(pick(ordering)),
            None => Some(false),
        };
    }
    if v1.is_obj() && v2.is_obj() {
        if let (Object::String(s1), Object::String(s2)) =
            (vm.heap.get(v1.as_obj()), vm.heap.get(v2.as_obj()))
        {
            return Some(pick(s1.as_str().cmp(s2.as_str())));
        }
    }
    if is_instance(vm, v1) {
        if let Some(result) = instance_binary(vm, magic, v1, v2) {
            return Some(vm.heap.to_bool(result));
        }
        if vm.has_error() {
            return None;
        }
    }
    unsupported_operand(vm, symbol, v1, v2);
    None
}

/// `from .. to` constructs a Range; both operands must be numbers.
pub fn var_op_range(vm: &mut Vm, from: Var, to: Var) -> Option<Var> {
    if from.is_num() && to.is_num() {
        let range = vm.new_range(from.as_num(), to.as_num());
        return Some(Var::object(range));
    }
    unsupported_operand(vm, "..", from, to);
    None
}

/// `element in container` for strings (substring), lists, maps and ranges.
pub fn var_contains(vm: &mut Vm, element: Var, container: Var) -> Option<bool> {
    if container.is_obj() {
        let obj = container.as_obj();
        match vm.heap.kind_of(container) {
            VarKind::String => {
                if vm.heap.kind_of(element) != VarKind::String {
                    let type_name = vm.heap.value_type_name(element);
                    vm.set_runtime_error(format!(
                        "Expected a String operand for 'in', got '{type_name}'."
                    ));
                    return None;
                }
                let haystack = vm.heap.string(obj).as_str();
                let needle = vm.heap.string(element.as_obj()).as_str();
                return Some(haystack.contains(needle));
            }
            VarKind::List => {
                let found = vm
                    .heap
                    .list(obj)
                    .as_slice()
                    .iter()
                    .any(|item| vm.heap.values_equal(*item, element));
                return Some(found);
            }
            VarKind::Map => {
                if !vm.heap.is_hashable(element) {
                    let type_name = vm.heap.value_type_name(element);
                    vm.set_runtime_error(format!("'{type_name}' is not hashable."));
                    return None;
                }
                return Some(vm.heap.map_contains(obj, element));
            }
            VarKind::Range => {
                if !element.is_num() {
                    return Some(false);
                }
                return Some(vm.heap.range(obj).contains(element.as_num()));
            }
            _ => {}
        }
    }
    let type_name = vm.heap.value_type_name(container);
    vm.set_runtime_error(format!("'{type_name}' is not iterable."));
    None
}

/// `value is type`: the right-hand side must be a class; walks the value's
/// class chain.
pub fn var_is_type(vm: &mut Vm, value: Var, type_: Var) -> Option<bool> {
    if !type_.is_obj() || !matches!(vm.heap.get(type_.as_obj()), Object::Class(_)) {
        vm.set_runtime_error("Right operand of 'is' must be a Class.".to_string());
        return None;
    }
    let target = type_.as_obj();
    let mut walk = Some(get_class_of(vm, value));
    while let Some(cls) = walk {
        if cls == target {
            return Some(true);
        }
        walk = vm.heap.class(cls).super_class;
    }
    Some(false)
}

/// Reads the attribute `name` on `on`. Builtin kinds expose a fixed
/// attribute set; modules read globals; classes read static attributes and
/// methods; instances read the attribute map, then methods as binds, then
/// the `_getter` magic method (unless `skip_getter`).
pub fn get_attrib(vm: &mut Vm, on: Var, name: ObjRef, skip_getter: bool) -> Var {
    let name_str = vm.heap.string(name).as_str().to_string();

    if on.is_obj() {
        let obj = on.as_obj();
        match vm.heap.kind_of(on) {
            VarKind::String => {
                if name_str == "length" {
                    return Var::number(vm.heap.string(obj).len() as f64);
                }
            }
            VarKind::List => {
                if name_str == "length" {
                    return Var::number(vm.heap.list(obj).len() as f64);
                }
            }
            VarKind::Map => {
                if name_str == "length" {
                    return Var::number(vm.heap.map(obj).len() as f64);
                }
            }
            VarKind::Range => match name_str.as_str() {
                "first" => return Var::number(vm.heap.range(obj).from()),
                "last" => return Var::number(vm.heap.range(obj).to()),
                _ => {}
            },
            VarKind::Closure => {
                let function = vm.heap.closure(obj).function;
                match name_str.as_str() {
                    "arity" => return Var::number(vm.heap.function(function).arity as f64),
                    "name" => {
                        let name = vm.heap.function(function).name.clone();
                        return Var::object(vm.new_string(&name));
                    }
                    _ => {}
                }
            }
            VarKind::Fiber => match name_str.as_str() {
                "is_done" => {
                    let done = vm.heap.fiber(obj).state == crate::fiber::FiberState::Done;
                    return Var::bool(done);
                }
                "error" => {
                    return vm.heap.fiber(obj).error.map(Var::object).unwrap_or(Var::NULL);
                }
                _ => {}
            },
            VarKind::Module => {
                if let Some(value) = vm.module_get_global(obj, &name_str) {
                    return value;
                }
            }
            VarKind::Class => {
                let static_attribs = vm.heap.class(obj).static_attribs;
                let value = vm.heap.map_get(static_attribs, Var::object(name));
                if !value.is_undef() {
                    return value;
                }
                if let Some(method) = find_method_on_chain(vm, obj, &name_str) {
                    return Var::object(vm.new_method_bind(method));
                }
                if name_str == "name" {
                    return Var::object(vm.heap.class(obj).name);
                }
            }
            VarKind::Instance => {
                let attribs = vm.heap.instance(obj).attribs;
                let value = vm.heap.map_get(attribs, Var::object(name));
                if !value.is_undef() {
                    return value;
                }
                let cls = vm.heap.instance(obj).class;
                if let Some(method) = find_method_on_chain(vm, cls, &name_str) {
                    let bind = vm.new_method_bind(method);
                    vm.heap.method_bind_mut(bind).receiver = on;
                    return Var::object(bind);
                }
                if !skip_getter {
                    if let Some(getter) = get_magic_method(vm, cls, MagicMethod::Getter) {
                        let name_var = Var::object(name);
                        if let Some(result) = vm.call_method(on, getter, &[name_var]) {
                            return result;
                        }
                        return Var::NULL; // Error already set by the call.
                    }
                }
            }
            _ => {}
        }
    }

    let type_name = vm.heap.value_type_name(on);
    vm.set_runtime_error(format!(
        "'{type_name}' object has no attribute named '{name_str}'."
    ));
    Var::NULL
}

/// Writes the attribute `name` on `on`. Instances consult the `_setter`
/// magic method first (unless `skip_setter`); modules write globals,
/// classes write static attributes. Everything else is an error.
pub fn set_attrib(vm: &mut Vm, on: Var, name: ObjRef, value: Var, skip_setter: bool) {
    let name_str = vm.heap.string(name).as_str().to_string();

    if on.is_obj() {
        let obj = on.as_obj();
        match vm.heap.kind_of(on) {
            VarKind::Module => {
                vm.module_set_global(obj, &name_str, value);
                return;
            }
            VarKind::Class => {
                let static_attribs = vm.heap.class(obj).static_attribs;
                vm.heap.map_set(static_attribs, Var::object(name), value);
                return;
            }
            VarKind::Instance => {
                let cls = vm.heap.instance(obj).class;
                let attribs = vm.heap.instance(obj).attribs;
                if !skip_setter {
                    if let Some(setter) = get_magic_method(vm, cls, MagicMethod::Setter) {
                        let name_var = Var::object(name);
                        vm.call_method(on, setter, &[name_var, value]);
                        return;
                    }
                }
                vm.heap.map_set(attribs, Var::object(name), value);
                return;
            }
            _ => {}
        }
    }

    let type_name = vm.heap.value_type_name(on);
    vm.set_runtime_error(format!(
        "'{type_name}' object cannot set attribute '{name_str}'."
    ));
}

/// Reads `on[key]` for strings, lists, maps and instances (via `[]`).
/// Negative list and string indices count from the end.
pub fn get_subscript(vm: &mut Vm, on: Var, key: Var) -> Option<Var> {
    if on.is_obj() {
        let obj = on.as_obj();
        match vm.heap.kind_of(on) {
            VarKind::String => {
                let length = vm.heap.string(obj).as_str().chars().count();
                let index = subscript_index(vm, key, length)?;
                let ch: String = vm
                    .heap
                    .string(obj)
                    .as_str()
                    .chars()
                    .nth(index)
                    .expect("Index was checked.")
                    .into();
                return Some(Var::object(vm.new_string_owned(ch)));
            }
            VarKind::List => {
                let length = vm.heap.list(obj).len();
                let index = subscript_index(vm, key, length)?;
                return Some(vm.heap.list(obj).as_slice()[index]);
            }
            VarKind::Map => {
                if !vm.heap.is_hashable(key) {
                    let type_name = vm.heap.value_type_name(key);
                    vm.set_runtime_error(format!("'{type_name}' is not hashable."));
                    return None;
                }
                let value = vm.heap.map_get(obj, key);
                if value.is_undef() {
                    let repr = var_to_string(vm, key, true)?;
                    let repr = vm.heap.string(repr).as_str().to_string();
                    vm.set_runtime_error(format!("Key {repr} not found."));
                    return None;
                }
                return Some(value);
            }
            VarKind::Instance => {
                let cls = get_class_of(vm, on);
                if let Some(closure) = get_magic_method(vm, cls, MagicMethod::SubscriptGet) {
                    return vm.call_method(on, closure, &[key]);
                }
                if vm.has_error() {
                    return None;
                }
            }
            _ => {}
        }
    }
    let type_name = vm.heap.value_type_name(on);
    vm.set_runtime_error(format!("'{type_name}' object is not subscriptable."));
    None
}

/// Writes `on[key] = value` for lists, maps and instances (via `[]=`).
pub fn set_subscript(vm: &mut Vm, on: Var, key: Var, value: Var) -> Option<()> {
    if on.is_obj() {
        let obj = on.as_obj();
        match vm.heap.kind_of(on) {
            VarKind::List => {
                let length = vm.heap.list(obj).len();
                let index = subscript_index(vm, key, length)?;
                vm.heap.list_mut(obj).elements[index] = value;
                return Some(());
            }
            VarKind::Map => {
                if !vm.heap.is_hashable(key) {
                    let type_name = vm.heap.value_type_name(key);
                    vm.set_runtime_error(format!("'{type_name}' is not hashable."));
                    return None;
                }
                vm.heap.map_set(obj, key, value);
                return Some(());
            }
            VarKind::Instance => {
                let cls = get_class_of(vm, on);
                if let Some(closure) = get_magic_method(vm, cls, MagicMethod::SubscriptSet) {
                    vm.call_method(on, closure, &[key, value])?;
                    return Some(());
                }
                if vm.has_error() {
                    return None;
                }
            }
            _ => {}
        }
    }
    let type_name = vm.heap.value_type_name(on);
    vm.set_runtime_error(format!("'{type_name}' object is not subscriptable."));
    None
}

/// Validates a container subscript: a whole number in range, negatives
/// counting from the end.
fn subscript_index(vm: &mut Vm, key: Var, length: usize) -> Option<usize> {
    if !key.is_num() || key.as_num().fract() != 0.0 {
        let type_name = vm.heap.value_type_name(key);
        vm.set_runtime_error(format!("Expected an integer index, got '{type_name}'."));
        return None;
    }
    let mut index = key.as_num() as i64;
    if index < 0 {
        index += length as i64;
    }
    if index < 0 || index as usize >= length {
        vm.set_runtime_error("Index out of bounds.".to_string());
        return None;
    }
    Some(index as usize)
}

/// One step of the iteration protocol: given the sequence and the previous
/// iterator (null to begin), returns the next iterator and element, or
/// `None` when exhausted. Errors set the fiber error; callers must check.
pub fn var_iterate(vm: &mut Vm, seq: Var, iterator: Var) -> Option<(Var, Var)> {
    if seq.is_obj() {
        let obj = seq.as_obj();
        match vm.heap.kind_of(seq) {
            VarKind::List => {
                let next = if iterator.is_null() { 0 } else { iterator.as_num() as usize + 1 };
                if next >= vm.heap.list(obj).len() {
                    return None;
                }
                return Some((Var::number(next as f64), vm.heap.list(obj).as_slice()[next]));
            }
            VarKind::String => {
                let next = if iterator.is_null() { 0 } else { iterator.as_num() as usize + 1 };
                let ch: Option<String> =
                    vm.heap.string(obj).as_str().chars().nth(next).map(Into::into);
                let ch = ch?;
                let ch = vm.new_string_owned(ch);
                return Some((Var::number(next as f64), Var::object(ch)));
            }
            VarKind::Range => {
                let (from, to) = {
                    let range = vm.heap.range(obj);
                    (range.from(), range.to())
                };
                let step = if iterator.is_null() { 0.0 } else { iterator.as_num() + 1.0 };
                let value = if from <= to { from + step } else { from - step };
                let in_range = if from <= to { value < to } else { value > to };
                if !in_range {
                    return None;
                }
                return Some((Var::number(step), Var::number(value)));
            }
            VarKind::Map => {
                let start = if iterator.is_null() { 0 } else { iterator.as_num() as usize + 1 };
                let index = vm.heap.map_next_entry(obj, start)?;
                let key = vm.heap.map(obj).entries[index].key;
                return Some((Var::number(index as f64), key));
            }
            VarKind::Instance => {
                let cls = get_class_of(vm, seq);
                let next_method = get_magic_method(vm, cls, MagicMethod::Next);
                let value_method = get_magic_method(vm, cls, MagicMethod::Value);
                if let (Some(next_method), Some(value_method)) = (next_method, value_method) {
                    let next = vm.call_method(seq, next_method, &[iterator])?;
                    if next.is_null() {
                        return None;
                    }
                    let value = vm.call_method(seq, value_method, &[next])?;
                    return Some((next, value));
                }
            }
            _ => {}
        }
    }
    let type_name = vm.heap.value_type_name(seq);
    vm.set_runtime_error(format!("'{type_name}' is not iterable."));
    None
}

/// Pre-construction step of `new_instance`: builtin classes return null
/// (their constructor produces the real value); user classes allocate an
/// Instance, invoking the nearest native payload constructor.
pub fn pre_construct_this(vm: &mut Vm, cls: ObjRef) -> Option<Var> {
    match vm.heap.class(cls).class_of {
        VarKind::Instance => Some(Var::object(vm.new_instance_of(cls))),
        VarKind::Object | VarKind::Module => {
            let name = vm.heap.string(vm.heap.class(cls).name).as_str().to_string();
            vm.set_runtime_error(format!("Class '{name}' cannot be instantiated."));
            None
        }
        _ => Some(Var::NULL),
    }
}

/// Constructs an instance of `cls` with `args`: pre-construct, then the
/// `_init` magic method. For builtin classes the constructor's return
/// value becomes the instance.
pub fn construct_instance(vm: &mut Vm, cls: ObjRef, args: &[Var]) -> Option<Var> {
    let mut instance = pre_construct_this(vm, cls)?;

    let pushed = instance.is_obj();
    if pushed {
        vm.push_temp_ref(instance.as_obj()); // instance.
    }

    let init = get_magic_method(vm, cls, MagicMethod::Init);
    let result = match init {
        Some(init) => {
            let ret = vm.call_method(instance, init, args);
            match ret {
                Some(ret) => {
                    // Builtin constructors return the real instance.
                    if instance.is_null() {
                        instance = ret;
                    }
                    Some(instance)
                }
                None => None,
            }
        }
        None if instance.is_null() => {
            let name = vm.heap.string(vm.heap.class(cls).name).as_str().to_string();
            vm.set_runtime_error(format!("Class '{name}' has no constructor."));
            None
        }
        None => Some(instance),
    };

    if pushed {
        vm.pop_temp_ref(); // instance.
    }
    result
}
