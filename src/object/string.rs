//! Immutable heap strings and their operations.
//!
//! Construction copies the bytes and precomputes the content hash. Every
//! operation returns a new string, except that an input which is already in
//! the requested form is returned unchanged (an observable no-allocation
//! optimization).

use crate::value::{hash_string, ObjRef, Var};
use crate::vm::Vm;

/// An immutable string with a precomputed content hash.
pub struct Str {
    data: String,
    hash: u32,
}

impl Str {
    /// Creates a string, copying and hashing `text`.
    pub fn new(text: &str) -> Self {
        Self {
            data: text.to_string(),
            hash: hash_string(text),
        }
    }

    /// Wraps an owned string, hashing it.
    pub fn from_owned(data: String) -> Self {
        let hash = hash_string(&data);
        Self { data, hash }
    }

    /// The string content.
    pub fn as_str(&self) -> &str {
        &self.data
    }

    /// The length in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` for the empty string.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The precomputed content hash.
    pub fn hash(&self) -> u32 {
        self.hash
    }
}

/// A piece of a format template: `$` substitutes a borrowed `str`, `@`
/// substitutes a heap string.
#[derive(Clone, Copy)]
pub enum StrPiece<'a> {
    /// Literal text copied verbatim.
    Lit(&'a str),
    /// A borrowed host string.
    Text(&'a str),
    /// A heap string.
    Obj(ObjRef),
}

impl Vm {
    /// Allocates a new string object copying `text`.
    pub fn new_string(&mut self, text: &str) -> ObjRef {
        self.allocate(crate::object::Object::String(Str::new(text)))
    }

    /// Allocates a new string object taking ownership of `text`.
    pub fn new_string_owned(&mut self, text: String) -> ObjRef {
        self.allocate(crate::object::Object::String(Str::from_owned(text)))
    }

    /// Builds a string from format pieces, the runtime's replacement for
    /// varargs formatting.
    pub fn string_format(&mut self, pieces: &[StrPiece<'_>]) -> ObjRef {
        let mut out = String::new();
        for piece in pieces {
            match piece {
                StrPiece::Lit(text) | StrPiece::Text(text) => out.push_str(text),
                StrPiece::Obj(obj) => out.push_str(self.heap.string(*obj).as_str()),
            }
        }
        self.new_string_owned(out)
    }

    /// Returns the lower-cased string, or `this` itself when it is already
    /// lower case.
    pub fn string_lower(&mut self, this: ObjRef) -> ObjRef {
        let s = self.heap.string(this).as_str();
        if !s.chars().any(|c| c.is_uppercase()) {
            return this;
        }
        let lower = s.to_lowercase();
        self.new_string_owned(lower)
    }

    /// Returns the upper-cased string, or `this` itself when it is already
    /// upper case.
    pub fn string_upper(&mut self, this: ObjRef) -> ObjRef {
        let s = self.heap.string(this).as_str();
        if !s.chars().any(|c| c.is_lowercase()) {
            return this;
        }
        let upper = s.to_uppercase();
        self.new_string_owned(upper)
    }

    /// Returns the string with leading and trailing white space removed, or
    /// `this` itself when it is already trimmed.
    pub fn string_strip(&mut self, this: ObjRef) -> ObjRef {
        let s = self.heap.string(this).as_str();
        let trimmed = s.trim();
        if trimmed.len() == s.len() {
            return this;
        }
        let owned = trimmed.to_string();
        self.new_string_owned(owned)
    }

    /// Replaces up to `count` occurrences of `old` with `new` (`-1` means
    /// all). Returns `this` itself when nothing matches or there is nothing
    /// to do.
    pub fn string_replace(&mut self, this: ObjRef, old: ObjRef, new: ObjRef, count: i32) -> ObjRef {
        debug_assert!(count >= 0 || count == -1);

        let this_s = self.heap.string(this).as_str();
        let old_s = self.heap.string(old).as_str();
        let new_s = self.heap.string(new).as_str();

        if this_s.is_empty() || old_s.is_empty() || count == 0 || old_s == new_s {
            return this;
        }
        if !this_s.contains(old_s) {
            return this;
        }

        let replaced = if count < 0 {
            this_s.replace(old_s, new_s)
        } else {
            this_s.replacen(old_s, new_s, count as usize)
        };
        self.new_string_owned(replaced)
    }

    /// Splits the string by `sep` into a list of strings. An empty
    /// separator splits into individual characters. A string containing no
    /// separator reuses `this` as the single element.
    pub fn string_split(&mut self, this: ObjRef, sep: ObjRef) -> ObjRef {
        let list = self.new_list(0);
        self.push_temp_ref(list);

        let sep_empty = self.heap.string(sep).is_empty();
        if sep_empty {
            let chars: Vec<String> = self
                .heap
                .string(this)
                .as_str()
                .chars()
                .map(|c| c.to_string())
                .collect();
            for ch in chars {
                let piece = self.new_string_owned(ch);
                self.push_temp_ref(piece);
                self.list_append(list, Var::object(piece));
                self.pop_temp_ref();
            }
        } else if !self
            .heap
            .string(this)
            .as_str()
            .contains(self.heap.string(sep).as_str())
        {
            self.list_append(list, Var::object(this));
        } else {
            let pieces: Vec<String> = {
                let this_s = self.heap.string(this).as_str();
                let sep_s = self.heap.string(sep).as_str();
                this_s.split(sep_s).map(|p| p.to_string()).collect()
            };
            for piece in pieces {
                let piece = self.new_string_owned(piece);
                self.push_temp_ref(piece);
                self.list_append(list, Var::object(piece));
                self.pop_temp_ref();
            }
        }

        self.pop_temp_ref(); // list.
        list
    }

    /// Concatenates two strings. An empty operand returns the other string
    /// unchanged.
    pub fn string_join(&mut self, a: ObjRef, b: ObjRef) -> ObjRef {
        if self.heap.string(a).is_empty() {
            return b;
        }
        if self.heap.string(b).is_empty() {
            return a;
        }
        let mut joined = String::with_capacity(self.heap.string(a).len() + self.heap.string(b).len());
        joined.push_str(self.heap.string(a).as_str());
        joined.push_str(self.heap.string(b).as_str());
        self.new_string_owned(joined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_matches_data() {
        let s = Str::new("hello");
        assert_eq!(s.hash(), hash_string("hello"));
        assert_eq!(s.as_str(), "hello");
        assert_eq!(s.len(), 5);
    }

    #[test]
    fn test_equal_content_equal_hash() {
        assert_eq!(Str::new("abc").hash(), Str::from_owned("abc".into()).hash());
        assert_ne!(Str::new("abc").hash(), Str::new("abd").hash());
    }
}
