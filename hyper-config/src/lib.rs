//! Boot Configuration Store
//!
//! Parses the boot configuration text into a flat, offset-linked store and
//! offers key-scoped typed lookups over it.
//!
//! The store is a single growable buffer of entries in parse order.
//! Logical offsets are 1-based; offset 0 is the reserved "no more"
//! sentinel, so the root scope's first child lives at offset 1. Every
//! entry links to its next sibling within the same scope, loadable
//! entries additionally chain to the next loadable entry, and all links
//! point strictly forward. String keys and values are views into the
//! original text, which must outlive the store.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]

extern crate alloc;

mod parse;

pub use parse::ParseError;

use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;

/// Type of a configuration value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    None,
    Boolean,
    Unsigned,
    Signed,
    String,
    Object,
}

impl ValueType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::None => "None",
            Self::Boolean => "Boolean",
            Self::Unsigned => "Unsigned Integer",
            Self::Signed => "Signed Integer",
            Self::String => "String",
            Self::Object => "Object",
        }
    }

    #[must_use]
    pub const fn mask(self) -> TypeMask {
        match self {
            Self::None => TypeMask::NONE,
            Self::Boolean => TypeMask::BOOLEAN,
            Self::Unsigned => TypeMask::UNSIGNED,
            Self::Signed => TypeMask::SIGNED,
            Self::String => TypeMask::STRING,
            Self::Object => TypeMask::OBJECT,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

bitflags! {
    /// Set of acceptable value types for a lookup.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeMask: u8 {
        const NONE = 1 << 0;
        const BOOLEAN = 1 << 1;
        const UNSIGNED = 1 << 2;
        const SIGNED = 1 << 3;
        const STRING = 1 << 4;
        const OBJECT = 1 << 5;
    }
}

impl fmt::Display for TypeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (ty, flag) in [
            (ValueType::None, TypeMask::NONE),
            (ValueType::Boolean, TypeMask::BOOLEAN),
            (ValueType::Unsigned, TypeMask::UNSIGNED),
            (ValueType::Signed, TypeMask::SIGNED),
            (ValueType::String, TypeMask::STRING),
            (ValueType::Object, TypeMask::OBJECT),
        ] {
            if !self.contains(flag) {
                continue;
            }
            if !first {
                f.write_str(" or ")?;
            }
            f.write_str(ty.as_str())?;
            first = false;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum RawValue<'a> {
    None,
    Boolean(bool),
    Unsigned(u64),
    Signed(i64),
    String(&'a str),
    Object,
}

/// A configuration value together with its position in the store.
///
/// The position is what makes [`Config::get_next`] and object-scoped
/// lookups possible.
#[derive(Debug, Clone, Copy)]
pub struct Value<'a> {
    raw: RawValue<'a>,
    cfg_off: u32,
}

impl<'a> Value<'a> {
    #[must_use]
    pub fn ty(&self) -> ValueType {
        match self.raw {
            RawValue::None => ValueType::None,
            RawValue::Boolean(_) => ValueType::Boolean,
            RawValue::Unsigned(_) => ValueType::Unsigned,
            RawValue::Signed(_) => ValueType::Signed,
            RawValue::String(_) => ValueType::String,
            RawValue::Object => ValueType::Object,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self.raw, RawValue::None)
    }

    #[must_use]
    pub fn is_object(&self) -> bool {
        matches!(self.raw, RawValue::Object)
    }

    #[must_use]
    pub fn as_bool(&self) -> Option<bool> {
        match self.raw {
            RawValue::Boolean(b) => Some(b),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_unsigned(&self) -> Option<u64> {
        match self.raw {
            RawValue::Unsigned(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_signed(&self) -> Option<i64> {
        match self.raw {
            RawValue::Signed(v) => Some(v),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> Option<&'a str> {
        match self.raw {
            RawValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Offset of this value's entry within the store.
    #[must_use]
    pub fn cfg_off(&self) -> u32 {
        self.cfg_off
    }
}

/// A top-level named section describing one bootable configuration.
#[derive(Debug, Clone, Copy)]
pub struct LoadableEntry<'a> {
    name: &'a str,
    cfg_off: u32,
}

impl<'a> LoadableEntry<'a> {
    #[must_use]
    pub fn name(&self) -> &'a str {
        self.name
    }

    #[must_use]
    pub fn cfg_off(&self) -> u32 {
        self.cfg_off
    }
}

/// Anything that can act as a lookup scope: the global scope, a loadable
/// entry, or an object value.
pub trait ConfigScope {
    fn cfg_off(&self) -> u32;
}

/// The global (top-level) scope.
pub struct Global;

/// Scope designator for lookups outside any loadable entry.
pub const GLOBAL: Global = Global;

impl ConfigScope for Global {
    fn cfg_off(&self) -> u32 {
        0
    }
}

impl ConfigScope for LoadableEntry<'_> {
    fn cfg_off(&self) -> u32 {
        self.cfg_off
    }
}

impl ConfigScope for Value<'_> {
    fn cfg_off(&self) -> u32 {
        self.cfg_off
    }
}

/// Lookup failure. Absence is only an error for the `require_*` family;
/// everything else here is a misuse of the config file and is fatal to
/// the boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupError<'a> {
    Missing {
        key: &'a str,
    },
    NotUnique {
        key: &'a str,
    },
    TypeMismatch {
        key: &'a str,
        expected: TypeMask,
        found: ValueType,
    },
}

impl fmt::Display for LookupError<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Missing { key } => {
                write!(f, "couldn't find mandatory key \"{key}\" in the config file")
            }
            Self::NotUnique { key } => write!(f, "expected key \"{key}\" to be unique"),
            Self::TypeMismatch {
                key,
                expected,
                found,
            } => write!(
                f,
                "unexpected type for \"{key}\": expected {expected}, got {found}"
            ),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Payload<'a> {
    Value(RawValue<'a>),
    Loadable { next_loadable: u32 },
}

#[derive(Debug)]
pub(crate) struct Entry<'a> {
    pub(crate) key: &'a str,
    pub(crate) payload: Payload<'a>,
    pub(crate) next_in_scope: u32,
}

struct FindResult {
    first: u32,
    count: usize,
}

/// The parsed configuration store.
pub struct Config<'a> {
    pub(crate) entries: Vec<Entry<'a>>,
    pub(crate) first_loadable: u32,
    pub(crate) last_loadable: u32,
}

impl<'a> Config<'a> {
    /// Parse `text` into a store. The text must outlive the store; string
    /// values and keys are views into it. The first error encountered is
    /// returned, there is no recovery.
    pub fn parse(text: &'a str) -> Result<Self, ParseError> {
        parse::parse(text)
    }

    fn entry_at(&self, off: u32) -> &Entry<'a> {
        &self.entries[off as usize - 1]
    }

    fn value_at(&self, off: u32) -> Value<'a> {
        match self.entry_at(off).payload {
            Payload::Value(raw) => Value { raw, cfg_off: off },
            Payload::Loadable { .. } => unreachable!("offset {off} is not a value"),
        }
    }

    /// Walk the sibling chain of `scope` looking for `key`. Iteration
    /// starts at the scope's first child and stops at the first entry
    /// that is not a plain value (a loadable-entry header terminates the
    /// global chain). `max` of 0 means unbounded.
    fn find(&self, scope: u32, key: &str, max: usize) -> FindResult {
        let mut res = FindResult { first: 0, count: 0 };
        let mut off = scope + 1;

        if off as usize > self.entries.len() {
            return res;
        }

        loop {
            let entry = self.entry_at(off);
            if !matches!(entry.payload, Payload::Value(_)) {
                break;
            }

            if entry.key == key {
                if res.count == 0 {
                    res.first = off;
                }
                res.count += 1;

                if max != 0 && res.count == max {
                    break;
                }
            }

            if entry.next_in_scope == 0 {
                break;
            }
            off = entry.next_in_scope;
        }

        res
    }

    fn find_and_extract(
        &self,
        scope: u32,
        key: &'a str,
        unique: bool,
        mask: TypeMask,
    ) -> Result<Option<Value<'a>>, LookupError<'a>> {
        let res = self.find(scope, key, 2);

        if res.count == 0 {
            return Ok(None);
        }
        if res.count > 1 && unique {
            return Err(LookupError::NotUnique { key });
        }

        let val = self.value_at(res.first);
        if !mask.contains(val.ty().mask()) {
            return Err(LookupError::TypeMismatch {
                key,
                expected: mask,
                found: val.ty(),
            });
        }

        Ok(Some(val))
    }

    // -- Unique lookups: a second occurrence of the key is an error.

    pub fn get_bool(
        &self,
        scope: &dyn ConfigScope,
        key: &'a str,
    ) -> Result<Option<bool>, LookupError<'a>> {
        Ok(self
            .find_and_extract(scope.cfg_off(), key, true, TypeMask::BOOLEAN)?
            .and_then(|v| v.as_bool()))
    }

    pub fn get_unsigned(
        &self,
        scope: &dyn ConfigScope,
        key: &'a str,
    ) -> Result<Option<u64>, LookupError<'a>> {
        Ok(self
            .find_and_extract(scope.cfg_off(), key, true, TypeMask::UNSIGNED)?
            .and_then(|v| v.as_unsigned()))
    }

    pub fn get_signed(
        &self,
        scope: &dyn ConfigScope,
        key: &'a str,
    ) -> Result<Option<i64>, LookupError<'a>> {
        Ok(self
            .find_and_extract(scope.cfg_off(), key, true, TypeMask::SIGNED)?
            .and_then(|v| v.as_signed()))
    }

    pub fn get_string(
        &self,
        scope: &dyn ConfigScope,
        key: &'a str,
    ) -> Result<Option<&'a str>, LookupError<'a>> {
        Ok(self
            .find_and_extract(scope.cfg_off(), key, true, TypeMask::STRING)?
            .and_then(|v| v.as_str()))
    }

    pub fn get_object(
        &self,
        scope: &dyn ConfigScope,
        key: &'a str,
    ) -> Result<Option<Value<'a>>, LookupError<'a>> {
        self.find_and_extract(scope.cfg_off(), key, true, TypeMask::OBJECT)
    }

    /// Unique lookup accepting any of the types in `mask`. The resolved
    /// type is carried by the returned value.
    pub fn get_one_of(
        &self,
        scope: &dyn ConfigScope,
        key: &'a str,
        mask: TypeMask,
    ) -> Result<Option<Value<'a>>, LookupError<'a>> {
        self.find_and_extract(scope.cfg_off(), key, true, mask)
    }

    // -- First-of lookups: duplicates are permitted, the first one wins.

    pub fn get_first_bool(
        &self,
        scope: &dyn ConfigScope,
        key: &'a str,
    ) -> Result<Option<bool>, LookupError<'a>> {
        Ok(self
            .find_and_extract(scope.cfg_off(), key, false, TypeMask::BOOLEAN)?
            .and_then(|v| v.as_bool()))
    }

    pub fn get_first_string(
        &self,
        scope: &dyn ConfigScope,
        key: &'a str,
    ) -> Result<Option<&'a str>, LookupError<'a>> {
        Ok(self
            .find_and_extract(scope.cfg_off(), key, false, TypeMask::STRING)?
            .and_then(|v| v.as_str()))
    }

    pub fn get_first_one_of(
        &self,
        scope: &dyn ConfigScope,
        key: &'a str,
        mask: TypeMask,
    ) -> Result<Option<Value<'a>>, LookupError<'a>> {
        self.find_and_extract(scope.cfg_off(), key, false, mask)
    }

    // -- Mandatory lookups: absence becomes an error.

    pub fn require_string(
        &self,
        scope: &dyn ConfigScope,
        key: &'a str,
    ) -> Result<&'a str, LookupError<'a>> {
        self.get_string(scope, key)?
            .ok_or(LookupError::Missing { key })
    }

    pub fn require_one_of(
        &self,
        scope: &dyn ConfigScope,
        key: &'a str,
        mask: TypeMask,
    ) -> Result<Value<'a>, LookupError<'a>> {
        self.get_one_of(scope, key, mask)?
            .ok_or(LookupError::Missing { key })
    }

    // -- Sibling iteration starting from a previously returned value.

    /// Find the next later sibling with the same key and the same type as
    /// `val`. With `strict`, a same-key sibling of a different type is an
    /// error instead of being skipped.
    pub fn get_next(
        &self,
        val: &Value<'a>,
        strict: bool,
    ) -> Result<Option<Value<'a>>, LookupError<'a>> {
        self.next_matching(val, val.ty().mask(), strict)
    }

    /// As [`Config::get_next`] but accepting any type in `mask`.
    pub fn get_next_one_of(
        &self,
        mask: TypeMask,
        val: &Value<'a>,
        strict: bool,
    ) -> Result<Option<Value<'a>>, LookupError<'a>> {
        self.next_matching(val, mask, strict)
    }

    fn next_matching(
        &self,
        val: &Value<'a>,
        mask: TypeMask,
        strict: bool,
    ) -> Result<Option<Value<'a>>, LookupError<'a>> {
        let key = self.entry_at(val.cfg_off).key;
        let mut off = val.cfg_off;

        loop {
            let entry = self.entry_at(off);
            if entry.next_in_scope == 0 {
                return Ok(None);
            }
            off = entry.next_in_scope;

            let next = self.entry_at(off);
            if !matches!(next.payload, Payload::Value(_)) {
                return Ok(None);
            }
            if next.key != key {
                continue;
            }

            let candidate = self.value_at(off);
            if !mask.contains(candidate.ty().mask()) {
                if strict {
                    return Err(LookupError::TypeMismatch {
                        key: self.entry_at(off).key,
                        expected: mask,
                        found: candidate.ty(),
                    });
                }
                continue;
            }

            return Ok(Some(candidate));
        }
    }

    // -- Scope and loadable-entry iteration.

    /// All key/value pairs of a scope, in source order.
    pub fn pairs(&self, scope: &dyn ConfigScope) -> Pairs<'_, 'a> {
        let off = scope.cfg_off() + 1;
        let off = if off as usize > self.entries.len() {
            0
        } else {
            off
        };
        Pairs { cfg: self, off }
    }

    pub fn loadable_entries(&self) -> LoadableEntries<'_, 'a> {
        LoadableEntries {
            cfg: self,
            off: self.first_loadable,
        }
    }

    pub fn first_loadable_entry(&self) -> Option<LoadableEntry<'a>> {
        self.loadable_entries().next()
    }

    pub fn loadable_entry(&self, name: &str) -> Option<LoadableEntry<'a>> {
        self.loadable_entries().find(|e| e.name == name)
    }
}

/// Iterator over the key/value pairs of one scope.
pub struct Pairs<'c, 'a> {
    cfg: &'c Config<'a>,
    off: u32,
}

impl<'c, 'a> Iterator for Pairs<'c, 'a> {
    type Item = (&'a str, Value<'a>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.off == 0 {
            return None;
        }

        let entry = self.cfg.entry_at(self.off);
        if !matches!(entry.payload, Payload::Value(_)) {
            return None;
        }

        let item = (entry.key, self.cfg.value_at(self.off));
        self.off = entry.next_in_scope;
        Some(item)
    }
}

/// Iterator over the loadable-entry chain.
pub struct LoadableEntries<'c, 'a> {
    cfg: &'c Config<'a>,
    off: u32,
}

impl<'c, 'a> Iterator for LoadableEntries<'c, 'a> {
    type Item = LoadableEntry<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.off == 0 {
            return None;
        }

        let entry = self.cfg.entry_at(self.off);
        let Payload::Loadable { next_loadable } = entry.payload else {
            return None;
        };

        let item = LoadableEntry {
            name: entry.key,
            cfg_off: self.off,
        };
        self.off = next_loadable;
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn cfg(text: &str) -> Config<'_> {
        Config::parse(text).expect("config should parse")
    }

    #[test]
    fn pairs_preserve_source_order() {
        let c = cfg("alpha = 1\nbeta = 2\ngamma = 3\n");
        let keys: Vec<_> = c.pairs(&GLOBAL).map(|(k, _)| k).collect();
        assert_eq!(keys, ["alpha", "beta", "gamma"]);
    }

    #[test]
    fn sibling_links_point_strictly_forward() {
        let c = cfg("a = 1\nb = { x = 1 y = 2 }\nc = 3\n[first]\nk = 1\n[second]\nk = 2\n");

        let mut prev = 0;
        for (_, v) in c.pairs(&GLOBAL) {
            assert!(v.cfg_off() > prev);
            prev = v.cfg_off();
        }

        let mut prev = 0;
        for e in c.loadable_entries() {
            assert!(e.cfg_off() > prev);
            prev = e.cfg_off();
        }
    }

    #[test]
    fn unique_vs_first_vs_next() {
        let c = cfg("k = 1\nk = 2\n");

        assert_eq!(
            c.get_unsigned(&GLOBAL, "k"),
            Err(LookupError::NotUnique { key: "k" })
        );

        let first = c
            .get_first_one_of(&GLOBAL, "k", TypeMask::UNSIGNED)
            .unwrap()
            .unwrap();
        assert_eq!(first.as_unsigned(), Some(1));

        let second = c.get_next(&first, true).unwrap().unwrap();
        assert_eq!(second.as_unsigned(), Some(2));

        assert!(c.get_next(&second, true).unwrap().is_none());
    }

    #[test]
    fn get_next_skips_other_keys() {
        let c = cfg("m = \"a\"\nother = 1\nm = \"b\"\n");
        let first = c
            .get_first_one_of(&GLOBAL, "m", TypeMask::STRING)
            .unwrap()
            .unwrap();
        let second = c.get_next(&first, true).unwrap().unwrap();
        assert_eq!(second.as_str(), Some("b"));
    }

    #[test]
    fn get_next_strict_type_mismatch() {
        let c = cfg("m = \"a\"\nm = 4\n");
        let first = c
            .get_first_one_of(&GLOBAL, "m", TypeMask::STRING)
            .unwrap()
            .unwrap();

        assert!(matches!(
            c.get_next(&first, true),
            Err(LookupError::TypeMismatch { .. })
        ));
        // Non-strict iteration skips the mismatch and runs off the end.
        assert!(c.get_next(&first, false).unwrap().is_none());
    }

    #[test]
    fn typed_lookup_rejects_wrong_type() {
        let c = cfg("k = \"text\"\n");
        assert!(matches!(
            c.get_unsigned(&GLOBAL, "k"),
            Err(LookupError::TypeMismatch {
                found: ValueType::String,
                ..
            })
        ));
    }

    #[test]
    fn absent_key_is_not_an_error() {
        let c = cfg("k = 1\n");
        assert_eq!(c.get_bool(&GLOBAL, "missing"), Ok(None));
        assert_eq!(
            c.require_string(&GLOBAL, "missing"),
            Err(LookupError::Missing { key: "missing" })
        );
    }

    #[test]
    fn object_scoped_lookups() {
        let c = cfg("outer = {\n inner = { flag = true }\n count = 7\n}\n");

        let outer = c.get_object(&GLOBAL, "outer").unwrap().unwrap();
        assert_eq!(c.get_unsigned(&outer, "count"), Ok(Some(7)));

        let inner = c.get_object(&outer, "inner").unwrap().unwrap();
        assert_eq!(c.get_bool(&inner, "flag"), Ok(Some(true)));

        // Child keys are not visible from the parent scope.
        assert_eq!(c.get_bool(&GLOBAL, "flag"), Ok(None));
    }

    #[test]
    fn loadable_entry_lookup_and_scoping() {
        let c = cfg("global = 1\n[first]\nbinary = \"/a\"\n[second]\nbinary = \"/b\"\n");

        let names: Vec<_> = c.loadable_entries().map(|e| e.name()).collect();
        assert_eq!(names, ["first", "second"]);

        let second = c.loadable_entry("second").unwrap();
        assert_eq!(c.get_string(&second, "binary"), Ok(Some("/b")));

        let first = c.first_loadable_entry().unwrap();
        assert_eq!(first.name(), "first");
        assert_eq!(c.get_string(&first, "binary"), Ok(Some("/a")));

        // The global chain stops at the first loadable entry header.
        assert_eq!(c.get_unsigned(&GLOBAL, "global"), Ok(Some(1)));
        assert_eq!(c.get_string(&GLOBAL, "binary"), Ok(None));
    }

    #[test]
    fn one_of_reports_resolved_type() {
        let c = cfg("v = null\n");
        let val = c
            .get_one_of(&GLOBAL, "v", TypeMask::STRING | TypeMask::NONE)
            .unwrap()
            .unwrap();
        assert_eq!(val.ty(), ValueType::None);
        assert!(val.is_null());
    }
}
