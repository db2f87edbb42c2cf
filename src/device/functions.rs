//! Named host functions reachable through FUNC.
//!
//! The registry is a fixed-capacity list scanned linearly by name. Each entry
//! declares its argument count; [`ANY_ARITY`] accepts any count.

use crate::protocol::frame::Status;
use crate::vm::{Mailbox, Pins};
use copro_derive::Error;
use std::sync::Arc;

/// Entries the registry holds.
pub const REGISTRY_CAPACITY: usize = 16;
/// Arity accepting any number of arguments.
pub const ANY_ARITY: i32 = -1;
/// Longest accepted function name.
pub const MAX_NAME_LEN: usize = 32;

pub type HostFn = Box<dyn Fn(&[i32]) -> i32 + Send + Sync>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("function registry is full ({0} entries)")]
    Full(usize),
    #[error("function `{0}` is already registered")]
    Duplicate(String),
    #[error("invalid function name `{0}`")]
    BadName(String),
}

struct Entry {
    name: String,
    arity: i32,
    call: HostFn,
}

/// Fixed-size table of host functions.
#[derive(Default)]
pub struct FunctionRegistry {
    entries: Vec<Entry>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with `add`, `sum`, `pin_read`, `pin_write` and `mb_len`.
    pub fn with_builtins(pins: Arc<dyn Pins>, mailbox: Mailbox) -> Self {
        let mut registry = Self::new();
        let read_pins = pins.clone();

        let builtins: [(&str, i32, HostFn); 5] = [
            ("add", 2, Box::new(|args: &[i32]| args[0].wrapping_add(args[1]))),
            (
                "sum",
                ANY_ARITY,
                Box::new(|args: &[i32]| args.iter().fold(0i32, |acc, v| acc.wrapping_add(*v))),
            ),
            (
                "pin_read",
                1,
                Box::new(move |args: &[i32]| read_pins.digital_read(args[0]) as i32),
            ),
            (
                "pin_write",
                2,
                Box::new(move |args: &[i32]| {
                    pins.digital_write(args[0], args[1] != 0);
                    0
                }),
            ),
            ("mb_len", 0, Box::new(move |_: &[i32]| mailbox.len() as i32)),
        ];
        for (name, arity, call) in builtins {
            // fresh registry, cannot overflow or collide
            let _ = registry.register(name, arity, call);
        }
        registry
    }

    pub fn register(&mut self, name: &str, arity: i32, call: HostFn) -> Result<(), RegistryError> {
        if name.is_empty() || name.len() > MAX_NAME_LEN {
            return Err(RegistryError::BadName(name.to_string()));
        }
        if self.entries.len() >= REGISTRY_CAPACITY {
            return Err(RegistryError::Full(REGISTRY_CAPACITY));
        }
        if self.entries.iter().any(|e| e.name == name) {
            return Err(RegistryError::Duplicate(name.to_string()));
        }
        self.entries.push(Entry {
            name: name.to_string(),
            arity,
            call,
        });
        Ok(())
    }

    /// Calls `name` with `args`.
    ///
    /// [`Status::Param`] when the name is unknown or the argument count does
    /// not match a fixed arity.
    pub fn call(&self, name: &[u8], args: &[i32]) -> Result<i32, Status> {
        let entry = self
            .entries
            .iter()
            .find(|e| e.name.as_bytes() == name)
            .ok_or(Status::Param)?;

        if entry.arity >= 0 && entry.arity as usize != args.len() {
            return Err(Status::Param);
        }
        Ok((entry.call)(args))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|e| e.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::SimPins;

    fn builtins() -> (FunctionRegistry, Arc<SimPins>, Mailbox) {
        let pins = Arc::new(SimPins::new());
        let mailbox = Mailbox::new(32);
        let registry = FunctionRegistry::with_builtins(pins.clone(), mailbox.clone());
        (registry, pins, mailbox)
    }

    #[test]
    fn builtin_arithmetic() {
        let (registry, _, _) = builtins();
        assert_eq!(registry.call(b"add", &[40, 2]), Ok(42));
        assert_eq!(registry.call(b"add", &[i32::MAX, 1]), Ok(i32::MIN));
        assert_eq!(registry.call(b"sum", &[]), Ok(0));
        assert_eq!(registry.call(b"sum", &[1, 2, 3, 4]), Ok(10));
    }

    #[test]
    fn arity_is_enforced() {
        let (registry, _, _) = builtins();
        assert_eq!(registry.call(b"add", &[1]), Err(Status::Param));
        assert_eq!(registry.call(b"mb_len", &[1]), Err(Status::Param));
        assert_eq!(registry.call(b"nope", &[]), Err(Status::Param));
    }

    #[test]
    fn pin_and_mailbox_builtins() {
        let (registry, pins, mailbox) = builtins();
        assert_eq!(registry.call(b"pin_write", &[5, 1]), Ok(0));
        assert_eq!(pins.level(5), Some(1));
        assert_eq!(registry.call(b"pin_read", &[5]), Ok(1));

        mailbox.append(b"hello");
        assert_eq!(registry.call(b"mb_len", &[]), Ok(5));
    }

    #[test]
    fn capacity_and_duplicates() {
        let mut registry = FunctionRegistry::new();
        for i in 0..REGISTRY_CAPACITY {
            registry.register(&format!("f{i}"), 0, Box::new(move |_| i as i32)).unwrap();
        }
        assert_eq!(
            registry.register("extra", 0, Box::new(|_| 0)),
            Err(RegistryError::Full(REGISTRY_CAPACITY))
        );
        assert_eq!(registry.call(b"f7", &[]), Ok(7));

        let mut registry = FunctionRegistry::new();
        registry.register("x", 0, Box::new(|_| 0)).unwrap();
        assert_eq!(
            registry.register("x", 1, Box::new(|_| 1)),
            Err(RegistryError::Duplicate("x".into()))
        );
        assert!(matches!(registry.register("", 0, Box::new(|_| 0)), Err(RegistryError::BadName(_))));
    }
}
