// This module provides the shared context attached to every IR module. Context is a
// symbol-name interner: interning the same string twice yields Symbols backed by the same
// allocation, so names coming from different modules compare by pointer before falling
// back to content. ThreadSafeContext is the reference-counted handle passed to modules
// and sessions; the interner is released when the last handle goes away. The interner
// table sits behind a parking_lot mutex so modules can be built on different threads
// against the same context.

//! Shared interning context.

use hashbrown::HashSet;
use parking_lot::Mutex;
use std::borrow::Borrow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::ops::Deref;
use std::sync::Arc;

/// Interned symbol name.
#[derive(Clone, Eq, PartialOrd, Ord)]
pub struct Symbol(Arc<str>);

impl Symbol {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True when both symbols come from the same interner entry.
    pub fn ptr_eq(&self, other: &Symbol) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Symbol {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || *self.0 == *other.0
    }
}

impl Hash for Symbol {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl Deref for Symbol {
    type Target = str;

    fn deref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Symbol {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Interner shared by modules.
#[derive(Default)]
pub struct Context {
    names: Mutex<HashSet<Arc<str>>>,
}

impl Context {
    pub fn intern(&self, name: &str) -> Symbol {
        let mut names = self.names.lock();
        if let Some(existing) = names.get(name) {
            return Symbol(existing.clone());
        }
        let entry: Arc<str> = Arc::from(name);
        names.insert(entry.clone());
        Symbol(entry)
    }

    pub fn interned_count(&self) -> usize {
        self.names.lock().len()
    }
}

/// Reference-counted handle to a [`Context`].
#[derive(Clone, Default)]
pub struct ThreadSafeContext {
    inner: Arc<Context>,
}

impl ThreadSafeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&self, name: &str) -> Symbol {
        self.inner.intern(name)
    }

    /// Number of live handles (modules, sessions and user copies).
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    pub fn same_context(&self, other: &ThreadSafeContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Deref for ThreadSafeContext {
    type Target = Context;

    fn deref(&self) -> &Context {
        &self.inner
    }
}

impl fmt::Debug for ThreadSafeContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadSafeContext")
            .field("interned", &self.interned_count())
            .field("handles", &self.handle_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interning_shares_storage() {
        let ctx = ThreadSafeContext::new();
        let a = ctx.intern("printf");
        let b = ctx.intern("printf");
        assert!(a.ptr_eq(&b));
        assert_eq!(ctx.interned_count(), 1);
        assert_eq!(a.as_str(), "printf");
    }

    #[test]
    fn test_symbols_from_different_contexts_compare_by_content() {
        let a = ThreadSafeContext::new().intern("x");
        let b = ThreadSafeContext::new().intern("x");
        assert!(!a.ptr_eq(&b));
        assert_eq!(a, b);
    }

    #[test]
    fn test_handle_count_tracks_clones() {
        let ctx = ThreadSafeContext::new();
        let copy = ctx.clone();
        assert_eq!(ctx.handle_count(), 2);
        assert!(ctx.same_context(&copy));
        drop(copy);
        assert_eq!(ctx.handle_count(), 1);
    }

    #[test]
    fn test_concurrent_interning() {
        let ctx = ThreadSafeContext::new();
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ctx = ctx.clone();
                std::thread::spawn(move || ctx.intern("shared"))
            })
            .collect();
        let syms: Vec<Symbol> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(syms.windows(2).all(|w| w[0].ptr_eq(&w[1])));
    }
}
