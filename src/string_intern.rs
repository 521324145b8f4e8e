use std::collections::HashSet;
use std::sync::Arc;

/// Deduplicating string pool shared by the reader and the correlator.
///
/// A trace with millions of records repeats the same handful of event
/// names, systems, field keys and comm strings over and over. Every string
/// that lands in a [`TraceEvent`](crate::TraceEvent) goes through this pool,
/// so identical strings share one allocation and can be compared with
/// [`Arc::ptr_eq`] when a cheap identity check is enough.
///
/// # Examples
///
/// ```
/// use rgpuvis::StringPool;
/// use std::sync::Arc;
///
/// let mut pool = StringPool::new();
/// let a = pool.intern("amdgpu_cs_ioctl");
/// let b = pool.intern("amdgpu_cs_ioctl");
/// assert!(Arc::ptr_eq(&a, &b));
/// ```
#[derive(Debug)]
pub struct StringPool {
    pool: HashSet<Arc<str>>,
}

impl StringPool {
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        StringPool {
            pool: HashSet::with_capacity(capacity),
        }
    }

    /// Returns the pooled copy of `s`, inserting it on first use.
    pub fn intern(&mut self, s: &str) -> Arc<str> {
        if let Some(interned) = self.pool.get(s) {
            return Arc::clone(interned);
        }
        let arc: Arc<str> = Arc::from(s);
        self.pool.insert(Arc::clone(&arc));
        arc
    }

    /// Interns an owned string without copying it again when it is new.
    pub fn intern_owned(&mut self, s: String) -> Arc<str> {
        if let Some(interned) = self.pool.get(s.as_str()) {
            return Arc::clone(interned);
        }
        let arc: Arc<str> = Arc::from(s);
        self.pool.insert(Arc::clone(&arc));
        arc
    }

    /// Looks a string up without inserting it.
    pub fn get(&self, s: &str) -> Option<Arc<str>> {
        self.pool.get(s).cloned()
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }
}

impl Default for StringPool {
    fn default() -> Self {
        Self::new()
    }
}
