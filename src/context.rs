//! Invocation context shared between the caller and the parser
//!
//! The caller owns the context and may read it while a parser is running. The parser only ever
//! performs two kinds of updates:
//! - the test tag follows first-writer-wins: a tag set by the parent process is never replaced by
//!   one a subprocess reports
//! - build attributes are merged additively: keys present locally keep their value, unknown keys
//!   are adopted
//!
//! Both are read-then-conditionally-write under the context's lock. Only one subprocess is
//! expected to report into a context at a time.
//!

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde::{Deserialize, Serialize};

/// Cross-process state of a test invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvocationContext {
    test_tag: Option<String>,
    build_attributes: BTreeMap<String, String>,
}

impl InvocationContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Tag identifying the tests of this invocation
    pub fn test_tag(&self) -> Option<&str> {
        self.test_tag.as_deref()
    }

    /// Set the test tag unconditionally
    pub fn set_test_tag<T: Into<String>>(&mut self, tag: T) {
        self.test_tag = Some(tag.into());
    }

    /// Set the test tag only if none is set yet, returns whether the tag was taken
    pub fn offer_test_tag(&mut self, tag: &str) -> bool {
        match self.test_tag {
            Some(_) => false,
            None => {
                self.test_tag = Some(tag.to_string());
                true
            }
        }
    }

    /// All build attributes
    pub fn build_attributes(&self) -> &BTreeMap<String, String> {
        &self.build_attributes
    }

    /// Look up a single build attribute
    pub fn build_attribute(&self, key: &str) -> Option<&str> {
        self.build_attributes.get(key).map(String::as_str)
    }

    /// Set a build attribute unconditionally
    pub fn add_build_attribute<K: Into<String>, V: Into<String>>(&mut self, key: K, value: V) {
        self.build_attributes.insert(key.into(), value.into());
    }

    /// Merge attributes without overwriting existing ones
    ///
    /// Returns the keys that were rejected because they were already present.
    ///
    pub fn merge_build_attributes<I>(&mut self, attributes: I) -> Vec<String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut rejected = Vec::new();

        for (key, value) in attributes {
            if self.build_attributes.contains_key(&key) {
                rejected.push(key);
            } else {
                self.build_attributes.insert(key, value);
            }
        }

        rejected
    }
}

/// Handle to an invocation context that is shared with a parser
#[derive(Debug, Clone, Default)]
pub struct SharedContext {
    inner: Arc<RwLock<InvocationContext>>,
}

impl SharedContext {
    /// Share a context
    pub fn new(context: InvocationContext) -> Self {
        SharedContext {
            inner: Arc::new(RwLock::new(context)),
        }
    }

    /// Acquire read access
    ///
    /// A poisoned lock is recovered from: the context holds plain data that no update leaves in
    /// an inconsistent state.
    ///
    pub fn read(&self) -> RwLockReadGuard<'_, InvocationContext> {
        self.inner.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Acquire write access
    pub fn write(&self) -> RwLockWriteGuard<'_, InvocationContext> {
        self.inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Copy of the current state
    pub fn snapshot(&self) -> InvocationContext {
        self.read().clone()
    }
}

impl From<InvocationContext> for SharedContext {
    fn from(context: InvocationContext) -> Self {
        SharedContext::new(context)
    }
}
