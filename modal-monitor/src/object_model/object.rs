use std::{fmt, sync::Arc};

use rand::Rng;

use super::header::ObjectHeader;
use crate::sync::lockword::WordLayout;

/// A heap object as seen by the monitor subsystem: its lock state words and,
/// for VM-internal locks, a name.
pub struct Object {
    header: ObjectHeader,
    name: Option<Box<str>>,
}

pub type ObjectRef = Arc<Object>;

impl Object {
    pub fn new() -> ObjectRef {
        Arc::new(Self {
            header: ObjectHeader::new(),
            name: None,
        })
    }

    pub fn named(name: &str) -> ObjectRef {
        Arc::new(Self {
            header: ObjectHeader::new(),
            name: Some(name.into()),
        })
    }

    pub fn header(&self) -> &ObjectHeader {
        &self.header
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }
}

impl fmt::Debug for Object {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "Object({name:?} @ {:p})", self as *const Self),
            None => write!(f, "Object({:p})", self as *const Self),
        }
    }
}

/// Fresh identity hashcode that fits the hashcode field of `layout`. Never zero.
pub fn create_hash_code(layout: WordLayout) -> u32 {
    let mut rng = rand::rng();
    loop {
        let hash = rng.random::<u32>() as u64 & layout.hashcode_mask();
        if hash != 0 {
            return hash as u32;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_codes_fit_layout() {
        for _ in 0..1000 {
            let hash = create_hash_code(WordLayout::Split32);
            assert_ne!(hash, 0);
            assert!(hash as u64 <= WordLayout::Split32.hashcode_mask());
            assert_ne!(create_hash_code(WordLayout::Wide64), 0);
        }
    }
}
