use std::sync::{Mutex, PoisonError};

/// Interior-mutable holder for generator state shared behind `&self`.
#[derive(Debug, Default)]
pub struct MutexCell<T>(Mutex<T>);

impl<T> MutexCell<T> {
    pub fn new(value: T) -> Self {
        Self(Mutex::new(value))
    }

    pub fn with_inner<F: FnOnce(&mut T) -> O, O>(&self, func: F) -> O {
        // a panic while sampling leaves the generator state intact
        let mut cell = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        func(&mut *cell)
    }
}
