use crate::error::{Error, Result};

/// Tunables of a [`crate::Heap`].
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Smallest arena growth, in units. Amortizes the cost of growth calls
    /// when many small requests exhaust the free list.
    pub min_growth_units: usize,
    /// Treat the static data segment as a root range in [`crate::Heap::collect`].
    pub scan_static: bool,
    /// Treat the live stack as a root range in [`crate::Heap::collect`].
    pub scan_stack: bool,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            min_growth_units: 1024,
            scan_static: true,
            scan_stack: true,
        }
    }
}

impl HeapConfig {
    pub(crate) fn validate(&self) -> Result<()> {
        if self.min_growth_units == 0 {
            return Err(Error::InvalidConfig("min_growth_units must be > 0"));
        }
        if self.min_growth_units > u32::MAX as usize {
            return Err(Error::InvalidConfig(
                "min_growth_units must fit in a block header",
            ));
        }
        Ok(())
    }
}
