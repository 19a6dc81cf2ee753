//! Probability-weighted selection.
//!
//! Test bodies that model state machines pick their next operation from a
//! weighted set: "mostly enqueue, sometimes dequeue, rarely reconnect". The
//! selection itself is one `f64` draw, so it costs a fixed 8 bytes and
//! replays exactly.
//!
//! # Selection rule
//!
//! Entries own cumulative half-open ranges `[start, end)` over the weight
//! total. A draw landing exactly on a boundary therefore selects the
//! later-registered entry. A draw that rounds up to the total (possible in
//! floating point) selects the last entry.

use crate::context::CaseContext;
use crate::error::HarnessError;
use crate::testable::CaseError;

struct Entry<T> {
    /// Exclusive end of this entry's cumulative range.
    cum_end: f64,
    value: T,
}

/// Ordered weighted entries with draw-based selection.
pub struct WeightedChoice<T> {
    entries: Vec<Entry<T>>,
    total: f64,
}

impl<T> Default for WeightedChoice<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WeightedChoice<T> {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            total: 0.0,
        }
    }

    /// Register an entry. Weights must be finite and non-negative;
    /// zero-weight entries are dropped (they can never be selected).
    pub fn add(&mut self, weight: f64, value: T) -> Result<(), HarnessError> {
        if !weight.is_finite() || weight < 0.0 {
            return Err(HarnessError::invalid(format!(
                "weight must be finite and non-negative, got {weight}"
            )));
        }
        if weight == 0.0 {
            return Ok(());
        }
        self.total += weight;
        self.entries.push(Entry {
            cum_end: self.total,
            value,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Map a unit draw in `[0, 1)` to an entry index. Pure, so the boundary
    /// rule is testable without a stream.
    fn index_for(&self, unit: f64) -> usize {
        debug_assert!(!self.entries.is_empty());
        let scaled = unit * self.total;
        for (i, entry) in self.entries.iter().enumerate() {
            if scaled < entry.cum_end {
                return i;
            }
        }
        self.entries.len() - 1
    }

    /// Draw once and borrow the selected value.
    pub fn pick<'a>(&'a mut self, ctx: &mut CaseContext) -> Result<&'a mut T, HarnessError> {
        if self.entries.is_empty() {
            return Err(HarnessError::invalid("selection from an empty weighted set"));
        }
        let unit = ctx.next_f64();
        let i = self.index_for(unit);
        Ok(&mut self.entries[i].value)
    }
}

/// Boxed action form used by `execute`.
pub type WeightedAction = Box<dyn FnMut(&mut CaseContext) -> Result<(), CaseError> + Send>;

impl WeightedChoice<WeightedAction> {
    /// Select an action, place `placemark` if given, then run the action.
    ///
    /// The placemark lands between selection and execution, so its recorded
    /// position identifies which action ran without the action's own draws
    /// shifting it.
    pub fn execute(
        &mut self,
        ctx: &mut CaseContext,
        placemark: Option<&str>,
    ) -> Result<(), CaseError> {
        if self.entries.is_empty() {
            return Err(Box::new(HarnessError::invalid(
                "selection from an empty weighted set",
            )));
        }
        let unit = ctx.next_f64();
        let i = self.index_for(unit);
        if let Some(name) = placemark {
            ctx.placemark_named(name)?;
        }
        (self.entries[i].value)(ctx)
    }
}

// ============================================================================
// Tests
// ============================================================================
