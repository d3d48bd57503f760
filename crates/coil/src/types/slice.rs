use crate::{heap::HeapId, value::Value};

/// Heap payload of a slice object. Bounds are arbitrary values (usually ints or None).
#[derive(Debug)]
pub(crate) struct Slice {
    pub start: Value,
    pub stop: Value,
    pub step: Value,
}

impl Slice {
    pub fn dec_ref_ids(&mut self, stack: &mut Vec<HeapId>) {
        for value in [&mut self.start, &mut self.stop, &mut self.step] {
            if let Value::Ref(id) = value {
                stack.push(*id);
                #[cfg(feature = "ref-count-panic")]
                value.dec_ref_forget();
            }
        }
    }
}

/// Concrete slice bounds resolved against a sequence length.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SliceIndices {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
    pub len: usize,
}

impl SliceIndices {
    /// Normalizes optional bounds the way sequence slicing does: negative bounds count
    /// from the end, out of range bounds clamp. `step` must be non-zero.
    #[must_use]
    pub fn resolve(length: usize, start: Option<i64>, stop: Option<i64>, step: i64) -> Self {
        let length = length as i64;
        let (lower, upper) = if step < 0 { (-1, length - 1) } else { (0, length) };
        let clamp = |v: i64| {
            if v < 0 {
                (v + length).max(lower)
            } else {
                v.min(upper)
            }
        };
        let start = start.map_or(if step < 0 { upper } else { lower }, clamp);
        let stop = stop.map_or(if step < 0 { lower } else { upper }, clamp);
        let len = if step < 0 {
            if stop < start { (start - stop - 1) / -step + 1 } else { 0 }
        } else if start < stop {
            (stop - start - 1) / step + 1
        } else {
            0
        };
        Self {
            start,
            stop,
            step,
            len: len as usize,
        }
    }

    /// The indices selected, in order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.len).map(move |i| (self.start + i as i64 * self.step) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn picked(len: usize, start: Option<i64>, stop: Option<i64>, step: i64) -> Vec<usize> {
        SliceIndices::resolve(len, start, stop, step).iter().collect()
    }

    #[test]
    fn forward_slices_clamp() {
        assert_eq!(picked(5, Some(1), Some(3), 1), vec![1, 2]);
        assert_eq!(picked(5, Some(-2), None, 1), vec![3, 4]);
        assert_eq!(picked(5, None, Some(100), 2), vec![0, 2, 4]);
        assert_eq!(picked(5, Some(4), Some(2), 1), Vec::<usize>::new());
    }

    #[test]
    fn reverse_slices() {
        assert_eq!(picked(5, None, None, -1), vec![4, 3, 2, 1, 0]);
        assert_eq!(picked(5, Some(3), Some(0), -2), vec![3, 1]);
        assert_eq!(picked(5, Some(-10), None, -1), Vec::<usize>::new());
    }
}
