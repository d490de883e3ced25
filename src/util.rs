//! Index arithmetic shared by the in-memory and disk-backed containers.

/// Normalize a possibly-negative index against `len`.
///
/// `-1` maps to `len - 1`; anything out of `[-len, len)` is `None`.
pub(crate) fn norm_index(len: usize, index: i64) -> Option<usize> {
    let len = len as i64;
    let idx = if index < 0 { len + index } else { index };
    if idx < 0 || idx >= len {
        None
    } else {
        Some(idx as usize)
    }
}

/// Resolve `[start:stop:step]` into concrete element indices.
///
/// Matches sequence slicing semantics exactly: out-of-range bounds clamp,
/// negative bounds count from the end, a negative step walks backwards with
/// defaults of `len - 1` down to (and including) index 0.
///
/// `step == 0` yields no indices.
pub(crate) fn slice_indices(
    len: usize,
    start: Option<i64>,
    stop: Option<i64>,
    step: i64,
) -> Vec<usize> {
    if step == 0 || len == 0 {
        return Vec::new();
    }
    let n = len as i64;

    let clamp = |bound: i64, low: i64, high: i64| -> i64 {
        let adjusted = if bound < 0 { n + bound } else { bound };
        adjusted.clamp(low, high)
    };

    let mut out = Vec::new();
    if step > 0 {
        let begin = clamp(start.unwrap_or(0), 0, n);
        let end = clamp(stop.unwrap_or(n), 0, n);
        let mut i = begin;
        while i < end {
            out.push(i as usize);
            i += step;
        }
    } else {
        // for a negative step the defaults run from the last element down
        // past the first; -1 below is the "before index 0" sentinel
        let begin = clamp(start.unwrap_or(n - 1), -1, n - 1);
        let end = match stop {
            Some(bound) => {
                let adjusted = if bound < 0 { n + bound } else { bound };
                adjusted.clamp(-1, n)
            }
            None => -1,
        };
        let mut i = begin;
        while i > end {
            out.push(i as usize);
            i += step;
        }
    }
    out
}
