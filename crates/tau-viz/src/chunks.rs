//! Grouping of many parameters into plot-sized chunks.

use std::cmp::Ordering;

use regex::Regex;
use tau_core::{Error, Result};
use tau_inference::ScanTree;

/// Chunk size for bin-by-bin parameter plots.
pub const BBB_CHUNK: usize = 9;

/// Split `list` into `ceil(n / nmax)` chunks whose sizes differ by at most one.
///
/// With `complete`, chunks shorter than `nmax` borrow neighbours so that every
/// chunk has `nmax` entries: the first extends right, the last extends left and
/// middle chunks extend on both sides.
pub fn chunkify<T: Clone>(list: &[T], nmax: usize, complete: bool) -> Vec<Vec<T>> {
    if list.is_empty() || nmax == 0 {
        return Vec::new();
    }
    let total = list.len();
    let nchunks = total.div_ceil(nmax);
    let (base, extra) = (total / nchunks, total % nchunks);
    let mut chunks = Vec::with_capacity(nchunks);
    let mut last = 0;
    for ichunk in 0..nchunks {
        let n = if ichunk < extra { base + 1 } else { base };
        let first = last;
        last += n;
        let (lo, hi) = if complete && n < nmax {
            let missing = nmax - n;
            if ichunk == 0 {
                (first, last + missing)
            } else if ichunk == nchunks - 1 {
                (first.saturating_sub(missing), last)
            } else {
                (first.saturating_sub(missing.div_ceil(2)), last + missing / 2)
            }
        } else {
            (first, last)
        };
        chunks.push(list[lo..hi.min(total)].to_vec());
    }
    chunks
}

/// Split `list` into `nparts` parts, as evenly sized as possible, larger first.
pub fn partition<T: Clone>(list: &[T], nparts: usize) -> Vec<Vec<T>> {
    let mut parts = Vec::with_capacity(nparts);
    let mut left = list.len();
    let mut start = 0;
    for remaining in (1..=nparts).rev() {
        let n = left.div_ceil(remaining);
        parts.push(list[start..start + n].to_vec());
        left -= n;
        start += n;
    }
    parts
}

/// Reorder `list` so that it reads down `ncol` columns of a legend filled
/// row by row: `[1,2,3,4,5,6,7]` with two columns gives `[1,5,2,6,3,7,4]`.
pub fn columnize<T: Clone>(list: &[T], ncol: usize) -> Vec<T> {
    let parts = partition(list, ncol.max(1));
    let rows = parts.first().map_or(0, Vec::len);
    let mut out = Vec::with_capacity(list.len());
    for row in 0..rows {
        for part in &parts {
            if let Some(item) = part.get(row) {
                out.push(item.clone());
            }
        }
    }
    out
}

/// Compare strings treating digit runs as numbers, so `bin2` sorts before `bin10`.
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let (mut a, mut b) = (a, b);
    loop {
        match (a.chars().next(), b.chars().next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) if x.is_ascii_digit() && y.is_ascii_digit() => {
                let na = a.find(|c: char| !c.is_ascii_digit()).unwrap_or(a.len());
                let nb = b.find(|c: char| !c.is_ascii_digit()).unwrap_or(b.len());
                let (da, db) = (a[..na].trim_start_matches('0'), b[..nb].trim_start_matches('0'));
                let ord = da.len().cmp(&db.len()).then_with(|| da.cmp(db));
                if ord != Ordering::Equal {
                    return ord;
                }
                a = &a[na..];
                b = &b[nb..];
            }
            (Some(x), Some(y)) => {
                if x != y {
                    return x.cmp(&y);
                }
                a = &a[x.len_utf8()..];
                b = &b[y.len_utf8()..];
            }
        }
    }
}

/// Branch names of `tree` matching `pattern`, where `*` is a wildcard and the
/// match may occur anywhere in the name. Sorted naturally.
pub fn find_branches(tree: &ScanTree, pattern: &str) -> Result<Vec<String>> {
    let escaped = regex::escape(pattern).replace(r"\*", ".*");
    let re = Regex::new(&escaped).map_err(|e| Error::Config(format!("bad branch pattern '{pattern}': {e}")))?;
    let mut names: Vec<String> = tree.branches.keys().filter(|n| re.is_match(n)).cloned().collect();
    names.sort_by(|a, b| natural_cmp(a, b));
    Ok(names)
}

/// Bin-by-bin statistical parameters matching `pattern`, grouped for plotting.
pub fn bbb_chunks(tree: &ScanTree, pattern: &str) -> Result<Vec<Vec<String>>> {
    let names = find_branches(tree, pattern)?;
    let complete = names.len() > BBB_CHUNK;
    Ok(chunkify(&names, BBB_CHUNK, complete))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunkify_even() {
        let list: Vec<u32> = (1..=10).collect();
        let chunks = chunkify(&list, 4, false);
        assert_eq!(chunks, vec![vec![1, 2, 3, 4], vec![5, 6, 7], vec![8, 9, 10]]);
    }

    #[test]
    fn test_chunkify_complete() {
        let list: Vec<u32> = (1..=10).collect();
        let chunks = chunkify(&list, 4, true);
        assert_eq!(chunks, vec![vec![1, 2, 3, 4], vec![4, 5, 6, 7], vec![7, 8, 9, 10]]);
        assert!(chunkify(&list[..3], 4, true).iter().all(|c| c.len() == 3));
        assert!(chunkify::<u32>(&[], 4, true).is_empty());
    }

    #[test]
    fn test_partition_columnize() {
        let list = [1, 2, 3, 4, 5, 6, 7];
        assert_eq!(partition(&list, 2), vec![vec![1, 2, 3, 4], vec![5, 6, 7]]);
        assert_eq!(columnize(&list, 2), vec![1, 5, 2, 6, 3, 7, 4]);
        assert_eq!(columnize(&list, 3).len(), 7);
    }

    #[test]
    fn test_natural_order() {
        let mut names = vec!["prop_binDM1_bin10", "prop_binDM1_bin2", "prop_binDM1_bin1"];
        names.sort_by(|a, b| natural_cmp(a, b));
        assert_eq!(names, vec!["prop_binDM1_bin1", "prop_binDM1_bin2", "prop_binDM1_bin10"]);
    }

    #[test]
    fn test_find_branches() {
        let tracked = (0..12).map(|i| format!("prop_binDM1_bin{i}")).chain(["lumi".to_string()]).collect();
        let tree = ScanTree::new("tes_DM1", tracked);
        let found = find_branches(&tree, "prop_binDM1*").unwrap();
        assert_eq!(found.len(), 12);
        assert_eq!(found[2], "trackedParam_prop_binDM1_bin2");
        let chunks = bbb_chunks(&tree, "prop_binDM1*").unwrap();
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| c.len() == BBB_CHUNK));
    }
}
