//! Selection of image pairs whose matches enter the problem.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use ba_core::{Real, Vec3};
use log::info;

/// Read the overlap list: one `image1 image2` pair per line, symmetric.
pub fn read_overlap_list(path: &Path) -> Result<BTreeSet<(String, String)>> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("the overlap list {} does not exist", path.display()))?;
    let mut pairs = BTreeSet::new();
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        if let (Some(a), Some(b)) = (fields.next(), fields.next()) {
            pairs.insert((a.to_string(), b.to_string()));
            pairs.insert((b.to_string(), a.to_string()));
        }
    }
    Ok(pairs)
}

/// Enumerate the camera pairs to consider, honoring the overlap limit, the
/// overlap list and the camera-position distance filter.
pub fn select_pairs(
    images: &[String],
    overlap_limit: usize,
    overlap_list: Option<&BTreeSet<(String, String)>>,
    position_hints: Option<&[Option<Vec3>]>,
    position_filter_dist: Real,
) -> Vec<(usize, usize)> {
    let n = images.len();
    // A limit of zero means "match every image against every other".
    let limit = if overlap_limit == 0 { n } else { overlap_limit };

    let mut pairs = Vec::new();
    for i in 0..n {
        for j in (i + 1)..n.min(i + limit + 1) {
            if let Some(list) = overlap_list {
                if !list.contains(&(images[i].clone(), images[j].clone())) {
                    continue;
                }
            }
            if let (Some(hints), true) = (position_hints, position_filter_dist > 0.0) {
                if let (Some(a), Some(b)) = (hints[i], hints[j]) {
                    let dist = (a - b).norm();
                    if dist > position_filter_dist {
                        info!(
                            "skipping pair ({}, {}) with camera distance {}",
                            images[i], images[j], dist
                        );
                        continue;
                    }
                }
            }
            pairs.push((i, j));
        }
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    fn images(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("img{}.tif", i)).collect()
    }

    #[test]
    fn zero_limit_matches_all_pairs() {
        let pairs = select_pairs(&images(4), 0, None, None, -1.0);
        assert_eq!(pairs.len(), 6);
    }

    #[test]
    fn limit_restricts_to_subsequent_images() {
        let pairs = select_pairs(&images(4), 1, None, None, -1.0);
        assert_eq!(pairs, vec![(0, 1), (1, 2), (2, 3)]);
    }

    #[test]
    fn overlap_list_whitelists_pairs() {
        let mut list = BTreeSet::new();
        list.insert(("img0.tif".to_string(), "img2.tif".to_string()));
        list.insert(("img2.tif".to_string(), "img0.tif".to_string()));
        let pairs = select_pairs(&images(3), 0, Some(&list), None, -1.0);
        assert_eq!(pairs, vec![(0, 2)]);
    }

    #[test]
    fn distant_cameras_are_pruned() {
        let hints = vec![
            Some(Vec3::new(0.0, 0.0, 0.0)),
            Some(Vec3::new(10_000.0, 0.0, 0.0)),
            None,
        ];
        let pairs = select_pairs(&images(3), 0, None, Some(&hints), 100.0);
        // (0,1) is too far apart; pairs with an unknown position survive.
        assert_eq!(pairs, vec![(0, 2), (1, 2)]);
    }
}
