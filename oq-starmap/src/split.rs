//! Partitioning of weighted sequences into blocks of homogeneous weight.
//!
//! Two modes: [`split_in_blocks`] targets a number of blocks (eager),
//! [`block_splitter`] bounds the weight per block (lazy). Both keep items
//! with different keys in different blocks, so a task never mixes kinds.

use std::cmp::Ordering;

/// A contiguous chunk of the input with its total weight.
#[derive(Clone, Debug, PartialEq)]
pub struct WeightedBlock<T> {
    pub items: Vec<T>,
    pub weight: f64,
}

/// Default weight function: every item costs 1.
pub fn unit_weight<T>(_item: &T) -> f64 {
    1.0
}

/// Default key function: all items share one kind.
pub fn no_key<T>(_item: &T) -> &'static str {
    "Unspecified"
}

/// Lazily packs `items` into blocks of total weight at most `max_weight`.
///
/// A single item heavier than `max_weight` still gets a block of its own;
/// that is the only case where the bound is exceeded. With `sort` the items
/// are packed in descending weight order.
pub fn block_splitter<T, K, WF, KF>(
    mut items: Vec<T>,
    max_weight: f64,
    weight: WF,
    key: KF,
    sort: bool,
) -> impl Iterator<Item = WeightedBlock<T>>
where
    WF: Fn(&T) -> f64,
    KF: Fn(&T) -> K,
    K: PartialEq,
{
    assert!(max_weight > 0.0, "max_weight must be positive");
    if sort {
        items.sort_by(|a, b| {
            weight(b).partial_cmp(&weight(a)).unwrap_or(Ordering::Equal)
        });
    }
    let mut iter = items.into_iter().peekable();
    std::iter::from_fn(move || {
        let first = iter.next()?;
        let block_key = key(&first);
        let mut block_weight = weight(&first);
        let mut block = vec![first];
        loop {
            let take = match iter.peek() {
                Some(next) => {
                    key(next) == block_key && block_weight + weight(next) <= max_weight
                },
                None => false,
            };
            if !take {
                break;
            }
            if let Some(item) = iter.next() {
                block_weight += weight(&item);
                block.push(item);
            }
        }
        Some(WeightedBlock {
            items: block,
            weight: block_weight,
        })
    })
}

/// Eagerly splits `items` into at most `hint` blocks of nearly equal
/// weight, after grouping by `key`. Every group gets at least one block,
/// heavier groups get proportionally more.
pub fn split_in_blocks<T, K, WF, KF>(
    items: Vec<T>,
    hint: usize,
    weight: WF,
    key: KF,
) -> Vec<WeightedBlock<T>>
where
    WF: Fn(&T) -> f64,
    KF: Fn(&T) -> K,
    K: PartialEq,
{
    assert!(hint >= 1, "hint must be positive");
    // group by key, preserving first-occurrence order
    let mut groups: Vec<(K, Vec<T>, f64)> = Vec::new();
    for item in items {
        let item_key = key(&item);
        let item_weight = weight(&item);
        match groups.iter_mut().find(|(group_key, ..)| *group_key == item_key) {
            Some((_, group, group_weight)) => {
                group.push(item);
                *group_weight += item_weight;
            },
            None => groups.push((item_key, vec![item], item_weight)),
        }
    }

    let ngroups = groups.len();
    let total: f64 = groups.iter().map(|(.., group_weight)| *group_weight).sum();
    let mut blocks = Vec::new();
    let mut used = 0usize;
    for (index, (_, group, group_weight)) in groups.into_iter().enumerate() {
        let groups_after = ngroups - index - 1;
        let available = hint
            .saturating_sub(used)
            .saturating_sub(groups_after)
            .max(1);
        let ideal = if total > 0.0 {
            (hint as f64 * group_weight / total).round() as usize
        } else {
            1
        };
        let nblocks = ideal.clamp(1, available).min(group.len().max(1));
        used += nblocks;
        split_group(group, group_weight, nblocks, &weight, &mut blocks);
    }
    blocks
}

/// Splits one key-homogeneous group into `nblocks` chunks whose cumulative
/// weights track the equal-share boundaries.
fn split_group<T, WF>(
    group: Vec<T>,
    group_weight: f64,
    nblocks: usize,
    weight: &WF,
    out: &mut Vec<WeightedBlock<T>>,
) where
    WF: Fn(&T) -> f64,
{
    let first_block = out.len();
    let mut cumulative = 0.0;
    let mut current = Vec::new();
    let mut current_weight = 0.0;
    for item in group {
        let item_weight = weight(&item);
        cumulative += item_weight;
        current_weight += item_weight;
        current.push(item);
        let done = out.len() - first_block;
        let boundary = (done + 1) as f64 * group_weight / nblocks as f64;
        if done + 1 < nblocks && cumulative >= boundary {
            out.push(WeightedBlock {
                items: std::mem::take(&mut current),
                weight: current_weight,
            });
            current_weight = 0.0;
        }
    }
    if !current.is_empty() {
        out.push(WeightedBlock {
            items: current,
            weight: current_weight,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::block_splitter;
    use super::no_key;
    use super::split_in_blocks;
    use super::unit_weight;

    #[test]
    fn count_bounded_covers_once() {
        let seq: Vec<u32> = (0..23).collect();
        let blocks = split_in_blocks(seq.clone(), 4, unit_weight, no_key);
        assert!(blocks.len() <= 4);
        let joined: Vec<u32> = blocks.iter().flat_map(|b| b.items.clone()).collect();
        assert_eq!(joined, seq);
        // unit weights: the block sizes differ by at most one item
        let sizes: Vec<usize> = blocks.iter().map(|b| b.items.len()).collect();
        let min = sizes.iter().min().unwrap();
        let max = sizes.iter().max().unwrap();
        assert!(max - min <= 1, "uneven blocks: {sizes:?}");
    }

    #[test]
    fn count_bounded_respects_keys() {
        // 'a' items and 'b' items must never share a block
        let seq = vec![(1u32, 'a'), (2, 'a'), (3, 'b'), (4, 'b'), (5, 'b')];
        let blocks = split_in_blocks(seq, 3, |it| it.0 as f64, |it| it.1);
        assert!(blocks.len() <= 3);
        for block in &blocks {
            let kinds: Vec<char> = block.items.iter().map(|it| it.1).collect();
            assert!(kinds.windows(2).all(|w| w[0] == w[1]), "mixed block: {kinds:?}");
        }
    }

    #[test]
    fn weight_bounded_blocks() {
        let seq = vec![3.0, 3.0, 3.0, 9.0, 1.0, 1.0];
        let blocks: Vec<_> = block_splitter(seq, 6.0, |w| *w, no_key, false).collect();
        for block in &blocks {
            // the 9.0 item alone may exceed the bound
            assert!(block.weight <= 6.0 || block.items.len() == 1);
        }
        let total: f64 = blocks.iter().map(|b| b.weight).sum();
        assert_eq!(total, 20.0);
    }

    #[test]
    fn weight_bounded_sorting_packs_heavy_first() {
        let seq = vec![1.0, 5.0, 2.0, 4.0];
        let blocks: Vec<_> = block_splitter(seq, 6.0, |w| *w, no_key, true).collect();
        assert_eq!(blocks[0].items[0], 5.0);
    }

    #[test]
    fn splitting_is_deterministic() {
        let seq: Vec<u32> = (0..100).collect();
        let a = split_in_blocks(seq.clone(), 7, |it| (*it % 3) as f64, no_key);
        let b = split_in_blocks(seq, 7, |it| (*it % 3) as f64, no_key);
        assert_eq!(a, b);
    }
}
