//
// SPDX-License-Identifier: MIT
// See LICENSE for details
//! Parse CPU / NUMA-node id lists.
//!
//! Two dialects exist: command-line affinity arguments use `:` for ranges
//! (`0:7,12` means cpus 0 through 7 plus 12) while the kernel's sysfs
//! `cpulist` files use `-` (`0-7,12`). Both are comma-separated lists of
//! single ids or inclusive ranges.
use std::collections::BTreeSet;

use eyre::{eyre, Result};
use nom::{
    character::complete::{char, digit1},
    combinator::{all_consuming, map_res, opt},
    multi::separated_list1,
    sequence::{pair, preceded},
    IResult,
};

fn id(input: &str) -> IResult<&str, u32> {
    map_res(digit1, str::parse)(input)
}

fn id_or_range(range_sep: char) -> impl Fn(&str) -> IResult<&str, (u32, Option<u32>)> {
    move |input| pair(id, opt(preceded(char(range_sep), id)))(input)
}

fn id_list(input: &str, range_sep: char) -> Result<Vec<(u32, Option<u32>)>> {
    let (_, entries) = all_consuming(separated_list1(char(','), id_or_range(range_sep)))(input)
        .map_err(|_| eyre!("Invalid id list: {}", input))?;
    Ok(entries)
}

fn expand(entries: Vec<(u32, Option<u32>)>, input: &str) -> Result<BTreeSet<u32>> {
    let mut ids = BTreeSet::new();
    for (start, end) in entries {
        let end = end.unwrap_or(start);
        if end < start {
            return Err(eyre!("Range end below start in id list: {}", input));
        }
        ids.extend(start..=end);
    }
    Ok(ids)
}

/// Parse a user affinity argument such as `0:7,12`. Ids must stay below
/// `max`: an out-of-range id is a configuration error, not something to
/// silently drop.
pub fn parse_affinity_list(input: &str, max: u32) -> Result<BTreeSet<u32>> {
    let ids = expand(id_list(input.trim(), ':')?, input)?;
    match ids.iter().next_back() {
        Some(&largest) if largest >= max => Err(eyre!(
            "Id {} out of range in {} (valid ids are 0..{})",
            largest,
            input,
            max
        )),
        _ => Ok(ids),
    }
}

/// Parse a kernel `cpulist` pseudo-file such as `0-7,16-23`. An empty file
/// (a memory-only NUMA node) is an empty set.
pub fn parse_kernel_cpu_list(input: &str) -> Result<BTreeSet<u32>> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(BTreeSet::new());
    }
    expand(id_list(trimmed, '-')?, input)
}
