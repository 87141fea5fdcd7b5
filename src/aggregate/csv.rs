//
// SPDX-License-Identifier: MIT
// See LICENSE for details
//! Optional CSV rendering of the merged result: one row per timestamp,
//! one column per `<tag> <metric>` pair, tags in catalog category order.
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use eyre::{eyre, Context, Result};

use super::DenseTable;

pub fn write_csv(path: &Path, axis: &[String], tags: &[String], dense: &DenseTable) -> Result<()> {
    let file =
        File::create(path).wrap_err_with(|| eyre!("Unable to create {}", path.display()))?;
    let mut out = BufWriter::new(file);

    let mut header = vec!["timestamps".to_string()];
    for tag in tags {
        if let Some(columns) = dense.get(tag) {
            for metric in columns.keys() {
                header.push(format!("{} {}", tag, metric));
            }
        }
    }
    writeln!(out, "{}", header.join(","))?;

    for (index, ts) in axis.iter().enumerate() {
        let mut row = vec![ts.clone()];
        for tag in tags {
            if let Some(columns) = dense.get(tag) {
                for column in columns.values() {
                    match column.get(index) {
                        Some(value) => row.push(value.to_string()),
                        // A short column is padded with its typed placeholder.
                        None => row.push(
                            column
                                .first()
                                .map(|v| v.placeholder().to_string())
                                .unwrap_or_else(|| "NA".to_string()),
                        ),
                    }
                }
            }
        }
        writeln!(out, "{}", row.join(","))?;
    }
    out.flush()?;
    Ok(())
}
